//! Audit capture coordinator
//!
//! Drives capture and delivery from the persistence layer's lifecycle
//! events. Records captured when a save starts are promoted once it
//! finishes and then either delivered straight away (no transaction) or
//! held until the enclosing transaction is about to commit.
//!
//! The commit-started and transaction-ownership flags are plain atomics,
//! not a lock around state transitions. Hosts must not run concurrent saves
//! through one unit of work while a transaction is open.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AuditSettings;
use crate::error::{AuditError, AuditResult};
use crate::persistence::{
    ensure_not_cancelled, HostTransaction, OwnedTransaction, SaveChangesInterceptor,
    TransactionEvent, TransactionInterceptor, TransactionStatus, UnitOfWork,
};
use crate::rules::RuleRegistry;
use crate::sink::AuditSink;

use super::buffer::TransactionBuffer;
use super::entry::{batch_justifies_delivery, EntityAuditRecord};
use super::snapshot::SnapshotBuilder;

/// Where the coordinator is in the save/transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    SaveStarted,
    SaveFinished,
    TransactionOpen,
    CommitPending,
    TransactionClosed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::SaveStarted => write!(f, "save started"),
            Phase::SaveFinished => write!(f, "save finished"),
            Phase::TransactionOpen => write!(f, "transaction open"),
            Phase::CommitPending => write!(f, "commit pending"),
            Phase::TransactionClosed => write!(f, "transaction closed"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates audit capture for one unit of work
pub struct AuditCoordinator<P> {
    snapshots: SnapshotBuilder<P>,
    sink: Arc<dyn AuditSink<P>>,
    settings: AuditSettings,
    buffer: TransactionBuffer<P>,
    owned: Mutex<Option<OwnedTransaction>>,
    transaction_started: AtomicBool,
    commit_started: AtomicBool,
    phase: Mutex<Phase>,
}

impl<P> AuditCoordinator<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: Arc<RuleRegistry<P>>,
        sink: Arc<dyn AuditSink<P>>,
        settings: AuditSettings,
    ) -> Self {
        Self {
            snapshots: SnapshotBuilder::new(registry),
            sink,
            settings,
            buffer: TransactionBuffer::new(),
            owned: Mutex::new(None),
            transaction_started: AtomicBool::new(false),
            commit_started: AtomicBool::new(false),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn settings(&self) -> &AuditSettings {
        &self.settings
    }

    pub fn buffer(&self) -> &TransactionBuffer<P> {
        &self.buffer
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Whether the current transaction was opened by this coordinator
    pub fn owns_transaction(&self) -> bool {
        self.transaction_started.load(Ordering::SeqCst)
    }

    /// Whether a commit initiated by this coordinator is in flight
    pub fn commit_in_flight(&self) -> bool {
        self.commit_started.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
    }

    fn reset_flags(&self) {
        self.commit_started.store(false, Ordering::SeqCst);
        self.transaction_started.store(false, Ordering::SeqCst);
    }

    /// Hand records to the sink, swallowing everything but cancellation
    async fn deliver(
        &self,
        records: Vec<EntityAuditRecord<P>>,
        transaction: Option<&dyn HostTransaction>,
        event: Option<&TransactionEvent>,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        let count = records.len();

        match self.sink.deliver(records, transaction, event, cancel).await {
            Ok(()) => {
                info!(
                    count,
                    transaction = ?event.map(|e| e.transaction_id),
                    "Delivered audit records"
                );
                Ok(())
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                error!(count, error = %err, "Audit delivery failed, records dropped");
                Ok(())
            }
        }
    }

    async fn commit_owned(
        &self,
        owned: OwnedTransaction,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        let transaction_id = owned.id();
        self.commit_started.store(true, Ordering::SeqCst);
        self.set_phase(Phase::CommitPending);

        let outcome = match owned.commit(cancel).await {
            Ok(()) => {
                debug!(transaction = %transaction_id, "Committed coordinator-owned transaction");
                Ok(())
            }
            Err(err) => {
                error!(
                    transaction = %transaction_id,
                    error = %err,
                    "Commit failed, rolling back"
                );
                self.roll_back_owned(&owned, cancel).await;
                self.buffer.clear();
                self.set_phase(Phase::Idle);
                if err.is_cancelled() {
                    Err(err)
                } else {
                    Ok(())
                }
            }
        };

        drop(owned);
        self.reset_flags();
        outcome
    }

    /// Roll back a coordinator-owned transaction, even after `cancel` fired
    async fn roll_back_owned(&self, owned: &OwnedTransaction, cancel: &CancellationToken) {
        let cleanup = if cancel.is_cancelled() {
            CancellationToken::new()
        } else {
            cancel.clone()
        };

        if let Err(err) = owned.rollback(&cleanup).await {
            warn!(
                transaction = %owned.id(),
                error = %err,
                "Rollback of coordinator-owned transaction failed"
            );
        }
    }

    /// Roll back the auto-opened transaction after a failed or cancelled save
    async fn abandon_owned(&self, cancel: &CancellationToken) {
        let owned = lock(&self.owned).take();
        let Some(owned) = owned else {
            return;
        };

        debug!(transaction = %owned.id(), "Rolling back transaction opened for save");
        self.roll_back_owned(&owned, cancel).await;
        drop(owned);
        self.buffer.clear();
        self.reset_flags();
        self.set_phase(Phase::Idle);
    }

    async fn finish_transaction(
        &self,
        event: &TransactionEvent,
        status: TransactionStatus,
        cancel: &CancellationToken,
    ) {
        let discarded = self.buffer.drain_committed().len();
        if discarded > 0 {
            debug!(
                transaction = %event.transaction_id,
                discarded,
                "Discarded undelivered audit records"
            );
        }

        self.reset_flags();
        self.set_phase(Phase::TransactionClosed);
        debug!(transaction = %event.transaction_id, %status, "Transaction finished");

        self.sink.transaction_finished(event, status, cancel).await;
        self.set_phase(Phase::Idle);
    }
}

#[async_trait]
impl<P> SaveChangesInterceptor for AuditCoordinator<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn saving_changes(
        &self,
        unit_of_work: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        ensure_not_cancelled(cancel)?;

        if self.commit_in_flight() {
            debug!("Commit in flight, skipping capture for nested save");
            self.buffer.drain_pending();
            return Ok(());
        }

        self.set_phase(Phase::SaveStarted);

        if self.settings.auto_open_transaction && unit_of_work.current_transaction().is_none() {
            let transaction = unit_of_work.begin_transaction(cancel).await?;
            debug!(transaction = %transaction.id(), "Opened transaction for save");
            *lock(&self.owned) = Some(OwnedTransaction::new(transaction));
            self.transaction_started.store(true, Ordering::SeqCst);
        }

        let records = self.snapshots.capture_before_save(unit_of_work)?;
        self.buffer.extend_pending(records);
        Ok(())
    }

    async fn saved_changes(
        &self,
        unit_of_work: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        if self.commit_in_flight() {
            return Ok(());
        }

        let captured = self.buffer.drain_pending();
        if let Err(err) = ensure_not_cancelled(cancel) {
            self.abandon_owned(cancel).await;
            return Err(err);
        }

        let records = self.snapshots.promote_after_save(captured, unit_of_work);
        self.set_phase(Phase::SaveFinished);

        if unit_of_work.current_transaction().is_none() {
            self.buffer.clear();
            let result = if batch_justifies_delivery(&records) {
                self.deliver(records, None, None, cancel).await
            } else {
                debug!(count = records.len(), "No auditable changes, nothing delivered");
                Ok(())
            };
            self.set_phase(Phase::Idle);
            return result;
        }

        self.buffer.extend_committed(records);
        self.set_phase(Phase::TransactionOpen);

        let owned = lock(&self.owned).take();
        match owned {
            Some(owned) => self.commit_owned(owned, cancel).await,
            None => Ok(()),
        }
    }

    async fn save_failed(
        &self,
        _unit_of_work: &dyn UnitOfWork,
        error: &AuditError,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        warn!(error = %error, "Save failed, discarding captured audit records");
        self.buffer.drain_pending();

        self.abandon_owned(cancel).await;
        Ok(())
    }
}

#[async_trait]
impl<P> TransactionInterceptor for AuditCoordinator<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn transaction_committing(
        &self,
        transaction: &dyn HostTransaction,
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        ensure_not_cancelled(cancel)?;
        self.set_phase(Phase::CommitPending);

        if !self.buffer.committed_justifies_delivery() {
            debug!(
                transaction = %event.transaction_id,
                pending = self.buffer.committed_len(),
                "No auditable changes in transaction"
            );
            return Ok(());
        }

        let records = self.buffer.drain_committed();
        self.deliver(records, Some(transaction), Some(event), cancel)
            .await
    }

    async fn transaction_committed(&self, event: &TransactionEvent, cancel: &CancellationToken) {
        self.finish_transaction(event, TransactionStatus::Committed, cancel)
            .await;
    }

    async fn transaction_rolled_back(&self, event: &TransactionEvent, cancel: &CancellationToken) {
        self.finish_transaction(event, TransactionStatus::RolledBack, cancel)
            .await;
    }

    async fn transaction_failed(&self, event: &TransactionEvent, cancel: &CancellationToken) {
        self.finish_transaction(event, TransactionStatus::Failed, cancel)
            .await;
    }
}

impl<P> fmt::Debug for AuditCoordinator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditCoordinator")
            .field("settings", &self.settings)
            .field("phase", &*lock(&self.phase))
            .field("transaction_started", &self.transaction_started)
            .field("commit_started", &self.commit_started)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditAction;
    use crate::models::FieldValue;
    use crate::rules::RuleConfiguration;
    use crate::sink::MemorySink;
    use crate::storage::{EntitySchema, MemorySession, MemoryStore};

    const INVOICE: &str = "billing::Invoice";
    const AUDIT_NOTE: &str = "audit::Note";

    struct Harness {
        session: MemorySession,
        coordinator: Arc<AuditCoordinator<&'static str>>,
        sink: Arc<MemorySink<&'static str>>,
    }

    fn create_harness(auto_open: bool) -> Harness {
        let sink = Arc::new(MemorySink::new());
        create_harness_with_sink(auto_open, Arc::clone(&sink) as Arc<dyn AuditSink<_>>, sink)
    }

    fn create_harness_with_sink(
        auto_open: bool,
        delivering: Arc<dyn AuditSink<&'static str>>,
        sink: Arc<MemorySink<&'static str>>,
    ) -> Harness {
        let store = MemoryStore::new()
            .with_schema(
                EntitySchema::with_generated_key(INVOICE, "Id")
                    .property("Total")
                    .property("Note")
                    .shadow("RowVersion"),
            )
            .with_schema(EntitySchema::with_generated_key(AUDIT_NOTE, "Id").property("Text"));

        let registry = RuleRegistry::new()
            .with(
                RuleConfiguration::builder(INVOICE, "finance.read")
                    .ignore("Note")
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .with(RuleConfiguration::builder(AUDIT_NOTE, "audit.read").build().unwrap())
            .unwrap();

        let coordinator = Arc::new(AuditCoordinator::new(
            Arc::new(registry),
            delivering,
            AuditSettings::default().with_auto_open(auto_open),
        ));

        let session = MemorySession::new(Arc::new(store));
        session.intercept(Arc::clone(&coordinator));

        Harness {
            session,
            coordinator,
            sink,
        }
    }

    fn renaming_harness() -> Harness {
        let sink = Arc::new(MemorySink::new());
        let store = MemoryStore::new().with_schema(
            EntitySchema::with_generated_key(INVOICE, "Id")
                .property("Total")
                .property("Note"),
        );
        let registry = RuleRegistry::new()
            .with(
                RuleConfiguration::builder(INVOICE, "finance.read")
                    .rename("Note", "Comment")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let coordinator = Arc::new(AuditCoordinator::new(
            Arc::new(registry),
            Arc::clone(&sink) as Arc<dyn AuditSink<_>>,
            AuditSettings::default(),
        ));
        let session = MemorySession::new(Arc::new(store));
        session.intercept(Arc::clone(&coordinator));
        Harness {
            session,
            coordinator,
            sink,
        }
    }

    async fn seed_invoice(harness: &Harness, note: &str) -> String {
        let cancel = CancellationToken::new();
        let invoice = harness
            .session
            .add(
                INVOICE,
                [("Total", FieldValue::from(100)), ("Note", FieldValue::from(note))],
            )
            .unwrap();
        harness.session.save_changes(&cancel).await.unwrap();
        harness.session.primary_key_value(invoice).unwrap()
    }

    #[tokio::test]
    async fn test_create_delivered_immediately_with_generated_id() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();

        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100)), ("Note", FieldValue::Null)])
            .unwrap();

        harness.session.save_changes(&cancel).await.unwrap();

        let batches = harness.sink.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].transaction_id.is_none());

        let record = &batches[0].records[0];
        assert_eq!(record.action, AuditAction::Create);
        assert_eq!(record.entity_name, "Invoice");
        assert_eq!(record.required_read_permission, "finance.read");
        assert_eq!(record.tracked_properties.get("Total"), Some(&FieldValue::Integer(100)));
        assert!(!record.tracked_properties.contains_key("Note"));
        assert!(!record.tracked_properties.contains_key("RowVersion"));
        assert!(record.entity_id.as_deref().map_or(false, |id| !id.is_empty()));
        assert_eq!(harness.coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_update_records_renamed_property() {
        let harness = renaming_harness();
        let cancel = CancellationToken::new();
        let key = seed_invoice(&harness, "a").await;

        let invoice = harness.session.load(INVOICE, &key).unwrap();
        harness.session.set(invoice, "Note", "b").unwrap();
        harness.session.save_changes(&cancel).await.unwrap();

        let records = harness.sink.records();
        assert_eq!(records.len(), 2);

        let update = &records[1];
        assert_eq!(update.action, AuditAction::Update);
        assert_eq!(update.entity_id.as_deref(), Some(key.as_str()));
        assert_eq!(update.tracked_properties.len(), 1);
        assert_eq!(
            update.tracked_properties.get("Comment"),
            Some(&FieldValue::Text("b".into()))
        );
    }

    #[tokio::test]
    async fn test_lone_noop_update_not_delivered() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();
        let key = seed_invoice(&harness, "a").await;

        // Only the ignored property changes
        let invoice = harness.session.load(INVOICE, &key).unwrap();
        harness.session.set(invoice, "Note", "b").unwrap();
        harness.session.save_changes(&cancel).await.unwrap();

        assert_eq!(harness.sink.batch_count(), 1);
        assert!(!harness.coordinator.buffer().has_pending());
        assert!(!harness.coordinator.buffer().has_committed());
    }

    #[tokio::test]
    async fn test_noop_update_included_in_justified_batch() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();
        let first_key = seed_invoice(&harness, "a").await;
        let second_key = seed_invoice(&harness, "a").await;

        let transaction = harness.session.begin_transaction(&cancel).await.unwrap();

        let first = harness.session.load(INVOICE, &first_key).unwrap();
        harness.session.set(first, "Note", "ignored").unwrap();
        harness.session.save_changes(&cancel).await.unwrap();
        assert_eq!(harness.coordinator.buffer().committed_len(), 1);

        let second = harness.session.load(INVOICE, &second_key).unwrap();
        harness.session.set(second, "Total", 250).unwrap();
        harness.session.save_changes(&cancel).await.unwrap();
        assert_eq!(harness.coordinator.phase(), Phase::TransactionOpen);
        assert_eq!(harness.sink.batch_count(), 2);

        transaction.commit(&cancel).await.unwrap();

        let batches = harness.sink.batches();
        assert_eq!(batches.len(), 3);
        let batch = &batches[2];
        assert_eq!(batch.transaction_id, Some(transaction.id()));
        assert_eq!(batch.records.len(), 2);
        assert!(batch.records[0].tracked_properties.is_empty());
        assert_eq!(
            batch.records[1].tracked_properties.get("Total"),
            Some(&FieldValue::Integer(250))
        );
        assert_eq!(
            harness.sink.finished(),
            vec![(transaction.id(), TransactionStatus::Committed)]
        );
        assert_eq!(harness.coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_lone_noop_update_in_transaction_not_delivered() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();
        let key = seed_invoice(&harness, "a").await;

        let transaction = harness.session.begin_transaction(&cancel).await.unwrap();
        let invoice = harness.session.load(INVOICE, &key).unwrap();
        harness.session.set(invoice, "Note", "b").unwrap();
        harness.session.save_changes(&cancel).await.unwrap();
        transaction.commit(&cancel).await.unwrap();

        assert_eq!(harness.sink.batch_count(), 1);
        assert!(!harness.coordinator.buffer().has_committed());
    }

    #[tokio::test]
    async fn test_host_rollback_clears_buffers() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();

        let transaction = harness.session.begin_transaction(&cancel).await.unwrap();
        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(5))])
            .unwrap();
        harness.session.save_changes(&cancel).await.unwrap();
        assert!(harness.coordinator.buffer().has_committed());

        transaction.rollback(&cancel).await.unwrap();

        assert!(!harness.coordinator.buffer().has_committed());
        assert!(!harness.coordinator.buffer().has_pending());
        assert_eq!(harness.sink.batch_count(), 0);
        assert_eq!(
            harness.sink.finished(),
            vec![(transaction.id(), TransactionStatus::RolledBack)]
        );
    }

    #[tokio::test]
    async fn test_auto_open_commits_and_delivers_in_transaction() {
        let harness = create_harness(true);
        let cancel = CancellationToken::new();

        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100))])
            .unwrap();
        harness.session.save_changes(&cancel).await.unwrap();

        let batches = harness.sink.batches();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].transaction_id.is_some());
        assert!(batches[0].records[0].entity_id.is_some());

        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 1);
        assert!(harness.session.current_transaction().is_none());
        assert!(!harness.coordinator.owns_transaction());
        assert!(!harness.coordinator.commit_in_flight());
        assert_eq!(harness.sink.finished()[0].1, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn test_auto_open_failed_save_rolls_back() {
        let harness = create_harness(true);
        let cancel = CancellationToken::new();

        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100))])
            .unwrap();
        harness.session.fail_next_save();

        assert!(harness.session.save_changes(&cancel).await.is_err());

        assert!(harness.session.current_transaction().is_none());
        assert!(!harness.coordinator.owns_transaction());
        assert!(!harness.coordinator.buffer().has_pending());
        assert!(!harness.coordinator.buffer().has_committed());
        assert_eq!(harness.sink.batch_count(), 0);
        assert_eq!(harness.sink.finished()[0].1, TransactionStatus::RolledBack);

        // The next save cycle starts clean
        harness.session.save_changes(&cancel).await.unwrap();
        assert_eq!(harness.sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_open_commit_failure_rolls_back_and_clears() {
        let harness = create_harness(true);
        let cancel = CancellationToken::new();

        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100))])
            .unwrap();
        harness.session.fail_next_commit();

        // Commit failure is recovered inside the save pipeline
        harness.session.save_changes(&cancel).await.unwrap();

        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 0);
        assert!(!harness.coordinator.buffer().has_committed());
        assert!(!harness.coordinator.commit_in_flight());
        assert_eq!(harness.sink.finished()[0].1, TransactionStatus::Failed);
        // Delivery happened in the committing hook before the commit failed
        assert_eq!(harness.sink.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let harness = create_harness(false);
        harness.sink.set_failing(true);

        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(1))])
            .unwrap();
        harness
            .session
            .save_changes(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 1);
        assert_eq!(harness.sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_block_commit() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();
        harness.sink.set_failing(true);

        let transaction = harness.session.begin_transaction(&cancel).await.unwrap();
        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(1))])
            .unwrap();
        harness.session.save_changes(&cancel).await.unwrap();
        transaction.commit(&cancel).await.unwrap();

        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 1);
        assert_eq!(harness.sink.finished()[0].1, TransactionStatus::Committed);
    }

    #[tokio::test]
    async fn test_unregistered_types_not_audited() {
        let harness = create_harness(false);
        let store = MemoryStore::new()
            .with_schema(EntitySchema::with_generated_key("inventory::Widget", "Id").property("Sku"));
        let session = MemorySession::new(Arc::new(store));
        session.intercept(Arc::clone(&harness.coordinator));

        session
            .add("inventory::Widget", [("Sku", FieldValue::from("W-1"))])
            .unwrap();
        session.save_changes(&CancellationToken::new()).await.unwrap();
        assert_eq!(harness.sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_decrypt_type_mismatch_fails_save() {
        let sink = Arc::new(MemorySink::new());
        let store = MemoryStore::new().with_schema(
            EntitySchema::with_supplied_key("people::Person", "Code").property("Ssn"),
        );
        let decryptor: Arc<dyn crate::rules::FieldDecryptor> = Arc::new(
            crate::crypto::AesGcmDecryptor::new(crate::crypto::DerivedKey::from_bytes([7u8; 32])),
        );
        let registry = RuleRegistry::new()
            .with(
                RuleConfiguration::builder("people::Person", "hr.read")
                    .decrypt("Ssn", decryptor, false)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let coordinator = Arc::new(AuditCoordinator::new(
            Arc::new(registry),
            Arc::clone(&sink) as Arc<dyn AuditSink<_>>,
            AuditSettings::default(),
        ));
        let session = MemorySession::new(Arc::new(store));
        session.intercept(Arc::clone(&coordinator));

        session
            .add(
                "people::Person",
                [("Code", FieldValue::from("P-1")), ("Ssn", FieldValue::from("plain"))],
            )
            .unwrap();
        let err = session
            .save_changes(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("people::Person"));
        assert!(err.to_string().contains("Ssn"));
        assert_eq!(session.store().count("people::Person").unwrap(), 0);
        assert_eq!(sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_surfaces_and_keeps_buffers() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();

        let transaction = harness.session.begin_transaction(&cancel).await.unwrap();
        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(1))])
            .unwrap();
        harness.session.save_changes(&cancel).await.unwrap();

        cancel.cancel();
        let err = transaction.commit(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(harness.sink.batch_count(), 0);
        // Commit was refused before any event, so the records are still buffered
        assert!(harness.coordinator.buffer().has_committed());

        transaction.rollback(&CancellationToken::new()).await.unwrap();
        assert!(!harness.coordinator.buffer().has_committed());
    }

    #[tokio::test]
    async fn test_cancelled_delivery_fails_commit() {
        let harness = create_harness(false);
        let cancel = CancellationToken::new();

        let transaction = harness.session.begin_transaction(&cancel).await.unwrap();
        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(1))])
            .unwrap();
        harness.session.save_changes(&cancel).await.unwrap();

        let event = TransactionEvent::new(transaction.id(), chrono::Utc::now());
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = harness
            .coordinator
            .transaction_committing(transaction.as_ref(), &event, &cancelled)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(harness.coordinator.buffer().has_committed());
    }

    /// Interceptor that cancels the save once capture has run
    struct CancelOnSave;

    #[async_trait]
    impl SaveChangesInterceptor for CancelOnSave {
        async fn saving_changes(
            &self,
            _: &dyn UnitOfWork,
            cancel: &CancellationToken,
        ) -> AuditResult<()> {
            cancel.cancel();
            Ok(())
        }

        async fn saved_changes(&self, _: &dyn UnitOfWork, _: &CancellationToken) -> AuditResult<()> {
            Ok(())
        }

        async fn save_failed(
            &self,
            _: &dyn UnitOfWork,
            _: &AuditError,
            _: &CancellationToken,
        ) -> AuditResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TransactionInterceptor for CancelOnSave {
        async fn transaction_committing(
            &self,
            _: &dyn HostTransaction,
            _: &TransactionEvent,
            _: &CancellationToken,
        ) -> AuditResult<()> {
            Ok(())
        }

        async fn transaction_committed(&self, _: &TransactionEvent, _: &CancellationToken) {}

        async fn transaction_rolled_back(&self, _: &TransactionEvent, _: &CancellationToken) {}

        async fn transaction_failed(&self, _: &TransactionEvent, _: &CancellationToken) {}
    }

    #[tokio::test]
    async fn test_cancelled_auto_open_save_rolls_back_opened_transaction() {
        let harness = create_harness(true);
        harness.session.intercept(Arc::new(CancelOnSave));

        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100))])
            .unwrap();

        let cancel = CancellationToken::new();
        let err = harness.session.save_changes(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        assert!(!harness.coordinator.buffer().has_pending());
        assert!(!harness.coordinator.buffer().has_committed());
        assert!(!harness.coordinator.owns_transaction());
        assert!(harness.session.current_transaction().is_none());
        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 0);
        assert_eq!(harness.sink.batch_count(), 0);
        assert_eq!(harness.sink.finished().len(), 1);
        assert_eq!(harness.sink.finished()[0].1, TransactionStatus::RolledBack);
        assert_eq!(harness.coordinator.phase(), Phase::Idle);
    }

    #[tokio::test]
    async fn test_save_after_cancelled_auto_open_save_starts_clean() {
        let harness = create_harness(true);
        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100))])
            .unwrap();

        let cancel = CancellationToken::new();
        harness
            .coordinator
            .saving_changes(&harness.session, &cancel)
            .await
            .unwrap();
        assert!(harness.coordinator.owns_transaction());
        cancel.cancel();
        let err = harness
            .coordinator
            .saved_changes(&harness.session, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(harness.session.current_transaction().is_none());

        harness
            .session
            .save_changes(&CancellationToken::new())
            .await
            .unwrap();

        let batches = harness.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].records.len(), 1);
        assert_eq!(batches[0].records[0].action, AuditAction::Create);
        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 1);
    }

    /// Sink that trips the cancellation token while delivering
    struct CancellingSink;

    #[async_trait]
    impl AuditSink<&'static str> for CancellingSink {
        async fn deliver(
            &self,
            _records: Vec<EntityAuditRecord<&'static str>>,
            _transaction: Option<&dyn HostTransaction>,
            _event: Option<&TransactionEvent>,
            cancel: &CancellationToken,
        ) -> AuditResult<()> {
            cancel.cancel();
            Err(AuditError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancelled_owned_commit_rolls_back_and_resets() {
        let sink = Arc::new(MemorySink::new());
        let harness = create_harness_with_sink(true, Arc::new(CancellingSink), sink);
        harness
            .session
            .add(INVOICE, [("Total", FieldValue::from(100))])
            .unwrap();

        let err = harness
            .session
            .save_changes(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        assert!(harness.session.current_transaction().is_none());
        assert_eq!(harness.session.store().count(INVOICE).unwrap(), 0);
        assert!(!harness.coordinator.owns_transaction());
        assert!(!harness.coordinator.commit_in_flight());
        assert!(!harness.coordinator.buffer().has_committed());
        assert_eq!(harness.coordinator.phase(), Phase::Idle);
    }

    /// Sink that records its delivery through the audited session
    struct WritingSink {
        session: MemorySession,
        inner: Arc<MemorySink<&'static str>>,
    }

    #[async_trait]
    impl AuditSink<&'static str> for WritingSink {
        async fn deliver(
            &self,
            records: Vec<EntityAuditRecord<&'static str>>,
            transaction: Option<&dyn HostTransaction>,
            event: Option<&TransactionEvent>,
            cancel: &CancellationToken,
        ) -> AuditResult<()> {
            let text = format!("{} audit records", records.len());
            self.session
                .add(AUDIT_NOTE, [("Text", FieldValue::from(text))])?;
            self.session.save_changes(cancel).await?;
            self.inner.deliver(records, transaction, event, cancel).await
        }
    }

    #[tokio::test]
    async fn test_nested_save_during_commit_not_audited() {
        let sink = Arc::new(MemorySink::new());
        let store = Arc::new(
            MemoryStore::new()
                .with_schema(EntitySchema::with_generated_key(INVOICE, "Id").property("Total"))
                .with_schema(EntitySchema::with_generated_key(AUDIT_NOTE, "Id").property("Text")),
        );
        let session = MemorySession::new(store);
        let registry = RuleRegistry::new()
            .with(RuleConfiguration::builder(INVOICE, "finance.read").build().unwrap())
            .unwrap()
            .with(RuleConfiguration::builder(AUDIT_NOTE, "audit.read").build().unwrap())
            .unwrap();
        let coordinator = Arc::new(AuditCoordinator::new(
            Arc::new(registry),
            Arc::new(WritingSink {
                session: session.clone(),
                inner: Arc::clone(&sink),
            }) as Arc<dyn AuditSink<_>>,
            AuditSettings::default().with_auto_open(true),
        ));
        session.intercept(Arc::clone(&coordinator));

        session
            .add(INVOICE, [("Total", FieldValue::from(9))])
            .unwrap();
        session.save_changes(&CancellationToken::new()).await.unwrap();

        // The sink's own row committed with the audited change
        assert_eq!(session.store().count(AUDIT_NOTE).unwrap(), 1);
        assert_eq!(session.store().count(INVOICE).unwrap(), 1);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_type, INVOICE);
        assert!(!session.has_changes());
    }
}
