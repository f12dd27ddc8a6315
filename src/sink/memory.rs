//! In-memory audit sink

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audit::EntityAuditRecord;
use crate::error::{AuditError, AuditResult};
use crate::models::TransactionId;
use crate::persistence::{
    ensure_not_cancelled, HostTransaction, TransactionEvent, TransactionStatus,
};

use super::AuditSink;

/// One successful `deliver` call
#[derive(Debug, Clone)]
pub struct DeliveredBatch<P> {
    pub records: Vec<EntityAuditRecord<P>>,
    /// Transaction the batch was delivered in, if any
    pub transaction_id: Option<TransactionId>,
}

/// Sink that keeps every delivered batch in memory
#[derive(Debug)]
pub struct MemorySink<P> {
    batches: Mutex<Vec<DeliveredBatch<P>>>,
    finished: Mutex<Vec<(TransactionId, TransactionStatus)>>,
    failing: AtomicBool,
}

impl<P> Default for MemorySink<P> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: Clone> MemorySink<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent deliveries fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<DeliveredBatch<P>> {
        lock(&self.batches).clone()
    }

    pub fn batch_count(&self) -> usize {
        lock(&self.batches).len()
    }

    /// All delivered records, in delivery order
    pub fn records(&self) -> Vec<EntityAuditRecord<P>> {
        lock(&self.batches)
            .iter()
            .flat_map(|batch| batch.records.iter().cloned())
            .collect()
    }

    /// Transaction-finished notifications received so far
    pub fn finished(&self) -> Vec<(TransactionId, TransactionStatus)> {
        lock(&self.finished).clone()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> AuditSink<P> for MemorySink<P> {
    async fn deliver(
        &self,
        records: Vec<EntityAuditRecord<P>>,
        transaction: Option<&dyn HostTransaction>,
        _event: Option<&TransactionEvent>,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        ensure_not_cancelled(cancel)?;

        if self.failing.load(Ordering::SeqCst) {
            return Err(AuditError::Sink("memory sink is failing".into()));
        }

        lock(&self.batches).push(DeliveredBatch {
            records,
            transaction_id: transaction.map(|t| t.id()),
        });
        Ok(())
    }

    async fn transaction_finished(
        &self,
        event: &TransactionEvent,
        status: TransactionStatus,
        _cancel: &CancellationToken,
    ) {
        lock(&self.finished).push((event.transaction_id, status));
    }
}
