//! Persistence layer contract
//!
//! The audit subsystem does not persist entities itself. It consumes a unit
//! of work that reports pending changes and primary keys, opens host
//! transactions, and raises lifecycle events through the interceptor
//! traits below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AuditError, AuditResult};
use crate::models::{EntityEntry, EntityHandle, TransactionId};

/// Outcome of a host transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Committed,
    RolledBack,
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Committed => write!(f, "committed"),
            TransactionStatus::RolledBack => write!(f, "rolled back"),
            TransactionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Context accompanying transaction lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    pub transaction_id: TransactionId,
    pub started_at: DateTime<Utc>,
    /// Failure description for failed transactions
    pub error: Option<String>,
}

impl TransactionEvent {
    pub fn new(transaction_id: TransactionId, started_at: DateTime<Utc>) -> Self {
        Self {
            transaction_id,
            started_at,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// A live host transaction
#[async_trait]
pub trait HostTransaction: Send + Sync {
    fn id(&self) -> TransactionId;

    async fn commit(&self, cancel: &CancellationToken) -> AuditResult<()>;

    async fn rollback(&self, cancel: &CancellationToken) -> AuditResult<()>;

    /// Dispose of the handle. A transaction that was neither committed nor
    /// rolled back is rolled back; otherwise this is a no-op.
    fn release(&self);
}

/// One logical persistence session
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Tracked entities with a pending mutation
    fn pending_changes(&self) -> Vec<EntityEntry>;

    /// Current primary-key value of a tracked entity
    fn primary_key_value(&self, entity: EntityHandle) -> Option<String>;

    /// The open transaction, if any
    fn current_transaction(&self) -> Option<TransactionId>;

    async fn begin_transaction(
        &self,
        cancel: &CancellationToken,
    ) -> AuditResult<Box<dyn HostTransaction>>;
}

/// Save lifecycle events
#[async_trait]
pub trait SaveChangesInterceptor: Send + Sync {
    async fn saving_changes(
        &self,
        unit_of_work: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> AuditResult<()>;

    async fn saved_changes(
        &self,
        unit_of_work: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> AuditResult<()>;

    async fn save_failed(
        &self,
        unit_of_work: &dyn UnitOfWork,
        error: &AuditError,
        cancel: &CancellationToken,
    ) -> AuditResult<()>;
}

/// Transaction lifecycle events
#[async_trait]
pub trait TransactionInterceptor: Send + Sync {
    /// Raised before the commit finalizes
    async fn transaction_committing(
        &self,
        transaction: &dyn HostTransaction,
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) -> AuditResult<()>;

    async fn transaction_committed(&self, event: &TransactionEvent, cancel: &CancellationToken);

    async fn transaction_rolled_back(&self, event: &TransactionEvent, cancel: &CancellationToken);

    async fn transaction_failed(&self, event: &TransactionEvent, cancel: &CancellationToken);
}

/// Scope guard around a transaction opened by the audit subsystem
///
/// The wrapped transaction is released when the guard drops, whether or
/// not it was completed.
pub struct OwnedTransaction {
    inner: Box<dyn HostTransaction>,
}

impl OwnedTransaction {
    pub fn new(inner: Box<dyn HostTransaction>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id()
    }

    pub async fn commit(&self, cancel: &CancellationToken) -> AuditResult<()> {
        self.inner.commit(cancel).await
    }

    pub async fn rollback(&self, cancel: &CancellationToken) -> AuditResult<()> {
        self.inner.rollback(cancel).await
    }
}

impl Drop for OwnedTransaction {
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl std::fmt::Debug for OwnedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedTransaction")
            .field("id", &self.inner.id())
            .finish()
    }
}

/// Fail with [`AuditError::Cancelled`] if `cancel` was triggered
pub fn ensure_not_cancelled(cancel: &CancellationToken) -> AuditResult<()> {
    if cancel.is_cancelled() {
        Err(AuditError::Cancelled)
    } else {
        Ok(())
    }
}
