//! Audit sink contract
//!
//! A sink durably stores or forwards delivered audit records. The
//! coordinator calls `deliver` at most once per logical commit and never
//! retries: a failed delivery is logged and dropped so that it cannot
//! disturb the host's save or commit.
//!
//! Two sinks ship with the crate:
//!
//! - `MemorySink`: collects delivered batches in memory, for tests and
//!   embedding.
//! - `JsonLinesSink`: appends each record as one JSON line to a log file.

mod jsonl;
mod memory;

pub use jsonl::{read_records, JsonLinesSink};
pub use memory::{DeliveredBatch, MemorySink};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audit::EntityAuditRecord;
use crate::error::AuditResult;
use crate::persistence::{HostTransaction, TransactionEvent, TransactionStatus};

/// Consumer of delivered audit records
#[async_trait]
pub trait AuditSink<P: Send + 'static>: Send + Sync {
    /// Deliver a batch of records.
    ///
    /// Inside a host transaction, `transaction` is the live handle so the
    /// sink can take part in the same atomic unit, and `event` describes
    /// it. Both are `None` for immediate delivery outside a transaction.
    async fn deliver(
        &self,
        records: Vec<EntityAuditRecord<P>>,
        transaction: Option<&dyn HostTransaction>,
        event: Option<&TransactionEvent>,
        cancel: &CancellationToken,
    ) -> AuditResult<()>;

    /// Best-effort notification that a host transaction ended
    async fn transaction_finished(
        &self,
        _event: &TransactionEvent,
        _status: TransactionStatus,
        _cancel: &CancellationToken,
    ) {
    }
}
