//! Audit capture for entity changes
//!
//! # Architecture
//!
//! - `EntityChangeRecord` / `EntityAuditRecord`: a captured change before
//!   and after the save that produced it.
//! - `SnapshotBuilder`: turns the pending change set into records using the
//!   rule registry, and promotes them after save.
//! - `TransactionBuffer`: records waiting for their save to finish or for
//!   the enclosing transaction to commit.
//! - `AuditCoordinator`: reacts to save and transaction events and hands
//!   finished batches to an `AuditSink`.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use entity_audit::{AuditCoordinator, AuditSettings, MemorySink, RuleConfiguration, RuleRegistry};
//!
//! let registry = RuleRegistry::new().with(
//!     RuleConfiguration::builder("billing::Invoice", "finance.read")
//!         .ignore("Note")
//!         .build()?,
//! )?;
//!
//! let coordinator = Arc::new(AuditCoordinator::new(
//!     Arc::new(registry),
//!     Arc::new(MemorySink::new()),
//!     AuditSettings::default(),
//! ));
//! session.intercept(coordinator);
//! session.save_changes(&cancel).await?;
//! ```

mod buffer;
mod coordinator;
mod entry;
mod snapshot;

pub use buffer::TransactionBuffer;
pub use coordinator::{AuditCoordinator, Phase};
pub use entry::{batch_justifies_delivery, AuditAction, EntityAuditRecord, EntityChangeRecord};
pub use snapshot::SnapshotBuilder;
