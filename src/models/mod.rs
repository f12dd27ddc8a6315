//! Core data models
//!
//! Identifiers, property values and the change-set entries exchanged with
//! the persistence layer.

pub mod change;
pub mod ids;
pub mod value;

pub use change::{EntityEntry, EntityState, KeyKind, PropertyEntry};
pub use ids::{AuditRecordId, EntityHandle, TransactionId};
pub use value::FieldValue;
