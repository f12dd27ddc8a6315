//! Custom error types for entity-audit
//!
//! This module defines the error hierarchy for the audit subsystem using
//! thiserror for ergonomic error definitions.

use thiserror::Error;

/// The main error type for audit capture operations
#[derive(Error, Debug)]
pub enum AuditError {
    /// General configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An audited entity type has no rule configuration registered
    #[error("Missing rule configuration for entity type '{entity_type}'")]
    MissingRules { entity_type: String },

    /// A decrypt rule received a raw value that is not a byte sequence
    #[error(
        "Only byte sequence decryption is supported, invalid type: {actual} entity: {entity_type} property: {property}"
    )]
    TypeMismatch {
        entity_type: String,
        property: String,
        actual: &'static str,
    },

    /// Byte-shaped input that could not be decrypted
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// The persistence layer reported a mutation kind outside create/update/delete
    #[error("Invalid entity state '{state}' for entity type '{entity_type}'")]
    InvalidState {
        entity_type: String,
        state: String,
    },

    /// Host transaction errors (begin, commit, rollback)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Persistence layer errors outside transaction handling
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Audit sink delivery errors
    #[error("Sink error: {0}")]
    Sink(String),

    /// A cancellation signal aborted the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(String),
}

impl AuditError {
    /// Create a "missing rules" error for an entity type
    pub fn missing_rules(entity_type: impl Into<String>) -> Self {
        Self::MissingRules {
            entity_type: entity_type.into(),
        }
    }

    /// Check if this error signals a setup defect that must reach the caller
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::MissingRules { .. } | Self::TypeMismatch { .. }
        )
    }

    /// Check if this error was caused by a cancellation signal
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Result type alias for audit operations
pub type AuditResult<T> = Result<T, AuditError>;
