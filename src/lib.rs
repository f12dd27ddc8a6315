//! entity-audit - transactional audit capture for entity changes
//!
//! Captures create, update and delete operations performed through a
//! persistence layer's unit of work, filters and reshapes recorded values
//! with per-entity-type rules, and delivers the resulting audit records to a
//! sink either immediately or just before the enclosing transaction commits.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - `rules`: Per-entity-type rule configurations and the registry
//! - `audit`: Snapshot builder, transaction buffer and the coordinator
//! - `persistence`: Unit-of-work, transaction and interceptor contracts
//! - `sink`: Audit sink contract with in-memory and JSON-lines sinks
//! - `storage`: In-memory persistence layer and atomic JSON file I/O
//! - `crypto`: AES-256-GCM field decryption with Argon2id key derivation
//! - `config`: Audit settings
//! - `models`: Change-set entries, property values and identifiers
//! - `logging`: Subscriber setup for binaries
//! - `cli`: Handlers for the command-line tool
//! - `error`: Custom error types
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use entity_audit::{AuditCoordinator, AuditSettings, MemorySink, RuleConfiguration, RuleRegistry};
//!
//! let registry = RuleRegistry::new().with(
//!     RuleConfiguration::builder("billing::Invoice", "finance.read")
//!         .rename("Note", "Comment")
//!         .build()?,
//! )?;
//! let settings = AuditSettings::load_or_default("audit.json")?;
//! let coordinator = AuditCoordinator::new(Arc::new(registry), Arc::new(MemorySink::new()), settings);
//! ```

pub mod audit;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod rules;
pub mod sink;
pub mod storage;

pub use audit::{AuditAction, AuditCoordinator, EntityAuditRecord, EntityChangeRecord, Phase};
pub use config::AuditSettings;
pub use error::{AuditError, AuditResult};
pub use rules::{FieldDecryptor, PropertyRule, RuleConfiguration, RuleRegistry};
pub use sink::{AuditSink, JsonLinesSink, MemorySink};
