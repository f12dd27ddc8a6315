//! Configuration module for entity-audit
//!
//! Settings are plain JSON files; the command-line tool can override them
//! with flags and environment variables.

pub mod settings;

pub use settings::AuditSettings;
