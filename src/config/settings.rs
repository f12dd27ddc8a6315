//! Audit settings
//!
//! The only behavioral option is whether the coordinator opens a transaction
//! itself when a save starts outside one.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AuditError;
use crate::storage::file_io::{read_json, write_json_atomic};

/// Settings for the audit coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Schema version for migration support
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    /// Open a transaction during save when none is active
    #[serde(default)]
    pub auto_open_transaction: bool,
}

fn default_schema_version() -> u32 {
    1
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            auto_open_transaction: false,
        }
    }
}

impl AuditSettings {
    pub fn with_auto_open(mut self, auto_open: bool) -> Self {
        self.auto_open_transaction = auto_open;
        self
    }

    /// Load settings from disk, or defaults if the file doesn't exist
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        read_json(path).map_err(|e| match e {
            AuditError::Json(msg) => {
                AuditError::Config(format!("Failed to parse settings file: {}", msg))
            }
            other => other,
        })
    }

    /// Save settings to disk
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), AuditError> {
        write_json_atomic(path, self)
    }
}
