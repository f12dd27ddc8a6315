//! Append-only JSON-lines audit log sink
//!
//! Each delivered record is written as a single JSON line. A batch is
//! written with one append and flushed once at the end.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::audit::EntityAuditRecord;
use crate::error::{AuditError, AuditResult};
use crate::persistence::{ensure_not_cancelled, HostTransaction, TransactionEvent};

use super::AuditSink;

/// Handles writing audit records to a JSON-lines log file
pub struct JsonLinesSink<P> {
    log_path: PathBuf,
    write_lock: Mutex<()>,
    _permission: PhantomData<fn() -> P>,
}

impl<P> JsonLinesSink<P> {
    /// Create a sink that appends to the specified path
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            write_lock: Mutex::new(()),
            _permission: PhantomData,
        }
    }

    /// Get the path to the log file
    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Check if the log file exists
    pub fn exists(&self) -> bool {
        self.log_path.exists()
    }

    /// Read all records from the log file, oldest first
    pub fn read_all(&self) -> AuditResult<Vec<EntityAuditRecord<P>>>
    where
        P: DeserializeOwned,
    {
        read_records(&self.log_path)
    }

    /// Read the most recent `count` records
    pub fn read_recent(&self, count: usize) -> AuditResult<Vec<EntityAuditRecord<P>>>
    where
        P: DeserializeOwned,
    {
        let mut all = self.read_all()?;
        let start = all.len().saturating_sub(count);
        Ok(all.split_off(start))
    }

    /// Number of records in the log
    pub fn entry_count(&self) -> AuditResult<usize> {
        if !self.log_path.exists() {
            return Ok(0);
        }

        let file = File::open(&self.log_path)
            .map_err(|e| AuditError::Io(format!("Failed to open audit log: {}", e)))?;

        Ok(BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .count())
    }
}

/// Read every record from a JSON-lines audit log
pub fn read_records<P: DeserializeOwned>(path: &Path) -> AuditResult<Vec<EntityAuditRecord<P>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)
        .map_err(|e| AuditError::Io(format!("Failed to open audit log: {}", e)))?;

    let mut records = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| {
            AuditError::Io(format!("Failed to read audit log line {}: {}", line_num + 1, e))
        })?;

        if line.trim().is_empty() {
            continue;
        }

        let record = serde_json::from_str(&line).map_err(|e| {
            AuditError::Json(format!(
                "Failed to parse audit record at line {}: {}",
                line_num + 1,
                e
            ))
        })?;
        records.push(record);
    }

    Ok(records)
}

#[async_trait]
impl<P: Serialize + Send + Sync + 'static> AuditSink<P> for JsonLinesSink<P> {
    async fn deliver(
        &self,
        records: Vec<EntityAuditRecord<P>>,
        _transaction: Option<&dyn HostTransaction>,
        event: Option<&TransactionEvent>,
        cancel: &CancellationToken,
    ) -> AuditResult<()> {
        ensure_not_cancelled(cancel)?;

        if records.is_empty() {
            return Ok(());
        }

        let mut lines = String::new();
        for record in &records {
            let json = serde_json::to_string(record).map_err(|e| {
                AuditError::Json(format!("Failed to serialize audit record: {}", e))
            })?;
            lines.push_str(&json);
            lines.push('\n');
        }

        let _guard = self.write_lock.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|e| AuditError::Io(format!("Failed to open audit log: {}", e)))?;

        file.write_all(lines.as_bytes())
            .await
            .map_err(|e| AuditError::Io(format!("Failed to write audit records: {}", e)))?;

        file.flush()
            .await
            .map_err(|e| AuditError::Io(format!("Failed to flush audit log: {}", e)))?;

        debug!(
            path = %self.log_path.display(),
            count = records.len(),
            transaction = ?event.map(|e| e.transaction_id),
            "Appended audit records"
        );

        Ok(())
    }
}
