//! `show` command: print records from a JSON-lines audit log

use std::path::Path;

use crate::audit::EntityAuditRecord;
use crate::error::{AuditError, AuditResult};
use crate::sink::JsonLinesSink;

/// Render records either as human-readable blocks or as JSON lines
pub fn render_records(records: &[EntityAuditRecord<String>], json: bool) -> AuditResult<Vec<String>> {
    records
        .iter()
        .map(|record| {
            if json {
                serde_json::to_string(record).map_err(|e| {
                    AuditError::Json(format!("Failed to serialize audit record: {}", e))
                })
            } else {
                Ok(format!(
                    "{}\n  Type: {}  Permission: {}",
                    record.format_human_readable(),
                    record.entity_type,
                    record.required_read_permission
                ))
            }
        })
        .collect()
}

/// Handle the show command
pub fn handle_show_command(log: &Path, count: Option<usize>, json: bool) -> AuditResult<()> {
    let sink: JsonLinesSink<String> = JsonLinesSink::new(log);

    if !sink.exists() {
        return Err(AuditError::Io(format!(
            "Audit log not found: {}",
            log.display()
        )));
    }

    let records = match count {
        Some(count) => sink.read_recent(count)?,
        None => sink.read_all()?,
    };

    if records.is_empty() {
        println!("No audit records in {}", log.display());
        return Ok(());
    }

    for line in render_records(&records, json)? {
        println!("{}", line);
    }

    if !json {
        println!();
        println!("{} of {} record(s)", records.len(), sink.entry_count()?);
    }

    Ok(())
}
