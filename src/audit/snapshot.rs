//! Snapshot builder
//!
//! Turns the persistence layer's pending change set into audit records,
//! consulting the rule registry for every property, and promotes captured
//! records once the save has produced generated keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::AuditResult;
use crate::models::EntityEntry;
use crate::persistence::UnitOfWork;
use crate::rules::RuleRegistry;

use super::entry::{AuditAction, EntityAuditRecord, EntityChangeRecord};

/// Builds audit records from change sets
#[derive(Debug)]
pub struct SnapshotBuilder<P> {
    registry: Arc<RuleRegistry<P>>,
}

impl<P: Clone> SnapshotBuilder<P> {
    pub fn new(registry: Arc<RuleRegistry<P>>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RuleRegistry<P> {
        &self.registry
    }

    /// Capture one record per pending change of an audited entity type.
    ///
    /// Entity types without a registered configuration are not audited and
    /// are skipped.
    pub fn capture_before_save(
        &self,
        unit_of_work: &dyn UnitOfWork,
    ) -> AuditResult<Vec<EntityChangeRecord<P>>> {
        let mut records = Vec::new();

        for entry in unit_of_work.pending_changes() {
            if !self.registry.contains(&entry.entity_type) {
                continue;
            }
            records.push(self.capture_entry(&entry, unit_of_work)?);
        }

        debug!(count = records.len(), "Captured audit records before save");
        Ok(records)
    }

    /// Capture a single change-set entry.
    ///
    /// Creates inspect every declared property; updates and deletes only
    /// those flagged as modified.
    pub fn capture_entry(
        &self,
        entry: &EntityEntry,
        unit_of_work: &dyn UnitOfWork,
    ) -> AuditResult<EntityChangeRecord<P>> {
        let config = self.registry.resolve(&entry.entity_type)?;
        let action = AuditAction::from_state(entry.state, &entry.entity_type)?;

        let mut tracked = BTreeMap::new();
        let inspected = entry
            .properties
            .iter()
            .filter(|p| action == AuditAction::Create || p.is_modified)
            .filter(|p| p.is_recordable());

        for property in inspected {
            config.execute_rules(&property.name, property.current_value.clone(), &mut tracked)?;
        }

        EntityChangeRecord::capture(
            entry.entity,
            unit_of_work.primary_key_value(entry.entity),
            entry.entity_type.as_str(),
            config.entity_name(),
            action,
            config.permission().clone(),
            tracked,
        )
    }

    /// Promote captured records after save, preserving order.
    ///
    /// Creates re-resolve their id since generated keys only exist once
    /// the insert ran; every other record keeps the id captured before save.
    pub fn promote_after_save(
        &self,
        records: Vec<EntityChangeRecord<P>>,
        unit_of_work: &dyn UnitOfWork,
    ) -> Vec<EntityAuditRecord<P>> {
        records
            .into_iter()
            .map(|record| {
                let entity_id = match record.action {
                    AuditAction::Create => unit_of_work
                        .primary_key_value(record.entity)
                        .or_else(|| record.entity_id.clone()),
                    _ => record.entity_id.clone(),
                };
                record.promote(entity_id)
            })
            .collect()
    }
}
