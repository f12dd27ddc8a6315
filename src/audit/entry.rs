//! Audit record data structures
//!
//! `EntityChangeRecord` is captured before the persistence layer executes a
//! save. `EntityAuditRecord` is its post-save counterpart carrying the
//! finalized entity id, and is what sinks receive.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, AuditResult};
use crate::models::{AuditRecordId, EntityHandle, EntityState, FieldValue};

/// Types of mutations that are audited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    /// Entity was created
    Create,
    /// Entity was updated
    Update,
    /// Entity was deleted
    Delete,
}

impl AuditAction {
    /// Derive the action from the persistence layer's entity state.
    ///
    /// Any state other than added/modified/deleted violates the change-set
    /// contract and fails.
    pub fn from_state(state: EntityState, entity_type: &str) -> AuditResult<Self> {
        match state {
            EntityState::Added => Ok(AuditAction::Create),
            EntityState::Modified => Ok(AuditAction::Update),
            EntityState::Deleted => Ok(AuditAction::Delete),
            other => Err(AuditError::InvalidState {
                entity_type: entity_type.to_string(),
                state: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditAction::Create => write!(f, "CREATE"),
            AuditAction::Update => write!(f, "UPDATE"),
            AuditAction::Delete => write!(f, "DELETE"),
        }
    }
}

/// A mutation captured before save
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChangeRecord<P> {
    /// Correlates the pre-save record with its post-save counterpart
    pub unique_id: AuditRecordId,

    /// Handle of the mutated entity within its unit of work
    #[serde(skip)]
    pub entity: EntityHandle,

    /// Primary key; unresolved for creates until after save
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Entity-type tag the record was captured for
    pub entity_type: String,

    /// Display name of the entity type
    pub entity_name: String,

    pub action: AuditAction,

    /// Permission tag required to read this record
    pub required_read_permission: P,

    /// Recorded property values after rule evaluation
    pub tracked_properties: BTreeMap<String, FieldValue>,

    /// JSON form of `tracked_properties`, computed once at capture
    pub serialized_payload: String,

    /// When the mutation was captured (UTC)
    pub timestamp: DateTime<Utc>,
}

impl<P> EntityChangeRecord<P> {
    /// Capture a new record, serializing the tracked properties once
    pub fn capture(
        entity: EntityHandle,
        entity_id: Option<String>,
        entity_type: impl Into<String>,
        entity_name: impl Into<String>,
        action: AuditAction,
        required_read_permission: P,
        tracked_properties: BTreeMap<String, FieldValue>,
    ) -> AuditResult<Self> {
        let serialized_payload = serde_json::to_string(&tracked_properties)?;

        Ok(Self {
            unique_id: AuditRecordId::new(),
            entity,
            entity_id,
            entity_type: entity_type.into(),
            entity_name: entity_name.into(),
            action,
            required_read_permission,
            tracked_properties,
            serialized_payload,
            timestamp: Utc::now(),
        })
    }

    /// Produce the post-save record carrying `entity_id`
    pub fn promote(self, entity_id: Option<String>) -> EntityAuditRecord<P> {
        EntityAuditRecord {
            unique_id: self.unique_id,
            entity: self.entity,
            entity_id,
            entity_type: self.entity_type,
            entity_name: self.entity_name,
            action: self.action,
            required_read_permission: self.required_read_permission,
            tracked_properties: self.tracked_properties,
            serialized_payload: self.serialized_payload,
            timestamp: self.timestamp,
        }
    }
}

/// A mutation finalized after save, ready for delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityAuditRecord<P> {
    pub unique_id: AuditRecordId,

    #[serde(skip)]
    pub entity: EntityHandle,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    pub entity_type: String,

    pub entity_name: String,

    pub action: AuditAction,

    pub required_read_permission: P,

    pub tracked_properties: BTreeMap<String, FieldValue>,

    pub serialized_payload: String,

    pub timestamp: DateTime<Utc>,
}

impl<P> EntityAuditRecord<P> {
    /// Whether at least one property value was recorded
    pub fn has_changes(&self) -> bool {
        !self.tracked_properties.is_empty()
    }

    /// Whether this record alone warrants delivering its batch.
    ///
    /// An update that recorded nothing never does; it still travels with a
    /// batch that some other record justifies.
    pub fn justifies_delivery(&self) -> bool {
        self.action != AuditAction::Update || self.has_changes()
    }

    /// Format the record for human-readable output
    pub fn format_human_readable(&self) -> String {
        let mut output = format!(
            "[{}] {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.action,
            self.entity_name,
            self.entity_id.as_deref().unwrap_or("-")
        );

        if self.has_changes() {
            let changes: Vec<String> = self
                .tracked_properties
                .iter()
                .map(|(name, value)| format!("{}: {}", name, value))
                .collect();
            output.push_str(&format!("\n  Values: {}", changes.join(", ")));
        }

        output
    }
}

/// Whether any record in `records` warrants delivery
pub fn batch_justifies_delivery<P>(records: &[EntityAuditRecord<P>]) -> bool {
    records.iter().any(EntityAuditRecord::justifies_delivery)
}
