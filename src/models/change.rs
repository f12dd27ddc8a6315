//! Change-set entries reported by the persistence layer
//!
//! One `EntityEntry` describes a tracked entity with a pending mutation and
//! the current values of its declared properties.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::EntityHandle;
use super::value::FieldValue;

/// Mutation state of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    /// Not tracked by the unit of work
    Detached,
    /// Tracked, no pending mutation
    Unchanged,
    /// Pending insert
    Added,
    /// Pending update
    Modified,
    /// Pending delete
    Deleted,
}

impl EntityState {
    /// Whether the state represents a pending mutation
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityState::Detached => write!(f, "Detached"),
            EntityState::Unchanged => write!(f, "Unchanged"),
            EntityState::Added => write!(f, "Added"),
            EntityState::Modified => write!(f, "Modified"),
            EntityState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Role of a property with respect to the entity's primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    /// Ordinary property
    #[default]
    None,
    /// Primary key supplied by the caller
    Supplied,
    /// Primary key generated by the database on insert
    Generated,
}

/// A property of a tracked entity together with its current value
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    pub name: String,
    pub current_value: FieldValue,
    pub is_modified: bool,
    pub key: KeyKind,
    /// Bookkeeping column with no backing field on the domain object
    pub is_shadow: bool,
}

impl PropertyEntry {
    pub fn new(name: impl Into<String>, current_value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            current_value: current_value.into(),
            is_modified: false,
            key: KeyKind::None,
            is_shadow: false,
        }
    }

    pub fn modified(mut self, is_modified: bool) -> Self {
        self.is_modified = is_modified;
        self
    }

    pub fn key(mut self, key: KeyKind) -> Self {
        self.key = key;
        self
    }

    pub fn shadow(mut self) -> Self {
        self.is_shadow = true;
        self
    }

    /// Primary keys are recorded only when the database generates them
    pub fn is_recordable(&self) -> bool {
        !self.is_shadow && self.key != KeyKind::Supplied
    }
}

/// A tracked entity with a pending mutation
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    pub entity: EntityHandle,
    /// Entity-type tag, e.g. `billing::Invoice`
    pub entity_type: String,
    pub state: EntityState,
    pub properties: Vec<PropertyEntry>,
}

impl EntityEntry {
    /// Names of properties flagged as modified
    pub fn modified_property_names(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|p| p.is_modified)
            .map(|p| p.name.as_str())
    }
}
