//! Per-unit-of-work accumulator of audit records awaiting delivery
//!
//! Holds two independent collections: records captured before the current
//! save (pending-save) and promoted records waiting for the host
//! transaction to commit (pending-commit). Every operation is safe to call
//! concurrently from multiple in-flight saves.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::entry::{EntityAuditRecord, EntityChangeRecord};

/// Thread-safe audit record buffer owned by one coordinator
#[derive(Debug)]
pub struct TransactionBuffer<P> {
    pending_save: Mutex<Vec<EntityChangeRecord<P>>>,
    pending_commit: Mutex<Vec<EntityAuditRecord<P>>>,
}

impl<P> Default for TransactionBuffer<P> {
    fn default() -> Self {
        Self {
            pending_save: Mutex::new(Vec::new()),
            pending_commit: Mutex::new(Vec::new()),
        }
    }
}

// Poisoned locks stay usable
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P> TransactionBuffer<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pending(&self, record: EntityChangeRecord<P>) {
        lock(&self.pending_save).push(record);
    }

    pub fn extend_pending(&self, records: impl IntoIterator<Item = EntityChangeRecord<P>>) {
        lock(&self.pending_save).extend(records);
    }

    pub fn add_committed(&self, record: EntityAuditRecord<P>) {
        lock(&self.pending_commit).push(record);
    }

    pub fn extend_committed(&self, records: impl IntoIterator<Item = EntityAuditRecord<P>>) {
        lock(&self.pending_commit).extend(records);
    }

    /// Take all pending-save records, leaving the set empty
    pub fn drain_pending(&self) -> Vec<EntityChangeRecord<P>> {
        std::mem::take(&mut *lock(&self.pending_save))
    }

    /// Take all pending-commit records, leaving the set empty
    pub fn drain_committed(&self) -> Vec<EntityAuditRecord<P>> {
        std::mem::take(&mut *lock(&self.pending_commit))
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.pending_save).is_empty()
    }

    pub fn has_committed(&self) -> bool {
        !lock(&self.pending_commit).is_empty()
    }

    /// Whether any pending-commit record warrants delivery
    pub fn committed_justifies_delivery(&self) -> bool {
        lock(&self.pending_commit)
            .iter()
            .any(EntityAuditRecord::justifies_delivery)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending_save).len()
    }

    pub fn committed_len(&self) -> usize {
        lock(&self.pending_commit).len()
    }

    /// Discard both collections
    pub fn clear(&self) {
        lock(&self.pending_save).clear();
        lock(&self.pending_commit).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::entry::AuditAction;
    use crate::models::EntityHandle;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn change(action: AuditAction) -> EntityChangeRecord<()> {
        EntityChangeRecord::capture(
            EntityHandle::new(1),
            None,
            "Invoice",
            "Invoice",
            action,
            (),
            BTreeMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_drain_pending_clears() {
        let buffer = TransactionBuffer::new();
        buffer.add_pending(change(AuditAction::Create));
        buffer.add_pending(change(AuditAction::Delete));

        assert_eq!(buffer.drain_pending().len(), 2);
        assert!(!buffer.has_pending());
        assert!(buffer.drain_pending().is_empty());
    }

    #[test]
    fn test_collections_are_independent() {
        let buffer = TransactionBuffer::new();
        buffer.add_pending(change(AuditAction::Create));
        buffer.add_committed(change(AuditAction::Update).promote(Some("1".into())));

        assert_eq!(buffer.drain_committed().len(), 1);
        assert!(!buffer.has_committed());
        assert_eq!(buffer.pending_len(), 1);
    }

    #[test]
    fn test_committed_justification() {
        let buffer = TransactionBuffer::new();
        buffer.add_committed(change(AuditAction::Update).promote(None));
        assert!(buffer.has_committed());
        assert!(!buffer.committed_justifies_delivery());

        buffer.add_committed(change(AuditAction::Delete).promote(None));
        assert!(buffer.committed_justifies_delivery());
    }

    #[test]
    fn test_concurrent_appends() {
        let buffer = Arc::new(TransactionBuffer::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        buffer.add_pending(change(AuditAction::Create));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.drain_pending().len(), 400);
    }

    #[test]
    fn test_clear() {
        let buffer = TransactionBuffer::new();
        buffer.add_pending(change(AuditAction::Create));
        buffer.add_committed(change(AuditAction::Create).promote(None));
        buffer.clear();
        assert!(!buffer.has_pending());
        assert!(!buffer.has_committed());
    }
}
