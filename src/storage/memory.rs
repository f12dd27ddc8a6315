//! In-memory persistence layer
//!
//! `MemoryStore` holds committed rows per entity type. `MemorySession` is a
//! unit of work over a store: it tracks entities, assigns generated keys on
//! insert, and runs snapshot-based transactions that raise the interceptor
//! events the audit coordinator listens to.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AuditError, AuditResult};
use crate::models::{
    EntityEntry, EntityHandle, EntityState, FieldValue, KeyKind, PropertyEntry, TransactionId,
};
use crate::persistence::{
    ensure_not_cancelled, HostTransaction, SaveChangesInterceptor, TransactionEvent,
    TransactionInterceptor, UnitOfWork,
};

/// Column values of one entity, keyed by property name
pub type Row = BTreeMap<String, FieldValue>;

type Tables = HashMap<String, BTreeMap<String, Row>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shape of one entity type
#[derive(Debug, Clone)]
pub struct EntitySchema {
    entity_type: String,
    key: String,
    key_generated: bool,
    properties: Vec<String>,
    shadow: Vec<String>,
}

impl EntitySchema {
    /// Schema whose key is assigned by the store on insert
    pub fn with_generated_key(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(entity_type.into(), key.into(), true)
    }

    /// Schema whose key is supplied by the caller
    pub fn with_supplied_key(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(entity_type.into(), key.into(), false)
    }

    fn new(entity_type: String, key: String, key_generated: bool) -> Self {
        Self {
            entity_type,
            key,
            key_generated,
            properties: Vec::new(),
            shadow: Vec::new(),
        }
    }

    pub fn property(mut self, name: impl Into<String>) -> Self {
        self.properties.push(name.into());
        self
    }

    /// Bookkeeping column with no domain-object backing
    pub fn shadow(mut self, name: impl Into<String>) -> Self {
        self.shadow.push(name.into());
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn key_kind(&self) -> KeyKind {
        if self.key_generated {
            KeyKind::Generated
        } else {
            KeyKind::Supplied
        }
    }

    fn declares(&self, name: &str) -> bool {
        self.key == name
            || self.properties.iter().any(|p| p == name)
            || self.shadow.iter().any(|p| p == name)
    }

    /// Every column as (name, key role, is shadow), key first
    fn columns(&self) -> Vec<(&str, KeyKind, bool)> {
        let mut columns = vec![(self.key.as_str(), self.key_kind(), false)];
        columns.extend(self.properties.iter().map(|p| (p.as_str(), KeyKind::None, false)));
        columns.extend(self.shadow.iter().map(|p| (p.as_str(), KeyKind::None, true)));
        columns
    }

    fn key_of(&self, values: &Row) -> AuditResult<String> {
        values
            .get(&self.key)
            .and_then(FieldValue::to_key_string)
            .ok_or_else(|| {
                AuditError::Persistence(format!(
                    "Entity of type '{}' has no value for key '{}'",
                    self.entity_type, self.key
                ))
            })
    }
}

/// Committed rows for a set of entity types
pub struct MemoryStore {
    schemas: HashMap<String, EntitySchema>,
    tables: RwLock<Tables>,
    next_key: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            schemas: HashMap::new(),
            tables: RwLock::new(HashMap::new()),
            next_key: AtomicI64::new(1),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: EntitySchema) -> Self {
        self.schemas.insert(schema.entity_type.clone(), schema);
        self
    }

    pub fn schema(&self, entity_type: &str) -> AuditResult<&EntitySchema> {
        self.schemas.get(entity_type).ok_or_else(|| {
            AuditError::Persistence(format!("Unknown entity type '{}'", entity_type))
        })
    }

    /// Get a committed row by key
    pub fn get(&self, entity_type: &str, key: &str) -> AuditResult<Option<Row>> {
        let tables = self.tables.read().map_err(|e| {
            AuditError::Persistence(format!("Failed to acquire read lock: {}", e))
        })?;

        Ok(tables.get(entity_type).and_then(|t| t.get(key)).cloned())
    }

    /// Number of committed rows of an entity type
    pub fn count(&self, entity_type: &str) -> AuditResult<usize> {
        let tables = self.tables.read().map_err(|e| {
            AuditError::Persistence(format!("Failed to acquire read lock: {}", e))
        })?;

        Ok(tables.get(entity_type).map_or(0, BTreeMap::len))
    }

    fn next_key(&self) -> i64 {
        self.next_key.fetch_add(1, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct TrackedEntity {
    entity_type: String,
    state: EntityState,
    values: Row,
    original: Row,
}

struct Snapshot {
    tables: Tables,
    tracked: BTreeMap<EntityHandle, TrackedEntity>,
}

struct SessionInner {
    store: Arc<MemoryStore>,
    tracked: Mutex<BTreeMap<EntityHandle, TrackedEntity>>,
    next_handle: AtomicU64,
    transaction: Mutex<Option<TransactionId>>,
    save_interceptors: RwLock<Vec<Arc<dyn SaveChangesInterceptor>>>,
    transaction_interceptors: RwLock<Vec<Arc<dyn TransactionInterceptor>>>,
    fail_next_save: AtomicBool,
    fail_next_commit: AtomicBool,
}

impl SessionInner {
    fn save_interceptors(&self) -> Vec<Arc<dyn SaveChangesInterceptor>> {
        self.save_interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transaction_interceptors(&self) -> Vec<Arc<dyn TransactionInterceptor>> {
        self.transaction_interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot(&self) -> AuditResult<Snapshot> {
        let tracked = lock(&self.tracked);
        let tables = self.store.tables.read().map_err(|e| {
            AuditError::Persistence(format!("Failed to acquire read lock: {}", e))
        })?;

        Ok(Snapshot {
            tables: tables.clone(),
            tracked: tracked.clone(),
        })
    }

    fn restore(&self, snapshot: Snapshot) -> AuditResult<()> {
        let mut tracked = lock(&self.tracked);
        let mut tables = self.store.tables.write().map_err(|e| {
            AuditError::Persistence(format!("Failed to acquire write lock: {}", e))
        })?;

        *tables = snapshot.tables;
        *tracked = snapshot.tracked;
        Ok(())
    }

    fn end_transaction(&self, id: TransactionId) {
        let mut current = lock(&self.transaction);
        if *current == Some(id) {
            *current = None;
        }
    }
}

/// A unit of work over a [`MemoryStore`]
///
/// Clones share the same tracked entities and transaction.
#[derive(Clone)]
pub struct MemorySession {
    inner: Arc<SessionInner>,
}

impl MemorySession {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                tracked: Mutex::new(BTreeMap::new()),
                next_handle: AtomicU64::new(1),
                transaction: Mutex::new(None),
                save_interceptors: RwLock::new(Vec::new()),
                transaction_interceptors: RwLock::new(Vec::new()),
                fail_next_save: AtomicBool::new(false),
                fail_next_commit: AtomicBool::new(false),
            }),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.inner.store
    }

    /// Register an interceptor for both save and transaction events
    pub fn intercept<I>(&self, interceptor: Arc<I>)
    where
        I: SaveChangesInterceptor + TransactionInterceptor + 'static,
    {
        let save: Arc<dyn SaveChangesInterceptor> = interceptor.clone();
        let transaction: Arc<dyn TransactionInterceptor> = interceptor;

        self.inner
            .save_interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(save);
        self.inner
            .transaction_interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(transaction);
    }

    /// Track a new entity for insertion
    pub fn add<I, K>(&self, entity_type: &str, values: I) -> AuditResult<EntityHandle>
    where
        I: IntoIterator<Item = (K, FieldValue)>,
        K: Into<String>,
    {
        let schema = self.inner.store.schema(entity_type)?;

        let mut row: Row = schema
            .columns()
            .into_iter()
            .map(|(name, _, _)| (name.to_string(), FieldValue::Null))
            .collect();

        for (name, value) in values {
            let name = name.into();
            if !schema.declares(&name) {
                return Err(unknown_property(entity_type, &name));
            }
            row.insert(name, value);
        }

        Ok(self.track(TrackedEntity {
            entity_type: entity_type.to_string(),
            state: EntityState::Added,
            values: row,
            original: Row::new(),
        }))
    }

    /// Start tracking a committed entity
    pub fn load(&self, entity_type: &str, key: &str) -> AuditResult<EntityHandle> {
        let row = self.inner.store.get(entity_type, key)?.ok_or_else(|| {
            AuditError::Persistence(format!("No {} with key '{}'", entity_type, key))
        })?;

        Ok(self.track(TrackedEntity {
            entity_type: entity_type.to_string(),
            state: EntityState::Unchanged,
            values: row.clone(),
            original: row,
        }))
    }

    /// Change one property of a tracked entity
    pub fn set(
        &self,
        entity: EntityHandle,
        property: &str,
        value: impl Into<FieldValue>,
    ) -> AuditResult<()> {
        let mut tracked = lock(&self.inner.tracked);
        let tracked_entity = tracked.get_mut(&entity).ok_or_else(|| not_tracked(entity))?;

        if !self.inner.store.schema(&tracked_entity.entity_type)?.declares(property) {
            return Err(unknown_property(&tracked_entity.entity_type, property));
        }
        if tracked_entity.state == EntityState::Deleted {
            return Err(AuditError::Persistence(format!(
                "Cannot modify deleted entity {}",
                entity
            )));
        }

        tracked_entity.values.insert(property.to_string(), value.into());
        if tracked_entity.state == EntityState::Unchanged
            && tracked_entity.values != tracked_entity.original
        {
            tracked_entity.state = EntityState::Modified;
        }
        Ok(())
    }

    /// Mark a tracked entity for deletion
    ///
    /// An entity that was never saved is simply forgotten.
    pub fn remove(&self, entity: EntityHandle) -> AuditResult<()> {
        let mut tracked = lock(&self.inner.tracked);
        let state = tracked
            .get(&entity)
            .map(|e| e.state)
            .ok_or_else(|| not_tracked(entity))?;

        if state == EntityState::Added {
            tracked.remove(&entity);
        } else if let Some(tracked_entity) = tracked.get_mut(&entity) {
            tracked_entity.state = EntityState::Deleted;
        }
        Ok(())
    }

    /// Current value of a property of a tracked entity
    pub fn get(&self, entity: EntityHandle, property: &str) -> Option<FieldValue> {
        lock(&self.inner.tracked)
            .get(&entity)
            .and_then(|e| e.values.get(property).cloned())
    }

    pub fn state(&self, entity: EntityHandle) -> EntityState {
        lock(&self.inner.tracked)
            .get(&entity)
            .map_or(EntityState::Detached, |e| e.state)
    }

    pub fn has_changes(&self) -> bool {
        lock(&self.inner.tracked)
            .values()
            .any(|e| e.state.is_pending())
    }

    /// Make the next save fail after the saving event was raised
    pub fn fail_next_save(&self) {
        self.inner.fail_next_save.store(true, Ordering::SeqCst);
    }

    /// Make the next commit fail after the committing event was raised
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Persist every pending change, raising save events around the write.
    ///
    /// Returns the number of entities written.
    pub async fn save_changes(&self, cancel: &CancellationToken) -> AuditResult<usize> {
        ensure_not_cancelled(cancel)?;

        let interceptors = self.inner.save_interceptors();
        for interceptor in &interceptors {
            if let Err(err) = interceptor.saving_changes(self, cancel).await {
                self.notify_save_failed(&interceptors, &err, cancel).await;
                return Err(err);
            }
        }

        let written = match self.apply_changes() {
            Ok(written) => written,
            Err(err) => {
                self.notify_save_failed(&interceptors, &err, cancel).await;
                return Err(err);
            }
        };
        debug!(written, "Saved changes");

        for interceptor in &interceptors {
            interceptor.saved_changes(self, cancel).await?;
        }

        Ok(written)
    }

    async fn notify_save_failed(
        &self,
        interceptors: &[Arc<dyn SaveChangesInterceptor>],
        error: &AuditError,
        cancel: &CancellationToken,
    ) {
        for interceptor in interceptors {
            if let Err(e) = interceptor.save_failed(self, error, cancel).await {
                warn!(error = %e, "Save-failed handler returned an error");
            }
        }
    }

    fn track(&self, entity: TrackedEntity) -> EntityHandle {
        let handle = EntityHandle::new(self.inner.next_handle.fetch_add(1, Ordering::SeqCst));
        lock(&self.inner.tracked).insert(handle, entity);
        handle
    }

    /// Write pending changes to the store, all or nothing
    fn apply_changes(&self) -> AuditResult<usize> {
        if self.inner.fail_next_save.swap(false, Ordering::SeqCst) {
            return Err(AuditError::Persistence("injected save failure".into()));
        }

        let store = &self.inner.store;
        let mut tracked = lock(&self.inner.tracked);
        let mut tables = store.tables.write().map_err(|e| {
            AuditError::Persistence(format!("Failed to acquire write lock: {}", e))
        })?;

        let mut next_tables = tables.clone();
        let mut next_tracked = tracked.clone();
        let mut written = 0;

        for entity in next_tracked.values_mut() {
            if !entity.state.is_pending() {
                continue;
            }

            let schema = store.schema(&entity.entity_type)?;
            let table = next_tables.entry(entity.entity_type.clone()).or_default();

            match entity.state {
                EntityState::Added => {
                    if schema.key_generated {
                        entity
                            .values
                            .insert(schema.key.clone(), FieldValue::Integer(store.next_key()));
                    }
                    let key = schema.key_of(&entity.values)?;
                    if table.contains_key(&key) {
                        return Err(AuditError::Persistence(format!(
                            "Duplicate key '{}' for entity type '{}'",
                            key, entity.entity_type
                        )));
                    }
                    table.insert(key, entity.values.clone());
                    entity.state = EntityState::Unchanged;
                }
                EntityState::Modified => {
                    let key = schema.key_of(&entity.values)?;
                    let row = table.get_mut(&key).ok_or_else(|| {
                        AuditError::Persistence(format!(
                            "No {} with key '{}'",
                            entity.entity_type, key
                        ))
                    })?;
                    *row = entity.values.clone();
                    entity.state = EntityState::Unchanged;
                }
                EntityState::Deleted => {
                    let key = schema.key_of(&entity.values)?;
                    table.remove(&key);
                    entity.state = EntityState::Detached;
                }
                EntityState::Unchanged | EntityState::Detached => continue,
            }

            entity.original = entity.values.clone();
            written += 1;
        }

        next_tracked.retain(|_, e| e.state != EntityState::Detached);
        *tables = next_tables;
        *tracked = next_tracked;

        Ok(written)
    }

    fn open_transaction(&self) -> AuditResult<MemoryTransaction> {
        let mut current = lock(&self.inner.transaction);
        if let Some(active) = *current {
            return Err(AuditError::Transaction(format!(
                "Transaction {} is already active",
                active
            )));
        }

        let snapshot = self.inner.snapshot()?;
        let id = TransactionId::new();
        *current = Some(id);

        debug!(transaction = %id, "Began transaction");
        Ok(MemoryTransaction {
            session: Arc::clone(&self.inner),
            id,
            started_at: Utc::now(),
            snapshot: Mutex::new(Some(snapshot)),
        })
    }
}

fn not_tracked(entity: EntityHandle) -> AuditError {
    AuditError::Persistence(format!("Entity {} is not tracked", entity))
}

fn unknown_property(entity_type: &str, property: &str) -> AuditError {
    AuditError::Persistence(format!(
        "Entity type '{}' has no property '{}'",
        entity_type, property
    ))
}

#[async_trait]
impl UnitOfWork for MemorySession {
    fn pending_changes(&self) -> Vec<EntityEntry> {
        let tracked = lock(&self.inner.tracked);

        tracked
            .iter()
            .filter(|(_, e)| e.state.is_pending())
            .filter_map(|(handle, e)| {
                let schema = self.inner.store.schema(&e.entity_type).ok()?;
                let properties = schema
                    .columns()
                    .into_iter()
                    .map(|(name, key, shadow)| {
                        let value = e.values.get(name).cloned().unwrap_or(FieldValue::Null);
                        let property = PropertyEntry::new(name, value)
                            .modified(e.values.get(name) != e.original.get(name))
                            .key(key);
                        if shadow {
                            property.shadow()
                        } else {
                            property
                        }
                    })
                    .collect();

                Some(EntityEntry {
                    entity: *handle,
                    entity_type: e.entity_type.clone(),
                    state: e.state,
                    properties,
                })
            })
            .collect()
    }

    fn primary_key_value(&self, entity: EntityHandle) -> Option<String> {
        let tracked = lock(&self.inner.tracked);
        let tracked_entity = tracked.get(&entity)?;
        let schema = self.inner.store.schema(&tracked_entity.entity_type).ok()?;
        tracked_entity
            .values
            .get(schema.key())
            .and_then(FieldValue::to_key_string)
    }

    fn current_transaction(&self) -> Option<TransactionId> {
        *lock(&self.inner.transaction)
    }

    async fn begin_transaction(
        &self,
        cancel: &CancellationToken,
    ) -> AuditResult<Box<dyn HostTransaction>> {
        ensure_not_cancelled(cancel)?;
        Ok(Box::new(self.open_transaction()?))
    }
}

/// Snapshot-based transaction over a [`MemorySession`]
///
/// Rolling back restores the store and the session's tracked entities to
/// their state when the transaction began. Dropping an active transaction
/// rolls it back without raising events.
pub struct MemoryTransaction {
    session: Arc<SessionInner>,
    id: TransactionId,
    started_at: DateTime<Utc>,
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemoryTransaction {
    fn event(&self) -> TransactionEvent {
        TransactionEvent::new(self.id, self.started_at)
    }

    fn is_active(&self) -> bool {
        lock(&self.snapshot).is_some()
    }

    fn take_snapshot(&self) -> Option<Snapshot> {
        lock(&self.snapshot).take()
    }

    async fn fail(&self, error: AuditError, cancel: &CancellationToken) -> AuditResult<()> {
        if let Some(snapshot) = self.take_snapshot() {
            self.session.restore(snapshot)?;
        }
        self.session.end_transaction(self.id);
        warn!(transaction = %self.id, error = %error, "Transaction failed");

        let event = self.event().with_error(error.to_string());
        for interceptor in self.session.transaction_interceptors() {
            interceptor.transaction_failed(&event, cancel).await;
        }
        Err(error)
    }
}

#[async_trait]
impl HostTransaction for MemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    async fn commit(&self, cancel: &CancellationToken) -> AuditResult<()> {
        ensure_not_cancelled(cancel)?;
        if !self.is_active() {
            return Err(AuditError::Transaction(format!(
                "Transaction {} is no longer active",
                self.id
            )));
        }

        let event = self.event();
        for interceptor in self.session.transaction_interceptors() {
            if let Err(err) = interceptor.transaction_committing(self, &event, cancel).await {
                return self.fail(err, cancel).await;
            }
        }

        if self.session.fail_next_commit.swap(false, Ordering::SeqCst) {
            let err = AuditError::Transaction("injected commit failure".into());
            return self.fail(err, cancel).await;
        }

        self.take_snapshot();
        self.session.end_transaction(self.id);
        debug!(transaction = %self.id, "Committed transaction");

        for interceptor in self.session.transaction_interceptors() {
            interceptor.transaction_committed(&event, cancel).await;
        }
        Ok(())
    }

    async fn rollback(&self, cancel: &CancellationToken) -> AuditResult<()> {
        ensure_not_cancelled(cancel)?;
        let Some(snapshot) = self.take_snapshot() else {
            return Ok(());
        };

        self.session.restore(snapshot)?;
        self.session.end_transaction(self.id);
        debug!(transaction = %self.id, "Rolled back transaction");

        let event = self.event();
        for interceptor in self.session.transaction_interceptors() {
            interceptor.transaction_rolled_back(&event, cancel).await;
        }
        Ok(())
    }

    fn release(&self) {
        let Some(snapshot) = self.take_snapshot() else {
            return;
        };

        if let Err(e) = self.session.restore(snapshot) {
            warn!(transaction = %self.id, error = %e, "Failed to restore snapshot on release");
        }
        self.session.end_transaction(self.id);
        debug!(transaction = %self.id, "Released uncompleted transaction, changes discarded");
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}
