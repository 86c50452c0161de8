//! Durable object store for migration and worker records
//!
//! Records are keyed by namespace and name and carry an [`ObjectMeta`] with a
//! resource version for optimistic concurrency. Two write paths exist:
//!
//! - [`ObjectStore::update`]: full-record write of desired state. Fails with
//!   `Conflict` if the caller's copy is stale and bumps the generation.
//! - [`ObjectStore::patch`]: field-scoped change applied to the latest stored
//!   copy under the write lock. Never conflicts and never bumps the generation.
//!
//! Deletion is two-phase: a record holding finalizers is only marked for
//! deletion, and is removed once its last finalizer goes away.

use crate::error::{MigrateError, Result};
use crate::types::{Object, ObjectKey, ObjectMeta};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Created,
    /// Desired state changed through `update`
    SpecChanged,
    /// Observed state or metadata changed through `patch`
    StatusChanged,
    DeletionRequested,
    Deleted,
}

/// Change notification emitted by the store
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: ObjectKey,
    pub kind: StoreEventKind,
}

impl StoreEvent {
    /// Status patches are written by the controllers themselves and must not
    /// re-trigger their own reconciliation.
    pub fn triggers_reconcile(&self) -> bool {
        self.kind != StoreEventKind::StatusChanged
    }
}

/// Namespaced, versioned record store with optional JSON snapshot persistence
pub struct ObjectStore<T: Object> {
    /// All records by key
    objects: RwLock<BTreeMap<ObjectKey, T>>,

    /// Monotonic resource version counter
    version: RwLock<u64>,

    /// Change notifications
    events: broadcast::Sender<StoreEvent>,

    /// Snapshot file, rewritten after every mutation
    state_path: Option<PathBuf>,
}

impl<T: Object> Default for ObjectStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Object> ObjectStore<T> {
    /// Create an in-memory store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: RwLock::new(0),
            events,
            state_path: None,
        }
    }

    /// Open a store persisted to `path`, loading any existing snapshot
    pub fn open(path: &Path) -> Result<Self> {
        let mut store = Self::new();
        store.state_path = Some(path.to_path_buf());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let records: Vec<T> = serde_json::from_str(&content)?;
            let mut max_version = 0;
            {
                let mut objects = store.objects.write();
                for record in records {
                    max_version = max_version.max(record.meta().resource_version);
                    objects.insert(record.key(), record);
                }
            }
            *store.version.write() = max_version;
            info!(
                "Loaded {} {} records from {}",
                store.len(),
                T::KIND,
                path.display()
            );
        }

        Ok(store)
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<T> {
        self.objects.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.read().contains_key(key)
    }

    pub fn list(&self) -> Vec<T> {
        self.objects.read().values().cloned().collect()
    }

    pub fn list_namespace(&self, namespace: &str) -> Vec<T> {
        self.objects
            .read()
            .values()
            .filter(|o| o.meta().namespace == namespace)
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Insert a new record
    pub fn create(&self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let mut objects = self.objects.write();
        if objects.contains_key(&key) {
            return Err(MigrateError::AlreadyExists(format!("{} {}", T::KIND, key)));
        }

        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.uid = uuid::Uuid::new_v4().to_string();
        meta.resource_version = version;
        meta.generation = 1;
        meta.creation_timestamp = Utc::now();
        meta.deletion_timestamp = None;

        self.commit(&mut objects, &key, Some(obj.clone()))?;
        drop(objects);

        debug!("Created {} {}", T::KIND, key);
        self.emit(key, StoreEventKind::Created);
        Ok(obj)
    }

    /// Replace a record's desired state. The caller's copy must be current.
    pub fn update(&self, mut obj: T) -> Result<T> {
        let key = obj.key();
        let mut objects = self.objects.write();
        let current = objects
            .get(&key)
            .ok_or_else(|| MigrateError::NotFound(format!("{} {}", T::KIND, key)))?;

        if current.meta().resource_version != obj.meta().resource_version {
            return Err(MigrateError::Conflict(format!(
                "{} {} was modified (have version {}, stored {})",
                T::KIND,
                key,
                obj.meta().resource_version,
                current.meta().resource_version
            )));
        }

        let generation = current.meta().generation + 1;
        restore_identity(current.meta(), obj.meta_mut());
        let version = self.next_version();
        let meta = obj.meta_mut();
        meta.resource_version = version;
        meta.generation = generation;

        let kind = if finalized(obj.meta()) {
            self.commit(&mut objects, &key, None)?;
            StoreEventKind::Deleted
        } else {
            self.commit(&mut objects, &key, Some(obj.clone()))?;
            StoreEventKind::SpecChanged
        };
        drop(objects);

        self.emit(key, kind);
        Ok(obj)
    }

    /// Apply a field-scoped change to the latest stored copy.
    ///
    /// A patch that changes nothing is not written and emits no event.
    pub fn patch<F>(&self, key: &ObjectKey, f: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let mut objects = self.objects.write();
        let current = objects
            .get(key)
            .ok_or_else(|| MigrateError::NotFound(format!("{} {}", T::KIND, key)))?;

        let mut next = current.clone();
        f(&mut next);
        restore_identity(current.meta(), next.meta_mut());

        if serde_json::to_value(current)? == serde_json::to_value(&next)? {
            return Ok(next);
        }

        next.meta_mut().resource_version = self.next_version();
        let kind = if finalized(next.meta()) {
            self.commit(&mut objects, key, None)?;
            StoreEventKind::Deleted
        } else {
            self.commit(&mut objects, key, Some(next.clone()))?;
            StoreEventKind::StatusChanged
        };
        drop(objects);

        self.emit(key.clone(), kind);
        Ok(next)
    }

    /// Request deletion. Returns true if the record was removed immediately,
    /// false if it is held by finalizers and was only marked.
    pub fn request_delete(&self, key: &ObjectKey) -> Result<bool> {
        let mut objects = self.objects.write();
        let current = objects
            .get(key)
            .ok_or_else(|| MigrateError::NotFound(format!("{} {}", T::KIND, key)))?;

        if current.meta().finalizers.is_empty() {
            self.commit(&mut objects, key, None)?;
            drop(objects);
            self.emit(key.clone(), StoreEventKind::Deleted);
            return Ok(true);
        }

        if current.meta().is_deleting() {
            return Ok(false);
        }

        let mut marked = current.clone();
        let meta = marked.meta_mut();
        meta.deletion_timestamp = Some(Utc::now());
        meta.resource_version = self.next_version();
        self.commit(&mut objects, key, Some(marked))?;
        drop(objects);

        self.emit(key.clone(), StoreEventKind::DeletionRequested);
        Ok(false)
    }

    /// Drop a finalizer; removes the record if it was the last hold on a
    /// record marked for deletion. Missing records are already finalized.
    pub fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<()> {
        match self.patch(key, |obj| {
            obj.meta_mut().remove_finalizer(finalizer);
        }) {
            Ok(_) | Err(MigrateError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn next_version(&self) -> u64 {
        let mut version = self.version.write();
        *version += 1;
        *version
    }

    fn emit(&self, key: ObjectKey, kind: StoreEventKind) {
        // Ignore if no receivers
        let _ = self.events.send(StoreEvent { key, kind });
    }

    /// Write `next` for `key` and rewrite the snapshot. If the snapshot
    /// cannot be written the previous record is put back, so memory never
    /// runs ahead of disk.
    fn commit(
        &self,
        objects: &mut BTreeMap<ObjectKey, T>,
        key: &ObjectKey,
        next: Option<T>,
    ) -> Result<()> {
        let previous = match next {
            Some(obj) => objects.insert(key.clone(), obj),
            None => objects.remove(key),
        };

        if let Err(e) = self.persist(objects) {
            match previous {
                Some(obj) => objects.insert(key.clone(), obj),
                None => objects.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, objects: &BTreeMap<ObjectKey, T>) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };

        let records: Vec<&T> = objects.values().collect();
        let content = serde_json::to_string_pretty(&records)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|e| {
                error!(
                    "Failed to persist {} store to {}: {}",
                    T::KIND,
                    path.display(),
                    e
                );
                MigrateError::from(e)
            })
    }
}

/// Identity and lifecycle fields belong to the store, not to writers
fn restore_identity(current: &ObjectMeta, next: &mut ObjectMeta) {
    next.name = current.name.clone();
    next.namespace = current.namespace.clone();
    next.uid = current.uid.clone();
    next.resource_version = current.resource_version;
    next.generation = current.generation;
    next.creation_timestamp = current.creation_timestamp;
    next.deletion_timestamp = current.deletion_timestamp;
}

fn finalized(meta: &ObjectMeta) -> bool {
    meta.is_deleting() && meta.finalizers.is_empty()
}
