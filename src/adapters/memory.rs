//! In-memory [`ResourceStore`].
//!
//! Used by the daemon's default configuration and by tests. Supports fault
//! injection so callers can exercise partial failures of individual store
//! operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::trace;

use crate::core::error::StoreError;
use crate::core::models::{ObjectKey, StoredObject};
use crate::core::registry::{KindDescriptor, KindRegistry};
use crate::core::store::{
    Applied, LabelSelector, ResourceStore, WatchEvent, WriteChannel, apply_delete, apply_update,
    prepare_create,
};

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
    DeleteAllOf,
}

/// A scripted failure: the next `remaining` calls of `op` (optionally only
/// for `kind`) fail with `error`.
#[derive(Debug, Clone)]
pub struct Fault {
    pub op: StoreOp,
    pub kind: Option<String>,
    pub error: StoreError,
    pub remaining: u32,
}

impl Fault {
    pub fn new(op: StoreOp, error: StoreError) -> Self {
        Self {
            op,
            kind: None,
            error,
            remaining: 1,
        }
    }

    pub fn for_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn times(mut self, remaining: u32) -> Self {
        self.remaining = remaining;
        self
    }
}

/// Per-operation call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: u64,
    pub lists: u64,
    pub creates: u64,
    pub updates: u64,
    pub status_updates: u64,
    pub deletes: u64,
    pub bulk_deletes: u64,
}

#[derive(Clone)]
pub struct MemoryStore {
    registry: Arc<KindRegistry>,
    objects: Arc<RwLock<BTreeMap<ObjectKey, StoredObject>>>,
    faults: Arc<Mutex<Vec<Fault>>>,
    stats: Arc<Mutex<StoreStats>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    pub fn new(registry: Arc<KindRegistry>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            registry,
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            faults: Arc::new(Mutex::new(Vec::new())),
            stats: Arc::new(Mutex::new(StoreStats::default())),
            events,
        }
    }

    pub async fn inject(&self, fault: Fault) {
        self.faults.lock().await.push(fault);
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    pub async fn stats(&self) -> StoreStats {
        self.stats.lock().await.clone()
    }

    /// Number of stored objects, across kinds.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    async fn enter(&self, op: StoreOp, kind: &str) -> Result<(), StoreError> {
        {
            let mut stats = self.stats.lock().await;
            match op {
                StoreOp::Get => stats.gets += 1,
                StoreOp::List => stats.lists += 1,
                StoreOp::Create => stats.creates += 1,
                StoreOp::Update => stats.updates += 1,
                StoreOp::UpdateStatus => stats.status_updates += 1,
                StoreOp::Delete => stats.deletes += 1,
                StoreOp::DeleteAllOf => stats.bulk_deletes += 1,
            }
        }

        let mut faults = self.faults.lock().await;
        let hit = faults.iter_mut().position(|f| {
            f.op == op && f.remaining > 0 && f.kind.as_deref().is_none_or(|k| k == kind)
        });
        if let Some(index) = hit {
            let fault = &mut faults[index];
            fault.remaining -= 1;
            let error = fault.error.clone();
            if fault.remaining == 0 {
                faults.remove(index);
            }
            trace!(?op, kind, %error, "Injected store fault");
            return Err(error);
        }
        Ok(())
    }

    fn key(kind: &KindDescriptor, namespace: Option<&str>, name: &str) -> ObjectKey {
        ObjectKey {
            kind: kind.kind.to_string(),
            namespace: kind.scope(namespace).map(str::to_string),
            name: name.to_string(),
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn write(&self, obj: StoredObject, channel: WriteChannel) -> Result<StoredObject, StoreError> {
        let kind = self.registry.lookup(&obj.kind)?;
        let key = Self::key(kind, obj.metadata.namespace.as_deref(), &obj.metadata.name);
        let mut objects = self.objects.write().await;
        let existing = objects
            .get(&key)
            .ok_or_else(|| StoreError::not_found(&key.kind, &key.name))?;
        match apply_update(existing, obj, channel)? {
            Applied::Replace(next) => {
                objects.insert(key, next.clone());
                self.publish(WatchEvent::Applied(next.clone()));
                Ok(next)
            }
            Applied::Remove(last) => {
                objects.remove(&key);
                self.publish(WatchEvent::Deleted(last.clone()));
                Ok(last)
            }
        }
    }

    fn remove_or_mark(
        &self,
        objects: &mut BTreeMap<ObjectKey, StoredObject>,
        key: ObjectKey,
    ) -> Option<()> {
        let existing = objects.get(&key)?;
        match apply_delete(existing) {
            Applied::Remove(last) => {
                objects.remove(&key);
                self.publish(WatchEvent::Deleted(last));
            }
            Applied::Replace(marked) => {
                if marked.metadata.resource_version != existing.metadata.resource_version {
                    objects.insert(key, marked.clone());
                    self.publish(WatchEvent::Applied(marked));
                }
            }
        }
        Some(())
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<StoredObject, StoreError> {
        self.enter(StoreOp::Get, kind.kind).await?;
        self.registry.lookup(kind.kind)?;
        let key = Self::key(kind, namespace, name);
        self.objects
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind.kind, name))
    }

    async fn list(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredObject>, StoreError> {
        self.enter(StoreOp::List, kind.kind).await?;
        self.registry.lookup(kind.kind)?;
        let namespace = kind.scope(namespace);
        Ok(self
            .objects
            .read()
            .await
            .values()
            .filter(|obj| obj.kind == kind.kind)
            .filter(|obj| namespace.is_none() || obj.metadata.namespace.as_deref() == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, obj: StoredObject) -> Result<StoredObject, StoreError> {
        self.enter(StoreOp::Create, &obj.kind).await?;
        let obj = prepare_create(&self.registry, obj)?;
        let key = obj.key();
        let mut objects = self.objects.write().await;
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: key.kind,
                name: key.name,
            });
        }
        objects.insert(key, obj.clone());
        self.publish(WatchEvent::Applied(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, obj: StoredObject) -> Result<StoredObject, StoreError> {
        self.enter(StoreOp::Update, &obj.kind).await?;
        self.write(obj, WriteChannel::Spec).await
    }

    async fn update_status(&self, obj: StoredObject) -> Result<StoredObject, StoreError> {
        self.enter(StoreOp::UpdateStatus, &obj.kind).await?;
        self.write(obj, WriteChannel::Status).await
    }

    async fn delete(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        self.enter(StoreOp::Delete, kind.kind).await?;
        self.registry.lookup(kind.kind)?;
        let key = Self::key(kind, namespace, name);
        let mut objects = self.objects.write().await;
        self.remove_or_mark(&mut objects, key)
            .ok_or_else(|| StoreError::not_found(kind.kind, name))
    }

    async fn delete_all_of(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<usize, StoreError> {
        self.enter(StoreOp::DeleteAllOf, kind.kind).await?;
        self.registry.lookup(kind.kind)?;
        let namespace = kind.scope(namespace);
        let mut objects = self.objects.write().await;
        let matching: Vec<ObjectKey> = objects
            .iter()
            .filter(|(key, obj)| {
                key.kind == kind.kind
                    && (namespace.is_none() || key.namespace.as_deref() == namespace)
                    && selector.matches(&obj.metadata.labels)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let count = matching.len();
        for key in matching {
            self.remove_or_mark(&mut objects, key);
        }
        Ok(count)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
