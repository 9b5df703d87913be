//! The declarative resource store consumed by the core.
//!
//! The core only talks to the store through [`ResourceStore`]. Adapters live in
//! `crate::adapters` (in-memory) and `crate::db` (SQLite); both share the write
//! semantics implemented at the bottom of this module so that versioning,
//! status sub-channel and finalizer behaviour are identical.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::error::StoreError;
use super::models::{Labels, StoredObject};
use super::registry::{KindDescriptor, KindRegistry};

/// Equality-based label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    required: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn matching(key: &str, value: &str) -> Self {
        let mut required = BTreeMap::new();
        required.insert(key.to_string(), value.to_string());
        Self { required }
    }

    pub fn and(mut self, key: &str, value: &str) -> Self {
        self.required.insert(key.to_string(), value.to_string());
        self
    }

    /// The required labels, e.g. to stamp them onto a new object.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.required.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.required
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

/// Change notification broadcast by a store.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Applied(StoredObject),
    Deleted(StoredObject),
}

impl WatchEvent {
    pub fn object(&self) -> &StoredObject {
        match self {
            WatchEvent::Applied(obj) | WatchEvent::Deleted(obj) => obj,
        }
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<StoredObject, StoreError>;

    /// List objects of a kind, across all namespaces when `namespace` is `None`.
    async fn list(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredObject>, StoreError>;

    async fn create(&self, obj: StoredObject) -> Result<StoredObject, StoreError>;

    /// Write spec and metadata. The status of the stored object is kept.
    async fn update(&self, obj: StoredObject) -> Result<StoredObject, StoreError>;

    /// Write status only.
    async fn update_status(&self, obj: StoredObject) -> Result<StoredObject, StoreError>;

    async fn delete(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Delete every object of `kind` in `namespace` whose labels match.
    /// Returns how many objects were affected.
    async fn delete_all_of(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<usize, StoreError>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

// ---------------------------------------------------------------------------
// Idempotent primitives
// ---------------------------------------------------------------------------

/// `get` that maps `NotFound` to `None`.
pub async fn get_opt(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<StoredObject>, StoreError> {
    match store.get(kind, namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Outcome of [`create_if_absent`].
#[derive(Debug, Clone)]
pub enum Ensured {
    Created(StoredObject),
    Existing(StoredObject),
}

impl Ensured {
    pub fn object(&self) -> &StoredObject {
        match self {
            Ensured::Created(obj) | Ensured::Existing(obj) => obj,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }
}

/// Create `obj` unless an object with the same identity exists.
///
/// Existence is checked first so a repeated call issues no create; a lost
/// creation race is resolved by reading the winner.
pub async fn create_if_absent(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    obj: StoredObject,
) -> Result<Ensured, StoreError> {
    let namespace = obj.metadata.namespace.clone();
    let name = obj.metadata.name.clone();
    if let Some(existing) = get_opt(store, kind, namespace.as_deref(), &name).await? {
        return Ok(Ensured::Existing(existing));
    }
    match store.create(obj).await {
        Ok(created) => Ok(Ensured::Created(created)),
        Err(StoreError::AlreadyExists { .. }) => store
            .get(kind, namespace.as_deref(), &name)
            .await
            .map(Ensured::Existing),
        Err(e) => Err(e),
    }
}

/// Delete an object, treating absence as success. Returns whether it existed.
pub async fn delete_if_present(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    namespace: Option<&str>,
    name: &str,
) -> Result<bool, StoreError> {
    match store.delete(kind, namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Shared write semantics for adapters
// ---------------------------------------------------------------------------

/// Which part of an object an update may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteChannel {
    Spec,
    Status,
}

/// Result of applying a write to a stored object.
#[derive(Debug, Clone)]
pub enum Applied {
    Replace(StoredObject),
    Remove(StoredObject),
}

/// Normalise a new object: resolve its kind, scope the namespace and stamp
/// identity and version.
pub fn prepare_create(
    registry: &KindRegistry,
    mut obj: StoredObject,
) -> Result<StoredObject, StoreError> {
    let kind = registry.lookup(&obj.kind)?;
    if obj.metadata.name.is_empty() {
        return Err(StoreError::Invalid(format!("{} without a name", obj.kind)));
    }
    obj.metadata.namespace = match (kind.namespaced, obj.metadata.namespace.take()) {
        (true, Some(ns)) if !ns.is_empty() => Some(ns),
        (true, _) => {
            return Err(StoreError::Invalid(format!(
                "{} {:?} requires a namespace",
                obj.kind, obj.metadata.name
            )));
        }
        (false, _) => None,
    };
    obj.metadata.uid = Uuid::now_v7().to_string();
    obj.metadata.resource_version = 1;
    obj.metadata.creation_timestamp = Some(Utc::now());
    obj.metadata.deletion_timestamp = None;
    Ok(obj)
}

/// Apply an update through `channel` on top of `existing`.
///
/// Fails with `Conflict` when the incoming resource version is stale. Removing
/// the last finalizer of a deleting object removes the object.
pub fn apply_update(
    existing: &StoredObject,
    incoming: StoredObject,
    channel: WriteChannel,
) -> Result<Applied, StoreError> {
    if incoming.metadata.resource_version != existing.metadata.resource_version {
        return Err(StoreError::conflict(&existing.kind, &existing.metadata.name));
    }
    let mut next = existing.clone();
    match channel {
        WriteChannel::Spec => {
            next.spec = incoming.spec;
            next.metadata.labels = incoming.metadata.labels;
            next.metadata.finalizers = incoming.metadata.finalizers;
        }
        WriteChannel::Status => {
            next.status = incoming.status;
        }
    }
    next.metadata.resource_version += 1;
    if next.metadata.is_deleting() && next.metadata.finalizers.is_empty() {
        return Ok(Applied::Remove(next));
    }
    Ok(Applied::Replace(next))
}

/// Delete semantics: objects holding finalizers are only marked.
pub fn apply_delete(existing: &StoredObject) -> Applied {
    if existing.metadata.finalizers.is_empty() {
        return Applied::Remove(existing.clone());
    }
    let mut next = existing.clone();
    if next.metadata.deletion_timestamp.is_none() {
        next.metadata.deletion_timestamp = Some(Utc::now());
        next.metadata.resource_version += 1;
    }
    Applied::Replace(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(version: u64) -> StoredObject {
        let mut obj = StoredObject::new("Pod", Some("ns"), "p").with_spec(json!({"a": 1}));
        obj.metadata.resource_version = version;
        obj
    }

    #[test]
    fn test_selector_requires_all_labels() {
        let mut labels = Labels::new();
        labels.insert("owner".into(), "b1".into());
        assert!(LabelSelector::matching("owner", "b1").matches(&labels));
        assert!(!LabelSelector::matching("owner", "b2").matches(&labels));
        assert!(!LabelSelector::matching("owner", "b1").and("x", "y").matches(&labels));
        assert!(LabelSelector::default().matches(&labels));
    }

    #[test]
    fn test_stale_update_conflicts() {
        let existing = stored(3);
        let err = apply_update(&existing, stored(2), WriteChannel::Spec).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_status_channel_leaves_spec_alone() {
        let existing = stored(1);
        let incoming = stored(1)
            .with_spec(json!({"a": 2}))
            .with_status(json!({"phase": "InProgress"}));
        let Applied::Replace(next) = apply_update(&existing, incoming, WriteChannel::Status).unwrap()
        else {
            panic!("expected replace");
        };
        assert_eq!(next.spec, json!({"a": 1}));
        assert_eq!(next.status, json!({"phase": "InProgress"}));
        assert_eq!(next.metadata.resource_version, 2);
    }

    #[test]
    fn test_delete_with_finalizer_only_marks() {
        let mut existing = stored(1);
        existing.metadata.finalizers.push("f".into());
        let Applied::Replace(marked) = apply_delete(&existing) else {
            panic!("expected mark");
        };
        assert!(marked.metadata.is_deleting());

        let mut release = marked.clone();
        release.metadata.finalizers.clear();
        assert!(matches!(
            apply_update(&marked, release, WriteChannel::Spec).unwrap(),
            Applied::Remove(_)
        ));
    }

    #[test]
    fn test_prepare_create_scopes_namespace() {
        let registry = KindRegistry::with_defaults();
        let vsc = StoredObject::new("VolumeSnapshotContent", Some("ns"), "c");
        let prepared = prepare_create(&registry, vsc).unwrap();
        assert_eq!(prepared.metadata.namespace, None);
        assert_eq!(prepared.metadata.resource_version, 1);

        let pod = StoredObject::new("Pod", None, "p");
        assert!(matches!(
            prepare_create(&registry, pod),
            Err(StoreError::Invalid(_))
        ));
    }
}
