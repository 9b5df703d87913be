//! Simulated transfer engine.
//!
//! Plays the external data mover: it watches for transfer triggers
//! (ReplicationSource / ReplicationDestination), marks them started, and after
//! a configurable delay reports success. A restore additionally produces a
//! snapshot bound to a snapshot content, as a real engine would. Failures can
//! be injected through [`Simulator`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::StoreError;
use crate::core::models::StoredObject;
use crate::core::registry::{
    KindDescriptor, REPLICATION_DESTINATION, REPLICATION_SOURCE, VOLUME_SNAPSHOT,
    VOLUME_SNAPSHOT_CONTENT,
};
use crate::core::store::{ResourceStore, WatchEvent, create_if_absent, get_opt};

enum SimulatedCommand {
    Fail { name: String, reason: String },
}

/// Handle for steering the simulation from outside (tests, RPC).
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
}

impl Simulator {
    /// Make the next run of the named trigger fail.
    pub fn fail_next(&self, trigger: &str, reason: &str) {
        let _ = self.tx.send(SimulatedCommand::Fail {
            name: trigger.to_string(),
            reason: reason.to_string(),
        });
    }
}

pub struct SimulatedDataMover {
    store: Arc<dyn ResourceStore>,
    transfer_time: Duration,
    cmd_rx: mpsc::UnboundedReceiver<SimulatedCommand>,
}

impl SimulatedDataMover {
    pub fn new(store: Arc<dyn ResourceStore>, transfer_time: Duration) -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                transfer_time,
                cmd_rx: rx,
            },
            Simulator { tx },
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut events = self.store.watch();
        let mut failing: HashMap<String, String> = HashMap::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        info!(transfer_secs = self.transfer_time.as_secs(), "Simulated data mover started");

        while let Ok(SimulatedCommand::Fail { name, reason }) = self.cmd_rx.try_recv() {
            failing.insert(name, reason);
        }

        // Triggers created before we subscribed.
        for kind in [REPLICATION_SOURCE, REPLICATION_DESTINATION] {
            match self.store.list(&kind, None).await {
                Ok(objects) => {
                    for obj in objects {
                        self.maybe_start(obj, &mut seen, &failing, &shutdown);
                    }
                }
                Err(e) => warn!(kind = kind.kind, error = %e, "Simulator could not list triggers"),
            }
        }

        loop {
            tokio::select! {
                // Commands first, so a failure armed before a trigger is
                // created applies to it.
                biased;
                _ = shutdown.cancelled() => break,
                Some(cmd) = self.cmd_rx.recv() => match cmd {
                    SimulatedCommand::Fail { name, reason } => {
                        debug!(trigger = %name, "Simulator will fail trigger");
                        failing.insert(name, reason);
                    }
                },
                event = events.recv() => match event {
                    Ok(WatchEvent::Applied(obj)) => {
                        self.maybe_start(obj, &mut seen, &failing, &shutdown);
                    }
                    Ok(WatchEvent::Deleted(obj)) => {
                        seen.remove(&(obj.kind.clone(), obj.metadata.name.clone()));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Simulator watch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Simulated data mover stopped");
    }

    fn maybe_start(
        &self,
        obj: StoredObject,
        seen: &mut HashSet<(String, String)>,
        failing: &HashMap<String, String>,
        shutdown: &CancellationToken,
    ) {
        let kind = match obj.kind.as_str() {
            k if k == REPLICATION_SOURCE.kind => REPLICATION_SOURCE,
            k if k == REPLICATION_DESTINATION.kind => REPLICATION_DESTINATION,
            _ => return,
        };
        if obj.metadata.is_deleting() || obj.status_str("lastSyncTime").is_some() {
            return;
        }
        if !seen.insert((obj.kind.clone(), obj.metadata.name.clone())) {
            return;
        }

        let store = self.store.clone();
        let delay = self.transfer_time;
        let failure = failing.get(&obj.metadata.name).cloned();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let namespace = obj.metadata.namespace.clone();
            let name = obj.metadata.name.clone();
            if let Err(e) = mark_started(store.as_ref(), &kind, namespace.as_deref(), &name).await {
                warn!(trigger = %name, error = %e, "Simulator could not start transfer");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
            let result = match failure {
                Some(reason) => {
                    mark_failed(store.as_ref(), &kind, namespace.as_deref(), &name, &reason).await
                }
                None => mark_succeeded(store.as_ref(), &kind, namespace.as_deref(), &name).await,
            };
            match result {
                Ok(()) => info!(trigger = %name, "Simulated transfer finished"),
                Err(e) => warn!(trigger = %name, error = %e, "Simulator could not finish transfer"),
            }
        });
    }
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Apply `edit` to a trigger's status, re-reading on conflicts.
async fn edit_status<F>(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    namespace: Option<&str>,
    name: &str,
    mut edit: F,
) -> Result<(), StoreError>
where
    F: FnMut(&mut StoredObject) + Send,
{
    loop {
        let Some(mut obj) = get_opt(store, kind, namespace, name).await? else {
            return Ok(());
        };
        if !obj.status.is_object() {
            obj.status = json!({});
        }
        edit(&mut obj);
        match store.update_status(obj).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => continue,
            Err(e) => return Err(e),
        }
    }
}

fn set(obj: &mut StoredObject, key: &str, value: Value) {
    if let Some(map) = obj.status.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

/// Report that the engine picked up the trigger.
pub async fn mark_started(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    namespace: Option<&str>,
    name: &str,
) -> Result<(), StoreError> {
    let started = now();
    edit_status(store, kind, namespace, name, |obj| {
        set(obj, "lastSyncStartTime", json!(started));
    })
    .await
}

/// Report a successful run for the trigger's current manual trigger value.
/// Restores also get a snapshot bound to a fresh snapshot content.
pub async fn mark_succeeded(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    namespace: Option<&str>,
    name: &str,
) -> Result<(), StoreError> {
    let Some(trigger) = get_opt(store, kind, namespace, name).await? else {
        return Ok(());
    };

    let mut image = None;
    if kind.kind == REPLICATION_DESTINATION.kind {
        image = Some(produce_image(store, &trigger).await?);
    }

    let finished = now();
    let manual = trigger.spec_str("trigger.manual").map(str::to_string);
    edit_status(store, kind, namespace, name, |obj| {
        if obj.status_str("lastSyncStartTime").is_none() {
            set(obj, "lastSyncStartTime", json!(finished));
        }
        set(obj, "lastSyncTime", json!(finished));
        if let Some(manual) = &manual {
            set(obj, "lastManualSync", json!(manual));
        }
        set(obj, "latestMoverStatus", json!({ "result": "Successful" }));
        if let Some(image) = &image {
            set(obj, "latestImage", json!({ "name": image, "kind": "VolumeSnapshot" }));
        }
    })
    .await
}

/// Report a failed run.
pub async fn mark_failed(
    store: &dyn ResourceStore,
    kind: &KindDescriptor,
    namespace: Option<&str>,
    name: &str,
    reason: &str,
) -> Result<(), StoreError> {
    let finished = now();
    edit_status(store, kind, namespace, name, |obj| {
        set(obj, "lastSyncTime", json!(finished));
        set(
            obj,
            "latestMoverStatus",
            json!({ "result": "Failed", "logs": reason }),
        );
    })
    .await
}

/// Create the snapshot a restore run leaves behind and return its name.
async fn produce_image(store: &dyn ResourceStore, trigger: &StoredObject) -> Result<String, StoreError> {
    let name = format!("{}-image", trigger.metadata.name);
    let content = format!("{}-content", name);
    let namespace = trigger.metadata.namespace.as_deref();

    let content_obj = StoredObject::new(VOLUME_SNAPSHOT_CONTENT.kind, None, &content)
        .with_spec(json!({
            "deletionPolicy": "Retain",
            "volumeSnapshotRef": { "name": name, "namespace": namespace },
        }))
        .with_status(json!({ "snapshotHandle": format!("sim-{}", content), "readyToUse": true }));
    create_if_absent(store, &VOLUME_SNAPSHOT_CONTENT, content_obj).await?;

    let snapshot_obj = StoredObject::new(VOLUME_SNAPSHOT.kind, namespace, &name)
        .with_spec(json!({ "source": { "persistentVolumeClaimName": trigger.spec_str("restic.destinationPVC") } }))
        .with_status(json!({ "boundVolumeSnapshotContentName": content, "readyToUse": true }));
    create_if_absent(store, &VOLUME_SNAPSHOT, snapshot_obj).await?;

    Ok(name)
}
