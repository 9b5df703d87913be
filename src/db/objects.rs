//! SQLite-backed [`ResourceStore`].
//!
//! Objects are stored as JSON bodies keyed by (kind, namespace, name), with
//! the resource version duplicated into its own column. Every write runs in
//! one transaction and applies the same semantics as the in-memory store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::error::StoreError;
use crate::core::models::StoredObject;
use crate::core::registry::{KindDescriptor, KindRegistry};
use crate::core::store::{
    Applied, LabelSelector, ResourceStore, WatchEvent, WriteChannel, apply_delete, apply_update,
    prepare_create,
};

const WATCH_CAPACITY: usize = 1024;

/// Domain result produced inside a connection closure.
type Inner<T> = Result<T, StoreError>;

pub struct SqliteStore {
    conn: Connection,
    registry: Arc<KindRegistry>,
    events: broadcast::Sender<WatchEvent>,
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn encode(obj: &StoredObject) -> Inner<String> {
    serde_json::to_string(obj).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn decode(body: &str) -> Inner<StoredObject> {
    serde_json::from_str(body).map_err(|e| StoreError::Invalid(format!("corrupt stored object: {e}")))
}

fn ns_column(namespace: Option<&str>) -> String {
    namespace.unwrap_or_default().to_string()
}

fn load(
    c: &rusqlite::Connection,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<Option<String>, rusqlite::Error> {
    use rusqlite::OptionalExtension;
    c.query_row(
        "SELECT body FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
        params![kind, namespace, name],
        |row| row.get(0),
    )
    .optional()
}

fn save(c: &rusqlite::Connection, obj: &StoredObject, body: &str) -> Result<(), rusqlite::Error> {
    c.execute(
        "INSERT INTO objects (kind, namespace, name, resource_version, body)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(kind, namespace, name) DO UPDATE SET
            resource_version = excluded.resource_version,
            body = excluded.body,
            updated_at = CURRENT_TIMESTAMP",
        params![
            &obj.kind,
            ns_column(obj.metadata.namespace.as_deref()),
            &obj.metadata.name,
            obj.metadata.resource_version as i64,
            body
        ],
    )?;
    Ok(())
}

fn remove(c: &rusqlite::Connection, obj: &StoredObject) -> Result<(), rusqlite::Error> {
    c.execute(
        "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
        params![
            &obj.kind,
            ns_column(obj.metadata.namespace.as_deref()),
            &obj.metadata.name
        ],
    )?;
    Ok(())
}

/// Persist the outcome of a delete or update. Returns the watch event to
/// publish, if anything changed.
fn persist(
    c: &rusqlite::Connection,
    previous_version: u64,
    applied: Applied,
) -> Result<Inner<Option<WatchEvent>>, rusqlite::Error> {
    match applied {
        Applied::Remove(last) => {
            remove(c, &last)?;
            Ok(Ok(Some(WatchEvent::Deleted(last))))
        }
        Applied::Replace(next) => {
            if next.metadata.resource_version == previous_version {
                return Ok(Ok(None));
            }
            let body = match encode(&next) {
                Ok(body) => body,
                Err(e) => return Ok(Err(e)),
            };
            save(c, &next, &body)?;
            Ok(Ok(Some(WatchEvent::Applied(next))))
        }
    }
}

impl SqliteStore {
    pub fn new(conn: Connection, registry: Arc<KindRegistry>) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            conn,
            registry,
            events,
        }
    }

    fn publish(&self, events: impl IntoIterator<Item = WatchEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    async fn write(&self, obj: StoredObject, channel: WriteChannel) -> Result<StoredObject, StoreError> {
        let kind = *self.registry.lookup(&obj.kind)?;
        let namespace = ns_column(kind.scope(obj.metadata.namespace.as_deref()));

        let (stored, event) = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let Some(body) = load(&tx, kind.kind, &namespace, &obj.metadata.name)? else {
                    return Ok(Err(StoreError::not_found(kind.kind, &obj.metadata.name)));
                };
                let existing = match decode(&body) {
                    Ok(existing) => existing,
                    Err(e) => return Ok(Err(e)),
                };
                let applied = match apply_update(&existing, obj, channel) {
                    Ok(applied) => applied,
                    Err(e) => return Ok(Err(e)),
                };
                let stored = match &applied {
                    Applied::Replace(o) | Applied::Remove(o) => o.clone(),
                };
                let event = match persist(&tx, existing.metadata.resource_version, applied)? {
                    Ok(event) => event,
                    Err(e) => return Ok(Err(e)),
                };
                tx.commit()?;
                Ok::<_, rusqlite::Error>(Ok((stored, event)))
            })
            .await
            .map_err(unavailable)??;

        self.publish(event);
        Ok(stored)
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<StoredObject, StoreError> {
        self.registry.lookup(kind.kind)?;
        let kind_name = kind.kind;
        let namespace = ns_column(kind.scope(namespace));
        let key_name = name.to_string();

        let body = self
            .conn
            .call(move |c| load(c, kind_name, &namespace, &key_name))
            .await
            .map_err(unavailable)?;

        match body {
            Some(body) => decode(&body),
            None => Err(StoreError::not_found(kind.kind, name)),
        }
    }

    async fn list(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
    ) -> Result<Vec<StoredObject>, StoreError> {
        self.registry.lookup(kind.kind)?;
        let kind_name = kind.kind;
        let namespace = kind.scope(namespace).map(str::to_string);

        let bodies = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT body FROM objects
                     WHERE kind = ?1 AND (?2 IS NULL OR namespace = ?2)
                     ORDER BY namespace, name",
                )?;
                let rows = stmt.query_map(params![kind_name, namespace], |row| row.get(0))?;
                rows.collect::<Result<Vec<String>, _>>()
            })
            .await
            .map_err(unavailable)?;

        bodies.iter().map(|body| decode(body)).collect()
    }

    async fn create(&self, obj: StoredObject) -> Result<StoredObject, StoreError> {
        let obj = prepare_create(&self.registry, obj)?;
        let body = encode(&obj)?;
        let row = obj.clone();

        self.conn
            .call(move |c| {
                let tx = c.transaction()?;
                let namespace = ns_column(row.metadata.namespace.as_deref());
                if load(&tx, &row.kind, &namespace, &row.metadata.name)?.is_some() {
                    return Ok(Err(StoreError::AlreadyExists {
                        kind: row.kind.clone(),
                        name: row.metadata.name.clone(),
                    }));
                }
                save(&tx, &row, &body)?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(Ok(()))
            })
            .await
            .map_err(unavailable)??;

        self.publish([WatchEvent::Applied(obj.clone())]);
        Ok(obj)
    }

    async fn update(&self, obj: StoredObject) -> Result<StoredObject, StoreError> {
        self.write(obj, WriteChannel::Spec).await
    }

    async fn update_status(&self, obj: StoredObject) -> Result<StoredObject, StoreError> {
        self.write(obj, WriteChannel::Status).await
    }

    async fn delete(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<(), StoreError> {
        self.registry.lookup(kind.kind)?;
        let kind_name = kind.kind;
        let namespace = ns_column(kind.scope(namespace));
        let key_name = name.to_string();

        let event = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let Some(body) = load(&tx, kind_name, &namespace, &key_name)? else {
                    return Ok(Err(StoreError::not_found(kind_name, &key_name)));
                };
                let existing = match decode(&body) {
                    Ok(existing) => existing,
                    Err(e) => return Ok(Err(e)),
                };
                let event = match persist(&tx, existing.metadata.resource_version, apply_delete(&existing))? {
                    Ok(event) => event,
                    Err(e) => return Ok(Err(e)),
                };
                tx.commit()?;
                Ok::<_, rusqlite::Error>(Ok(event))
            })
            .await
            .map_err(unavailable)??;

        self.publish(event);
        Ok(())
    }

    async fn delete_all_of(
        &self,
        kind: &KindDescriptor,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<usize, StoreError> {
        self.registry.lookup(kind.kind)?;
        let kind_name = kind.kind;
        let namespace = kind.scope(namespace).map(str::to_string);
        let selector = selector.clone();

        let events = self
            .conn
            .call(move |c| {
                let tx = c.transaction()?;
                let bodies = {
                    let mut stmt = tx.prepare(
                        "SELECT body FROM objects
                         WHERE kind = ?1 AND (?2 IS NULL OR namespace = ?2)",
                    )?;
                    let rows = stmt.query_map(params![kind_name, namespace], |row| row.get(0))?;
                    rows.collect::<Result<Vec<String>, _>>()?
                };

                let mut matched = 0;
                let mut events = Vec::new();
                for body in bodies {
                    let existing = match decode(&body) {
                        Ok(existing) => existing,
                        Err(e) => return Ok(Err(e)),
                    };
                    if !selector.matches(&existing.metadata.labels) {
                        continue;
                    }
                    matched += 1;
                    match persist(&tx, existing.metadata.resource_version, apply_delete(&existing))? {
                        Ok(Some(event)) => events.push(event),
                        Ok(None) => {}
                        Err(e) => return Ok(Err(e)),
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(Ok((matched, events)))
            })
            .await
            .map_err(unavailable)??;

        let (matched, events) = events;
        self.publish(events);
        Ok(matched)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
