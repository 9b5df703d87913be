//! RPC method handlers.
//!
//! Dispatches JSON-RPC method calls to the appropriate handler functions.

use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::context::AppContext;
use crate::core::batching::BatchingSnapshot;
use crate::core::error::ReconcileError;
use crate::core::job::MoverJob;
use crate::core::models::{
    BackupJob, BackupJobSpec, BatchingStatus, JobRef, JobStatus, LocalObjectReference, ObjectMeta,
    Phase, RestoreJob, RestoreJobSpec, StoredObject, VsbRef,
};
use crate::core::registry::{BACKUP_JOB, KindDescriptor, RESTORE_JOB};
use crate::core::status;

use super::protocol::{INVALID_PARAMS, NOT_FOUND, Request, Response};

/// Job kind as named by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    fn descriptor(self) -> KindDescriptor {
        match self {
            JobKind::Backup => BACKUP_JOB,
            JobKind::Restore => RESTORE_JOB,
        }
    }
}

/// One row of `jobs.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub kind: JobKind,
    pub namespace: String,
    pub name: String,
    pub pvc: Option<String>,
    pub snapshot_content: Option<String>,
    pub phase: Option<Phase>,
    pub batching: Option<BatchingStatus>,
    pub deleting: bool,
    pub age_secs: Option<i64>,
}

impl JobSummary {
    fn new<J: MoverJob>(kind: JobKind, job: &J, pvc: Option<String>) -> Self {
        let meta = job.metadata();
        let status: &JobStatus = job.status();
        Self {
            kind,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone(),
            pvc,
            snapshot_content: status.volume_snapshot_content_name.clone(),
            phase: status.phase,
            batching: status.batching_status,
            deleting: meta.is_deleting(),
            age_secs: meta
                .creation_timestamp
                .map(|created| (Utc::now() - created).num_seconds()),
        }
    }
}

/// Result of `daemon.status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub rpc_bind: String,
    pub store: String,
    pub simulation: bool,
    pub backups: BatchingSnapshot,
    pub restores: BatchingSnapshot,
}

#[derive(Deserialize)]
struct JobParams {
    kind: JobKind,
    namespace: String,
    name: String,
}

fn parse<P: DeserializeOwned>(id: &Value, params: Value) -> Result<P, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

fn reconcile_error(id: Value, error: ReconcileError) -> Response {
    match error {
        ReconcileError::Store(e) => Response::store_error(id, &e),
        other => Response::internal_error(id, other.to_string()),
    }
}

/// Handles RPC method dispatch and execution.
pub struct MethodHandler {
    ctx: AppContext,
    start_time: Instant,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
        }
    }

    /// Handle an RPC request and return a response.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        match request.method.as_str() {
            "daemon.status" => self.daemon_status(id).await,
            "objects.create" => self.objects_create(id, params).await,
            "objects.get" => self.objects_get(id, params).await,
            "backup.create" => self.backup_create(id, params).await,
            "restore.create" => self.restore_create(id, params).await,
            "jobs.list" => self.jobs_list(id, params).await,
            "jobs.get" => self.jobs_get(id, params).await,
            "jobs.delete" => self.jobs_delete(id, params).await,
            "simulator.fail_next" => self.simulator_fail_next(id, params),
            _ => Response::method_not_found(id, &request.method),
        }
    }

    /// Get daemon status and admission state.
    async fn daemon_status(&self, id: Value) -> Response {
        let config = &self.ctx.config;
        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION").to_string(),
                uptime_secs: self.start_time.elapsed().as_secs(),
                rpc_bind: config.rpc_bind.clone(),
                store: format!("{:?}", config.store).to_lowercase(),
                simulation: config.simulation,
                backups: self.ctx.backups.snapshot().await,
                restores: self.ctx.restores.snapshot().await,
            },
        )
    }

    /// Create an arbitrary object of a registered kind, e.g. the snapshot
    /// content a backup starts from or a credential secret.
    async fn objects_create(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            object: StoredObject,
        }

        let params: Params = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        match self.ctx.store.create(params.object).await {
            Ok(created) => Response::success(id, created),
            Err(e) => Response::store_error(id, &e),
        }
    }

    async fn objects_get(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            kind: String,
            #[serde(default)]
            namespace: Option<String>,
            name: String,
        }

        let params: Params = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        let kind = match self.ctx.registry.lookup(&params.kind) {
            Ok(kind) => *kind,
            Err(e) => return Response::store_error(id, &e),
        };
        match self
            .ctx
            .store
            .get(&kind, params.namespace.as_deref(), &params.name)
            .await
        {
            Ok(obj) => Response::success(id, obj),
            Err(e) => Response::store_error(id, &e),
        }
    }

    /// Create a backup job. Spec problems surface on the job as `Failed`.
    async fn backup_create(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            namespace: String,
            name: String,
            volume_snapshot_content: String,
            restic_secret: String,
            protected_namespace: String,
        }

        let params: Params = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        let job = BackupJob {
            metadata: ObjectMeta::new(Some(&params.namespace), &params.name),
            spec: BackupJobSpec {
                volume_snapshot_content: LocalObjectReference {
                    name: params.volume_snapshot_content,
                },
                restic_secret_ref: LocalObjectReference {
                    name: params.restic_secret,
                },
                protected_namespace: params.protected_namespace,
            },
            status: JobStatus::default(),
        };
        self.create_job(id, &job).await
    }

    /// Create a restore job, taking the backup reference either from a
    /// finished backup or verbatim from the request.
    async fn restore_create(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct BackupParams {
            #[serde(default)]
            namespace: Option<String>,
            name: String,
        }

        #[derive(Deserialize)]
        struct Params {
            namespace: String,
            name: String,
            restic_secret: String,
            protected_namespace: String,
            #[serde(default)]
            backup: Option<BackupParams>,
            #[serde(default)]
            backup_ref: Option<VsbRef>,
        }

        let params: Params = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        let backup_ref = match (params.backup, params.backup_ref) {
            (Some(backup), _) => {
                let key = JobRef::new(
                    backup.namespace.as_deref().unwrap_or(&params.namespace),
                    &backup.name,
                );
                let backup = match status::load::<BackupJob>(self.ctx.store.as_ref(), &key).await {
                    Ok(Some(backup)) => backup,
                    Ok(None) => {
                        return Response::error(id, NOT_FOUND, format!("backup {key} not found"));
                    }
                    Err(e) => return reconcile_error(id, e),
                };
                match VsbRef::from_backup(&backup) {
                    Some(backup_ref) => backup_ref,
                    None => {
                        return Response::error_with_data(
                            id,
                            INVALID_PARAMS,
                            format!("backup {key} has not recorded its source volume and repository yet"),
                            json!({ "phase": backup.status.phase }),
                        );
                    }
                }
            }
            (None, Some(backup_ref)) => backup_ref,
            (None, None) => {
                return Response::invalid_params(id, "either backup or backup_ref is required");
            }
        };

        let job = RestoreJob {
            metadata: ObjectMeta::new(Some(&params.namespace), &params.name),
            spec: RestoreJobSpec {
                restic_secret_ref: LocalObjectReference {
                    name: params.restic_secret,
                },
                backup_ref,
                protected_namespace: params.protected_namespace,
            },
            status: JobStatus::default(),
        };
        self.create_job(id, &job).await
    }

    async fn create_job<J: MoverJob>(&self, id: Value, job: &J) -> Response {
        let obj = match job.to_object() {
            Ok(obj) => obj,
            Err(e) => return reconcile_error(id, e),
        };
        match self.ctx.store.create(obj).await {
            Ok(created) => Response::success(id, created),
            Err(e) => Response::store_error(id, &e),
        }
    }

    /// List jobs, optionally restricted to one kind and namespace.
    async fn jobs_list(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            kind: Option<JobKind>,
            #[serde(default)]
            namespace: Option<String>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            match parse(&id, params) {
                Ok(p) => p,
                Err(resp) => return resp,
            }
        };
        let namespace = params.namespace.as_deref();

        let mut rows = Vec::new();
        if params.kind != Some(JobKind::Restore) {
            match self.list::<BackupJob>(namespace).await {
                Ok(jobs) => rows.extend(jobs.iter().map(|job| {
                    let pvc = job.status.source_pvc_data.as_ref().map(|p| p.name.clone());
                    JobSummary::new(JobKind::Backup, job, pvc)
                })),
                Err(e) => return reconcile_error(id, e),
            }
        }
        if params.kind != Some(JobKind::Backup) {
            match self.list::<RestoreJob>(namespace).await {
                Ok(jobs) => rows.extend(jobs.iter().map(|job| {
                    let pvc = Some(job.spec.backup_ref.source_pvc_data.name.clone());
                    JobSummary::new(JobKind::Restore, job, pvc)
                })),
                Err(e) => return reconcile_error(id, e),
            }
        }

        Response::success(id, rows)
    }

    async fn list<J: MoverJob>(&self, namespace: Option<&str>) -> Result<Vec<J>, ReconcileError> {
        self.ctx
            .store
            .list(&J::KIND, namespace)
            .await?
            .into_iter()
            .map(J::from_object)
            .collect()
    }

    /// Get a single job with its full status.
    async fn jobs_get(&self, id: Value, params: Value) -> Response {
        let params: JobParams = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        match self
            .ctx
            .store
            .get(&params.kind.descriptor(), Some(&params.namespace), &params.name)
            .await
        {
            Ok(obj) => Response::success(id, obj),
            Err(e) => Response::store_error(id, &e),
        }
    }

    /// Request deletion. The job stays visible in `Cleanup` until its staged
    /// resources are gone.
    async fn jobs_delete(&self, id: Value, params: Value) -> Response {
        let params: JobParams = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        match self
            .ctx
            .store
            .delete(&params.kind.descriptor(), Some(&params.namespace), &params.name)
            .await
        {
            Ok(()) => Response::success(id, json!({ "deleted": true })),
            Err(e) => Response::store_error(id, &e),
        }
    }

    /// Make the next run of a transfer trigger fail (simulation only).
    fn simulator_fail_next(&self, id: Value, params: Value) -> Response {
        #[derive(Deserialize)]
        struct Params {
            trigger: String,
            #[serde(default)]
            reason: Option<String>,
        }

        let params: Params = match parse(&id, params) {
            Ok(p) => p,
            Err(resp) => return resp,
        };

        match &self.ctx.simulator {
            Some(simulator) => {
                let reason = params.reason.as_deref().unwrap_or("injected failure");
                simulator.fail_next(&params.trigger, reason);
                Response::success(id, json!({ "armed": params.trigger }))
            }
            None => Response::error(id, INVALID_PARAMS, "simulation is not enabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::adapters::MemoryStore;
    use crate::config::AppConfig;
    use crate::core::models::PvcData;
    use crate::core::registry::KindRegistry;

    fn handler() -> MethodHandler {
        let registry = Arc::new(KindRegistry::with_defaults());
        let store = Arc::new(MemoryStore::new(registry.clone()));
        MethodHandler::new(AppContext::new(AppConfig::default(), registry, store))
    }

    fn request(method: &str, params: Value) -> Request {
        Request {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::Number(1.into())),
        }
    }

    #[tokio::test]
    async fn test_backup_create_then_list() {
        let handler = handler();
        let resp = handler
            .handle(request(
                "backup.create",
                json!({
                    "namespace": "apps",
                    "name": "b1",
                    "volume_snapshot_content": "snapcontent-1",
                    "restic_secret": "creds",
                    "protected_namespace": "adp"
                }),
            ))
            .await;
        assert!(resp.error.is_none());

        let resp = handler.handle(request("jobs.list", json!({"kind": "backup"}))).await;
        let rows: Vec<JobSummary> = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "b1");
        assert_eq!(rows[0].phase, None);

        let resp = handler.handle(request("jobs.list", json!({"kind": "restore"}))).await;
        let rows: Vec<JobSummary> = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_unfinished_backup_is_rejected() {
        let handler = handler();
        handler
            .handle(request(
                "backup.create",
                json!({
                    "namespace": "apps",
                    "name": "b1",
                    "volume_snapshot_content": "snapcontent-1",
                    "restic_secret": "creds",
                    "protected_namespace": "adp"
                }),
            ))
            .await;

        let resp = handler
            .handle(request(
                "restore.create",
                json!({
                    "namespace": "apps",
                    "name": "r1",
                    "restic_secret": "creds",
                    "protected_namespace": "adp",
                    "backup": {"name": "b1"}
                }),
            ))
            .await;
        let error = resp.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert!(error.data.is_some());

        let resp = handler
            .handle(request(
                "restore.create",
                json!({
                    "namespace": "apps",
                    "name": "r1",
                    "restic_secret": "creds",
                    "protected_namespace": "adp",
                    "backup": {"name": "missing"}
                }),
            ))
            .await;
        assert_eq!(resp.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn test_restore_with_explicit_reference() {
        let handler = handler();
        let backup_ref = VsbRef {
            source_pvc_data: PvcData {
                name: "data".into(),
                size: "1Gi".into(),
            },
            restic_repository: "s3:bucket/b1".into(),
            volume_snapshot_class_name: String::new(),
        };
        let resp = handler
            .handle(request(
                "restore.create",
                json!({
                    "namespace": "apps",
                    "name": "r1",
                    "restic_secret": "creds",
                    "protected_namespace": "adp",
                    "backup_ref": backup_ref
                }),
            ))
            .await;
        let created: StoredObject = serde_json::from_value(resp.result.unwrap()).unwrap();
        let restore = RestoreJob::from_object(created).unwrap();
        assert_eq!(restore.spec.backup_ref, backup_ref);
    }

    #[tokio::test]
    async fn test_unknown_object_kind_is_invalid_params() {
        let handler = handler();
        let resp = handler
            .handle(request(
                "objects.get",
                json!({"kind": "Deployment", "namespace": "apps", "name": "x"}),
            ))
            .await;
        assert_eq!(resp.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_fail_next_requires_simulation() {
        let handler = handler();
        let resp = handler
            .handle(request("simulator.fail_next", json!({"trigger": "b1-rep-src"})))
            .await;
        assert!(resp.error.is_some());
    }
}
