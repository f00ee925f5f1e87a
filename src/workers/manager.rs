//! Worker pool manager
//!
//! Tracks every backup worker of the process, grouped by owning
//! ShardedRedisBackup. One instance is created at startup and shared by
//! all reconciles through the controller context.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::crd::ShardedRedisBackup;
use crate::metrics;

use super::backup::{BackupJob, Worker, WorkerStatus};
use super::transport::Transport;

/// Identity of the resource owning a set of workers
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    pub namespace: String,
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource(backup: &ShardedRedisBackup) -> Self {
        Self::new(
            backup.namespace().unwrap_or_else(|| "default".to_string()),
            backup.name_any(),
        )
    }

    /// Reference used to requeue the owner on the controller
    pub fn object_ref(&self) -> ObjectRef<ShardedRedisBackup> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired worker
#[derive(Clone, Debug)]
pub struct WorkerSpec {
    pub job: BackupJob,
    pub transport: Transport,
}

impl WorkerSpec {
    pub fn new(job: BackupJob, transport: Transport) -> Self {
        Self { job, transport }
    }

    pub fn id(&self) -> String {
        self.job.worker_id()
    }
}

/// Emitted when a worker finishes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerEvent {
    pub owner: OwnerKey,
    pub worker_id: String,
}

type Registry = HashMap<OwnerKey, HashMap<String, Arc<Worker>>>;

struct Inner {
    workers: Mutex<Registry>,
    events: UnboundedSender<WorkerEvent>,
    receiver: Mutex<Option<UnboundedReceiver<WorkerEvent>>>,
}

/// Process-wide registry of backup workers
#[derive(Clone)]
pub struct WorkerManager {
    inner: Arc<Inner>,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerManager {
    pub fn new() -> Self {
        let (events, receiver) = mpsc::unbounded();
        Self {
            inner: Arc::new(Inner {
                workers: Mutex::new(HashMap::new()),
                events,
                receiver: Mutex::new(Some(receiver)),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every desired worker that is not tracked yet
    ///
    /// Tracked workers missing from `desired` are left alone: a backup is
    /// never stopped half way. Returns the number of workers started.
    pub fn reconcile_workers(&self, owner: &OwnerKey, desired: Vec<WorkerSpec>) -> usize {
        if desired.is_empty() {
            return 0;
        }

        let mut registry = self.registry();
        let tracked = registry.entry(owner.clone()).or_default();

        let mut started = 0;
        for spec in desired {
            let id = spec.id();
            if tracked.contains_key(&id) {
                debug!(owner = %owner, worker = %id, "Worker already tracked");
                continue;
            }

            metrics::RUNNING_WORKERS.inc();
            let events = self.inner.events.clone();
            let event_owner = owner.clone();
            let worker = Worker::spawn(spec.job, spec.transport, move |job, status, elapsed| {
                record_outcome(&event_owner, job, status, elapsed);
                let _ = events.unbounded_send(WorkerEvent {
                    owner: event_owner.clone(),
                    worker_id: job.worker_id(),
                });
            });

            info!(owner = %owner, worker = %id, "Started backup worker");
            tracked.insert(id, worker);
            started += 1;
        }

        started
    }

    /// Live worker by ID, if still tracked
    pub fn get_worker(&self, id: &str, owner: &OwnerKey) -> Option<Arc<Worker>> {
        self.registry()
            .get(owner)
            .and_then(|workers| workers.get(id))
            .cloned()
    }

    /// Stop tracking a worker whose record has been persisted as terminal
    ///
    /// A worker still in flight is canceled.
    pub fn release(&self, id: &str, owner: &OwnerKey) -> Option<Arc<Worker>> {
        let mut registry = self.registry();
        let workers = registry.get_mut(owner)?;
        let worker = workers.remove(id);
        if workers.is_empty() {
            registry.remove(owner);
        }
        drop(registry);

        if let Some(worker) = &worker {
            worker.cancel();
            debug!(owner = %owner, worker = %worker.id(), "Released backup worker");
        }
        worker
    }

    /// Number of tracked workers of an owner
    pub fn worker_count(&self, owner: &OwnerKey) -> usize {
        self.registry().get(owner).map(HashMap::len).unwrap_or(0)
    }

    /// Cancel and discard every worker of an owner
    pub fn cleanup(&self, owner: &OwnerKey) {
        let removed = self.registry().remove(owner);
        if let Some(workers) = removed {
            for worker in workers.values() {
                worker.cancel();
            }
            info!(owner = %owner, workers = workers.len(), "Discarded backup workers");
        }
    }

    /// Deferred form of [`cleanup`](Self::cleanup), for deletion hooks
    pub fn cleanup_fn(&self, owner: &OwnerKey) -> impl FnOnce() + Send + 'static {
        let manager = self.clone();
        let owner = owner.clone();
        move || manager.cleanup(&owner)
    }

    /// Take the notification stream
    ///
    /// There is a single stream per process; only the first call gets it.
    pub fn take_notifications(&self) -> Option<UnboundedReceiver<WorkerEvent>> {
        self.inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

fn record_outcome(owner: &OwnerKey, job: &BackupJob, status: &WorkerStatus, elapsed: std::time::Duration) {
    metrics::RUNNING_WORKERS.dec();

    let outcome = if status.error.is_none() { "success" } else { "failure" };
    metrics::BACKUPS_TOTAL
        .with_label_values(&[outcome, &owner.namespace, &owner.name, &job.shard])
        .inc();
    metrics::BACKUP_DURATION
        .with_label_values(&[&owner.namespace, &owner.name, &job.shard])
        .observe(elapsed.as_secs_f64());
    if let Some(bytes) = status.uploaded_bytes {
        metrics::BACKUP_SIZE_BYTES
            .with_label_values(&[&owner.namespace, &owner.name, &job.shard])
            .set(bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;

    use super::*;
    use crate::topology::{Endpoint, Role};
    use crate::workers::{ChunkStream, ObjectStore, RemoteShell, ShellConnector, WorkerError};

    /// Connector that counts sessions and then hangs or fails fast
    struct CountingConnector {
        connects: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl ShellConnector for CountingConnector {
        async fn connect(&self, _host: &str) -> Result<Box<dyn RemoteShell>, WorkerError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            Err(WorkerError::Connect("unreachable".to_string()))
        }
    }

    struct NullStore;

    #[async_trait]
    impl ObjectStore for NullStore {
        async fn upload(&self, _key: &str, _body: ChunkStream<'_>) -> Result<u64, WorkerError> {
            Ok(0)
        }
    }

    fn spec(shard: &str, connector: Arc<CountingConnector>) -> WorkerSpec {
        WorkerSpec::new(
            BackupJob {
                shard: shard.to_string(),
                server: Endpoint {
                    id: format!("{}.svc:6379", shard),
                    alias: format!("{}-1", shard),
                    role: Role::ReplicaRo,
                },
                scheduled_for: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
                timeout: Duration::from_secs(3600),
                poll_interval: Duration::from_secs(60),
                min_size: 1,
                db_file: "/data/dump.rdb".to_string(),
                key_prefix: String::new(),
                sudo: false,
            },
            Transport::new(connector, Arc::new(NullStore)),
        )
    }

    fn connector(hang: bool) -> Arc<CountingConnector> {
        Arc::new(CountingConnector {
            connects: AtomicUsize::new(0),
            hang,
        })
    }

    #[test]
    fn test_owner_key_display() {
        assert_eq!(OwnerKey::new("redis", "backups").to_string(), "redis/backups");
    }

    #[tokio::test]
    async fn test_reconcile_workers_is_idempotent() {
        let manager = WorkerManager::new();
        let owner = OwnerKey::new("ns", "backup");
        let conn = connector(true);

        let desired = vec![spec("shard00", conn.clone()), spec("shard01", conn.clone())];
        assert_eq!(manager.reconcile_workers(&owner, desired.clone()), 2);
        assert_eq!(manager.reconcile_workers(&owner, desired), 0);
        assert_eq!(manager.worker_count(&owner), 2);

        manager.cleanup(&owner);
    }

    #[tokio::test]
    async fn test_absent_workers_are_not_stopped() {
        let manager = WorkerManager::new();
        let owner = OwnerKey::new("ns", "backup");
        let conn = connector(true);

        manager.reconcile_workers(&owner, vec![spec("shard00", conn.clone())]);
        manager.reconcile_workers(&owner, vec![]);

        let id = spec("shard00", conn).id();
        let worker = manager.get_worker(&id, &owner).unwrap();
        assert!(!worker.status().finished);

        manager.cleanup(&owner);
    }

    #[tokio::test]
    async fn test_get_worker_is_scoped_by_owner() {
        let manager = WorkerManager::new();
        let owner = OwnerKey::new("ns", "backup");
        let other = OwnerKey::new("ns", "other");
        let conn = connector(true);
        let spec = spec("shard00", conn);
        let id = spec.id();

        manager.reconcile_workers(&owner, vec![spec]);

        assert!(manager.get_worker(&id, &owner).is_some());
        assert!(manager.get_worker(&id, &other).is_none());
        assert!(manager.get_worker("missing", &owner).is_none());

        manager.cleanup(&owner);
    }

    #[tokio::test]
    async fn test_finished_worker_notifies() {
        let manager = WorkerManager::new();
        let mut events = manager.take_notifications().unwrap();
        assert!(manager.take_notifications().is_none());

        let owner = OwnerKey::new("ns", "backup");
        let spec = spec("shard00", connector(false));
        let id = spec.id();
        manager.reconcile_workers(&owner, vec![spec]);

        let event = events.next().await.unwrap();
        assert_eq!(event, WorkerEvent { owner: owner.clone(), worker_id: id.clone() });

        let status = manager.get_worker(&id, &owner).unwrap().status();
        assert!(status.finished);
        assert!(status.error.is_some());

        assert!(manager.release(&id, &owner).is_some());
        assert!(manager.get_worker(&id, &owner).is_none());
    }

    #[tokio::test]
    async fn test_release_cancels_worker_in_flight() {
        let manager = WorkerManager::new();
        let owner = OwnerKey::new("ns", "backup");
        let spec = spec("shard00", connector(true));
        let id = spec.id();
        manager.reconcile_workers(&owner, vec![spec]);

        let worker = manager.release(&id, &owner).unwrap();
        assert_eq!(worker.id(), id);
        assert_eq!(manager.worker_count(&owner), 0);

        let status = worker.finished().await;
        assert_eq!(status.error, Some(WorkerError::Canceled));
    }

    #[tokio::test]
    async fn test_cleanup_fn_cancels_workers() {
        let manager = WorkerManager::new();
        let owner = OwnerKey::new("ns", "backup");
        let spec = spec("shard00", connector(true));
        let id = spec.id();
        manager.reconcile_workers(&owner, vec![spec]);
        let worker = manager.get_worker(&id, &owner).unwrap();

        let cleanup = manager.cleanup_fn(&owner);
        cleanup();

        assert_eq!(manager.worker_count(&owner), 0);
        let status = worker.finished().await;
        assert_eq!(status.error, Some(WorkerError::Canceled));
    }
}
