//! Backup worker
//!
//! Drives one shard snapshot through trigger, poll and transfer:
//!
//! 1. open a remote shell on the selected replica
//! 2. remember `LASTSAVE` and trigger `BGSAVE`
//! 3. poll until `LASTSAVE` advances and the dump reaches the minimum size
//! 4. upload the compressed dump to object storage
//!
//! The whole pipeline is bounded by the job timeout and aborts as soon as
//! the worker is canceled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::topology::Endpoint;

use super::transport::{ObjectStore, RemoteShell, Transport};
use super::WorkerError;

/// Format of the timestamp part of object keys
const KEY_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parameters of one backup
#[derive(Clone, Debug)]
pub struct BackupJob {
    pub shard: String,
    /// Replica the snapshot is taken from
    pub server: Endpoint,
    pub scheduled_for: DateTime<Utc>,
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Lower bound for the snapshot size in bytes
    pub min_size: u64,
    pub db_file: String,
    /// Prefix of the object key inside the bucket
    pub key_prefix: String,
    pub sudo: bool,
}

impl BackupJob {
    pub fn worker_id(&self) -> String {
        worker_id(&self.shard, &self.server.alias, self.scheduled_for)
    }

    /// Destination key: `<prefix>/<shard>/<timestamp>.rdb.gz`
    pub fn object_key(&self) -> String {
        let file = format!(
            "{}/{}.rdb.gz",
            self.shard,
            self.scheduled_for.format(KEY_TIMESTAMP_FORMAT)
        );
        let prefix = self.key_prefix.trim_matches('/');
        if prefix.is_empty() {
            file
        } else {
            format!("{}/{}", prefix, file)
        }
    }

    fn commands(&self) -> RedisCommands<'_> {
        RedisCommands { job: self }
    }
}

/// Deterministic worker identity
pub fn worker_id(shard: &str, server_alias: &str, scheduled_for: DateTime<Utc>) -> String {
    format!("{}-{}-{}", shard, server_alias, scheduled_for.timestamp())
}

/// Observable state of a worker
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    pub finished: bool,
    pub error: Option<WorkerError>,
    /// Bytes uploaded, once finished successfully
    pub uploaded_bytes: Option<u64>,
}

/// A running (or finished) backup
pub struct Worker {
    id: String,
    cancel: CancellationToken,
    status: watch::Receiver<WorkerStatus>,
}

impl Worker {
    /// Spawn the backup on the runtime
    ///
    /// `on_finish` runs on the worker task once the final status is set.
    pub fn spawn<F>(job: BackupJob, transport: Transport, on_finish: F) -> Arc<Self>
    where
        F: FnOnce(&BackupJob, &WorkerStatus, Duration) + Send + 'static,
    {
        let (tx, rx) = watch::channel(WorkerStatus::default());
        let cancel = CancellationToken::new();
        let worker = Arc::new(Self {
            id: job.worker_id(),
            cancel: cancel.clone(),
            status: rx,
        });

        tokio::spawn(async move {
            let started = Instant::now();
            info!(shard = %job.shard, server = %job.server.alias, "Backup worker started");

            let result = run(&job, &transport, &cancel).await;
            let status = match result {
                Ok(bytes) => {
                    info!(shard = %job.shard, bytes, key = %job.object_key(), "Backup worker finished");
                    WorkerStatus {
                        finished: true,
                        error: None,
                        uploaded_bytes: Some(bytes),
                    }
                }
                Err(e) => {
                    warn!(shard = %job.shard, error = %e, "Backup worker failed");
                    WorkerStatus {
                        finished: true,
                        error: Some(e),
                        uploaded_bytes: None,
                    }
                }
            };

            tx.send_replace(status.clone());
            on_finish(&job, &status, started.elapsed());
        });

        worker
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status; never blocks
    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the worker has finished
    pub async fn finished(&self) -> WorkerStatus {
        let mut rx = self.status.clone();
        // The sender only drops after publishing the final status
        let _ = rx.wait_for(|s| s.finished).await;
        let status = rx.borrow().clone();
        status
    }
}

async fn run(
    job: &BackupJob,
    transport: &Transport,
    cancel: &CancellationToken,
) -> Result<u64, WorkerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(WorkerError::Canceled),
        result = tokio::time::timeout(job.timeout, execute(job, transport)) => {
            result.unwrap_or(Err(WorkerError::Timeout))
        }
    }
}

async fn execute(job: &BackupJob, transport: &Transport) -> Result<u64, WorkerError> {
    let shell = transport.shell.connect(job.server.host()).await?;
    let result = snapshot_and_upload(job, shell.as_ref(), transport.store.as_ref()).await;
    shell.close().await;
    result
}

async fn snapshot_and_upload(
    job: &BackupJob,
    shell: &dyn RemoteShell,
    store: &dyn ObjectStore,
) -> Result<u64, WorkerError> {
    let cmds = job.commands();

    let before = parse_integer(&shell.exec(&cmds.lastsave()).await?)?;
    shell.exec(&cmds.bgsave()).await?;
    debug!(shard = %job.shard, lastsave = before, "Background save triggered");

    loop {
        tokio::time::sleep(job.poll_interval).await;

        match check_snapshot(shell, &cmds).await {
            Ok((lastsave, size)) if lastsave > before && size >= job.min_size => {
                debug!(shard = %job.shard, size, "Snapshot ready");
                break;
            }
            Ok((lastsave, size)) => {
                debug!(shard = %job.shard, lastsave, size, "Snapshot not ready yet");
            }
            Err(e) => {
                warn!(shard = %job.shard, error = %e, "Snapshot check failed, retrying");
            }
        }
    }

    let dump = cmds.compressed_dump();
    let body = shell.exec_stream(&dump).await?;
    store.upload(&job.object_key(), body).await
}

/// Returns (LASTSAVE, dump size in bytes)
async fn check_snapshot(shell: &dyn RemoteShell, cmds: &RedisCommands<'_>) -> Result<(i64, u64), WorkerError> {
    let out = shell.exec(&cmds.snapshot_check()).await?;
    let text = String::from_utf8_lossy(&out);
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let lastsave = lines
        .next()
        .ok_or_else(|| WorkerError::Command("empty snapshot check output".to_string()))?;
    let size = lines
        .next()
        .ok_or_else(|| WorkerError::Command("snapshot check output misses the dump size".to_string()))?;

    let lastsave = parse_integer(lastsave.as_bytes())?;
    let size = size
        .trim()
        .parse::<u64>()
        .map_err(|e| WorkerError::Command(format!("invalid dump size '{}': {}", size.trim(), e)))?;

    Ok((lastsave, size))
}

/// Parse redis-cli integer output, with or without the "(integer)" tag
fn parse_integer(out: &[u8]) -> Result<i64, WorkerError> {
    let text = String::from_utf8_lossy(out);
    let token = text.split_whitespace().last().unwrap_or_default();
    token
        .parse()
        .map_err(|_| WorkerError::Command(format!("unexpected redis-cli output '{}'", text.trim())))
}

/// Remote commands for one job
struct RedisCommands<'a> {
    job: &'a BackupJob,
}

impl RedisCommands<'_> {
    fn sudo(&self) -> &'static str {
        if self.job.sudo {
            "sudo "
        } else {
            ""
        }
    }

    fn redis_cli(&self, command: &str) -> String {
        format!("{}redis-cli -p {} {}", self.sudo(), self.job.server.port(), command)
    }

    fn lastsave(&self) -> String {
        self.redis_cli("LASTSAVE")
    }

    fn bgsave(&self) -> String {
        self.redis_cli("BGSAVE")
    }

    fn snapshot_check(&self) -> String {
        format!(
            "{} && {}stat -c %s {}",
            self.lastsave(),
            self.sudo(),
            self.job.db_file
        )
    }

    fn compressed_dump(&self) -> String {
        format!("{}gzip -1 -c {}", self.sudo(), self.job.db_file)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use futures::{StreamExt, TryStreamExt};

    use super::*;
    use crate::topology::Role;
    use crate::workers::transport::{ChunkStream, ShellConnector};

    /// Fake Redis host: BGSAVE bumps LASTSAVE, the dump has a fixed size
    struct FakeShell {
        lastsave: AtomicI64,
        dump_size: u64,
        dump: DumpOutput,
        commands: Arc<Mutex<Vec<String>>>,
    }

    /// What `gzip` writes on stdout
    #[derive(Clone, Copy)]
    struct DumpOutput {
        chunks: usize,
        chunk_len: usize,
        exit_ok: bool,
    }

    impl Default for DumpOutput {
        fn default() -> Self {
            Self {
                chunks: 1,
                chunk_len: 16,
                exit_ok: true,
            }
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn exec(&self, command: &str) -> Result<Vec<u8>, WorkerError> {
            self.commands.lock().unwrap().push(command.to_string());
            if command.contains("stat") {
                let lastsave = self.lastsave.load(Ordering::SeqCst);
                Ok(format!("{}\n{}\n", lastsave, self.dump_size).into_bytes())
            } else if command.ends_with("BGSAVE") {
                self.lastsave.fetch_add(1, Ordering::SeqCst);
                Ok(b"Background saving started".to_vec())
            } else {
                let lastsave = self.lastsave.load(Ordering::SeqCst);
                Ok(format!("(integer) {}", lastsave).into_bytes())
            }
        }

        async fn exec_stream<'a>(&'a self, command: &'a str) -> Result<ChunkStream<'a>, WorkerError> {
            self.commands.lock().unwrap().push(command.to_string());
            let dump = self.dump;
            let mut chunks: Vec<Result<Vec<u8>, WorkerError>> =
                (0..dump.chunks).map(|_| Ok(vec![0u8; dump.chunk_len])).collect();
            if !dump.exit_ok {
                chunks.push(Err(WorkerError::Command("gzip exited with 1".to_string())));
            }
            Ok(futures::stream::iter(chunks).boxed())
        }

        async fn close(self: Box<Self>) {}
    }

    struct FakeConnector {
        dump_size: u64,
        dump: DumpOutput,
        refuse: bool,
        commands: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ShellConnector for FakeConnector {
        async fn connect(&self, host: &str) -> Result<Box<dyn RemoteShell>, WorkerError> {
            if self.refuse {
                return Err(WorkerError::Connect(format!("{}: connection refused", host)));
            }
            Ok(Box::new(FakeShell {
                lastsave: AtomicI64::new(1_700_000_000),
                dump_size: self.dump_size,
                dump: self.dump,
                commands: self.commands.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct FakeStore {
        keys: Mutex<Vec<String>>,
        chunks: Mutex<Vec<usize>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn upload(&self, key: &str, body: ChunkStream<'_>) -> Result<u64, WorkerError> {
            let chunks: Vec<Vec<u8>> = body.try_collect().await?;
            if self.fail.load(Ordering::SeqCst) {
                return Err(WorkerError::Transfer("access denied".to_string()));
            }
            self.keys.lock().unwrap().push(key.to_string());
            self.chunks.lock().unwrap().push(chunks.len());
            Ok(chunks.iter().map(Vec::len).sum::<usize>() as u64)
        }
    }

    fn job() -> BackupJob {
        BackupJob {
            shard: "shard01".to_string(),
            server: Endpoint {
                id: "10.0.0.2:6379".to_string(),
                alias: "shard01-1".to_string(),
                role: Role::ReplicaRo,
            },
            scheduled_for: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            min_size: 100,
            db_file: "/data/dump.rdb".to_string(),
            key_prefix: "/backups/".to_string(),
            sudo: false,
        }
    }

    fn transport(dump_size: u64, refuse: bool) -> (Transport, Arc<FakeStore>, Arc<Mutex<Vec<String>>>) {
        transport_with_dump(dump_size, refuse, DumpOutput::default())
    }

    fn transport_with_dump(
        dump_size: u64,
        refuse: bool,
        dump: DumpOutput,
    ) -> (Transport, Arc<FakeStore>, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(FakeStore::default());
        let connector = Arc::new(FakeConnector {
            dump_size,
            dump,
            refuse,
            commands: commands.clone(),
        });
        (Transport::new(connector, store.clone()), store, commands)
    }

    #[test]
    fn test_worker_id_is_deterministic() {
        let job = job();
        assert_eq!(job.worker_id(), "shard01-shard01-1-1714557600");
        assert_eq!(job.worker_id(), worker_id("shard01", "shard01-1", job.scheduled_for));
    }

    #[test]
    fn test_object_key_layout() {
        let mut job = job();
        assert_eq!(job.object_key(), "backups/shard01/2024-05-01T10:00:00.rdb.gz");

        job.key_prefix = String::new();
        assert_eq!(job.object_key(), "shard01/2024-05-01T10:00:00.rdb.gz");
    }

    #[test]
    fn test_parse_integer_accepts_tagged_output() {
        assert_eq!(parse_integer(b"(integer) 42\n").unwrap(), 42);
        assert_eq!(parse_integer(b"42").unwrap(), 42);
        assert!(parse_integer(b"ERR").is_err());
    }

    #[test]
    fn test_sudo_prefixes_commands() {
        let mut job = job();
        job.sudo = true;
        let cmds = job.commands();
        assert_eq!(cmds.bgsave(), "sudo redis-cli -p 6379 BGSAVE");
        assert_eq!(
            cmds.snapshot_check(),
            "sudo redis-cli -p 6379 LASTSAVE && sudo stat -c %s /data/dump.rdb"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_backup_uploads_snapshot() {
        let (transport, store, commands) = transport(1024, false);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        let status = worker.finished().await;

        assert!(status.finished);
        assert_eq!(status.error, None);
        assert_eq!(status.uploaded_bytes, Some(16));
        assert_eq!(
            *store.keys.lock().unwrap(),
            vec!["backups/shard01/2024-05-01T10:00:00.rdb.gz".to_string()]
        );
        assert!(commands.lock().unwrap().iter().any(|c| c.ends_with("BGSAVE")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_below_min_size_times_out() {
        let (transport, store, _) = transport(10, false);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        let status = worker.finished().await;

        assert_eq!(status.error, Some(WorkerError::Timeout));
        assert_eq!(status.error.unwrap().to_string(), "timeout");
        assert!(store.keys.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_is_reported() {
        let (transport, _, _) = transport(1024, true);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        let status = worker.finished().await;

        let message = status.error.unwrap().to_string();
        assert!(message.starts_with("connect failed"), "{}", message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_failure_is_reported() {
        let (transport, store, _) = transport(1024, false);
        store.fail.store(true, Ordering::SeqCst);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        let status = worker.finished().await;

        assert_eq!(
            status.error,
            Some(WorkerError::Transfer("access denied".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_is_streamed_in_chunks() {
        let dump = DumpOutput {
            chunks: 3,
            chunk_len: 8,
            exit_ok: true,
        };
        let (transport, store, commands) = transport_with_dump(1024, false, dump);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        let status = worker.finished().await;

        assert_eq!(status.error, None);
        assert_eq!(status.uploaded_bytes, Some(24));
        assert_eq!(*store.chunks.lock().unwrap(), vec![3]);
        assert!(commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == "gzip -1 -c /data/dump.rdb"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_dump_command_stores_nothing() {
        let dump = DumpOutput {
            chunks: 2,
            chunk_len: 8,
            exit_ok: false,
        };
        let (transport, store, _) = transport_with_dump(1024, false, dump);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        let status = worker.finished().await;

        assert_eq!(
            status.error,
            Some(WorkerError::Command("gzip exited with 1".to_string()))
        );
        assert!(store.keys.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finishes_worker_with_canceled() {
        let (transport, _, _) = transport(10, false);

        let worker = Worker::spawn(job(), transport, |_, _, _| {});
        assert!(!worker.status().finished);

        worker.cancel();
        let status = worker.finished().await;
        assert_eq!(status.error, Some(WorkerError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_finish_receives_final_status() {
        let (transport, _, _) = transport(1024, false);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let _worker = Worker::spawn(job(), transport, move |job, status, _| {
            let _ = tx.send((job.shard.clone(), status.clone()));
        });

        let (shard, status) = rx.await.unwrap();
        assert_eq!(shard, "shard01");
        assert!(status.finished);
    }
}
