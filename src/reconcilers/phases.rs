//! Reconciliation phases of a ShardedRedisBackup
//!
//! Every phase works on the in-memory status only. Record transitions are
//! pure functions; the caller decides when to persist.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::crd::{BackupRecord, BackupState, ShardedRedisBackupSpec, ShardedRedisBackupStatus};
use crate::error::Result;
use crate::topology::{ClusterTopology, Endpoint};
use crate::workers::{worker_id, BackupJob, OwnerKey, Transport, WorkerManager, WorkerSpec, WorkerStatus};

use super::schedule;

/// What the state machine knows about the worker of a Running record
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerObservation {
    /// The record's server left the topology
    ServerGone,
    /// No tracked worker matches the record
    WorkerMissing,
    /// Worker still in flight
    Running,
    /// Worker done, with its error if any
    Finished(WorkerStatus),
}

/// Pending record moved to Running on `server`
pub fn start_record(record: &BackupRecord, server: &Endpoint, now: DateTime<Utc>) -> BackupRecord {
    BackupRecord {
        started_at: Some(now),
        server_id: Some(server.id.clone()),
        server_alias: Some(server.alias.clone()),
        state: BackupState::Running,
        message: "backup is running".to_string(),
        ..record.clone()
    }
}

/// Pending record that cannot run because its shard has no eligible replica
pub fn unschedulable_record(record: &BackupRecord) -> BackupRecord {
    BackupRecord {
        state: BackupState::Unknown,
        message: "no read-only replica available".to_string(),
        ..record.clone()
    }
}

/// Running record after observing its worker
pub fn observe_record(record: &BackupRecord, observation: &WorkerObservation) -> BackupRecord {
    let (state, message) = match observation {
        WorkerObservation::ServerGone => (BackupState::Unknown, "server not found in cluster".to_string()),
        WorkerObservation::WorkerMissing => (BackupState::Unknown, "runner not found".to_string()),
        WorkerObservation::Running => return record.clone(),
        WorkerObservation::Finished(status) => match &status.error {
            Some(e) => (BackupState::Failed, e.to_string()),
            None => (BackupState::Completed, "backup complete".to_string()),
        },
    };

    BackupRecord {
        state,
        message,
        ..record.clone()
    }
}

/// Static parameters shared by every job of a resource
#[derive(Clone, Debug)]
pub struct JobTemplate {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub min_size: u64,
    pub db_file: String,
    pub key_prefix: String,
    pub sudo: bool,
}

impl JobTemplate {
    pub fn from_spec(spec: &ShardedRedisBackupSpec) -> Result<Self> {
        Ok(Self {
            timeout: spec.timeout(),
            poll_interval: spec.poll_interval(),
            min_size: spec.min_size_bytes()?,
            db_file: spec.db_file.clone(),
            key_prefix: spec.s3_options.path.clone(),
            sudo: spec.ssh_options.sudo,
        })
    }

    pub fn job(&self, shard: &str, server: &Endpoint, scheduled_for: DateTime<Utc>) -> BackupJob {
        BackupJob {
            shard: shard.to_string(),
            server: server.clone(),
            scheduled_for,
            timeout: self.timeout,
            poll_interval: self.poll_interval,
            min_size: self.min_size,
            db_file: self.db_file.clone(),
            key_prefix: self.key_prefix.clone(),
            sudo: self.sudo,
        }
    }
}

/// Pending record dropped in favor of a later one of the same shard
pub fn superseded_record(record: &BackupRecord, reason: &str) -> BackupRecord {
    BackupRecord {
        state: BackupState::Unknown,
        message: format!("superseded by {}", reason),
        ..record.clone()
    }
}

/// Phase 2: start the most recent due Pending record of every idle shard
///
/// Older due Pending records of the same shard are superseded. Returns
/// whether the status changed and the workers to launch.
pub fn launch_due_backups(
    status: &mut ShardedRedisBackupStatus,
    topology: &ClusterTopology,
    template: &JobTemplate,
    transport: &Transport,
    now: DateTime<Utc>,
) -> (bool, Vec<WorkerSpec>) {
    let mut changed = false;
    let mut specs = Vec::new();

    for shard in &topology.shards {
        if status.find_last(&shard.name, BackupState::Running).is_some() {
            continue;
        }

        // Most recent first
        let due: Vec<usize> = status
            .backups
            .iter()
            .enumerate()
            .filter(|(_, b)| b.shard == shard.name && b.state == BackupState::Pending && b.scheduled_for <= now)
            .map(|(index, _)| index)
            .collect();
        let Some((&index, older)) = due.split_first() else {
            continue;
        };

        for &stale in older {
            debug!(shard = %shard.name, scheduled_for = %status.backups[stale].scheduled_for, "Superseding missed backup");
            status.backups[stale] = superseded_record(&status.backups[stale], "a later backup");
        }
        changed |= !older.is_empty();

        let record = &status.backups[index];
        let Some(target) = shard.read_only_replicas().first().copied() else {
            warn!(shard = %shard.name, "No read-only replica available for backup");
            status.backups[index] = unschedulable_record(record);
            changed = true;
            continue;
        };

        let job = template.job(&shard.name, target, record.scheduled_for);
        info!(shard = %shard.name, server = %target.alias, scheduled_for = %record.scheduled_for, "Launching backup");
        status.backups[index] = start_record(record, target, now);
        specs.push(WorkerSpec::new(job, transport.clone()));
        changed = true;
    }

    (changed, specs)
}

/// Result of phase 3
#[derive(Debug, Default)]
pub struct RunningReconciliation {
    pub changed: bool,
    /// Workers whose record is now terminal, released once persisted
    pub settled: Vec<String>,
}

/// Phase 3: fold worker state back into Running records
pub fn reconcile_running<F>(
    status: &mut ShardedRedisBackupStatus,
    topology: &ClusterTopology,
    lookup: F,
) -> RunningReconciliation
where
    F: Fn(&str) -> Option<WorkerStatus>,
{
    let mut result = RunningReconciliation::default();

    for record in status.backups.iter_mut().filter(|b| b.state == BackupState::Running) {
        let server = record
            .server_id
            .as_deref()
            .and_then(|id| topology.lookup_server_by_id(id));

        let (observation, id) = match server {
            // Any worker still attached to the departed server is stopped on release
            None => {
                let id = record
                    .server_alias
                    .as_deref()
                    .map(|alias| worker_id(&record.shard, alias, record.scheduled_for));
                (WorkerObservation::ServerGone, id)
            }
            Some(server) => {
                let id = worker_id(&record.shard, &server.alias, record.scheduled_for);
                let observation = match lookup(&id) {
                    None => WorkerObservation::WorkerMissing,
                    Some(s) if s.finished => WorkerObservation::Finished(s),
                    Some(_) => WorkerObservation::Running,
                };
                (observation, Some(id))
            }
        };

        if observation == WorkerObservation::Running {
            continue;
        }

        let updated = observe_record(record, &observation);
        debug!(shard = %record.shard, state = %updated.state, message = %updated.message, "Backup record settled");
        *record = updated;
        result.changed = true;

        match (&observation, id) {
            (WorkerObservation::Finished(_) | WorkerObservation::ServerGone, Some(id)) => result.settled.push(id),
            _ => {}
        }
    }

    result
}

/// Inputs of one reconcile, already fetched
pub struct ReconcileInput<'a> {
    pub owner: &'a OwnerKey,
    pub spec: &'a ShardedRedisBackupSpec,
    pub topology: &'a ClusterTopology,
    pub transport: &'a Transport,
    pub now: DateTime<Utc>,
}

/// What the caller must do after a reconcile step
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Status changed and must be persisted; settled workers are released after
    Persist { settled: Vec<String> },
    /// Nothing to persist; reconcile again after the delay
    Requeue(Duration),
}

/// Run phases 2 to 4 in order, stopping at the first one that changes status
pub fn step(
    status: &mut ShardedRedisBackupStatus,
    input: &ReconcileInput<'_>,
    manager: &WorkerManager,
) -> Result<Step> {
    let template = JobTemplate::from_spec(input.spec)?;

    let (changed, specs) = launch_due_backups(status, input.topology, &template, input.transport, input.now);
    manager.reconcile_workers(input.owner, specs);
    if changed {
        return Ok(Step::Persist { settled: Vec::new() });
    }

    let running = reconcile_running(status, input.topology, |id| {
        manager.get_worker(id, input.owner).map(|w| w.status())
    });
    if running.changed {
        return Ok(Step::Persist {
            settled: running.settled,
        });
    }

    let schedule = input.spec.parse_schedule()?;
    let next_run = schedule::next_run(&schedule, input.now)?;
    let shards = input.topology.shard_names();
    if schedule::reconcile_backup_list(status, next_run, &shards, input.spec.history_limit, input.spec.pause) {
        return Ok(Step::Persist { settled: Vec::new() });
    }

    Ok(Step::Requeue(schedule::requeue_after(next_run, input.now)))
}
