//! Backup scheduler
//!
//! Decides which shards get a new Pending record for the next cron tick
//! and bounds the history kept per shard.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tracing::debug;

use crate::crd::{BackupRecord, BackupState, ShardedRedisBackupStatus};
use crate::error::{Error, Result};

use super::phases::superseded_record;

/// Delay added to requeues so the next reconcile never fires before the tick
pub const REQUEUE_SKEW: Duration = Duration::from_secs(1);

/// First schedule tick strictly after `now`
pub fn next_run(schedule: &Schedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    schedule
        .after(&now)
        .next()
        .ok_or_else(|| Error::config("schedule has no upcoming run"))
}

/// Time to wait before reconciling for `next_run`
pub fn requeue_after(next_run: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next_run - now).to_std().unwrap_or_default() + REQUEUE_SKEW
}

/// Add a Pending record at `next_run` for every shard that needs one
///
/// A shard is skipped when it has a Running record, or when it already has
/// a record for `next_run`. Pending records later than `next_run` were
/// scheduled under a previous cron expression and are superseded.
pub fn schedule_backups(
    status: &mut ShardedRedisBackupStatus,
    next_run: DateTime<Utc>,
    shards: &[String],
) -> bool {
    let mut changed = false;

    for shard in shards {
        for record in status
            .backups
            .iter_mut()
            .filter(|b| &b.shard == shard && b.state == BackupState::Pending && b.scheduled_for > next_run)
        {
            debug!(shard = %shard, scheduled_for = %record.scheduled_for, "Superseding backup of previous schedule");
            *record = superseded_record(record, "a schedule change");
            changed = true;
        }

        if status.find_last(shard, BackupState::Running).is_some() || status.contains(shard, next_run) {
            continue;
        }

        status.add_backup(BackupRecord::pending(shard.clone(), next_run));
        debug!(shard = %shard, scheduled_for = %next_run, "Scheduled backup");
        changed = true;
    }

    changed
}

/// Keep at most `limit` records per shard, most recent first
///
/// Running records are never evicted. Records of shards outside `shards`
/// are left untouched.
pub fn apply_history_limit(status: &mut ShardedRedisBackupStatus, limit: usize, shards: &[String]) -> bool {
    let before = status.backups.len();
    let mut seen: HashMap<String, usize> = HashMap::new();

    status.backups.retain(|record| {
        if !shards.contains(&record.shard) {
            return true;
        }
        let count = seen.entry(record.shard.clone()).or_insert(0);
        *count += 1;
        record.state == BackupState::Running || *count <= limit
    });

    status.backups.len() != before
}

/// Phase 4: schedule the next tick and prune history
pub fn reconcile_backup_list(
    status: &mut ShardedRedisBackupStatus,
    next_run: DateTime<Utc>,
    shards: &[String],
    history_limit: u32,
    paused: bool,
) -> bool {
    let mut changed = false;

    if !paused && schedule_backups(status, next_run, shards) {
        changed = true;
    }

    if apply_history_limit(status, history_limit as usize, shards) {
        changed = true;
    }

    changed
}
