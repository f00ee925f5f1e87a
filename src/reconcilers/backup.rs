//! ShardedRedisBackup reconciler
//!
//! Handles the business logic for backup operations including:
//! - Spec validation
//! - Fetching the topology and credentials
//! - Running the reconcile phases
//! - Status updates

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::{
    api::{Patch, PatchParams},
    runtime::controller::Action,
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use crate::adapters::build_transport;
use crate::controllers::Context;
use crate::crd::{Condition, ShardedRedisBackup, ShardedRedisBackupStatus};
use crate::error::{Error, Result};
use crate::topology;
use crate::workers::OwnerKey;

use super::phases::{self, ReconcileInput, Step};

/// Field manager used for status patches
const FIELD_MANAGER: &str = "redis-backup-operator";

/// Requeue delay after a status write, in case the watch event is missed
const PERSIST_REQUEUE: Duration = Duration::from_secs(5);

/// Validate the ShardedRedisBackup spec
pub fn validate(backup: &ShardedRedisBackup) -> Result<()> {
    let spec = &backup.spec;

    if spec.sentinel_ref.trim().is_empty() {
        return Err(Error::validation("sentinelRef must be specified"));
    }

    spec.parse_schedule()
        .map_err(|e| Error::validation(e.to_string()))?;

    spec.min_size_bytes()
        .map_err(|e| Error::validation(e.to_string()))?;

    if spec.history_limit == 0 {
        return Err(Error::validation("historyLimit must be at least 1"));
    }

    if spec.poll_interval_secs >= spec.timeout_secs {
        return Err(Error::validation(format!(
            "pollIntervalSecs ({}) must be lower than timeoutSecs ({})",
            spec.poll_interval_secs, spec.timeout_secs
        )));
    }

    if spec.s3_options.bucket.trim().is_empty() {
        return Err(Error::validation("s3Options.bucket must be specified"));
    }

    if spec.ssh_options.user.trim().is_empty() {
        return Err(Error::validation("sshOptions.user must be specified"));
    }

    Ok(())
}

/// Reconcile one ShardedRedisBackup
pub async fn reconcile(backup: &ShardedRedisBackup, ctx: &Context, now: DateTime<Utc>) -> Result<Action> {
    let owner = OwnerKey::from_resource(backup);
    let namespace = owner.namespace.clone();

    // Phase 1: dependencies
    let topology = topology::resolve(&ctx.client, &namespace, &backup.spec.sentinel_ref).await?;
    let transport = build_transport(&backup.spec, &ctx.client, &namespace).await?;
    debug!(owner = %owner, shards = topology.shards.len(), "Dependencies resolved");

    let mut status = backup.status.clone().unwrap_or_default();
    status.sort();

    let input = ReconcileInput {
        owner: &owner,
        spec: &backup.spec,
        topology: &topology,
        transport: &transport,
        now,
    };

    // Phases 2 to 4
    match phases::step(&mut status, &input, &ctx.workers)? {
        Step::Persist { settled } => {
            persist_status(backup, &ctx.client, &namespace, status, now).await?;
            for id in settled {
                ctx.workers.release(&id, &owner);
            }
            Ok(Action::requeue(PERSIST_REQUEUE))
        }
        Step::Requeue(after) => {
            if !is_ready(&status) {
                persist_status(backup, &ctx.client, &namespace, status, now).await?;
            }
            info!(owner = %owner, requeue_secs = after.as_secs(), "Waiting for next scheduled backup");
            Ok(Action::requeue(after))
        }
    }
}

/// Write the backup list, guarded by the resource version that was read
async fn persist_status(
    backup: &ShardedRedisBackup,
    client: &Client,
    namespace: &str,
    status: ShardedRedisBackupStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = backup.name_any();
    let api: Api<ShardedRedisBackup> = Api::namespaced(client.clone(), namespace);

    let ready = ready_condition(
        &status.conditions,
        true,
        "BackupsScheduled",
        "Backup schedule is configured and active",
        now,
    );

    let backups = serde_json::to_value(&status.backups)?;
    let patch = json!({
        "metadata": {
            "resourceVersion": backup.resource_version(),
        },
        "status": {
            "backups": backups,
            "observedGeneration": backup.metadata.generation,
            "conditions": [ready],
        }
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await?;

    debug!(name = %name, records = status.backups.len(), "Status persisted");
    Ok(())
}

/// Update status to Failed after a validation error
pub async fn update_status_failed(
    backup: &ShardedRedisBackup,
    client: &Client,
    namespace: &str,
    error_message: &str,
) -> Result<()> {
    let name = backup.name_any();
    let api: Api<ShardedRedisBackup> = Api::namespaced(client.clone(), namespace);

    let existing = backup
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let condition = ready_condition(existing, false, "ValidationFailed", error_message, Utc::now());

    let status = json!({
        "status": {
            "observedGeneration": backup.metadata.generation,
            "conditions": [condition],
        }
    });

    api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(status))
        .await?;

    Ok(())
}

/// Build the Ready condition, keeping the transition time when unchanged
pub fn ready_condition(
    existing: &[Condition],
    ready: bool,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Condition {
    let status = if ready { "True" } else { "False" };
    let last_transition_time = existing
        .iter()
        .find(|c| c.type_ == "Ready" && c.status == status)
        .map(|c| c.last_transition_time)
        .unwrap_or(now);

    Condition {
        type_: "Ready".to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

fn is_ready(status: &ShardedRedisBackupStatus) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}
