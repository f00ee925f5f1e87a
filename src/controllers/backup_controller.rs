//! ShardedRedisBackup controller
//!
//! Watches ShardedRedisBackup resources and worker completion events and
//! triggers reconciliation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::ListParams,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config as WatcherConfig,
    },
    Api, Client, ResourceExt,
};
use tracing::{error, info, instrument, warn};

use crate::controllers::Context;
use crate::crd::ShardedRedisBackup;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reconcilers::backup as backup_reconciler;
use crate::workers::{OwnerKey, WorkerEvent};

/// Finalizer name for ShardedRedisBackup resources
const FINALIZER_NAME: &str = "redis.oso.sh/backup-finalizer";

/// Kind label used in metrics
const KIND: &str = "ShardedRedisBackup";

/// Run the ShardedRedisBackup controller
pub async fn run(client: Client, context: Arc<Context>) {
    let api: Api<ShardedRedisBackup> = Api::all(client.clone());

    // Verify CRD is installed
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("ShardedRedisBackup CRD not installed: {}", e);
        return;
    }

    info!("Starting ShardedRedisBackup controller");

    let mut controller = Controller::new(api, WatcherConfig::default()).shutdown_on_signal();

    // Wake the owner as soon as one of its workers finishes
    match context.workers.take_notifications() {
        Some(events) => {
            controller = controller.reconcile_on(events.map(|event: WorkerEvent| event.owner.object_ref()));
        }
        None => warn!("Worker notifications already consumed, relying on periodic requeues"),
    }

    controller
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    info!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or("default"),
                        "Reconciled ShardedRedisBackup"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation error");
                    metrics::RECONCILIATION_ERRORS.with_label_values(&[KIND]).inc();
                }
            }
        })
        .await;
}

/// Main reconciliation function
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<ShardedRedisBackup>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = metrics::RECONCILE_DURATION
        .with_label_values(&[KIND])
        .start_timer();
    metrics::RECONCILIATIONS.with_label_values(&[KIND]).inc();

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<ShardedRedisBackup> = Api::namespaced(ctx.client.clone(), &namespace);

    // Use finalizer so in-flight workers are canceled on deletion
    finalizer(&api, FINALIZER_NAME, obj, |event| async {
        match event {
            FinalizerEvent::Apply(backup) => apply(backup, ctx.clone()).await,
            FinalizerEvent::Cleanup(backup) => cleanup(backup, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Apply reconciliation (create/update/timer/worker event)
async fn apply(backup: Arc<ShardedRedisBackup>, ctx: Arc<Context>) -> Result<Action> {
    let name = backup.name_any();
    let namespace = backup.namespace().unwrap_or_else(|| "default".to_string());

    info!(
        name = %name,
        namespace = %namespace,
        generation = backup.metadata.generation.unwrap_or(0),
        "Reconciling ShardedRedisBackup"
    );

    // Validate the spec
    if let Err(e) = backup_reconciler::validate(&backup) {
        warn!(error = %e, "Validation failed");
        backup_reconciler::update_status_failed(&backup, &ctx.client, &namespace, &e.to_string())
            .await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    backup_reconciler::reconcile(&backup, &ctx, Utc::now()).await
}

/// Cleanup when resource is being deleted
async fn cleanup(backup: Arc<ShardedRedisBackup>, ctx: Arc<Context>) -> Result<Action> {
    let owner = OwnerKey::from_resource(&backup);
    info!(owner = %owner, "Cleaning up ShardedRedisBackup");

    // Uploaded backups are kept in the bucket
    let cancel_workers = ctx.workers.cleanup_fn(&owner);
    cancel_workers();

    metrics::CLEANUPS.with_label_values(&[KIND]).inc();

    Ok(Action::await_change())
}

/// Error policy for the controller
fn error_policy(obj: Arc<ShardedRedisBackup>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    error!(
        name = %name,
        error = %error,
        transient = error.is_transient(),
        "Reconciliation failed, scheduling retry"
    );

    Action::requeue(retry_delay(error))
}

/// Backoff per error class
fn retry_delay(error: &Error) -> Duration {
    match error {
        Error::Kube(_) => Duration::from_secs(30),
        Error::DependencyUnavailable(_) | Error::SecretNotFound(_) | Error::SecretKeyNotFound { .. } => {
            Duration::from_secs(30)
        }
        Error::Topology(_) => Duration::from_secs(60),
        Error::Config(_) | Error::Validation(_) => Duration::from_secs(300),
        Error::Finalizer(inner) => match inner.as_ref() {
            kube::runtime::finalizer::Error::ApplyFailed(e)
            | kube::runtime::finalizer::Error::CleanupFailed(e) => retry_delay(e),
            _ => Duration::from_secs(30),
        },
        _ => Duration::from_secs(30),
    }
}
