//! OSO Redis Backup Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client, the
//! shared backup worker pool and the ShardedRedisBackup controller.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use redis_backup_operator::{
    controllers::{self, Context},
    metrics,
    workers::WorkerManager,
};

/// Default metrics port
const DEFAULT_METRICS_PORT: u16 = 8080;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    info!("Starting OSO Redis Backup Operator");

    let metrics_port = metrics_port()?;

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // One worker pool for the whole process
    let workers = WorkerManager::new();
    let context = Arc::new(Context::new(client.clone(), workers));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    let backup_controller = controllers::run_backup_controller(client.clone(), context.clone());

    // Handle graceful shutdown
    tokio::select! {
        _ = backup_controller => {
            error!("Backup controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    info!("OSO Redis Backup Operator stopped");
    Ok(())
}

/// Metrics port from METRICS_PORT, falling back to the default
fn metrics_port() -> anyhow::Result<u16> {
    match std::env::var("METRICS_PORT") {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid METRICS_PORT {:?}: {}", value, e)),
        Err(_) => Ok(DEFAULT_METRICS_PORT),
    }
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
