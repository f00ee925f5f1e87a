//! Kubernetes controllers for the Redis Backup CRDs
//!
//! This module contains the controller implementation that watches
//! ShardedRedisBackup changes and worker notifications and triggers
//! reconciliation.

mod backup_controller;

pub use backup_controller::run as run_backup_controller;

use kube::Client;

use crate::workers::WorkerManager;

/// Shared context for all controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Process-wide backup worker registry
    pub workers: WorkerManager,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, workers: WorkerManager) -> Self {
        Self { client, workers }
    }
}
