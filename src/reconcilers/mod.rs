//! Reconcilers for the Redis Backup CRDs
//!
//! This module contains the business logic of the backup controller:
//! - Validating the ShardedRedisBackup spec
//! - Launching due backups and folding worker results into status
//! - Scheduling the next backups and pruning history

pub mod backup;
pub mod phases;
pub mod schedule;
