//! Prometheus metrics for the Redis Backup Operator
//!
//! This module exposes metrics for monitoring operator health, reconciles
//! and shard backups.

mod prometheus;

pub use prometheus::*;
