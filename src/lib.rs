//! OSO Redis Backup Kubernetes Operator
//!
//! This operator takes periodic RDB backups of every shard of a
//! Sentinel-managed Redis deployment and uploads them to S3, driven by the
//! ShardedRedisBackup Custom Resource Definition.

pub mod adapters;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod metrics;
pub mod reconcilers;
pub mod topology;
pub mod workers;

pub use error::{Error, Result};
