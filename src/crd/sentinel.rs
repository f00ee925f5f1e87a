//! Sentinel Custom Resource (read-only view)
//!
//! The Sentinel resource is owned by the Redis operator that deploys the
//! sentinels. This operator only reads the topology it publishes in status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Sentinel resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "redis.oso.sh",
    version = "v1alpha1",
    kind = "Sentinel",
    plural = "sentinels",
    singular = "sentinel",
    namespaced,
    status = "SentinelStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct SentinelSpec {
    /// Number of sentinel replicas
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Shards monitored by the sentinels, by name
    #[serde(default)]
    pub monitored_shards: BTreeMap<String, Vec<String>>,
}

/// Sentinel status as published by the sentinel controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SentinelStatus {
    /// Topology of every monitored shard
    #[serde(default)]
    pub monitored_shards: Vec<MonitoredShard>,
}

/// One shard as seen by the sentinels
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredShard {
    /// Shard name
    pub name: String,

    /// Servers of the shard, keyed by alias
    #[serde(default)]
    pub servers: BTreeMap<String, MonitoredServer>,
}

/// One server as seen by the sentinels
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredServer {
    /// host:port
    pub address: String,

    /// Replication role
    pub role: MonitoredRole,

    /// Relevant server configuration (e.g. slave-read-only)
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Replication role reported by the sentinels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MonitoredRole {
    Master,
    Slave,
}
