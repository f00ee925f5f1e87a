//! Custom Resource Definitions for the Redis Backup Operator

mod sentinel;
mod sharded_redis_backup;

pub use sentinel::*;
pub use sharded_redis_backup::*;

use kube::CustomResourceExt;

/// Generate the CRD YAML manifests owned by this operator
///
/// The Sentinel CRD belongs to the operator that deploys the sentinels and
/// is not emitted here.
pub fn generate_crds() -> Vec<String> {
    vec![serde_yaml::to_string(&ShardedRedisBackup::crd()).unwrap()]
}
