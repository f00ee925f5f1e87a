//! Cluster topology resolution through the Sentinel failover supervisor

mod cluster;

pub use cluster::*;
