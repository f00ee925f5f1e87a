//! Cluster topology as published by the failover supervisor

use kube::{Api, Client};

use crate::crd::{MonitoredRole, MonitoredServer, Sentinel, SentinelStatus};
use crate::error::{Error, Result};

/// Role of a server within its shard
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Master,
    ReplicaRo,
    ReplicaRw,
}

/// One Redis server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Stable identity (host:port)
    pub id: String,
    /// Server name as known by the supervisor
    pub alias: String,
    pub role: Role,
}

impl Endpoint {
    /// Host part of the address
    pub fn host(&self) -> &str {
        self.id
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.id)
    }

    /// Redis port, 6379 when the address carries none
    pub fn port(&self) -> u16 {
        self.id
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(6379)
    }
}

/// One shard and its servers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    pub name: String,
    pub servers: Vec<Endpoint>,
}

impl Shard {
    /// Read-only replicas, ordered by alias then ID
    ///
    /// The first element is the preferred backup source.
    pub fn read_only_replicas(&self) -> Vec<&Endpoint> {
        let mut replicas: Vec<&Endpoint> = self
            .servers
            .iter()
            .filter(|s| s.role == Role::ReplicaRo)
            .collect();
        replicas.sort_by(|a, b| a.alias.cmp(&b.alias).then_with(|| a.id.cmp(&b.id)));
        replicas
    }

    /// Current master as reported by Sentinel
    pub fn master(&self) -> Option<&Endpoint> {
        self.servers.iter().find(|s| s.role == Role::Master)
    }
}

/// Live topology of a sharded cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    pub shards: Vec<Shard>,
}

impl ClusterTopology {
    /// Build the topology from a Sentinel status
    pub fn from_sentinel_status(status: &SentinelStatus) -> Result<Self> {
        if status.monitored_shards.is_empty() {
            return Err(Error::topology("sentinel reports no monitored shards"));
        }

        let mut shards = Vec::with_capacity(status.monitored_shards.len());
        for monitored in &status.monitored_shards {
            let servers: Vec<Endpoint> = monitored
                .servers
                .iter()
                .map(|(alias, server)| Endpoint {
                    id: server.address.clone(),
                    alias: alias.clone(),
                    role: role_of(server),
                })
                .collect();

            let shard = Shard {
                name: monitored.name.clone(),
                servers,
            };
            if shard.master().is_none() {
                return Err(Error::topology(format!("shard '{}' has no master", shard.name)));
            }
            shards.push(shard);
        }
        shards.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self { shards })
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|s| s.name.clone()).collect()
    }

    pub fn shard(&self, name: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.name == name)
    }

    /// Find a server anywhere in the cluster by its ID
    pub fn lookup_server_by_id(&self, id: &str) -> Option<&Endpoint> {
        self.shards
            .iter()
            .flat_map(|s| s.servers.iter())
            .find(|e| e.id == id)
    }
}

fn role_of(server: &MonitoredServer) -> Role {
    match server.role {
        MonitoredRole::Master => Role::Master,
        MonitoredRole::Slave => match server.config.get("slave-read-only").map(String::as_str) {
            Some("no") => Role::ReplicaRw,
            _ => Role::ReplicaRo,
        },
    }
}

/// Resolve the topology published by the referenced Sentinel resource
pub async fn resolve(client: &Client, namespace: &str, sentinel_ref: &str) -> Result<ClusterTopology> {
    let api: Api<Sentinel> = Api::namespaced(client.clone(), namespace);
    let sentinel = api.get(sentinel_ref).await.map_err(|e| match e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            Error::dependency(format!("sentinel {}/{} not found", namespace, sentinel_ref))
        }
        other => Error::Kube(other),
    })?;

    let status = sentinel.status.ok_or_else(|| {
        Error::dependency(format!(
            "sentinel {}/{} has not published a status yet",
            namespace, sentinel_ref
        ))
    })?;

    ClusterTopology::from_sentinel_status(&status)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::crd::MonitoredShard;

    fn server(address: &str, role: MonitoredRole, read_only: Option<&str>) -> MonitoredServer {
        let mut config = BTreeMap::new();
        if let Some(ro) = read_only {
            config.insert("slave-read-only".to_string(), ro.to_string());
        }
        MonitoredServer {
            address: address.to_string(),
            role,
            config,
        }
    }

    fn status() -> SentinelStatus {
        let mut shard01 = BTreeMap::new();
        shard01.insert("shard01-0".to_string(), server("10.0.0.1:6379", MonitoredRole::Master, None));
        shard01.insert("shard01-2".to_string(), server("10.0.0.3:6379", MonitoredRole::Slave, Some("yes")));
        shard01.insert("shard01-1".to_string(), server("10.0.0.2:6379", MonitoredRole::Slave, None));

        let mut shard00 = BTreeMap::new();
        shard00.insert("shard00-0".to_string(), server("10.0.1.1:6379", MonitoredRole::Slave, Some("no")));
        shard00.insert("shard00-1".to_string(), server("10.0.1.2:6380", MonitoredRole::Master, None));

        SentinelStatus {
            monitored_shards: vec![
                MonitoredShard { name: "shard01".to_string(), servers: shard01 },
                MonitoredShard { name: "shard00".to_string(), servers: shard00 },
            ],
        }
    }

    #[test]
    fn test_shards_are_sorted_by_name() {
        let topology = ClusterTopology::from_sentinel_status(&status()).unwrap();
        assert_eq!(topology.shard_names(), vec!["shard00", "shard01"]);
    }

    #[test]
    fn test_read_only_replicas_exclude_master_and_rw() {
        let topology = ClusterTopology::from_sentinel_status(&status()).unwrap();

        let replicas = topology.shard("shard01").unwrap().read_only_replicas();
        let aliases: Vec<_> = replicas.iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(aliases, vec!["shard01-1", "shard01-2"]);

        assert!(topology.shard("shard00").unwrap().read_only_replicas().is_empty());
    }

    #[test]
    fn test_lookup_server_by_id() {
        let topology = ClusterTopology::from_sentinel_status(&status()).unwrap();

        let endpoint = topology.lookup_server_by_id("10.0.1.2:6380").unwrap();
        assert_eq!(endpoint.alias, "shard00-1");
        assert_eq!(endpoint.role, Role::Master);
        assert_eq!(endpoint.host(), "10.0.1.2");
        assert_eq!(endpoint.port(), 6380);

        assert!(topology.lookup_server_by_id("10.9.9.9:6379").is_none());
    }

    #[test]
    fn test_shard_without_master_is_topology_error() {
        let mut status = status();
        status.monitored_shards[0]
            .servers
            .retain(|_, s| s.role != MonitoredRole::Master);

        let err = ClusterTopology::from_sentinel_status(&status).unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
        assert!(err.to_string().contains("shard01"));
    }

    #[test]
    fn test_empty_status_is_topology_error() {
        let err = ClusterTopology::from_sentinel_status(&SentinelStatus::default()).unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
    }
}
