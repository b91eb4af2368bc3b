pub mod constants;
pub mod timeouts;

use std::{
    collections::HashSet,
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Stable identifier of a physical host in the static cluster topology.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusive range of ports a host dedicates to namespace placements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    /// Number of ports in the range.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.hi as u32 - self.lo as u32 + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.hi < self.lo
    }

    /// Exact number of port blocks of `block_size` the range can hold.
    #[must_use]
    pub const fn capacity(&self, block_size: u16) -> u32 {
        if block_size == 0 {
            return 0;
        }
        self.len() / block_size as u32
    }

    #[must_use]
    pub const fn contains_block(&self, base: u16, size: u16) -> bool {
        base >= self.lo && base as u32 + size as u32 - 1 <= self.hi as u32
    }
}

/// Static description of one peer host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
    pub id: HostId,
    /// Address peers and tenants reach this host on.
    pub addr: String,
    /// Port of the host's internal coordination endpoint.
    pub internal_port: u16,
    pub port_range: PortRange,
}

impl HostConfig {
    /// Base URL of the host's internal spawn endpoint.
    #[must_use]
    pub fn internal_url(&self) -> String {
        format!("http://{}:{}", self.addr, self.internal_port)
    }
}

/// Subscription tier attached to a namespace at creation time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl PlanTier {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
        }
    }
}

/// Per-tier overrides of the cluster replication factor.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PlanOverrides {
    #[serde(default)]
    pub free: Option<usize>,
    #[serde(default)]
    pub pro: Option<usize>,
    #[serde(default)]
    pub enterprise: Option<usize>,
}

impl PlanOverrides {
    #[must_use]
    pub const fn replication_factor(&self, tier: PlanTier, default: usize) -> usize {
        let value = match tier {
            PlanTier::Free => self.free,
            PlanTier::Pro => self.pro,
            PlanTier::Enterprise => self.enterprise,
        };
        match value {
            Some(factor) => factor,
            None => default,
        }
    }
}

/// Which backend the namespace registry persists to.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RegistryBackend {
    /// Volatile store for single-node development and tests.
    Memory,
    /// The platform's own replicated SQL store, reached over HTTP.
    /// `advertise` is the consensus address the co-located store instance
    /// announces; it anchors control-plane leadership to the store's own
    /// leader election.
    Sql {
        endpoints: Vec<String>,
        #[serde(default)]
        advertise: Option<String>,
    },
}

/// Paths of the external engine binaries the supervisor spawns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineBinaries {
    pub sql: PathBuf,
    pub cache: PathBuf,
    pub gateway: PathBuf,
}

/// Top-level node configuration, loaded once from YAML at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's entry in `hosts`.
    pub node_id: HostId,
    /// Public HTTP front-end bind address.
    pub bind: SocketAddr,
    /// Host-to-host coordination bind address.
    pub internal_bind: SocketAddr,
    /// Domain suffix tenant and deployment hosts hang off.
    pub base_domain: String,
    /// Root of all per-namespace data directories.
    pub data_root: PathBuf,
    /// Pre-shared secret guarding the internal spawn endpoint.
    pub cluster_secret: String,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    #[serde(default)]
    pub plans: PlanOverrides,
    pub registry: RegistryBackend,
    pub hosts: Vec<HostConfig>,
    pub engines: EngineBinaries,
}

const fn default_replication_factor() -> usize {
    3
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("node id '{node_id}' does not appear in the hosts list")]
    UnknownNodeId { node_id: HostId },
    #[error("duplicate host id '{host_id}' in hosts list")]
    DuplicateHost { host_id: HostId },
    #[error("host '{host_id}' has an inverted port range {lo}..{hi}")]
    InvertedPortRange { host_id: HostId, lo: u16, hi: u16 },
    #[error("replication factor must be at least 1")]
    ZeroReplication,
    #[error("cluster secret must not be empty")]
    EmptySecret,
    #[error("base domain must not be empty")]
    EmptyBaseDomain,
}

impl NodeConfig {
    /// Load and validate a node configuration from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;

        info!(
            node_id = %config.node_id,
            hosts = config.hosts.len(),
            replication_factor = config.replication_factor,
            "node configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replication_factor == 0 {
            return Err(ConfigError::ZeroReplication);
        }
        if self.cluster_secret.is_empty() {
            return Err(ConfigError::EmptySecret);
        }
        if self.base_domain.is_empty() {
            return Err(ConfigError::EmptyBaseDomain);
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if !seen.insert(host.id.clone()) {
                return Err(ConfigError::DuplicateHost {
                    host_id: host.id.clone(),
                });
            }
            if host.port_range.is_empty() {
                return Err(ConfigError::InvertedPortRange {
                    host_id: host.id.clone(),
                    lo: host.port_range.lo,
                    hi: host.port_range.hi,
                });
            }
        }

        if !self.hosts.iter().any(|host| host.id == self.node_id) {
            return Err(ConfigError::UnknownNodeId {
                node_id: self.node_id.clone(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn host(&self, id: &HostId) -> Option<&HostConfig> {
        self.hosts.iter().find(|host| &host.id == id)
    }

    #[must_use]
    pub fn local_host(&self) -> &HostConfig {
        self.host(&self.node_id)
            .unwrap_or_else(|| unreachable!("validated config always contains the local host"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> NodeConfig {
        NodeConfig {
            node_id: HostId::new("host-a"),
            bind: "0.0.0.0:8080".parse().unwrap(),
            internal_bind: "0.0.0.0:8090".parse().unwrap(),
            base_domain: "orama.test".into(),
            data_root: "/tmp/orama".into(),
            cluster_secret: "namespace-coordination".into(),
            replication_factor: 3,
            plans: PlanOverrides::default(),
            registry: RegistryBackend::Memory,
            hosts: vec![HostConfig {
                id: HostId::new("host-a"),
                addr: "127.0.0.1".into(),
                internal_port: 8090,
                port_range: PortRange { lo: 10000, hi: 10099 },
            }],
            engines: EngineBinaries {
                sql: "/usr/local/bin/orama-sqld".into(),
                cache: "/usr/local/bin/orama-cached".into(),
                gateway: "/usr/local/bin/orama-gwd".into(),
            },
        }
    }

    #[test]
    fn valid_config_passes() {
        base_config().validate().expect("config should validate");
    }

    #[test]
    fn rejects_unknown_node_id() {
        let mut config = base_config();
        config.node_id = HostId::new("host-z");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownNodeId { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let mut config = base_config();
        config.hosts.push(config.hosts[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateHost { .. })
        ));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let mut config = base_config();
        config.hosts[0].port_range = PortRange { lo: 200, hi: 100 };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedPortRange { .. })
        ));
    }

    #[test]
    fn port_range_capacity_is_floor_division() {
        let range = PortRange { lo: 10000, hi: 10099 };
        assert_eq!(range.capacity(5), 20);
        assert_eq!(range.capacity(7), 14);
        assert_eq!(range.capacity(0), 0);
    }

    #[test]
    fn plan_overrides_fall_back_to_default() {
        let overrides = PlanOverrides {
            pro: Some(5),
            ..PlanOverrides::default()
        };
        assert_eq!(overrides.replication_factor(PlanTier::Pro, 3), 5);
        assert_eq!(overrides.replication_factor(PlanTier::Free, 3), 3);
    }

    #[test]
    fn loads_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        let yaml = serde_yaml::to_string(&base_config()).unwrap();
        std::fs::write(&path, yaml).unwrap();

        let loaded = NodeConfig::load_from_file(&path).expect("load should succeed");
        assert_eq!(loaded.node_id, HostId::new("host-a"));
        assert_eq!(loaded.hosts.len(), 1);
    }
}
