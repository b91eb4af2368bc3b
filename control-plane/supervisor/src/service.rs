use std::path::{Path, PathBuf};

use orama_config::EngineBinaries;
use orama_registry::{NamespaceName, PortBlock, Role, ServiceKind, ServicePort};
use serde::{Deserialize, Serialize};

/// Identity of one supervised instance on this host. Spawn and stop are
/// idempotent per key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub namespace: NamespaceName,
    pub service: ServiceKind,
}

impl InstanceKey {
    #[must_use]
    pub fn new(namespace: NamespaceName, service: ServiceKind) -> Self {
        Self { namespace, service }
    }
}

/// Address of a peer placement, enough to derive any of its service ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host_addr: String,
    pub base_port: u16,
}

impl PeerEndpoint {
    #[must_use]
    pub fn service_addr(&self, port: ServicePort) -> String {
        format!("{}:{}", self.host_addr, PortBlock::at(self.base_port).port(port))
    }
}

/// Listen ports handed to one engine instance, taken from the placement's
/// reserved block.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ListenPorts {
    pub http: u16,
    /// Consensus port for SQL, gossip port for cache; unused by the gateway.
    pub internal: Option<u16>,
}

/// Typed descriptor the supervisor renders to YAML for the engine process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub namespace: NamespaceName,
    pub service: ServiceKind,
    pub role: Role,
    pub listen: ListenPorts,
    pub data_dir: PathBuf,
    /// Join addresses: the leader's consensus address for SQL followers, all
    /// peers' gossip addresses for cache members, the local SQL and cache
    /// HTTP addresses for the tenant gateway.
    pub join_addrs: Vec<String>,
}

impl InstanceConfig {
    /// Derive the descriptor for `service` on this host from the placement
    /// block and the cluster's peer endpoints.
    #[must_use]
    pub fn derive(
        namespace: NamespaceName,
        service: ServiceKind,
        role: Role,
        block: PortBlock,
        peers: &[PeerEndpoint],
        data_root: &Path,
    ) -> Self {
        let (listen, join_addrs) = match service {
            ServiceKind::Sql => (
                ListenPorts {
                    http: block.port(ServicePort::SqlHttp),
                    internal: Some(block.port(ServicePort::SqlConsensus)),
                },
                // Followers join the leader; the leader gets no join list.
                match role {
                    Role::Leader => vec![],
                    Role::Follower => peers
                        .iter()
                        .map(|peer| peer.service_addr(ServicePort::SqlConsensus))
                        .collect(),
                },
            ),
            ServiceKind::Cache => (
                ListenPorts {
                    http: block.port(ServicePort::CacheHttp),
                    internal: Some(block.port(ServicePort::CacheGossip)),
                },
                peers
                    .iter()
                    .map(|peer| peer.service_addr(ServicePort::CacheGossip))
                    .collect(),
            ),
            ServiceKind::Gateway => (
                ListenPorts {
                    http: block.port(ServicePort::GatewayHttp),
                    internal: None,
                },
                vec![
                    format!("127.0.0.1:{}", block.port(ServicePort::SqlHttp)),
                    format!("127.0.0.1:{}", block.port(ServicePort::CacheHttp)),
                ],
            ),
        };

        Self {
            data_dir: data_root
                .join(namespace.as_str())
                .join(service.as_str())
                .join("data"),
            namespace,
            service,
            role,
            listen,
            join_addrs,
        }
    }

    /// Directory holding the rendered config file, next to the data dir.
    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.data_dir
            .parent()
            .map_or_else(|| self.data_dir.clone(), Path::to_path_buf)
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir().join("config.yaml")
    }

    /// URL the supervisor and prober poll to observe instance health.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!(
            "http://127.0.0.1:{}{}",
            self.listen.http,
            health_path(self.service)
        )
    }

    /// Admin endpoint asked to shut the engine down gracefully.
    #[must_use]
    pub fn shutdown_url(&self) -> String {
        format!("http://127.0.0.1:{}/admin/shutdown", self.listen.http)
    }
}

/// Health endpoint each engine kind serves on its HTTP port.
#[must_use]
pub const fn health_path(kind: ServiceKind) -> &'static str {
    match kind {
        ServiceKind::Sql => "/status",
        ServiceKind::Cache => "/health",
        ServiceKind::Gateway => "/health",
    }
}

/// Resolves the engine binary and argument list for each service kind.
pub struct EngineCatalog {
    binaries: EngineBinaries,
}

impl EngineCatalog {
    #[must_use]
    pub fn new(binaries: EngineBinaries) -> Self {
        Self { binaries }
    }

    /// Env override first (`ORAMA_SQL_BIN` and friends), then the configured
    /// path.
    #[must_use]
    pub fn binary(&self, kind: ServiceKind) -> PathBuf {
        let env_var = match kind {
            ServiceKind::Sql => "ORAMA_SQL_BIN",
            ServiceKind::Cache => "ORAMA_CACHE_BIN",
            ServiceKind::Gateway => "ORAMA_GATEWAY_BIN",
        };
        if let Some(path) = std::env::var_os(env_var) {
            return PathBuf::from(path);
        }
        match kind {
            ServiceKind::Sql => self.binaries.sql.clone(),
            ServiceKind::Cache => self.binaries.cache.clone(),
            ServiceKind::Gateway => self.binaries.gateway.clone(),
        }
    }

    /// Every engine takes its rendered config file as the single argument.
    #[must_use]
    pub fn args(&self, config_path: &Path) -> Vec<String> {
        vec![
            "--config".to_owned(),
            config_path.to_string_lossy().into_owned(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Vec<PeerEndpoint> {
        vec![
            PeerEndpoint {
                host_addr: "10.0.0.1".into(),
                base_port: 10000,
            },
            PeerEndpoint {
                host_addr: "10.0.0.2".into(),
                base_port: 10005,
            },
        ]
    }

    #[test]
    fn sql_follower_joins_peer_consensus_ports() {
        let config = InstanceConfig::derive(
            NamespaceName::parse("acme").unwrap(),
            ServiceKind::Sql,
            Role::Follower,
            PortBlock::at(10000),
            &peers(),
            Path::new("/var/lib/orama"),
        );
        assert_eq!(config.listen.http, 10000);
        assert_eq!(config.listen.internal, Some(10001));
        assert_eq!(config.join_addrs, vec!["10.0.0.1:10001", "10.0.0.2:10006"]);
        assert_eq!(
            config.data_dir,
            Path::new("/var/lib/orama/acme/sql/data")
        );
    }

    #[test]
    fn sql_leader_has_no_join_list() {
        let config = InstanceConfig::derive(
            NamespaceName::parse("acme").unwrap(),
            ServiceKind::Sql,
            Role::Leader,
            PortBlock::at(10000),
            &peers(),
            Path::new("/var/lib/orama"),
        );
        assert!(config.join_addrs.is_empty());
    }

    #[test]
    fn cache_members_gossip_with_every_peer() {
        let config = InstanceConfig::derive(
            NamespaceName::parse("acme").unwrap(),
            ServiceKind::Cache,
            Role::Follower,
            PortBlock::at(10005),
            &peers(),
            Path::new("/var/lib/orama"),
        );
        assert_eq!(config.listen.http, 10007);
        assert_eq!(config.join_addrs, vec!["10.0.0.1:10003", "10.0.0.2:10008"]);
    }

    #[test]
    fn gateway_points_at_co_resident_services() {
        let config = InstanceConfig::derive(
            NamespaceName::parse("acme").unwrap(),
            ServiceKind::Gateway,
            Role::Leader,
            PortBlock::at(10000),
            &peers(),
            Path::new("/var/lib/orama"),
        );
        assert_eq!(config.listen.http, 10004);
        assert_eq!(config.listen.internal, None);
        assert_eq!(config.join_addrs, vec!["127.0.0.1:10000", "127.0.0.1:10002"]);
        assert_eq!(config.health_url(), "http://127.0.0.1:10004/health");
    }
}
