use orama_config::HostId;
use orama_registry::{NamespaceName, Role, ServiceKind};
use serde::{Deserialize, Serialize};

use crate::service::PeerEndpoint;

/// Payload shared by every spawn action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpawnSpec {
    pub namespace: NamespaceName,
    /// Host the command is addressed to; a receiver can reject mismatches.
    pub node_id: HostId,
    pub role: Role,
    pub base_port: u16,
    /// Endpoints of every placement in the cluster, this one included.
    pub peers: Vec<PeerEndpoint>,
}

/// Payload shared by every stop action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopSpec {
    pub namespace: NamespaceName,
    pub node_id: HostId,
}

/// Typed command set of the internal spawn endpoint. Retries are idempotent
/// by `(namespace, host, service)`: repeated spawns return the existing PID,
/// stops on a missing handle succeed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SpawnCommand {
    SpawnSql(SpawnSpec),
    SpawnCache(SpawnSpec),
    SpawnGateway(SpawnSpec),
    StopSql(StopSpec),
    StopCache(StopSpec),
    StopGateway(StopSpec),
}

impl SpawnCommand {
    #[must_use]
    pub fn spawn(service: ServiceKind, spec: SpawnSpec) -> Self {
        match service {
            ServiceKind::Sql => Self::SpawnSql(spec),
            ServiceKind::Cache => Self::SpawnCache(spec),
            ServiceKind::Gateway => Self::SpawnGateway(spec),
        }
    }

    #[must_use]
    pub fn stop(service: ServiceKind, spec: StopSpec) -> Self {
        match service {
            ServiceKind::Sql => Self::StopSql(spec),
            ServiceKind::Cache => Self::StopCache(spec),
            ServiceKind::Gateway => Self::StopGateway(spec),
        }
    }

    #[must_use]
    pub const fn service(&self) -> ServiceKind {
        match self {
            Self::SpawnSql(_) | Self::StopSql(_) => ServiceKind::Sql,
            Self::SpawnCache(_) | Self::StopCache(_) => ServiceKind::Cache,
            Self::SpawnGateway(_) | Self::StopGateway(_) => ServiceKind::Gateway,
        }
    }

    #[must_use]
    pub const fn namespace(&self) -> &NamespaceName {
        match self {
            Self::SpawnSql(spec) | Self::SpawnCache(spec) | Self::SpawnGateway(spec) => {
                &spec.namespace
            }
            Self::StopSql(spec) | Self::StopCache(spec) | Self::StopGateway(spec) => {
                &spec.namespace
            }
        }
    }

    #[must_use]
    pub const fn spawn_spec(&self) -> Option<&SpawnSpec> {
        match self {
            Self::SpawnSql(spec) | Self::SpawnCache(spec) | Self::SpawnGateway(spec) => Some(spec),
            _ => None,
        }
    }
}

/// Wire response of the internal spawn endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SpawnResponse {
    #[must_use]
    pub const fn ok(pid: Option<u32>) -> Self {
        Self {
            success: true,
            pid,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            pid: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_format_uses_kebab_actions() {
        let command = SpawnCommand::spawn(
            ServiceKind::Sql,
            SpawnSpec {
                namespace: NamespaceName::parse("acme").unwrap(),
                node_id: HostId::new("host-a"),
                role: Role::Leader,
                base_port: 10000,
                peers: vec![],
            },
        );
        let value = serde_json::to_value(&command).unwrap();
        assert_eq!(value["action"], "spawn-sql");
        assert_eq!(value["namespace"], "acme");
        assert_eq!(value["base_port"], 10000);

        let parsed: SpawnCommand = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.service(), ServiceKind::Sql);
    }

    #[test]
    fn stop_commands_round_trip() {
        let command = SpawnCommand::stop(
            ServiceKind::Gateway,
            StopSpec {
                namespace: NamespaceName::parse("acme").unwrap(),
                node_id: HostId::new("host-b"),
            },
        );
        let raw = serde_json::to_string(&command).unwrap();
        assert!(raw.contains("stop-gateway"));
        let parsed: SpawnCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.service(), ServiceKind::Gateway);
        assert!(parsed.spawn_spec().is_none());
    }
}
