use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use orama_config::{HostId, PlanTier, constants::DEFAULT_NAMESPACE};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seconds since the unix epoch; the registry's timestamp representation.
#[must_use]
pub fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_id(prefix: &str, bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    format!("{prefix}{}", hex::encode(buf))
}

#[derive(Debug, Error)]
#[error("invalid namespace name '{name}': {reason}")]
pub struct InvalidNamespaceName {
    pub name: String,
    pub reason: &'static str,
}

/// Validated tenant namespace name: `[a-z0-9][a-z0-9_-]{0,63}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceName(String);

impl NamespaceName {
    /// The permanent namespace outside provisioner management.
    #[must_use]
    pub fn default_namespace() -> Self {
        Self(DEFAULT_NAMESPACE.to_owned())
    }

    pub fn parse(name: impl Into<String>) -> Result<Self, InvalidNamespaceName> {
        let name = name.into();
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return Err(InvalidNamespaceName {
                name,
                reason: "empty",
            });
        };
        if name.len() > 64 {
            return Err(InvalidNamespaceName {
                name,
                reason: "longer than 64 characters",
            });
        }
        if !(first.is_ascii_lowercase() || first.is_ascii_digit()) {
            return Err(InvalidNamespaceName {
                name,
                reason: "must start with a lowercase letter or digit",
            });
        }
        if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
            return Err(InvalidNamespaceName {
                name,
                reason: "only lowercase letters, digits, '_' and '-' are allowed",
            });
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_NAMESPACE
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NamespaceName {
    type Error = InvalidNamespaceName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<NamespaceName> for String {
    fn from(value: NamespaceName) -> Self {
        value.0
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal, $bytes:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(random_id($prefix, $bytes))
            }

            #[must_use]
            pub fn from_string(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

opaque_id!(
    /// Opaque namespace row id.
    NamespaceId,
    "ns_",
    12
);
opaque_id!(
    /// Opaque cluster id handed back to provisioning clients.
    ClusterId,
    "cl_",
    16
);
opaque_id!(
    /// Opaque deployment row id.
    DeploymentId,
    "dp_",
    12
);

/// Durable record of a tenant namespace.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub id: NamespaceId,
    pub name: NamespaceName,
    pub wallet: String,
    pub plan: PlanTier,
    pub created_at: u64,
    pub deleted_at: Option<u64>,
}

/// Lifecycle state of a namespace cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    Requested,
    Provisioning,
    Ready,
    Failed,
    Deprovisioning,
    Gone,
}

impl ClusterState {
    /// Terminal states fall outside the one-live-cluster-per-namespace rule.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Gone)
    }

    /// Lifecycle transition graph. Re-applying the current state is always
    /// legal so resumed workflows can write idempotently.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        if self as u8 == to as u8 {
            return true;
        }
        matches!(
            (self, to),
            (Self::Requested, Self::Provisioning)
                | (Self::Requested, Self::Failed)
                | (Self::Provisioning, Self::Ready)
                | (Self::Provisioning, Self::Failed)
                | (Self::Ready, Self::Deprovisioning)
                | (Self::Failed, Self::Deprovisioning)
                | (Self::Deprovisioning, Self::Gone)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deprovisioning => "deprovisioning",
            Self::Gone => "gone",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "requested" => Some(Self::Requested),
            "provisioning" => Some(Self::Provisioning),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            "deprovisioning" => Some(Self::Deprovisioning),
            "gone" => Some(Self::Gone),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a namespace's backing cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    pub namespace_id: NamespaceId,
    pub state: ClusterState,
    /// Human-readable failure reason, set when `state == Failed`.
    pub reason: Option<String>,
    /// Serialized provisioner checkpoint; opaque to the registry.
    pub checkpoint: Option<String>,
    /// True once the DNS collaborator has published the namespace records.
    pub dns_ready: bool,
    pub created_at: u64,
    pub ready_at: Option<u64>,
}

impl ClusterRecord {
    #[must_use]
    pub fn new(namespace_id: NamespaceId) -> Self {
        Self {
            id: ClusterId::generate(),
            namespace_id,
            state: ClusterState::Requested,
            reason: None,
            checkpoint: None,
            dns_ready: false,
            created_at: unix_ts(),
            ready_at: None,
        }
    }
}

/// Role of a placement inside its cluster; exactly one leader per cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    Follower,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Follower => "follower",
        }
    }
}

/// The backing services co-resident on every placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Sql,
    Cache,
    Gateway,
}

impl ServiceKind {
    pub const ALL: [Self; 3] = [Self::Sql, Self::Cache, Self::Gateway];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sql => "sql",
            Self::Cache => "cache",
            Self::Gateway => "gateway",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed port offsets inside a placement's reserved block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServicePort {
    SqlHttp,
    SqlConsensus,
    CacheHttp,
    CacheGossip,
    GatewayHttp,
}

impl ServicePort {
    pub const ALL: [Self; 5] = [
        Self::SqlHttp,
        Self::SqlConsensus,
        Self::CacheHttp,
        Self::CacheGossip,
        Self::GatewayHttp,
    ];

    #[must_use]
    pub const fn offset(self) -> u16 {
        match self {
            Self::SqlHttp => 0,
            Self::SqlConsensus => 1,
            Self::CacheHttp => 2,
            Self::CacheGossip => 3,
            Self::GatewayHttp => 4,
        }
    }

    /// HTTP port a service's health endpoint answers on.
    #[must_use]
    pub const fn health_port(kind: ServiceKind) -> Self {
        match kind {
            ServiceKind::Sql => Self::SqlHttp,
            ServiceKind::Cache => Self::CacheHttp,
            ServiceKind::Gateway => Self::GatewayHttp,
        }
    }
}

/// Contiguous ports reserved for one placement, one per co-resident service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBlock {
    pub base: u16,
    pub size: u16,
}

impl PortBlock {
    /// Ports per placement; one for each entry in [`ServicePort::ALL`].
    pub const SIZE: u16 = ServicePort::ALL.len() as u16;

    #[must_use]
    pub const fn at(base: u16) -> Self {
        Self {
            base,
            size: Self::SIZE,
        }
    }

    #[must_use]
    pub const fn port(&self, service: ServicePort) -> u16 {
        self.base + service.offset()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        let self_end = self.base as u32 + self.size as u32;
        let other_end = other.base as u32 + other.size as u32;
        (self.base as u32) < other_end && (other.base as u32) < self_end
    }
}

/// One cluster's footprint on one host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Placement {
    pub cluster_id: ClusterId,
    pub host_id: HostId,
    pub role: Role,
    pub base_port: u16,
    pub sql_ready: bool,
    pub cache_ready: bool,
    pub gateway_ready: bool,
    /// Set when deprovisioning could not stop the placement in time.
    pub orphaned: bool,
}

impl Placement {
    #[must_use]
    pub fn new(cluster_id: ClusterId, host_id: HostId, role: Role, base_port: u16) -> Self {
        Self {
            cluster_id,
            host_id,
            role,
            base_port,
            sql_ready: false,
            cache_ready: false,
            gateway_ready: false,
            orphaned: false,
        }
    }

    #[must_use]
    pub const fn block(&self) -> PortBlock {
        PortBlock::at(self.base_port)
    }

    #[must_use]
    pub const fn service_ready(&self, kind: ServiceKind) -> bool {
        match kind {
            ServiceKind::Sql => self.sql_ready,
            ServiceKind::Cache => self.cache_ready,
            ServiceKind::Gateway => self.gateway_ready,
        }
    }
}

/// Durable port reservation row; unique per `(host_id, base_port)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortReservation {
    pub host_id: HostId,
    pub base_port: u16,
    pub block_size: u16,
    pub cluster_id: ClusterId,
}

impl PortReservation {
    #[must_use]
    pub const fn block(&self) -> PortBlock {
        PortBlock {
            base: self.base_port,
            size: self.block_size,
        }
    }
}

/// Execution model of a deployed tenant application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentKind {
    Static,
    ServerRendered,
}

impl DeploymentKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::ServerRendered => "server-rendered",
        }
    }
}

/// A tenant application bundle served by its namespace gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub namespace_id: NamespaceId,
    pub name: String,
    /// Globally unique `{name}-{6-char-random}` host label.
    pub subdomain: String,
    /// Content-addressed blob id of the uploaded bundle.
    pub content_id: String,
    pub kind: DeploymentKind,
}

/// Random lowercase-alphanumeric suffix for deployment subdomains.
#[must_use]
pub fn subdomain_for(name: &str) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..6)
        .map(|_| {
            let idx = (rng.next_u32() as usize) % ALPHABET.len();
            ALPHABET[idx] as char
        })
        .collect();
    format!("{name}-{suffix}")
}

/// The four booleans gating a cluster's `ready` state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessVector {
    pub sql: bool,
    pub cache: bool,
    pub gateway: bool,
    pub dns: bool,
}

impl ReadinessVector {
    #[must_use]
    pub const fn all_ready(&self) -> bool {
        self.sql && self.cache && self.gateway && self.dns
    }

    /// Fold placement bits into the cluster-wide vector: a service is ready
    /// only when every placement reports it ready.
    #[must_use]
    pub fn from_placements(placements: &[Placement], dns_ready: bool) -> Self {
        let all = |kind: ServiceKind| {
            !placements.is_empty() && placements.iter().all(|p| p.service_ready(kind))
        };
        Self {
            sql: all(ServiceKind::Sql),
            cache: all(ServiceKind::Cache),
            gateway: all(ServiceKind::Gateway),
            dns: dns_ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_name_validation() {
        assert!(NamespaceName::parse("acme").is_ok());
        assert!(NamespaceName::parse("a1-b_2").is_ok());
        assert!(NamespaceName::parse("9lives").is_ok());
        assert!(NamespaceName::parse("").is_err());
        assert!(NamespaceName::parse("-acme").is_err());
        assert!(NamespaceName::parse("Acme").is_err());
        assert!(NamespaceName::parse("acme!").is_err());
        assert!(NamespaceName::parse("a".repeat(65)).is_err());
    }

    #[test]
    fn default_namespace_is_recognised() {
        assert!(NamespaceName::parse("default").unwrap().is_default());
        assert!(!NamespaceName::parse("acme").unwrap().is_default());
    }

    #[test]
    fn port_block_offsets_cover_all_services() {
        let block = PortBlock::at(10000);
        assert_eq!(block.port(ServicePort::SqlHttp), 10000);
        assert_eq!(block.port(ServicePort::SqlConsensus), 10001);
        assert_eq!(block.port(ServicePort::CacheHttp), 10002);
        assert_eq!(block.port(ServicePort::CacheGossip), 10003);
        assert_eq!(block.port(ServicePort::GatewayHttp), 10004);
        assert_eq!(PortBlock::SIZE, 5);
    }

    #[test]
    fn port_block_overlap() {
        let a = PortBlock::at(10000);
        assert!(a.overlaps(&PortBlock::at(10004)));
        assert!(!a.overlaps(&PortBlock::at(10005)));
        assert!(PortBlock::at(10003).overlaps(&a));
    }

    #[test]
    fn readiness_vector_requires_every_placement() {
        let cluster = ClusterId::generate();
        let mut placements = vec![
            Placement::new(cluster.clone(), HostId::new("a"), Role::Leader, 10000),
            Placement::new(cluster, HostId::new("b"), Role::Follower, 10000),
        ];
        placements[0].sql_ready = true;

        let vector = ReadinessVector::from_placements(&placements, true);
        assert!(!vector.sql);

        placements[1].sql_ready = true;
        let vector = ReadinessVector::from_placements(&placements, true);
        assert!(vector.sql);
        assert!(!vector.all_ready());
    }

    #[test]
    fn subdomain_shape() {
        let subdomain = subdomain_for("webapp");
        assert!(subdomain.starts_with("webapp-"));
        assert_eq!(subdomain.len(), "webapp-".len() + 6);
    }
}
