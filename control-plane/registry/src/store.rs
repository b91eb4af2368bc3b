use async_trait::async_trait;
use orama_config::HostId;
use thiserror::Error;
use tokio::sync::watch;

use crate::model::{
    ClusterId, ClusterRecord, ClusterState, DeploymentRecord, NamespaceId, NamespaceName,
    NamespaceRecord, Placement, PortReservation, ServiceKind,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another live cluster already exists for the namespace. Carries the
    /// winning row so callers can return its id instead of failing.
    #[error("namespace '{namespace_id}' already has a live cluster {}", existing.id)]
    ClusterConflict {
        namespace_id: NamespaceId,
        existing: Box<ClusterRecord>,
    },
    #[error("port {base_port} on host '{host_id}' is already reserved")]
    DuplicateReservation { host_id: HostId, base_port: u16 },
    #[error("deployment subdomain '{subdomain}' is already taken")]
    DuplicateSubdomain { subdomain: String },
    #[error("namespace '{name}' already exists")]
    NamespaceExists { name: NamespaceName },
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("illegal state transition for cluster '{cluster_id}': {from} -> {to}")]
    IllegalTransition {
        cluster_id: ClusterId,
        from: ClusterState,
        to: ClusterState,
    },
    /// A write was rejected because this node is no longer the store leader.
    #[error("registry write rejected: leadership lost")]
    LeadershipLost,
    #[error("registry transport failed: {source}")]
    Transport {
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode registry response: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },
    #[error("registry backend error: {message}")]
    Backend { message: String },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// The single source of truth for namespace, cluster, placement, port and
/// deployment state. Reads are strongly consistent; writes are transactional.
#[async_trait]
pub trait RegistryStore: Send + Sync {
    // --- namespaces ---

    async fn create_namespace(&self, record: NamespaceRecord) -> RegistryResult<()>;
    async fn namespace_by_name(&self, name: &NamespaceName)
    -> RegistryResult<Option<NamespaceRecord>>;
    async fn namespace_by_id(&self, id: &NamespaceId) -> RegistryResult<Option<NamespaceRecord>>;
    async fn soft_delete_namespace(&self, id: &NamespaceId) -> RegistryResult<()>;

    // --- clusters ---

    /// Insert a cluster row, enforcing at most one non-terminal cluster per
    /// namespace. On contention the error carries the winning row.
    async fn insert_cluster(&self, record: ClusterRecord) -> RegistryResult<()>;
    async fn cluster(&self, id: &ClusterId) -> RegistryResult<Option<ClusterRecord>>;
    /// The namespace's live (non-terminal) cluster, if any.
    async fn live_cluster_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Option<ClusterRecord>>;
    /// The namespace's most recent cluster in any state, terminal included.
    async fn latest_cluster_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Option<ClusterRecord>>;
    async fn update_cluster_state(
        &self,
        id: &ClusterId,
        state: ClusterState,
    ) -> RegistryResult<()>;
    /// Persist the provisioner's resume point. Written before each step's
    /// external side effects begin.
    async fn save_checkpoint(&self, id: &ClusterId, checkpoint: &str) -> RegistryResult<()>;
    async fn set_failure_reason(&self, id: &ClusterId, reason: &str) -> RegistryResult<()>;
    async fn set_dns_ready(&self, id: &ClusterId, ready: bool) -> RegistryResult<()>;
    /// Transition to `ready` and stamp `ready_at`.
    async fn mark_ready(&self, id: &ClusterId) -> RegistryResult<()>;
    async fn clusters_in_state(&self, state: ClusterState) -> RegistryResult<Vec<ClusterRecord>>;

    // --- placements ---

    async fn insert_placements(&self, placements: Vec<Placement>) -> RegistryResult<()>;
    async fn placements(&self, cluster_id: &ClusterId) -> RegistryResult<Vec<Placement>>;
    async fn set_service_ready(
        &self,
        cluster_id: &ClusterId,
        host_id: &HostId,
        service: ServiceKind,
        ready: bool,
    ) -> RegistryResult<()>;
    async fn mark_placement_orphan(
        &self,
        cluster_id: &ClusterId,
        host_id: &HostId,
    ) -> RegistryResult<()>;
    async fn delete_placements(&self, cluster_id: &ClusterId) -> RegistryResult<()>;

    // --- port reservations ---

    /// Insert a reservation; fails on a conflicting base or overlapping block.
    async fn insert_reservation(&self, reservation: PortReservation) -> RegistryResult<()>;
    /// Release one reservation. Releasing an absent row is a no-op.
    async fn release_reservation(&self, host_id: &HostId, base_port: u16) -> RegistryResult<()>;
    async fn reservations_for_host(&self, host_id: &HostId)
    -> RegistryResult<Vec<PortReservation>>;
    async fn release_reservations_for_cluster(&self, cluster_id: &ClusterId)
    -> RegistryResult<()>;

    // --- deployments ---

    async fn insert_deployment(&self, record: DeploymentRecord) -> RegistryResult<()>;
    async fn deployment_by_subdomain(
        &self,
        subdomain: &str,
    ) -> RegistryResult<Option<DeploymentRecord>>;
    async fn deployments_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Vec<DeploymentRecord>>;
    /// Every deployment on the platform; feeds the router's subdomain map.
    async fn all_deployments(&self) -> RegistryResult<Vec<DeploymentRecord>>;
    async fn delete_deployments_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<()>;

    // --- change feed ---

    /// Monotonic counter bumped on every mutation; the router tails it to
    /// refresh its in-memory route maps.
    fn changes(&self) -> watch::Receiver<u64>;
}
