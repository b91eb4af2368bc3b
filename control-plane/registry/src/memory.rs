use std::collections::HashMap;

use async_trait::async_trait;
use orama_config::HostId;
use tokio::sync::{Mutex, watch};
use tracing::debug;

use crate::{
    model::{
        ClusterId, ClusterRecord, ClusterState, DeploymentRecord, NamespaceId, NamespaceName,
        NamespaceRecord, Placement, PortReservation, ServiceKind, unix_ts,
    },
    store::{RegistryError, RegistryResult, RegistryStore},
};

#[derive(Default)]
struct Tables {
    namespaces: Vec<NamespaceRecord>,
    clusters: Vec<ClusterRecord>,
    placements: Vec<Placement>,
    reservations: Vec<PortReservation>,
    deployments: Vec<DeploymentRecord>,
}

/// Volatile registry used by single-node development and tests. Enforces the
/// same schema invariants as the SQL backend: unique live namespace names,
/// one non-terminal cluster per namespace, unique `(host, base_port)`.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    changes_tx: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (changes_tx, _) = watch::channel(0);
        Self {
            tables: Mutex::new(Tables::default()),
            changes_tx,
        }
    }

    fn bump(&self) {
        self.changes_tx.send_modify(|version| *version += 1);
    }
}

#[async_trait]
impl RegistryStore for MemoryStore {
    async fn create_namespace(&self, record: NamespaceRecord) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .namespaces
            .iter()
            .any(|ns| ns.name == record.name && ns.deleted_at.is_none())
        {
            return Err(RegistryError::NamespaceExists { name: record.name });
        }
        // A soft-deleted row with the same name is replaced, matching the
        // SQL backend's delete-then-insert transaction.
        tables
            .namespaces
            .retain(|ns| !(ns.name == record.name && ns.deleted_at.is_some()));
        debug!(namespace = %record.name, id = %record.id, "namespace created");
        tables.namespaces.push(record);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn namespace_by_name(
        &self,
        name: &NamespaceName,
    ) -> RegistryResult<Option<NamespaceRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .namespaces
            .iter()
            .find(|ns| &ns.name == name && ns.deleted_at.is_none())
            .cloned())
    }

    async fn namespace_by_id(&self, id: &NamespaceId) -> RegistryResult<Option<NamespaceRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.namespaces.iter().find(|ns| &ns.id == id).cloned())
    }

    async fn soft_delete_namespace(&self, id: &NamespaceId) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .namespaces
            .iter_mut()
            .find(|ns| &ns.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "namespace",
                id: id.to_string(),
            })?;
        record.deleted_at = Some(unix_ts());
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn insert_cluster(&self, record: ClusterRecord) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .clusters
            .iter()
            .find(|c| c.namespace_id == record.namespace_id && !c.state.is_terminal())
        {
            return Err(RegistryError::ClusterConflict {
                namespace_id: record.namespace_id,
                existing: Box::new(existing.clone()),
            });
        }
        debug!(cluster = %record.id, namespace = %record.namespace_id, "cluster row inserted");
        tables.clusters.push(record);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn cluster(&self, id: &ClusterId) -> RegistryResult<Option<ClusterRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.clusters.iter().find(|c| &c.id == id).cloned())
    }

    async fn live_cluster_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Option<ClusterRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clusters
            .iter()
            .find(|c| &c.namespace_id == namespace_id && !c.state.is_terminal())
            .cloned())
    }

    async fn latest_cluster_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Option<ClusterRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clusters
            .iter()
            .filter(|c| &c.namespace_id == namespace_id)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn update_cluster_state(
        &self,
        id: &ClusterId,
        state: ClusterState,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .clusters
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
        if !record.state.can_transition_to(state) {
            return Err(RegistryError::IllegalTransition {
                cluster_id: id.clone(),
                from: record.state,
                to: state,
            });
        }
        debug!(cluster = %id, from = %record.state, to = %state, "cluster state transition");
        record.state = state;
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn save_checkpoint(&self, id: &ClusterId, checkpoint: &str) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .clusters
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
        record.checkpoint = Some(checkpoint.to_owned());
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn set_failure_reason(&self, id: &ClusterId, reason: &str) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .clusters
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
        record.reason = Some(reason.to_owned());
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn set_dns_ready(&self, id: &ClusterId, ready: bool) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .clusters
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
        record.dns_ready = ready;
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn mark_ready(&self, id: &ClusterId) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .clusters
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "cluster",
                id: id.to_string(),
            })?;
        if !record.state.can_transition_to(ClusterState::Ready) {
            return Err(RegistryError::IllegalTransition {
                cluster_id: id.clone(),
                from: record.state,
                to: ClusterState::Ready,
            });
        }
        record.state = ClusterState::Ready;
        record.ready_at = Some(unix_ts());
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn clusters_in_state(&self, state: ClusterState) -> RegistryResult<Vec<ClusterRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .clusters
            .iter()
            .filter(|c| c.state == state)
            .cloned()
            .collect())
    }

    async fn insert_placements(&self, placements: Vec<Placement>) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        for placement in placements {
            // PK (cluster_id, host_id): re-inserting an existing placement is
            // an idempotent replace so resumed provisioning can rerun a step.
            tables.placements.retain(|p| {
                !(p.cluster_id == placement.cluster_id && p.host_id == placement.host_id)
            });
            tables.placements.push(placement);
        }
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn placements(&self, cluster_id: &ClusterId) -> RegistryResult<Vec<Placement>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .placements
            .iter()
            .filter(|p| &p.cluster_id == cluster_id)
            .cloned()
            .collect())
    }

    async fn set_service_ready(
        &self,
        cluster_id: &ClusterId,
        host_id: &HostId,
        service: ServiceKind,
        ready: bool,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let placement = tables
            .placements
            .iter_mut()
            .find(|p| &p.cluster_id == cluster_id && &p.host_id == host_id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "placement",
                id: format!("{cluster_id}/{host_id}"),
            })?;
        match service {
            ServiceKind::Sql => placement.sql_ready = ready,
            ServiceKind::Cache => placement.cache_ready = ready,
            ServiceKind::Gateway => placement.gateway_ready = ready,
        }
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn mark_placement_orphan(
        &self,
        cluster_id: &ClusterId,
        host_id: &HostId,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let placement = tables
            .placements
            .iter_mut()
            .find(|p| &p.cluster_id == cluster_id && &p.host_id == host_id)
            .ok_or_else(|| RegistryError::NotFound {
                entity: "placement",
                id: format!("{cluster_id}/{host_id}"),
            })?;
        placement.orphaned = true;
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn delete_placements(&self, cluster_id: &ClusterId) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        // Orphaned placements survive deletion so operators can intervene.
        tables
            .placements
            .retain(|p| &p.cluster_id != cluster_id || p.orphaned);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn insert_reservation(&self, reservation: PortReservation) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        let block = reservation.block();
        for existing in tables
            .reservations
            .iter()
            .filter(|r| r.host_id == reservation.host_id)
        {
            if existing.base_port == reservation.base_port || existing.block().overlaps(&block) {
                return Err(RegistryError::DuplicateReservation {
                    host_id: reservation.host_id,
                    base_port: reservation.base_port,
                });
            }
        }
        tables.reservations.push(reservation);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn release_reservation(&self, host_id: &HostId, base_port: u16) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        tables
            .reservations
            .retain(|r| !(r.host_id == *host_id && r.base_port == base_port));
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn reservations_for_host(
        &self,
        host_id: &HostId,
    ) -> RegistryResult<Vec<PortReservation>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .reservations
            .iter()
            .filter(|r| &r.host_id == host_id)
            .cloned()
            .collect())
    }

    async fn release_reservations_for_cluster(
        &self,
        cluster_id: &ClusterId,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        tables.reservations.retain(|r| &r.cluster_id != cluster_id);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn insert_deployment(&self, record: DeploymentRecord) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .deployments
            .iter()
            .any(|d| d.subdomain == record.subdomain)
        {
            return Err(RegistryError::DuplicateSubdomain {
                subdomain: record.subdomain,
            });
        }
        tables.deployments.push(record);
        drop(tables);
        self.bump();
        Ok(())
    }

    async fn deployment_by_subdomain(
        &self,
        subdomain: &str,
    ) -> RegistryResult<Option<DeploymentRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .deployments
            .iter()
            .find(|d| d.subdomain == subdomain)
            .cloned())
    }

    async fn deployments_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<Vec<DeploymentRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .deployments
            .iter()
            .filter(|d| &d.namespace_id == namespace_id)
            .cloned()
            .collect())
    }

    async fn all_deployments(&self) -> RegistryResult<Vec<DeploymentRecord>> {
        let tables = self.tables.lock().await;
        Ok(tables.deployments.clone())
    }

    async fn delete_deployments_for_namespace(
        &self,
        namespace_id: &NamespaceId,
    ) -> RegistryResult<()> {
        let mut tables = self.tables.lock().await;
        tables.deployments.retain(|d| &d.namespace_id != namespace_id);
        drop(tables);
        self.bump();
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes_tx.subscribe()
    }
}
