use std::sync::Arc;

use futures::future::join_all;
use orama_config::{HostConfig, HostId, timeouts};
use orama_registry::{
    ClusterId, ClusterState, NamespaceName, Placement, RegistryError, RegistryStore, ServiceKind,
};
use orama_supervisor::{SpawnCommand, SpawnTransport, StopSpec};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::{dns::DnsPublisher, leadership::LeadershipMonitor};

const STOP_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DeprovisionError {
    #[error("cluster '{cluster_id}' cannot be deprovisioned from state {state}")]
    InvalidState {
        cluster_id: ClusterId,
        state: ClusterState,
    },
    #[error("cluster '{cluster_id}' not found")]
    NotFound { cluster_id: ClusterId },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Reverses provisioning: stop gateway, then cache, then SQL on every
/// placement, release ports, delete rows, soft-delete the namespace. A
/// placement that cannot be stopped within the deadline is marked orphan and
/// left for an operator; its data directory is never removed without a
/// clean stop.
pub struct Deprovisioner {
    store: Arc<dyn RegistryStore>,
    transport: Arc<dyn SpawnTransport>,
    dns: Arc<dyn DnsPublisher>,
    leadership: Arc<dyn LeadershipMonitor>,
    hosts: Vec<HostConfig>,
}

impl Deprovisioner {
    #[must_use]
    pub fn new(
        store: Arc<dyn RegistryStore>,
        transport: Arc<dyn SpawnTransport>,
        dns: Arc<dyn DnsPublisher>,
        leadership: Arc<dyn LeadershipMonitor>,
        hosts: Vec<HostConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            dns,
            leadership,
            hosts,
        }
    }

    pub async fn deprovision(&self, cluster_id: &ClusterId) -> Result<(), DeprovisionError> {
        let cluster = self
            .store
            .cluster(cluster_id)
            .await?
            .ok_or_else(|| DeprovisionError::NotFound {
                cluster_id: cluster_id.clone(),
            })?;

        // Teardown cannot interleave with provisioning.
        match self
            .store
            .update_cluster_state(cluster_id, ClusterState::Deprovisioning)
            .await
        {
            Ok(()) => {}
            Err(RegistryError::IllegalTransition { from, .. }) => {
                return Err(DeprovisionError::InvalidState {
                    cluster_id: cluster_id.clone(),
                    state: from,
                });
            }
            Err(err) => return Err(err.into()),
        }

        // A follower only records the transition; the leader's sweep runs
        // the teardown.
        if !self.leadership.is_leader() {
            info!(cluster = %cluster_id, "deprovision recorded, leader will tear down");
            return Ok(());
        }

        let namespace = self.store.namespace_by_id(&cluster.namespace_id).await?;
        let namespace_name = namespace.as_ref().map(|ns| ns.name.clone());
        info!(cluster = %cluster_id, namespace = ?namespace_name.as_ref().map(NamespaceName::as_str), "deprovisioning cluster");

        if !self.teardown(cluster_id, namespace_name.as_ref()).await? {
            // Orphaned placements keep their ports and rows; the cluster
            // stays in `deprovisioning` until an operator intervenes and a
            // later sweep finishes the job.
            warn!(cluster = %cluster_id, "teardown incomplete, cluster left deprovisioning");
            return Ok(());
        }

        if let Some(record) = namespace {
            self.store
                .delete_deployments_for_namespace(&record.id)
                .await?;
            self.store.soft_delete_namespace(&record.id).await?;
        }

        self.store.update_cluster_state(cluster_id, ClusterState::Gone).await?;
        info!(cluster = %cluster_id, "cluster gone");
        Ok(())
    }

    /// Resume teardowns a previous leader left mid-flight.
    pub async fn resume_pending(&self) -> Result<(), RegistryError> {
        for cluster in self
            .store
            .clusters_in_state(ClusterState::Deprovisioning)
            .await?
        {
            info!(cluster = %cluster.id, "resuming deprovisioning");
            let namespace = self.store.namespace_by_id(&cluster.namespace_id).await?;
            let namespace_name = namespace.as_ref().map(|ns| ns.name.clone());
            match self.teardown(&cluster.id, namespace_name.as_ref()).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(cluster = %cluster.id, error = %err, "resumed teardown failed");
                    continue;
                }
            }
            if let Some(record) = namespace {
                self.store
                    .delete_deployments_for_namespace(&record.id)
                    .await?;
                self.store.soft_delete_namespace(&record.id).await?;
            }
            self.store
                .update_cluster_state(&cluster.id, ClusterState::Gone)
                .await?;
        }
        Ok(())
    }

    /// Stop every service on every placement and release the cluster's
    /// resources. Returns false when any placement had to be orphaned; its
    /// ports stay reserved because the stuck engine may still bind them.
    async fn teardown(
        &self,
        cluster_id: &ClusterId,
        namespace: Option<&NamespaceName>,
    ) -> Result<bool, DeprovisionError> {
        let placements = self.store.placements(cluster_id).await?;
        let mut clean = true;

        if let Some(namespace) = namespace {
            // Ordered across steps, parallel within each step.
            for service in [ServiceKind::Gateway, ServiceKind::Cache, ServiceKind::Sql] {
                let stops = placements
                    .iter()
                    .map(|placement| self.stop_placement_service(namespace, placement, service));
                let results = join_all(stops).await;
                for (placement, stopped) in placements.iter().zip(results) {
                    if !stopped {
                        warn!(
                            cluster = %cluster_id,
                            host = %placement.host_id,
                            service = %service,
                            "placement unstoppable, marking orphan"
                        );
                        self.store
                            .mark_placement_orphan(cluster_id, &placement.host_id)
                            .await?;
                        clean = false;
                    }
                }
            }

            if let Err(err) = self.dns.retract(namespace).await {
                warn!(namespace = %namespace, error = %err, "dns retraction failed");
            }
        }

        if clean {
            self.store.release_reservations_for_cluster(cluster_id).await?;
            self.store.delete_placements(cluster_id).await?;
        }
        Ok(clean)
    }

    /// Retry the idempotent stop until it succeeds or the deprovision
    /// deadline passes. Returns false when the placement must be orphaned.
    async fn stop_placement_service(
        &self,
        namespace: &NamespaceName,
        placement: &Placement,
        service: ServiceKind,
    ) -> bool {
        let Some(host) = self.host_config(&placement.host_id) else {
            warn!(host = %placement.host_id, "placement on unknown host, orphaning");
            return false;
        };
        let deadline = Instant::now() + timeouts::deprovision_deadline();

        loop {
            let command = SpawnCommand::stop(
                service,
                StopSpec {
                    namespace: namespace.clone(),
                    node_id: placement.host_id.clone(),
                },
            );
            match self.transport.send(&host, command).await {
                Ok(_) => return true,
                Err(err) => {
                    if Instant::now() + STOP_RETRY_INTERVAL >= deadline {
                        warn!(host = %host.id, service = %service, error = %err, "stop deadline exceeded");
                        return false;
                    }
                    sleep(STOP_RETRY_INTERVAL).await;
                }
            }
        }
    }

    fn host_config(&self, host_id: &HostId) -> Option<HostConfig> {
        self.hosts.iter().find(|host| &host.id == host_id).cloned()
    }
}
