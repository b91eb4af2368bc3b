use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use orama_config::{HostConfig, HostId, timeouts};
use orama_registry::{
    ClusterId, ClusterState, DeploymentRecord, NamespaceName, ReadinessVector, RegistryStore,
    ServicePort,
};
use rand::Rng as _;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One routable tenant-gateway endpoint with its load gauge.
#[derive(Clone)]
pub struct PlacementTarget {
    pub host_id: HostId,
    pub addr: String,
    pub port: u16,
    outstanding: Arc<AtomicUsize>,
}

impl PlacementTarget {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.addr, self.port)
    }
}

/// Decrements the outstanding-request gauge when the proxied call finishes.
pub struct RequestGuard {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Routing view of one namespace cluster.
#[derive(Clone)]
pub struct ClusterRoutes {
    pub cluster_id: ClusterId,
    /// True only when all four readiness bits are set; the router never
    /// forwards data-plane traffic earlier.
    pub ready: bool,
    pub targets: Vec<PlacementTarget>,
}

#[derive(Clone, Default)]
struct RouteTables {
    clusters: HashMap<NamespaceName, ClusterRoutes>,
    deployments: HashMap<String, DeploymentRecord>,
}

/// In-memory route maps every host keeps warm by tailing the registry change
/// feed. Stale reads self-heal within one refresh interval.
pub struct RouterState {
    store: Arc<dyn RegistryStore>,
    hosts: Vec<HostConfig>,
    tables: RwLock<RouteTables>,
}

impl RouterState {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, hosts: Vec<HostConfig>) -> Arc<Self> {
        Arc::new(Self {
            store,
            hosts,
            tables: RwLock::new(RouteTables::default()),
        })
    }

    /// Tail the registry change feed and refresh the maps on every bump,
    /// with the refresh interval as a floor between rebuilds.
    pub fn spawn_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut changes = state.store.changes();
            loop {
                if let Err(err) = state.refresh().await {
                    warn!(error = %err, "route refresh failed");
                }
                tokio::time::sleep(timeouts::route_refresh_interval()).await;
                // Wait for the next mutation; a closed feed ends the task.
                if changes.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    /// Rebuild the route tables from the registry. Outstanding-request
    /// gauges survive rebuilds so balancing state is not lost.
    pub async fn refresh(&self) -> Result<(), orama_registry::RegistryError> {
        let mut clusters = HashMap::new();

        for cluster in self.store.clusters_in_state(ClusterState::Ready).await? {
            let Some(namespace) = self.store.namespace_by_id(&cluster.namespace_id).await? else {
                continue;
            };
            let placements = self.store.placements(&cluster.id).await?;
            let ready =
                ReadinessVector::from_placements(&placements, cluster.dns_ready).all_ready();

            let previous = self.tables.read().await.clusters.get(&namespace.name).cloned();
            let targets = placements
                .iter()
                .filter_map(|placement| {
                    let host = self.hosts.iter().find(|h| h.id == placement.host_id)?;
                    let outstanding = previous
                        .as_ref()
                        .and_then(|routes| {
                            routes
                                .targets
                                .iter()
                                .find(|t| t.host_id == placement.host_id)
                                .map(|t| Arc::clone(&t.outstanding))
                        })
                        .unwrap_or_default();
                    Some(PlacementTarget {
                        host_id: placement.host_id.clone(),
                        addr: host.addr.clone(),
                        port: placement.block().port(ServicePort::GatewayHttp),
                        outstanding,
                    })
                })
                .collect();

            clusters.insert(
                namespace.name,
                ClusterRoutes {
                    cluster_id: cluster.id,
                    ready,
                    targets,
                },
            );
        }

        let deployments = self
            .store
            .all_deployments()
            .await?
            .into_iter()
            .map(|record| (record.subdomain.clone(), record))
            .collect();

        let mut tables = self.tables.write().await;
        tables.clusters = clusters;
        tables.deployments = deployments;
        debug!(
            clusters = tables.clusters.len(),
            deployments = tables.deployments.len(),
            "route tables refreshed"
        );
        Ok(())
    }

    #[must_use]
    pub async fn cluster_routes(&self, namespace: &NamespaceName) -> Option<ClusterRoutes> {
        self.tables.read().await.clusters.get(namespace).cloned()
    }

    #[must_use]
    pub async fn deployment(&self, subdomain: &str) -> Option<DeploymentRecord> {
        self.tables.read().await.deployments.get(subdomain).cloned()
    }

    /// Pick the placement with the fewest outstanding requests, ties broken
    /// randomly, and account for the new request until the guard drops.
    #[must_use]
    pub fn pick_target(routes: &ClusterRoutes) -> Option<(PlacementTarget, RequestGuard)> {
        let minimum = routes
            .targets
            .iter()
            .map(|target| target.outstanding.load(Ordering::Relaxed))
            .min()?;
        let least_loaded: Vec<&PlacementTarget> = routes
            .targets
            .iter()
            .filter(|target| target.outstanding.load(Ordering::Relaxed) == minimum)
            .collect();
        let chosen = least_loaded[rand::thread_rng().gen_range(0..least_loaded.len())];

        chosen.outstanding.fetch_add(1, Ordering::Relaxed);
        Some((
            chosen.clone(),
            RequestGuard {
                outstanding: Arc::clone(&chosen.outstanding),
            },
        ))
    }
}
