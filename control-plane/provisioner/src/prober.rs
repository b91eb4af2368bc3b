use std::{collections::HashMap, sync::Arc};

use orama_config::{HostConfig, HostId, timeouts};
use orama_registry::{
    ClusterId, ClusterState, RegistryError, RegistryStore, ServiceKind, ServicePort,
};
use orama_supervisor::health_path;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, warn};

/// One probe target per `(cluster, host, service)`.
type ProbeKey = (ClusterId, HostId, ServiceKind);

/// Leader-side health prober. Every tick it probes the health endpoint of
/// each placement's SQL, cache and gateway instance and writes bit flips to
/// the registry: one success flips a bit true, `PROBE_FAIL_THRESHOLD`
/// consecutive failures flip it back false. DNS readiness is written by the
/// DNS collaborator, never by the prober.
pub struct ReadinessProber {
    store: Arc<dyn RegistryStore>,
    hosts: Vec<HostConfig>,
    http: reqwest::Client,
}

impl ReadinessProber {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, hosts: Vec<HostConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeouts::probe_interval())
            .build()
            .unwrap_or_default();
        Self { store, hosts, http }
    }

    /// Run the probe loop until the handle is aborted (on leadership loss).
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut failures: HashMap<ProbeKey, u32> = HashMap::new();
            loop {
                if let Err(err) = self.probe_round(&mut failures).await {
                    // Leadership loss ends the loop; the new leader probes.
                    if matches!(err, RegistryError::LeadershipLost) {
                        debug!("prober stopping: leadership lost");
                        return;
                    }
                    warn!(error = %err, "probe round failed");
                }
                sleep(timeouts::probe_interval()).await;
            }
        })
    }

    async fn probe_round(
        &self,
        failures: &mut HashMap<ProbeKey, u32>,
    ) -> Result<(), RegistryError> {
        let mut clusters = self
            .store
            .clusters_in_state(ClusterState::Provisioning)
            .await?;
        clusters.extend(self.store.clusters_in_state(ClusterState::Ready).await?);

        for cluster in clusters {
            let placements = self.store.placements(&cluster.id).await?;
            for placement in placements {
                let Some(host) = self.hosts.iter().find(|h| h.id == placement.host_id) else {
                    warn!(host = %placement.host_id, "placement on unknown host");
                    continue;
                };
                for service in ServiceKind::ALL {
                    let port = placement.block().port(ServicePort::health_port(service));
                    let url = format!("http://{}:{port}{}", host.addr, health_path(service));
                    let healthy = self.probe(&url).await;
                    self.apply_observation(failures, &cluster.id, &placement.host_id, service, placement.service_ready(service), healthy)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn probe(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn apply_observation(
        &self,
        failures: &mut HashMap<ProbeKey, u32>,
        cluster_id: &ClusterId,
        host_id: &HostId,
        service: ServiceKind,
        current: bool,
        healthy: bool,
    ) -> Result<(), RegistryError> {
        let key = (cluster_id.clone(), host_id.clone(), service);
        if healthy {
            failures.remove(&key);
            if !current {
                debug!(cluster = %cluster_id, host = %host_id, service = %service, "service ready");
                self.store
                    .set_service_ready(cluster_id, host_id, service, true)
                    .await?;
            }
            return Ok(());
        }

        let count = failures.entry(key).or_insert(0);
        *count += 1;
        if *count >= timeouts::PROBE_FAIL_THRESHOLD && current {
            warn!(
                cluster = %cluster_id,
                host = %host_id,
                service = %service,
                consecutive_failures = *count,
                "service unhealthy, clearing readiness bit"
            );
            self.store
                .set_service_ready(cluster_id, host_id, service, false)
                .await?;
        }
        Ok(())
    }
}
