use std::sync::Arc;

use orama_config::HostConfig;
use orama_registry::RegistryStore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    deprovision::Deprovisioner, leadership::LeadershipMonitor, prober::ReadinessProber,
    provisioner::Provisioner,
};

/// Runs the leader-only task set (readiness prober, provisioning resume,
/// deprovisioning resume), starting it when this node gains leadership and
/// stopping the prober when it loses it. In-flight provisioning tasks are
/// deliberately not aborted on loss: their registry writes fail and the new
/// leader resumes from the checkpoints.
pub struct LeaderRuntime {
    store: Arc<dyn RegistryStore>,
    provisioner: Arc<Provisioner>,
    deprovisioner: Arc<Deprovisioner>,
    hosts: Vec<HostConfig>,
}

impl LeaderRuntime {
    #[must_use]
    pub fn new(
        store: Arc<dyn RegistryStore>,
        provisioner: Arc<Provisioner>,
        deprovisioner: Arc<Deprovisioner>,
        hosts: Vec<HostConfig>,
    ) -> Self {
        Self {
            store,
            provisioner,
            deprovisioner,
            hosts,
        }
    }

    pub async fn run(self, leadership: Arc<dyn LeadershipMonitor>) {
        let mut watch = leadership.watch();
        let mut prober_handle: Option<JoinHandle<()>> = None;

        loop {
            let is_leader = *watch.borrow_and_update();

            if is_leader {
                if prober_handle.is_none() {
                    info!("gained control-plane leadership");
                    prober_handle = Some(
                        ReadinessProber::new(Arc::clone(&self.store), self.hosts.clone()).spawn(),
                    );
                }
                // The sweep both resumes interrupted workflows and picks up
                // `requested` and `deprovisioning` rows written by followers.
                if let Err(err) = self.provisioner.resume_pending().await {
                    warn!(error = %err, "provisioning sweep failed");
                }
                if let Err(err) = self.deprovisioner.resume_pending().await {
                    warn!(error = %err, "deprovisioning sweep failed");
                }
            } else if let Some(handle) = prober_handle.take() {
                info!("lost control-plane leadership");
                handle.abort();
            }

            let changed = tokio::select! {
                changed = watch.changed() => Some(changed),
                () = tokio::time::sleep(orama_config::timeouts::probe_interval()) => None,
            };
            if let Some(changed) = changed
                && changed.is_err()
            {
                if let Some(handle) = prober_handle.take() {
                    handle.abort();
                }
                return;
            }
        }
    }
}
