use std::sync::Arc;

use async_trait::async_trait;
use orama_registry::{ClusterId, NamespaceName, Placement, RegistryError, RegistryStore};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns publication failed: {message}")]
    Publish { message: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// External collaborator that publishes `ns-{name}.{base_domain}` records for
/// a cluster's placements and writes `dns_ready` back to the registry when
/// propagation completes.
#[async_trait]
pub trait DnsPublisher: Send + Sync {
    async fn publish(
        &self,
        cluster_id: &ClusterId,
        namespace: &NamespaceName,
        placements: &[Placement],
    ) -> Result<(), DnsError>;

    /// Retract records on deprovision. Best effort.
    async fn retract(&self, namespace: &NamespaceName) -> Result<(), DnsError>;
}

/// Development publisher: nothing to push anywhere, the records resolve via
/// the local resolver setup, so the readiness bit flips immediately.
pub struct LocalDnsPublisher {
    store: Arc<dyn RegistryStore>,
    base_domain: String,
}

impl LocalDnsPublisher {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>, base_domain: String) -> Self {
        Self { store, base_domain }
    }
}

#[async_trait]
impl DnsPublisher for LocalDnsPublisher {
    async fn publish(
        &self,
        cluster_id: &ClusterId,
        namespace: &NamespaceName,
        placements: &[Placement],
    ) -> Result<(), DnsError> {
        info!(
            record = format!("ns-{namespace}.{}", self.base_domain),
            hosts = placements.len(),
            "local dns publication"
        );
        self.store.set_dns_ready(cluster_id, true).await?;
        Ok(())
    }

    async fn retract(&self, namespace: &NamespaceName) -> Result<(), DnsError> {
        info!(
            record = format!("ns-{namespace}.{}", self.base_domain),
            "local dns retraction"
        );
        Ok(())
    }
}
