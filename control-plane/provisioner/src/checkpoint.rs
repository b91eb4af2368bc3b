use orama_registry::{ClusterId, RegistryResult, RegistryStore};
use serde::{Deserialize, Serialize};

/// Resume points of the provisioning workflow. A checkpoint is committed to
/// the cluster row before the step's external side effects begin, so a new
/// leader re-runs at most one step, and every step is idempotent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    #[default]
    ReservePorts,
    SpawnSql,
    AwaitSqlReady,
    SpawnCache,
    AwaitCacheReady,
    SpawnGateway,
    AwaitGatewayReady,
    AwaitDns,
    Done,
}

impl ProvisionStep {
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::ReservePorts => Self::SpawnSql,
            Self::SpawnSql => Self::AwaitSqlReady,
            Self::AwaitSqlReady => Self::SpawnCache,
            Self::SpawnCache => Self::AwaitCacheReady,
            Self::AwaitCacheReady => Self::SpawnGateway,
            Self::SpawnGateway => Self::AwaitGatewayReady,
            Self::AwaitGatewayReady => Self::AwaitDns,
            Self::AwaitDns | Self::Done => Self::Done,
        }
    }

    /// Decode a persisted checkpoint; absent or corrupt checkpoints restart
    /// the workflow from the beginning, which is safe because every step is
    /// idempotent.
    #[must_use]
    pub fn decode(raw: Option<&str>) -> Self {
        raw.and_then(|value| serde_json::from_str(value).ok())
            .unwrap_or_default()
    }

    pub async fn commit(
        self,
        store: &dyn RegistryStore,
        cluster_id: &ClusterId,
    ) -> RegistryResult<()> {
        let encoded = serde_json::to_string(&self).unwrap_or_default();
        store.save_checkpoint(cluster_id, &encoded).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_fixed() {
        let mut step = ProvisionStep::ReservePorts;
        let mut seen = vec![step];
        while step != ProvisionStep::Done {
            step = step.next();
            seen.push(step);
        }
        assert_eq!(seen.len(), 9);
        assert_eq!(seen[3], ProvisionStep::SpawnCache);
    }

    #[test]
    fn decode_tolerates_garbage() {
        assert_eq!(ProvisionStep::decode(None), ProvisionStep::ReservePorts);
        assert_eq!(
            ProvisionStep::decode(Some("not json")),
            ProvisionStep::ReservePorts
        );
        assert_eq!(
            ProvisionStep::decode(Some("\"await_dns\"")),
            ProvisionStep::AwaitDns
        );
    }
}
