use orama_config::HostConfig;
use orama_registry::{PortAllocError, PortAllocator};
use tracing::debug;

/// Pick `replication_factor` hosts for a new cluster: hosts with room for at
/// least one more block, ordered by utilisation ascending then host id
/// ascending. Returns `None` when fewer hosts qualify.
pub async fn select_hosts(
    allocator: &PortAllocator,
    hosts: &[HostConfig],
    replication_factor: usize,
) -> Result<Option<Vec<HostConfig>>, PortAllocError> {
    let mut candidates = Vec::new();
    for host in hosts {
        let (used, capacity) = allocator.utilization(host).await?;
        if used < capacity {
            candidates.push((used, host.clone()));
        } else {
            debug!(host = %host.id, used, capacity, "host full, skipping");
        }
    }

    candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

    if candidates.len() < replication_factor {
        return Ok(None);
    }
    Ok(Some(
        candidates
            .into_iter()
            .take(replication_factor)
            .map(|(_, host)| host)
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orama_config::{HostId, PortRange};
    use orama_registry::{ClusterId, MemoryStore, PortBlock, PortReservation, RegistryStore as _};

    use super::*;

    fn host(id: &str, lo: u16, hi: u16) -> HostConfig {
        HostConfig {
            id: HostId::new(id),
            addr: "127.0.0.1".into(),
            internal_port: 8090,
            port_range: PortRange { lo, hi },
        }
    }

    #[tokio::test]
    async fn selection_orders_by_utilisation_then_id() {
        let store = Arc::new(MemoryStore::new());
        // host-b has one block in use, so host-a and host-c come first.
        store
            .insert_reservation(PortReservation {
                host_id: HostId::new("host-b"),
                base_port: 10000,
                block_size: PortBlock::SIZE,
                cluster_id: ClusterId::generate(),
            })
            .await
            .unwrap();
        let allocator = PortAllocator::new(store);

        let hosts = vec![
            host("host-c", 10000, 10099),
            host("host-a", 10000, 10099),
            host("host-b", 10000, 10099),
        ];
        let selected = select_hosts(&allocator, &hosts, 3).await.unwrap().unwrap();
        let ids: Vec<&str> = selected.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["host-a", "host-c", "host-b"]);
    }

    #[tokio::test]
    async fn full_hosts_are_excluded() {
        let store = Arc::new(MemoryStore::new());
        // host-a can hold exactly one block, and it is taken.
        store
            .insert_reservation(PortReservation {
                host_id: HostId::new("host-a"),
                base_port: 10000,
                block_size: PortBlock::SIZE,
                cluster_id: ClusterId::generate(),
            })
            .await
            .unwrap();
        let allocator = PortAllocator::new(store);

        let hosts = vec![host("host-a", 10000, 10004), host("host-b", 10000, 10099)];
        let selected = select_hosts(&allocator, &hosts, 2).await.unwrap();
        assert!(selected.is_none());

        let selected = select_hosts(&allocator, &hosts, 1).await.unwrap().unwrap();
        assert_eq!(selected[0].id.as_str(), "host-b");
    }
}
