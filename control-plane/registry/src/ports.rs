use std::sync::Arc;

use orama_config::{HostConfig, HostId, PortRange};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    model::{ClusterId, PortBlock, PortReservation},
    store::{RegistryError, RegistryStore},
};

#[derive(Debug, Error)]
pub enum PortAllocError {
    #[error("host '{host_id}' has no free port block left")]
    Exhausted { host_id: HostId },
    #[error("host '{host_id}' port range cannot hold a single block of {block_size}")]
    InvalidRange { host_id: HostId, block_size: u16 },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// First free base for a block of `k` ports: lowest base in `range` whose
/// block overlaps no reservation. `reserved` must belong to one host.
#[must_use]
pub fn first_fit(range: PortRange, reserved: &[PortBlock], k: u16) -> Option<u16> {
    if k == 0 || range.capacity(k) == 0 {
        return None;
    }
    let mut blocks: Vec<PortBlock> = reserved.to_vec();
    blocks.sort_by_key(|block| block.base);

    let mut candidate = range.lo;
    for block in &blocks {
        if !range.contains_block(candidate, k) {
            return None;
        }
        let wanted = PortBlock { base: candidate, size: k };
        if !wanted.overlaps(block) {
            return Some(candidate);
        }
        // Skip past the colliding reservation.
        candidate = block.base.checked_add(block.size)?;
    }
    range.contains_block(candidate, k).then_some(candidate)
}

/// Reserves and releases port blocks for placements. Reservations are durable
/// (committed to the registry before `reserve` returns) and serialized per
/// host by the registry's unique index: every writer runs the same
/// deterministic first-fit, so concurrent reservations collide on the same
/// base and the loser rescans.
pub struct PortAllocator {
    store: Arc<dyn RegistryStore>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self { store }
    }

    pub async fn reserve(
        &self,
        host: &HostConfig,
        cluster_id: &ClusterId,
    ) -> Result<PortBlock, PortAllocError> {
        let k = PortBlock::SIZE;
        if host.port_range.capacity(k) == 0 {
            return Err(PortAllocError::InvalidRange {
                host_id: host.id.clone(),
                block_size: k,
            });
        }

        // Bounded by host capacity: each retry means another writer won a
        // base, and there are only `capacity` bases to lose.
        let max_attempts = host.port_range.capacity(k).max(1);
        for attempt in 0..max_attempts {
            let reserved = self.list_reserved(&host.id).await?;
            let Some(base) = first_fit(host.port_range, &reserved, k) else {
                return Err(PortAllocError::Exhausted {
                    host_id: host.id.clone(),
                });
            };

            match self
                .store
                .insert_reservation(PortReservation {
                    host_id: host.id.clone(),
                    base_port: base,
                    block_size: k,
                    cluster_id: cluster_id.clone(),
                })
                .await
            {
                Ok(()) => {
                    info!(host = %host.id, base, size = k, cluster = %cluster_id, "port block reserved");
                    return Ok(PortBlock::at(base));
                }
                Err(RegistryError::DuplicateReservation { .. }) => {
                    debug!(host = %host.id, base, attempt, "reservation raced, rescanning");
                }
                Err(other) => return Err(other.into()),
            }
        }

        Err(PortAllocError::Exhausted {
            host_id: host.id.clone(),
        })
    }

    /// Idempotent: releasing an absent block succeeds.
    pub async fn release(&self, host_id: &HostId, block: PortBlock) -> Result<(), PortAllocError> {
        self.store.release_reservation(host_id, block.base).await?;
        debug!(host = %host_id, base = block.base, "port block released");
        Ok(())
    }

    pub async fn list_reserved(&self, host_id: &HostId) -> Result<Vec<PortBlock>, PortAllocError> {
        let reservations = self.store.reservations_for_host(host_id).await?;
        Ok(reservations.iter().map(PortReservation::block).collect())
    }

    /// `(live blocks, total capacity)` for host-selection ordering.
    pub async fn utilization(&self, host: &HostConfig) -> Result<(u32, u32), PortAllocError> {
        let used = self.list_reserved(&host.id).await?.len() as u32;
        Ok((used, host.port_range.capacity(PortBlock::SIZE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn host(id: &str, lo: u16, hi: u16) -> HostConfig {
        HostConfig {
            id: HostId::new(id),
            addr: "127.0.0.1".into(),
            internal_port: 8090,
            port_range: PortRange { lo, hi },
        }
    }

    #[test]
    fn first_fit_prefers_lowest_base() {
        let range = PortRange { lo: 10000, hi: 10099 };
        assert_eq!(first_fit(range, &[], 5), Some(10000));

        let reserved = [PortBlock::at(10000), PortBlock::at(10010)];
        assert_eq!(first_fit(range, &reserved, 5), Some(10005));
    }

    #[test]
    fn first_fit_respects_upper_bound() {
        let range = PortRange { lo: 10000, hi: 10008 };
        // Only one 5-port block fits in 9 ports.
        assert_eq!(first_fit(range, &[], 5), Some(10000));
        assert_eq!(first_fit(range, &[PortBlock::at(10000)], 5), None);
    }

    #[test]
    fn first_fit_rejects_degenerate_input() {
        let range = PortRange { lo: 10000, hi: 10001 };
        assert_eq!(first_fit(range, &[], 5), None);
        assert_eq!(first_fit(range, &[], 0), None);
    }

    #[tokio::test]
    async fn reserve_fills_range_then_exhausts() {
        let store = Arc::new(MemoryStore::new());
        let allocator = PortAllocator::new(store);
        let host = host("host-a", 10000, 10099);
        let cluster = ClusterId::generate();

        let capacity = host.port_range.capacity(PortBlock::SIZE);
        assert_eq!(capacity, 20);

        for n in 0..capacity {
            let block = allocator.reserve(&host, &cluster).await.unwrap();
            assert_eq!(block.base, 10000 + (n as u16) * PortBlock::SIZE);
        }

        let err = allocator.reserve(&host, &cluster).await.unwrap_err();
        assert!(matches!(err, PortAllocError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn released_block_is_reused_first() {
        let store = Arc::new(MemoryStore::new());
        let allocator = PortAllocator::new(store);
        let host = host("host-a", 10000, 10099);
        let cluster = ClusterId::generate();

        let first = allocator.reserve(&host, &cluster).await.unwrap();
        let _second = allocator.reserve(&host, &cluster).await.unwrap();

        allocator.release(&host.id, first).await.unwrap();
        let third = allocator.reserve(&host, &cluster).await.unwrap();
        assert_eq!(third.base, first.base);
    }

    #[tokio::test]
    async fn invalid_range_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let allocator = PortAllocator::new(store);
        let host = host("host-a", 10000, 10002);
        let err = allocator
            .reserve(&host, &ClusterId::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, PortAllocError::InvalidRange { .. }));
    }
}
