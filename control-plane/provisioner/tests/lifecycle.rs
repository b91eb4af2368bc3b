use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use orama_config::{HostConfig, HostId, PlanOverrides, PlanTier, PortRange};
use orama_provisioner::{
    DeprovisionError, Deprovisioner, LocalDnsPublisher, Provisioner, StaticLeadership,
};
use orama_registry::{
    ClusterState, MemoryStore, NamespaceName, PortBlock, ReadinessVector, RegistryStore,
    ServiceKind,
};
use orama_supervisor::{SpawnCommand, SpawnResponse, SpawnTransport, SpawnTransportError};
use tokio::sync::Mutex;

type InstanceId = (NamespaceName, HostId, ServiceKind);

/// In-process stand-in for the spawn fabric: pretends every engine becomes
/// healthy immediately by writing the readiness bits the prober would write.
struct FakeFabric {
    store: Arc<dyn RegistryStore>,
    pids: Mutex<HashMap<InstanceId, u32>>,
    next_pid: AtomicU32,
    reject_spawns: Mutex<HashSet<ServiceKind>>,
    spawn_counts: Mutex<HashMap<ServiceKind, u32>>,
}

impl FakeFabric {
    fn new(store: Arc<dyn RegistryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pids: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(100),
            reject_spawns: Mutex::new(HashSet::new()),
            spawn_counts: Mutex::new(HashMap::new()),
        })
    }

    async fn reject(&self, service: ServiceKind) {
        self.reject_spawns.lock().await.insert(service);
    }

    async fn spawn_count(&self, service: ServiceKind) -> u32 {
        *self.spawn_counts.lock().await.get(&service).unwrap_or(&0)
    }

    async fn running_instances(&self) -> usize {
        self.pids.lock().await.len()
    }

    async fn mark_service_ready(&self, namespace: &NamespaceName, host: &HostId, service: ServiceKind) {
        let Ok(Some(ns)) = self.store.namespace_by_name(namespace).await else {
            return;
        };
        let Ok(Some(cluster)) = self.store.live_cluster_for_namespace(&ns.id).await else {
            return;
        };
        let _ = self
            .store
            .set_service_ready(&cluster.id, host, service, true)
            .await;
    }
}

#[async_trait]
impl SpawnTransport for FakeFabric {
    async fn send(
        &self,
        host: &HostConfig,
        command: SpawnCommand,
    ) -> Result<SpawnResponse, SpawnTransportError> {
        let service = command.service();
        let namespace = command.namespace().clone();
        let key = (namespace.clone(), host.id.clone(), service);

        if command.spawn_spec().is_some() {
            if self.reject_spawns.lock().await.contains(&service) {
                return Err(SpawnTransportError::Rejected {
                    host_id: host.id.clone(),
                    error: format!("{service} engine exited during startup"),
                });
            }
            *self.spawn_counts.lock().await.entry(service).or_insert(0) += 1;

            let mut pids = self.pids.lock().await;
            let pid = *pids
                .entry(key)
                .or_insert_with(|| self.next_pid.fetch_add(1, Ordering::SeqCst));
            drop(pids);

            self.mark_service_ready(&namespace, &host.id, service).await;
            Ok(SpawnResponse::ok(Some(pid)))
        } else {
            self.pids.lock().await.remove(&key);
            Ok(SpawnResponse::ok(None))
        }
    }
}

fn hosts(n: usize) -> Vec<HostConfig> {
    (0..n)
        .map(|i| HostConfig {
            id: HostId::new(format!("host-{}", (b'a' + i as u8) as char)),
            addr: format!("10.0.0.{}", i + 1),
            internal_port: 8090,
            port_range: PortRange { lo: 10000, hi: 10099 },
        })
        .collect()
}

struct Harness {
    store: Arc<dyn RegistryStore>,
    fabric: Arc<FakeFabric>,
    provisioner: Arc<Provisioner>,
    deprovisioner: Deprovisioner,
}

fn harness(hosts: Vec<HostConfig>, replication: usize) -> Harness {
    let store: Arc<dyn RegistryStore> = Arc::new(MemoryStore::new());
    let fabric = FakeFabric::new(Arc::clone(&store));
    let dns = Arc::new(LocalDnsPublisher::new(Arc::clone(&store), "orama.test".into()));
    let leadership = Arc::new(StaticLeadership::new(true));
    let provisioner = Provisioner::new(
        Arc::clone(&store),
        fabric.clone(),
        dns.clone(),
        leadership.clone(),
        hosts.clone(),
        replication,
        PlanOverrides::default(),
    );
    let deprovisioner = Deprovisioner::new(
        Arc::clone(&store),
        fabric.clone(),
        dns,
        leadership,
        hosts,
    );
    Harness {
        store,
        fabric,
        provisioner,
        deprovisioner,
    }
}

fn name(raw: &str) -> NamespaceName {
    NamespaceName::parse(raw).unwrap()
}

async fn readiness(store: &Arc<dyn RegistryStore>, cluster_id: &orama_registry::ClusterId) -> ReadinessVector {
    let cluster = store.cluster(cluster_id).await.unwrap().unwrap();
    let placements = store.placements(cluster_id).await.unwrap();
    ReadinessVector::from_placements(&placements, cluster.dns_ready)
}

#[tokio::test]
async fn happy_path_reaches_ready_with_one_placement_per_host() {
    let h = harness(hosts(3), 3);

    let record = h
        .provisioner
        .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    assert_eq!(record.state, ClusterState::Requested);

    h.provisioner.join_task(&record.id).await;

    let cluster = h.store.cluster(&record.id).await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Ready, "reason: {:?}", cluster.reason);
    assert!(cluster.ready_at.is_some());

    let placements = h.store.placements(&record.id).await.unwrap();
    assert_eq!(placements.len(), 3);
    let host_ids: HashSet<_> = placements.iter().map(|p| p.host_id.clone()).collect();
    assert_eq!(host_ids.len(), 3, "placements must land on distinct hosts");
    assert!(placements.iter().all(|p| p.base_port == 10000));
    assert_eq!(
        placements
            .iter()
            .filter(|p| p.role == orama_registry::Role::Leader)
            .count(),
        1
    );

    assert!(readiness(&h.store, &record.id).await.all_ready());

    // A second request for a ready namespace short-circuits to the same id.
    let again = h
        .provisioner
        .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(again.state, ClusterState::Ready);
}

#[tokio::test]
async fn concurrent_requests_share_one_cluster() {
    let h = harness(hosts(3), 3);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let provisioner = Arc::clone(&h.provisioner);
        handles.push(tokio::spawn(async move {
            provisioner
                .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
                .await
                .unwrap()
                .id
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 1, "all callers must observe the same cluster id");

    let id = ids.into_iter().next().unwrap();
    h.provisioner.join_task(&id).await;
    let cluster = h.store.cluster(&id).await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Ready);
}

#[tokio::test]
async fn capacity_exhaustion_fails_with_reason() {
    // One host, room for exactly two blocks.
    let mut host_list = hosts(1);
    host_list[0].port_range = PortRange { lo: 10000, hi: 10009 };
    let h = harness(host_list, 1);

    for ns in ["one", "two"] {
        let record = h
            .provisioner
            .request_cluster(&name(ns), "0xwallet", PlanTier::Free)
            .await
            .unwrap();
        h.provisioner.join_task(&record.id).await;
        let cluster = h.store.cluster(&record.id).await.unwrap().unwrap();
        assert_eq!(cluster.state, ClusterState::Ready);
    }

    let record = h
        .provisioner
        .request_cluster(&name("three"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    h.provisioner.join_task(&record.id).await;

    let cluster = h.store.cluster(&record.id).await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Failed);
    assert_eq!(cluster.reason.as_deref(), Some("insufficient_capacity"));

    // Exhaustion must not leak reservations.
    let reserved = h
        .store
        .reservations_for_host(&HostId::new("host-a"))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 2);
}

#[tokio::test]
async fn spawn_failure_compensates_and_marks_failed() {
    let h = harness(hosts(3), 3);
    h.fabric.reject(ServiceKind::Cache).await;

    let record = h
        .provisioner
        .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    h.provisioner.join_task(&record.id).await;

    let cluster = h.store.cluster(&record.id).await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Failed);
    assert!(cluster.reason.is_some());

    // Compensation stopped the SQL instances and released every port.
    assert_eq!(h.fabric.running_instances().await, 0);
    for host in hosts(3) {
        assert!(
            h.store
                .reservations_for_host(&host.id)
                .await
                .unwrap()
                .is_empty()
        );
    }
    assert!(h.store.placements(&record.id).await.unwrap().is_empty());

    // No implicit retry for a failed namespace.
    let again = h
        .provisioner
        .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    assert_eq!(again.id, record.id);
    assert_eq!(again.state, ClusterState::Failed);
}

#[tokio::test]
async fn provision_deprovision_provision_cycles_cleanly() {
    let h = harness(hosts(3), 3);

    let first = h
        .provisioner
        .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    h.provisioner.join_task(&first.id).await;

    h.deprovisioner.deprovision(&first.id).await.unwrap();

    let gone = h.store.cluster(&first.id).await.unwrap().unwrap();
    assert_eq!(gone.state, ClusterState::Gone);
    assert!(h.store.placements(&first.id).await.unwrap().is_empty());
    for host in hosts(3) {
        assert!(
            h.store
                .reservations_for_host(&host.id)
                .await
                .unwrap()
                .is_empty()
        );
    }
    assert_eq!(h.fabric.running_instances().await, 0);

    let second = h
        .provisioner
        .request_cluster(&name("acme"), "0xwallet", PlanTier::Free)
        .await
        .unwrap();
    assert_ne!(second.id, first.id, "re-provisioning yields a fresh cluster id");
    h.provisioner.join_task(&second.id).await;
    let cluster = h.store.cluster(&second.id).await.unwrap().unwrap();
    assert_eq!(cluster.state, ClusterState::Ready);
}

#[tokio::test]
async fn deprovision_is_rejected_mid_provisioning() {
    let h = harness(hosts(3), 3);

    let ns = orama_registry::NamespaceRecord {
        id: orama_registry::NamespaceId::generate(),
        name: name("acme"),
        wallet: "0xwallet".into(),
        plan: PlanTier::Free,
        created_at: orama_registry::model::unix_ts(),
        deleted_at: None,
    };
    h.store.create_namespace(ns.clone()).await.unwrap();
    let cluster = orama_registry::ClusterRecord::new(ns.id.clone());
    h.store.insert_cluster(cluster.clone()).await.unwrap();
    h.store
        .update_cluster_state(&cluster.id, ClusterState::Provisioning)
        .await
        .unwrap();

    let err = h.deprovisioner.deprovision(&cluster.id).await.unwrap_err();
    assert!(matches!(err, DeprovisionError::InvalidState { .. }));
}

#[tokio::test]
async fn new_leader_resumes_from_checkpoint_without_respawning_sql() {
    let h = harness(hosts(3), 3);

    // State a deposed leader left behind: ports reserved, placements
    // recorded, SQL spawned and ready, checkpoint at spawn_cache.
    let ns = orama_registry::NamespaceRecord {
        id: orama_registry::NamespaceId::generate(),
        name: name("zeta"),
        wallet: "0xwallet".into(),
        plan: PlanTier::Free,
        created_at: orama_registry::model::unix_ts(),
        deleted_at: None,
    };
    h.store.create_namespace(ns.clone()).await.unwrap();
    let cluster = orama_registry::ClusterRecord::new(ns.id.clone());
    h.store.insert_cluster(cluster.clone()).await.unwrap();
    h.store
        .update_cluster_state(&cluster.id, ClusterState::Provisioning)
        .await
        .unwrap();

    let host_list = hosts(3);
    let mut placements = Vec::new();
    for (i, host) in host_list.iter().enumerate() {
        h.store
            .insert_reservation(orama_registry::PortReservation {
                host_id: host.id.clone(),
                base_port: 10000,
                block_size: PortBlock::SIZE,
                cluster_id: cluster.id.clone(),
            })
            .await
            .unwrap();
        placements.push(orama_registry::Placement::new(
            cluster.id.clone(),
            host.id.clone(),
            if i == 0 {
                orama_registry::Role::Leader
            } else {
                orama_registry::Role::Follower
            },
            10000,
        ));
    }
    h.store.insert_placements(placements).await.unwrap();
    for host in &host_list {
        h.store
            .set_service_ready(&cluster.id, &host.id, ServiceKind::Sql, true)
            .await
            .unwrap();
    }
    h.store
        .save_checkpoint(&cluster.id, "\"spawn_cache\"")
        .await
        .unwrap();

    h.provisioner.resume_pending().await.unwrap();
    h.provisioner.join_task(&cluster.id).await;

    let resumed = h.store.cluster(&cluster.id).await.unwrap().unwrap();
    assert_eq!(resumed.state, ClusterState::Ready, "reason: {:?}", resumed.reason);

    // The resumed run starts at spawn_cache: no SQL spawn is re-issued, so
    // the original SQL processes keep their PIDs.
    assert_eq!(h.fabric.spawn_count(ServiceKind::Sql).await, 0);
    assert_eq!(h.fabric.spawn_count(ServiceKind::Cache).await, 3);
    assert_eq!(h.fabric.spawn_count(ServiceKind::Gateway).await, 3);
}
