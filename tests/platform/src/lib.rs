//! In-process platform harness for end-to-end control-plane scenarios: a
//! real public router served over loopback HTTP, backed by the in-memory
//! registry and a fake spawn fabric instead of real engine processes.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use async_trait::async_trait;
use orama_config::{HostConfig, HostId, PlanOverrides, PortRange};
use orama_gateway::{
    ApiKeys, BlobStore, DevWalletVerifier, FsBlobStore, GatewayContext, RouterState,
    public_router,
};
use orama_provisioner::{Deprovisioner, LocalDnsPublisher, Provisioner, StaticLeadership};
use orama_registry::{MemoryStore, NamespaceName, RegistryStore, ServiceKind};
use orama_supervisor::{SpawnCommand, SpawnResponse, SpawnTransport, SpawnTransportError};
use tokio::{net::TcpListener, sync::Mutex};

pub const TEST_SECRET: &str = "namespace-coordination";
pub const TEST_BASE_DOMAIN: &str = "orama.test";

type InstanceId = (NamespaceName, HostId, ServiceKind);

/// Spawn fabric double: every engine "starts" instantly and the readiness
/// bits are written the way the prober would.
pub struct FakeFabric {
    store: Arc<dyn RegistryStore>,
    pids: Mutex<HashMap<InstanceId, u32>>,
    next_pid: AtomicU32,
}

impl FakeFabric {
    #[must_use]
    pub fn new(store: Arc<dyn RegistryStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pids: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(100),
        })
    }

    pub async fn running_instances(&self) -> usize {
        self.pids.lock().await.len()
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
            let mut pids = self.pids.lock().await;
            let pid = *pids
                .entry(key)
                .or_insert_with(|| self.next_pid.fetch_add(1, Ordering::SeqCst));
            drop(pids);

            if let Ok(Some(ns)) = self.store.namespace_by_name(&namespace).await
                && let Ok(Some(cluster)) = self.store.live_cluster_for_namespace(&ns.id).await
            {
                let _ = self
                    .store
                    .set_service_ready(&cluster.id, &host.id, service, true)
                    .await;
            }
            Ok(SpawnResponse::ok(Some(pid)))
        } else {
            self.pids.lock().await.remove(&key);
            Ok(SpawnResponse::ok(None))
        }
    }
}

#[must_use]
pub fn test_hosts() -> Vec<HostConfig> {
    (0..3)
        .map(|i| HostConfig {
            id: HostId::new(format!("host-{}", (b'a' + i) as char)),
            addr: format!("10.0.0.{}", i + 1),
            internal_port: 8090,
            port_range: PortRange { lo: 10000, hi: 10099 },
        })
        .collect()
}

pub struct TestPlatform {
    pub base_url: String,
    pub store: Arc<dyn RegistryStore>,
    pub fabric: Arc<FakeFabric>,
    pub routes: Arc<RouterState>,
    pub blobs: Arc<FsBlobStore>,
    _data_dir: tempfile::TempDir,
}

impl TestPlatform {
    /// Boot the full control plane over loopback and return its base URL.
    pub async fn start() -> Self {
        let data_dir = tempfile::tempdir().expect("tempdir");
        let hosts = test_hosts();

        let store: Arc<dyn RegistryStore> = Arc::new(MemoryStore::new());
        let fabric = FakeFabric::new(Arc::clone(&store));
        let dns = Arc::new(LocalDnsPublisher::new(
            Arc::clone(&store),
            TEST_BASE_DOMAIN.into(),
        ));
        let leadership = Arc::new(StaticLeadership::new(true));

        let provisioner = Provisioner::new(
            Arc::clone(&store),
            fabric.clone(),
            dns.clone(),
            leadership.clone(),
            hosts.clone(),
            3,
            PlanOverrides::default(),
        );
        let deprovisioner = Arc::new(Deprovisioner::new(
            Arc::clone(&store),
            fabric.clone(),
            dns,
            leadership,
            hosts.clone(),
        ));

        let routes = RouterState::new(Arc::clone(&store), hosts);
        let blobs = Arc::new(FsBlobStore::new(data_dir.path()));

        let router = public_router(Arc::new(GatewayContext {
            store: Arc::clone(&store),
            provisioner,
            deprovisioner,
            api_keys: ApiKeys::new(TEST_SECRET.into()),
            wallet_verifier: Arc::new(DevWalletVerifier),
            blobs: Arc::clone(&blobs) as Arc<dyn BlobStore>,
            routes: Arc::clone(&routes),
            base_domain: TEST_BASE_DOMAIN.into(),
            http: reqwest::Client::new(),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            store,
            fabric,
            routes,
            blobs,
            _data_dir: data_dir,
        }
    }
}
