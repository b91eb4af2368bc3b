use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::join_all;
use orama_config::{HostConfig, HostId, PlanOverrides, PlanTier, timeouts};
use orama_registry::{
    ClusterId, ClusterRecord, ClusterState, NamespaceName, NamespaceRecord, Placement,
    PortAllocError, PortAllocator, RegistryError, RegistryStore, Role, ServiceKind, model::unix_ts,
};
use orama_supervisor::{
    PeerEndpoint, SpawnCommand, SpawnSpec, SpawnTransport, SpawnTransportError, StopSpec,
};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    checkpoint::ProvisionStep, dns::DnsPublisher, hosts::select_hosts,
    leadership::LeadershipMonitor,
};

const READY_POLL_FLOOR: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("namespace 'default' is not managed by the provisioner")]
    DefaultNamespace,
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a provisioning task ended without reaching `ready`.
enum TaskEnd {
    /// Terminal failure; the cluster was compensated and marked `failed`.
    Failed(String),
    /// Leadership moved; the new leader resumes from the checkpoint.
    Abandoned,
}

/// Per-step outcome inside the workflow.
enum StepError {
    /// Retry the same step with backoff until the overall deadline.
    Transient(String),
    /// Compensate and mark the cluster failed.
    Fatal(String),
    /// Registry writes rejected; abandon without compensating.
    LeadershipLost,
}

impl From<RegistryError> for StepError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::LeadershipLost => Self::LeadershipLost,
            RegistryError::Transport { .. } => Self::Transient(err.to_string()),
            other => Self::Fatal(other.to_string()),
        }
    }
}

impl From<SpawnTransportError> for StepError {
    fn from(err: SpawnTransportError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

struct TaskContext {
    cluster_id: ClusterId,
    namespace: NamespaceName,
    replication_factor: usize,
}

/// Drives clusters from `requested` to `ready` or `failed`. One in-process
/// task per cluster, running only on the elected control-plane leader; the
/// singleton task registry is the only leader-global state.
pub struct Provisioner {
    store: Arc<dyn RegistryStore>,
    transport: Arc<dyn SpawnTransport>,
    dns: Arc<dyn DnsPublisher>,
    leadership: Arc<dyn LeadershipMonitor>,
    allocator: PortAllocator,
    hosts: Vec<HostConfig>,
    default_replication: usize,
    plans: PlanOverrides,
    tasks: Mutex<HashMap<ClusterId, JoinHandle<()>>>,
}

impl Provisioner {
    #[must_use]
    pub fn new(
        store: Arc<dyn RegistryStore>,
        transport: Arc<dyn SpawnTransport>,
        dns: Arc<dyn DnsPublisher>,
        leadership: Arc<dyn LeadershipMonitor>,
        hosts: Vec<HostConfig>,
        default_replication: usize,
        plans: PlanOverrides,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator: PortAllocator::new(Arc::clone(&store)),
            store,
            transport,
            dns,
            leadership,
            hosts,
            default_replication,
            plans,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RegistryStore> {
        &self.store
    }

    /// Handle a provisioning request. Returns the cluster record the caller
    /// should report on: freshly created, or the existing live/failed one.
    /// The workflow itself continues in the background and survives caller
    /// disconnect.
    pub async fn request_cluster(
        self: &Arc<Self>,
        name: &NamespaceName,
        wallet: &str,
        plan: PlanTier,
    ) -> Result<ClusterRecord, ProvisionError> {
        if name.is_default() {
            return Err(ProvisionError::DefaultNamespace);
        }

        let namespace = self.ensure_namespace(name, wallet, plan).await?;

        if let Some(existing) = self.store.live_cluster_for_namespace(&namespace.id).await? {
            debug!(namespace = %name, cluster = %existing.id, state = %existing.state, "live cluster already present");
            return Ok(existing);
        }
        // A failed cluster is never retried implicitly; the owner must
        // deprovision and re-request.
        if let Some(latest) = self.store.latest_cluster_for_namespace(&namespace.id).await?
            && latest.state == ClusterState::Failed
        {
            return Ok(latest);
        }

        let record = ClusterRecord::new(namespace.id.clone());
        match self.store.insert_cluster(record.clone()).await {
            Ok(()) => {}
            Err(RegistryError::ClusterConflict { existing, .. }) => {
                // Lost the unique-index race; the winner's task is running.
                return Ok(*existing);
            }
            Err(err) => return Err(err.into()),
        }

        info!(namespace = %name, cluster = %record.id, "cluster requested");
        // A follower only records the request; the leader's sweep picks the
        // `requested` row up within one tick.
        if self.leadership.is_leader() {
            self.spawn_task(record.id.clone(), name.clone(), plan).await;
        }
        Ok(record)
    }

    async fn ensure_namespace(
        &self,
        name: &NamespaceName,
        wallet: &str,
        plan: PlanTier,
    ) -> Result<NamespaceRecord, ProvisionError> {
        if let Some(existing) = self.store.namespace_by_name(name).await? {
            return Ok(existing);
        }
        let record = NamespaceRecord {
            id: orama_registry::NamespaceId::generate(),
            name: name.clone(),
            wallet: wallet.to_owned(),
            plan,
            created_at: unix_ts(),
            deleted_at: None,
        };
        match self.store.create_namespace(record.clone()).await {
            Ok(()) => Ok(record),
            Err(RegistryError::NamespaceExists { .. }) => {
                // Raced another request; use the winner's row.
                self.store
                    .namespace_by_name(name)
                    .await?
                    .ok_or(ProvisionError::Registry(RegistryError::NotFound {
                        entity: "namespace",
                        id: name.to_string(),
                    }))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Resume workflows for clusters a previous leader left mid-flight.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<(), RegistryError> {
        for state in [ClusterState::Requested, ClusterState::Provisioning] {
            for cluster in self.store.clusters_in_state(state).await? {
                let Some(namespace) = self.store.namespace_by_id(&cluster.namespace_id).await?
                else {
                    warn!(cluster = %cluster.id, "orphan cluster row without namespace");
                    continue;
                };
                let checkpoint = cluster.checkpoint.clone();
                if self
                    .spawn_task(cluster.id.clone(), namespace.name.clone(), namespace.plan)
                    .await
                {
                    info!(
                        cluster = %cluster.id,
                        namespace = %namespace.name,
                        checkpoint = checkpoint.as_deref().unwrap_or("<none>"),
                        "resuming provisioning"
                    );
                }
            }
        }
        Ok(())
    }

    /// Wait for a cluster's background workflow, if one is running here.
    /// Test and shutdown plumbing; callers normally poll the registry.
    pub async fn join_task(&self, cluster_id: &ClusterId) {
        let handle = {
            let mut tasks = self.tasks.lock().await;
            tasks.remove(cluster_id)
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Returns false when a task for the cluster is already registered.
    async fn spawn_task(
        self: &Arc<Self>,
        cluster_id: ClusterId,
        name: NamespaceName,
        plan: PlanTier,
    ) -> bool {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&cluster_id) {
            return false;
        }
        let this = Arc::clone(self);
        let id = cluster_id.clone();
        let handle = tokio::spawn(async move {
            let cleanup = Arc::clone(&this);
            this.run(id.clone(), name, plan).await;
            cleanup.tasks.lock().await.remove(&id);
        });
        tasks.insert(cluster_id, handle);
        true
    }

    async fn run(self: Arc<Self>, cluster_id: ClusterId, namespace: NamespaceName, plan: PlanTier) {
        let context = TaskContext {
            cluster_id: cluster_id.clone(),
            namespace: namespace.clone(),
            replication_factor: self
                .plans
                .replication_factor(plan, self.default_replication),
        };

        match self.drive(&context).await {
            Ok(()) => {
                info!(cluster = %cluster_id, namespace = %namespace, "cluster ready");
            }
            Err(TaskEnd::Abandoned) => {
                info!(cluster = %cluster_id, "provisioning abandoned, new leader will resume");
            }
            Err(TaskEnd::Failed(reason)) => {
                warn!(cluster = %cluster_id, namespace = %namespace, reason, "provisioning failed");
                self.compensate(&context, &reason).await;
            }
        }
    }

    async fn drive(&self, context: &TaskContext) -> Result<(), TaskEnd> {
        let cluster = self
            .store
            .cluster(&context.cluster_id)
            .await
            .map_err(|_| TaskEnd::Abandoned)?
            .ok_or(TaskEnd::Abandoned)?;

        if cluster.state == ClusterState::Requested {
            self.transition(&context.cluster_id, ClusterState::Provisioning)
                .await?;
        } else if cluster.state != ClusterState::Provisioning {
            // Raced a deprovision or a concurrent resume; nothing to do.
            return Err(TaskEnd::Abandoned);
        }

        let deadline = Instant::now() + timeouts::ready_deadline();
        let mut step = ProvisionStep::decode(cluster.checkpoint.as_deref());
        let mut attempt: u32 = 0;

        while step != ProvisionStep::Done {
            // The checkpoint is durable before the step's side effects start.
            step.commit(self.store.as_ref(), &context.cluster_id)
                .await
                .map_err(|err| self.classify_checkpoint_error(&err))?;

            match self.run_step(step, context).await {
                Ok(()) => {
                    debug!(cluster = %context.cluster_id, step = ?step, "step complete");
                    step = step.next();
                    attempt = 0;
                }
                Err(StepError::Transient(message)) => {
                    let delay = backoff_delay(attempt);
                    attempt += 1;
                    if Instant::now() + delay >= deadline {
                        return Err(TaskEnd::Failed(format!(
                            "deadline exceeded at {step:?}: {message}"
                        )));
                    }
                    debug!(
                        cluster = %context.cluster_id,
                        step = ?step,
                        attempt,
                        delay_ms = delay.as_millis(),
                        message,
                        "step not complete, retrying"
                    );
                    sleep(delay).await;
                }
                Err(StepError::Fatal(message)) => return Err(TaskEnd::Failed(message)),
                Err(StepError::LeadershipLost) => return Err(TaskEnd::Abandoned),
            }
        }

        ProvisionStep::Done
            .commit(self.store.as_ref(), &context.cluster_id)
            .await
            .map_err(|err| self.classify_checkpoint_error(&err))?;
        match self.store.mark_ready(&context.cluster_id).await {
            Ok(()) => Ok(()),
            Err(RegistryError::LeadershipLost) => Err(TaskEnd::Abandoned),
            Err(err) => Err(TaskEnd::Failed(err.to_string())),
        }
    }

    fn classify_checkpoint_error(&self, err: &RegistryError) -> TaskEnd {
        match err {
            RegistryError::LeadershipLost => TaskEnd::Abandoned,
            other => TaskEnd::Failed(other.to_string()),
        }
    }

    async fn transition(&self, cluster_id: &ClusterId, state: ClusterState) -> Result<(), TaskEnd> {
        match self.store.update_cluster_state(cluster_id, state).await {
            Ok(()) => Ok(()),
            Err(RegistryError::LeadershipLost) => Err(TaskEnd::Abandoned),
            Err(err) => Err(TaskEnd::Failed(err.to_string())),
        }
    }

    async fn run_step(&self, step: ProvisionStep, context: &TaskContext) -> Result<(), StepError> {
        match step {
            ProvisionStep::ReservePorts => self.reserve_ports(context).await,
            ProvisionStep::SpawnSql => self.spawn_service(context, ServiceKind::Sql).await,
            ProvisionStep::AwaitSqlReady => self.await_service_ready(context, ServiceKind::Sql).await,
            ProvisionStep::SpawnCache => self.spawn_service(context, ServiceKind::Cache).await,
            ProvisionStep::AwaitCacheReady => {
                self.await_service_ready(context, ServiceKind::Cache).await
            }
            ProvisionStep::SpawnGateway => self.spawn_service(context, ServiceKind::Gateway).await,
            ProvisionStep::AwaitGatewayReady => {
                self.await_service_ready(context, ServiceKind::Gateway).await
            }
            ProvisionStep::AwaitDns => self.await_dns(context).await,
            ProvisionStep::Done => Ok(()),
        }
    }

    async fn reserve_ports(&self, context: &TaskContext) -> Result<(), StepError> {
        // A resumed run may hold partial reservations; drop and redo the
        // whole step so host selection sees a consistent picture.
        self.store
            .release_reservations_for_cluster(&context.cluster_id)
            .await?;
        self.store.delete_placements(&context.cluster_id).await?;

        let selected = select_hosts(&self.allocator, &self.hosts, context.replication_factor)
            .await
            .map_err(port_error)?;
        let Some(selected) = selected else {
            return Err(StepError::Fatal("insufficient_capacity".to_owned()));
        };

        let mut placements = Vec::with_capacity(selected.len());
        for (index, host) in selected.iter().enumerate() {
            let block = self
                .allocator
                .reserve(host, &context.cluster_id)
                .await
                .map_err(port_error)?;
            let role = if index == 0 { Role::Leader } else { Role::Follower };
            placements.push(Placement::new(
                context.cluster_id.clone(),
                host.id.clone(),
                role,
                block.base,
            ));
        }

        info!(
            cluster = %context.cluster_id,
            hosts = ?placements.iter().map(|p| p.host_id.as_str()).collect::<Vec<_>>(),
            "placements chosen"
        );
        self.store.insert_placements(placements).await?;
        Ok(())
    }

    async fn spawn_service(
        &self,
        context: &TaskContext,
        service: ServiceKind,
    ) -> Result<(), StepError> {
        let placements = self.store.placements(&context.cluster_id).await?;
        if placements.is_empty() {
            return Err(StepError::Fatal("no placements recorded".to_owned()));
        }

        let leader = placements
            .iter()
            .find(|p| p.role == Role::Leader)
            .ok_or_else(|| StepError::Fatal("cluster has no leader placement".to_owned()))?
            .clone();

        // SQL replication is leader-first: followers need a live leader to
        // join. Cache and gateway instances start everywhere at once.
        if service == ServiceKind::Sql {
            self.send_spawn(context, service, &leader, &placements).await?;
            let follower_calls = placements
                .iter()
                .filter(|p| p.role == Role::Follower)
                .map(|placement| self.send_spawn(context, service, placement, &placements));
            collect_spawn_results(join_all(follower_calls).await)?;
        } else {
            let calls = placements
                .iter()
                .map(|placement| self.send_spawn(context, service, placement, &placements));
            collect_spawn_results(join_all(calls).await)?;
        }
        Ok(())
    }

    async fn send_spawn(
        &self,
        context: &TaskContext,
        service: ServiceKind,
        placement: &Placement,
        all: &[Placement],
    ) -> Result<(), StepError> {
        let host = self.host_config(&placement.host_id)?;
        let peers = self.peers_for(service, placement, all)?;
        let command = SpawnCommand::spawn(
            service,
            SpawnSpec {
                namespace: context.namespace.clone(),
                node_id: placement.host_id.clone(),
                role: placement.role,
                base_port: placement.base_port,
                peers,
            },
        );
        self.transport.send(&host, command).await?;
        Ok(())
    }

    /// Join addresses each instance needs: SQL followers point at the
    /// leader, cache members gossip with every other placement, the gateway
    /// only talks to its co-resident services.
    fn peers_for(
        &self,
        service: ServiceKind,
        placement: &Placement,
        all: &[Placement],
    ) -> Result<Vec<PeerEndpoint>, StepError> {
        let endpoint = |p: &Placement| -> Result<PeerEndpoint, StepError> {
            let host = self.host_config(&p.host_id)?;
            Ok(PeerEndpoint {
                host_addr: host.addr.clone(),
                base_port: p.base_port,
            })
        };
        match service {
            ServiceKind::Sql => match placement.role {
                Role::Leader => Ok(vec![]),
                Role::Follower => all
                    .iter()
                    .filter(|p| p.role == Role::Leader)
                    .map(endpoint)
                    .collect(),
            },
            ServiceKind::Cache => all
                .iter()
                .filter(|p| p.host_id != placement.host_id)
                .map(endpoint)
                .collect(),
            ServiceKind::Gateway => Ok(vec![]),
        }
    }

    fn host_config(&self, host_id: &HostId) -> Result<HostConfig, StepError> {
        self.hosts
            .iter()
            .find(|host| &host.id == host_id)
            .cloned()
            .ok_or_else(|| StepError::Fatal(format!("host '{host_id}' missing from static config")))
    }

    async fn await_service_ready(
        &self,
        context: &TaskContext,
        service: ServiceKind,
    ) -> Result<(), StepError> {
        // Give the prober a moment between polls; the driver's backoff adds
        // the rest.
        sleep(READY_POLL_FLOOR).await;
        let placements = self.store.placements(&context.cluster_id).await?;

        // SQL readiness gates on the leader (quorum forms around it); cache
        // and gateway must answer on every placement.
        let ready = match service {
            ServiceKind::Sql => placements
                .iter()
                .any(|p| p.role == Role::Leader && p.sql_ready),
            other => {
                !placements.is_empty() && placements.iter().all(|p| p.service_ready(other))
            }
        };

        if ready {
            Ok(())
        } else {
            Err(StepError::Transient(format!("{service} not yet ready")))
        }
    }

    async fn await_dns(&self, context: &TaskContext) -> Result<(), StepError> {
        let placements = self.store.placements(&context.cluster_id).await?;
        self.dns
            .publish(&context.cluster_id, &context.namespace, &placements)
            .await
            .map_err(|err| StepError::Transient(err.to_string()))?;

        let cluster = self
            .store
            .cluster(&context.cluster_id)
            .await?
            .ok_or_else(|| StepError::Fatal("cluster row vanished".to_owned()))?;
        if cluster.dns_ready {
            Ok(())
        } else {
            Err(StepError::Transient("dns propagation pending".to_owned()))
        }
    }

    /// Inverse of the steps already performed, in reverse order. Every part
    /// is idempotent, so a half-finished compensation can rerun safely.
    async fn compensate(&self, context: &TaskContext, reason: &str) {
        let placements = match self.store.placements(&context.cluster_id).await {
            Ok(placements) => placements,
            Err(err) => {
                warn!(cluster = %context.cluster_id, error = %err, "compensation could not read placements");
                return;
            }
        };

        for service in [ServiceKind::Gateway, ServiceKind::Cache, ServiceKind::Sql] {
            let stops = placements.iter().map(|placement| async {
                let Ok(host) = self.host_config(&placement.host_id) else {
                    return;
                };
                let command = SpawnCommand::stop(
                    service,
                    StopSpec {
                        namespace: context.namespace.clone(),
                        node_id: placement.host_id.clone(),
                    },
                );
                if let Err(err) = self.transport.send(&host, command).await {
                    warn!(
                        cluster = %context.cluster_id,
                        host = %placement.host_id,
                        service = %service,
                        error = %err,
                        "compensating stop failed"
                    );
                }
            });
            join_all(stops).await;
        }

        let cleanup: Result<(), RegistryError> = async {
            self.store
                .release_reservations_for_cluster(&context.cluster_id)
                .await?;
            self.store.delete_placements(&context.cluster_id).await?;
            self.store
                .set_failure_reason(&context.cluster_id, reason)
                .await?;
            self.store
                .update_cluster_state(&context.cluster_id, ClusterState::Failed)
                .await
        }
        .await;

        if let Err(err) = cleanup {
            warn!(cluster = %context.cluster_id, error = %err, "compensation bookkeeping incomplete");
        }
    }
}

fn collect_spawn_results(results: Vec<Result<(), StepError>>) -> Result<(), StepError> {
    let mut transient = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(StepError::Transient(message)) => transient = Some(message),
            Err(fatal) => return Err(fatal),
        }
    }
    transient.map_or(Ok(()), |message| Err(StepError::Transient(message)))
}

fn port_error(err: PortAllocError) -> StepError {
    match err {
        PortAllocError::Exhausted { .. } | PortAllocError::InvalidRange { .. } => {
            StepError::Fatal("insufficient_capacity".to_owned())
        }
        PortAllocError::Registry(registry) => registry.into(),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = timeouts::backoff_base();
    let cap = timeouts::backoff_cap();
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    exp.min(cap)
}
