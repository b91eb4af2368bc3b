use std::{path::PathBuf, process, sync::Arc};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use orama_config::{NodeConfig, RegistryBackend};
use orama_gateway::{
    ApiKeys, DevWalletVerifier, FsBlobStore, GatewayContext, RouterState, public_router,
};
use orama_provisioner::{
    Deprovisioner, LeaderRuntime, LeadershipMonitor, LocalDnsPublisher, Provisioner,
    StaticLeadership, StoreLeadership,
};
use orama_registry::{MemoryStore, RegistryStore, SqlStore, sql::schema};
use orama_supervisor::{
    EngineCatalog, HttpSpawnTransport, InstanceSupervisor, InternalState, LoopbackTransport,
    SpawnTransport, internal_router,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orama-node", about = "Orama edge platform control-plane node")]
struct Cli {
    /// Path to the node configuration file.
    #[arg(long, default_value = "node.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control-plane node (default).
    Run,
    /// Print the registry schema DDL and exit.
    Schema,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Schema => {
            println!("{}", schema::render());
        }
        Command::Run => {
            if let Err(err) = run(&cli.config).await {
                warn!("node failed: {err:#}");
                process::exit(1);
            }
        }
    }
}

async fn run(config_path: &std::path::Path) -> Result<()> {
    let config = NodeConfig::load_from_file(config_path).context("loading node configuration")?;

    let store = build_store(&config).await?;
    let local_host = config.local_host().clone();

    // Host-local supervisor plus the internal endpoint peers call into.
    let supervisor = Arc::new(InstanceSupervisor::new(EngineCatalog::new(
        config.engines.clone(),
    )));
    let internal = internal_router(Arc::new(InternalState {
        supervisor: Arc::clone(&supervisor),
        data_root: config.data_root.clone(),
        secret: config.cluster_secret.clone(),
    }));
    let internal_listener = TcpListener::bind(config.internal_bind)
        .await
        .with_context(|| format!("binding internal endpoint on {}", config.internal_bind))?;

    let transport: Arc<dyn SpawnTransport> = match &config.registry {
        RegistryBackend::Memory => Arc::new(LoopbackTransport::new(
            Arc::clone(&supervisor),
            config.data_root.clone(),
        )),
        RegistryBackend::Sql { .. } => {
            Arc::new(HttpSpawnTransport::new(config.cluster_secret.clone()))
        }
    };

    let leadership: Arc<dyn LeadershipMonitor> = match &config.registry {
        RegistryBackend::Sql {
            endpoints,
            advertise: Some(advertise),
        } => {
            let (monitor, _handle) =
                StoreLeadership::spawn(endpoints.clone(), advertise.clone());
            Arc::new(monitor)
        }
        // Without a store to elect from, this node is the only writer.
        _ => Arc::new(StaticLeadership::new(true)),
    };

    let dns = Arc::new(LocalDnsPublisher::new(
        Arc::clone(&store),
        config.base_domain.clone(),
    ));
    let provisioner = Provisioner::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        dns.clone(),
        Arc::clone(&leadership),
        config.hosts.clone(),
        config.replication_factor,
        config.plans,
    );
    let deprovisioner = Arc::new(Deprovisioner::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        dns,
        Arc::clone(&leadership),
        config.hosts.clone(),
    ));

    let routes = RouterState::new(Arc::clone(&store), config.hosts.clone());
    let _refresh_handle = routes.spawn_refresh();

    let gateway = public_router(Arc::new(GatewayContext {
        store: Arc::clone(&store),
        provisioner: Arc::clone(&provisioner),
        deprovisioner: Arc::clone(&deprovisioner),
        api_keys: ApiKeys::new(config.cluster_secret.clone()),
        wallet_verifier: Arc::new(DevWalletVerifier),
        blobs: Arc::new(FsBlobStore::new(&config.data_root)),
        routes,
        base_domain: config.base_domain.clone(),
        http: reqwest::Client::new(),
    }));
    let public_listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding public endpoint on {}", config.bind))?;

    let leader_runtime = LeaderRuntime::new(
        Arc::clone(&store),
        provisioner,
        deprovisioner,
        config.hosts.clone(),
    );

    info!(
        node_id = %local_host.id,
        public = %config.bind,
        internal = %config.internal_bind,
        "control-plane node listening"
    );

    tokio::select! {
        result = axum::serve(public_listener, gateway) => {
            result.context("public server exited")?;
        }
        result = axum::serve(internal_listener, internal) => {
            result.context("internal server exited")?;
        }
        () = leader_runtime.run(leadership) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn build_store(config: &NodeConfig) -> Result<Arc<dyn RegistryStore>> {
    match &config.registry {
        RegistryBackend::Memory => {
            info!("using in-memory registry (single-node development mode)");
            Ok(Arc::new(MemoryStore::new()))
        }
        RegistryBackend::Sql { endpoints, .. } => {
            let store = SqlStore::new(endpoints.clone());
            store
                .ensure_schema()
                .await
                .context("applying registry schema")?;
            Ok(Arc::new(store))
        }
    }
}
