use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    process::{Child, Command, Stdio},
    time::Duration,
};

use orama_config::timeouts;
use orama_registry::{NamespaceName, ServiceKind};
use thiserror::Error;
use tokio::{sync::Mutex, time};
use tracing::{debug, info, warn};

use crate::service::{EngineCatalog, InstanceConfig, InstanceKey};

const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Window to reap a force-killed child before declaring it stuck.
const KILL_REAP_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to serialize instance config for {namespace}/{service}: {source}")]
    InvalidConfig {
        namespace: NamespaceName,
        service: ServiceKind,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to create instance directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write instance config at {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn engine '{binary}': {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{namespace}/{service} exited during startup (code {exit_code:?}), likely a port bind failure")]
    BindFailed {
        namespace: NamespaceName,
        service: ServiceKind,
        exit_code: Option<i32>,
    },
    #[error("{namespace}/{service} did not answer its health endpoint within {timeout:?}")]
    StartupTimeout {
        namespace: NamespaceName,
        service: ServiceKind,
        timeout: Duration,
    },
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("no running instance for {namespace}/{service}")]
    AlreadyGone {
        namespace: NamespaceName,
        service: ServiceKind,
    },
    #[error("{namespace}/{service} (pid {pid}) survived forced termination")]
    Timeout {
        namespace: NamespaceName,
        service: ServiceKind,
        pid: u32,
    },
}

/// Observed state of a supervised instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceStatus {
    Running { pid: u32 },
    Exited { code: Option<i32> },
    Unknown,
}

struct Instance {
    child: Child,
    pid: u32,
    config: InstanceConfig,
}

fn is_running(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(None))
}

/// Owns the engine child processes on this host, keyed by
/// `(namespace, service)`. Spawn waits for the engine's own health endpoint;
/// stop is graceful first, forced after the grace window. Data directories
/// survive stop and are removed only by the deprovisioner.
pub struct InstanceSupervisor {
    catalog: EngineCatalog,
    instances: Mutex<HashMap<InstanceKey, Instance>>,
    http: reqwest::Client,
}

impl InstanceSupervisor {
    #[must_use]
    pub fn new(catalog: EngineCatalog) -> Self {
        Self {
            catalog,
            instances: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Spawn an engine instance, or return the existing PID if one is already
    /// running for the same key.
    pub async fn spawn(&self, config: InstanceConfig) -> Result<u32, SpawnError> {
        let key = InstanceKey::new(config.namespace.clone(), config.service);

        {
            let mut instances = self.instances.lock().await;
            if let Some(existing) = instances.get_mut(&key) {
                if is_running(&mut existing.child) {
                    debug!(
                        namespace = %key.namespace,
                        service = %key.service,
                        pid = existing.pid,
                        "spawn found running instance, returning existing pid"
                    );
                    return Ok(existing.pid);
                }
                // Stale handle from a crashed engine; replace it.
                instances.remove(&key);
            }
        }

        let config_path = self.prepare_instance_dirs(&config)?;
        let binary = self.catalog.binary(config.service);

        debug!(
            namespace = %config.namespace,
            service = %config.service,
            binary = %binary.display(),
            config_file = %config_path.display(),
            "spawning engine process"
        );

        let child = Command::new(&binary)
            .args(self.catalog.args(&config_path))
            .current_dir(config.config_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| SpawnError::Spawn { binary, source })?;

        let pid = child.id();
        let health_url = config.health_url();
        {
            let mut instances = self.instances.lock().await;
            instances.insert(
                key.clone(),
                Instance {
                    child,
                    pid,
                    config: config.clone(),
                },
            );
        }

        match self.wait_healthy(&key, &health_url).await {
            Ok(()) => {
                info!(
                    namespace = %key.namespace,
                    service = %key.service,
                    pid,
                    "instance healthy"
                );
                Ok(pid)
            }
            Err(err) => {
                let mut instances = self.instances.lock().await;
                if let Some(mut instance) = instances.remove(&key) {
                    let _ = instance.child.kill();
                    let _ = instance.child.wait();
                }
                Err(err)
            }
        }
    }

    async fn wait_healthy(&self, key: &InstanceKey, health_url: &str) -> Result<(), SpawnError> {
        let timeout = timeouts::startup_timeout();
        let deadline = time::Instant::now() + timeout;

        loop {
            // An early exit means the engine never bound its ports.
            {
                let mut instances = self.instances.lock().await;
                match instances.get_mut(key) {
                    Some(instance) => {
                        if !is_running(&mut instance.child) {
                            let code = instance.child.try_wait().ok().flatten().and_then(|s| s.code());
                            instances.remove(key);
                            return Err(SpawnError::BindFailed {
                                namespace: key.namespace.clone(),
                                service: key.service,
                                exit_code: code,
                            });
                        }
                    }
                    None => {
                        return Err(SpawnError::BindFailed {
                            namespace: key.namespace.clone(),
                            service: key.service,
                            exit_code: None,
                        });
                    }
                }
            }

            match self.http.get(health_url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(_) | Err(_) => {}
            }

            if time::Instant::now() >= deadline {
                return Err(SpawnError::StartupTimeout {
                    namespace: key.namespace.clone(),
                    service: key.service,
                    timeout,
                });
            }
            time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    fn prepare_instance_dirs(&self, config: &InstanceConfig) -> Result<PathBuf, SpawnError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| SpawnError::DataDir {
            path: config.data_dir.clone(),
            source,
        })?;

        let yaml = serde_yaml::to_string(config).map_err(|source| SpawnError::InvalidConfig {
            namespace: config.namespace.clone(),
            service: config.service,
            source,
        })?;
        let config_path = config.config_path();
        std::fs::write(&config_path, yaml).map_err(|source| SpawnError::WriteConfig {
            path: config_path.clone(),
            source,
        })?;
        Ok(config_path)
    }

    /// Stop an instance: graceful shutdown request, grace window, then kill.
    pub async fn stop(&self, key: &InstanceKey) -> Result<(), StopError> {
        let mut instance = {
            let mut instances = self.instances.lock().await;
            instances.remove(key).ok_or_else(|| StopError::AlreadyGone {
                namespace: key.namespace.clone(),
                service: key.service,
            })?
        };

        let pid = instance.pid;
        debug!(namespace = %key.namespace, service = %key.service, pid, "stopping instance");

        // Best effort; engines without an admin endpoint just get killed
        // after the grace window.
        let _ = self.http.post(instance.config.shutdown_url()).send().await;

        if wait_for_exit(&mut instance.child, timeouts::stop_grace()).await {
            info!(namespace = %key.namespace, service = %key.service, pid, "instance stopped gracefully");
            return Ok(());
        }

        warn!(namespace = %key.namespace, service = %key.service, pid, "grace window expired, killing");
        let _ = instance.child.kill();

        if wait_for_exit(&mut instance.child, KILL_REAP_WINDOW).await {
            Ok(())
        } else {
            Err(StopError::Timeout {
                namespace: key.namespace.clone(),
                service: key.service,
                pid,
            })
        }
    }

    pub async fn status(&self, key: &InstanceKey) -> InstanceStatus {
        let mut instances = self.instances.lock().await;
        match instances.get_mut(key) {
            Some(instance) => match instance.child.try_wait() {
                Ok(None) => InstanceStatus::Running { pid: instance.pid },
                Ok(Some(status)) => InstanceStatus::Exited {
                    code: status.code(),
                },
                Err(_) => InstanceStatus::Unknown,
            },
            None => InstanceStatus::Unknown,
        }
    }

    /// PID of a running instance, if any.
    pub async fn pid(&self, key: &InstanceKey) -> Option<u32> {
        let mut instances = self.instances.lock().await;
        let instance = instances.get_mut(key)?;
        is_running(&mut instance.child).then_some(instance.pid)
    }

    /// Remove a namespace's data directories. Called by the deprovisioner
    /// after every service stopped cleanly; never while a child is alive.
    pub async fn remove_namespace_data(
        &self,
        data_root: &std::path::Path,
        namespace: &NamespaceName,
    ) -> io::Result<()> {
        let instances = self.instances.lock().await;
        let still_running = ServiceKind::ALL.iter().any(|kind| {
            instances.contains_key(&InstanceKey::new(namespace.clone(), *kind))
        });
        drop(instances);
        if still_running {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "namespace still has supervised instances",
            ));
        }

        let dir = data_root.join(namespace.as_str());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    time::timeout(timeout, async {
        loop {
            if !is_running(child) {
                return;
            }
            time::sleep(EXIT_POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use orama_config::EngineBinaries;
    use orama_registry::{PortBlock, Role};

    use super::*;

    fn supervisor() -> InstanceSupervisor {
        InstanceSupervisor::new(EngineCatalog::new(EngineBinaries {
            sql: "/nonexistent/orama-sqld".into(),
            cache: "/nonexistent/orama-cached".into(),
            gateway: "/nonexistent/orama-gwd".into(),
        }))
    }

    fn config(dir: &Path) -> InstanceConfig {
        InstanceConfig::derive(
            NamespaceName::parse("acme").unwrap(),
            ServiceKind::Sql,
            Role::Leader,
            PortBlock::at(10000),
            &[],
            dir,
        )
    }

    #[tokio::test]
    async fn stop_on_missing_instance_reports_already_gone() {
        let supervisor = supervisor();
        let key = InstanceKey::new(NamespaceName::parse("acme").unwrap(), ServiceKind::Sql);
        let err = supervisor.stop(&key).await.unwrap_err();
        assert!(matches!(err, StopError::AlreadyGone { .. }));
    }

    #[tokio::test]
    async fn status_of_unknown_instance() {
        let supervisor = supervisor();
        let key = InstanceKey::new(NamespaceName::parse("acme").unwrap(), ServiceKind::Cache);
        assert_eq!(supervisor.status(&key).await, InstanceStatus::Unknown);
        assert_eq!(supervisor.pid(&key).await, None);
    }

    #[tokio::test]
    async fn spawn_with_missing_binary_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor();
        let err = supervisor.spawn(config(dir.path())).await.unwrap_err();
        assert!(matches!(err, SpawnError::Spawn { .. }));
        // The config file was still rendered for debugging.
        assert!(config(dir.path()).config_path().exists());
    }

    #[tokio::test]
    async fn remove_namespace_data_tolerates_absent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor();
        supervisor
            .remove_namespace_data(dir.path(), &NamespaceName::parse("ghost").unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "spawns external engine binaries"]
    async fn spawn_then_spawn_returns_same_pid() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor();
        let first = supervisor.spawn(config(dir.path())).await.unwrap();
        let second = supervisor.spawn(config(dir.path())).await.unwrap();
        assert_eq!(first, second);
    }
}
