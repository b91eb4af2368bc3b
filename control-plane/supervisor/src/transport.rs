use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use orama_config::{
    HostConfig, HostId,
    constants::{INTERNAL_AUTH_HEADER, INTERNAL_SPAWN_PATH},
    timeouts,
};
use thiserror::Error;
use tracing::debug;

use crate::{
    protocol::{SpawnCommand, SpawnResponse},
    server::execute_command,
    supervisor::InstanceSupervisor,
};

#[derive(Debug, Error)]
pub enum SpawnTransportError {
    /// Connection-level failure; retriable with backoff.
    #[error("spawn rpc to host '{host_id}' failed: {source}")]
    Rpc {
        host_id: HostId,
        #[source]
        source: reqwest::Error,
    },
    #[error("host '{host_id}' rejected the cluster secret")]
    Unauthorized { host_id: HostId },
    /// The peer executed the command and reported an error; not retriable at
    /// the transport layer.
    #[error("host '{host_id}' rejected command: {error}")]
    Rejected { host_id: HostId, error: String },
}

impl SpawnTransportError {
    /// Whether the caller should retry the same call with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc { .. })
    }
}

/// Carrier of typed commands between control-plane hosts. The production
/// implementation speaks HTTP to each host's internal endpoint; tests and
/// single-node deployments use the loopback variant.
#[async_trait]
pub trait SpawnTransport: Send + Sync {
    async fn send(
        &self,
        host: &HostConfig,
        command: SpawnCommand,
    ) -> Result<SpawnResponse, SpawnTransportError>;
}

/// HTTP transport with the pre-shared cluster secret and a per-call timeout.
pub struct HttpSpawnTransport {
    http: reqwest::Client,
    secret: String,
}

impl HttpSpawnTransport {
    #[must_use]
    pub fn new(secret: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeouts::rpc_timeout())
            .build()
            .unwrap_or_default();
        Self { http, secret }
    }
}

#[async_trait]
impl SpawnTransport for HttpSpawnTransport {
    async fn send(
        &self,
        host: &HostConfig,
        command: SpawnCommand,
    ) -> Result<SpawnResponse, SpawnTransportError> {
        let url = format!("{}{INTERNAL_SPAWN_PATH}", host.internal_url());
        debug!(host = %host.id, %url, service = %command.service(), "sending spawn command");

        let response = self
            .http
            .post(&url)
            .header(INTERNAL_AUTH_HEADER, &self.secret)
            .json(&command)
            .send()
            .await
            .map_err(|source| SpawnTransportError::Rpc {
                host_id: host.id.clone(),
                source,
            })?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SpawnTransportError::Unauthorized {
                host_id: host.id.clone(),
            });
        }

        let body: SpawnResponse =
            response
                .json()
                .await
                .map_err(|source| SpawnTransportError::Rpc {
                    host_id: host.id.clone(),
                    source,
                })?;

        if body.success {
            Ok(body)
        } else {
            Err(SpawnTransportError::Rejected {
                host_id: host.id.clone(),
                error: body.error.unwrap_or_else(|| "unknown error".to_owned()),
            })
        }
    }
}

/// In-process transport for single-node deployments: every "host" resolves to
/// the local supervisor.
pub struct LoopbackTransport {
    supervisor: Arc<InstanceSupervisor>,
    data_root: PathBuf,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(supervisor: Arc<InstanceSupervisor>, data_root: PathBuf) -> Self {
        Self {
            supervisor,
            data_root,
        }
    }
}

#[async_trait]
impl SpawnTransport for LoopbackTransport {
    async fn send(
        &self,
        host: &HostConfig,
        command: SpawnCommand,
    ) -> Result<SpawnResponse, SpawnTransportError> {
        let response = execute_command(&self.supervisor, &self.data_root, command).await;
        if response.success {
            Ok(response)
        } else {
            Err(SpawnTransportError::Rejected {
                host_id: host.id.clone(),
                error: response.error.unwrap_or_else(|| "unknown error".to_owned()),
            })
        }
    }
}
