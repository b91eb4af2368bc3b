use std::{path::PathBuf, sync::Arc};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use orama_config::constants::{INTERNAL_AUTH_HEADER, INTERNAL_SPAWN_PATH};
use orama_registry::PortBlock;
use tracing::{debug, warn};

use crate::{
    protocol::{SpawnCommand, SpawnResponse},
    service::{InstanceConfig, InstanceKey},
    supervisor::{InstanceSupervisor, StopError},
};

/// State behind the host-local coordination endpoint.
pub struct InternalState {
    pub supervisor: Arc<InstanceSupervisor>,
    pub data_root: PathBuf,
    pub secret: String,
}

/// Router for the internal spawn endpoint every host exposes. This is the
/// only path by which one host instructs another to act.
pub fn internal_router(state: Arc<InternalState>) -> Router {
    Router::new()
        .route(INTERNAL_SPAWN_PATH, post(handle_spawn))
        .with_state(state)
}

async fn handle_spawn(
    State(state): State<Arc<InternalState>>,
    headers: HeaderMap,
    Json(command): Json<SpawnCommand>,
) -> impl IntoResponse {
    let presented = headers
        .get(INTERNAL_AUTH_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented != Some(state.secret.as_str()) {
        warn!(
            action = ?command.service(),
            namespace = %command.namespace(),
            "rejected internal spawn call without valid secret"
        );
        return (
            StatusCode::UNAUTHORIZED,
            Json(SpawnResponse::failure("invalid internal auth")),
        );
    }

    let response = execute_command(&state.supervisor, &state.data_root, command).await;
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(response))
}

/// Apply one typed command against the local supervisor. Shared between the
/// HTTP handler and the loopback transport.
pub async fn execute_command(
    supervisor: &InstanceSupervisor,
    data_root: &std::path::Path,
    command: SpawnCommand,
) -> SpawnResponse {
    let service = command.service();
    let namespace = command.namespace().clone();

    match command.spawn_spec() {
        Some(spec) => {
            let config = InstanceConfig::derive(
                namespace.clone(),
                service,
                spec.role,
                PortBlock::at(spec.base_port),
                &spec.peers,
                data_root,
            );
            match supervisor.spawn(config).await {
                Ok(pid) => {
                    debug!(namespace = %namespace, service = %service, pid, "spawn command applied");
                    SpawnResponse::ok(Some(pid))
                }
                Err(err) => {
                    warn!(namespace = %namespace, service = %service, error = %err, "spawn command failed");
                    SpawnResponse::failure(err.to_string())
                }
            }
        }
        None => {
            let key = InstanceKey::new(namespace.clone(), service);
            match supervisor.stop(&key).await {
                // Stopping something already gone is success, so callers can
                // retry teardown freely.
                Ok(()) | Err(StopError::AlreadyGone { .. }) => SpawnResponse::ok(None),
                Err(err @ StopError::Timeout { .. }) => {
                    warn!(namespace = %namespace, service = %service, error = %err, "stop command failed");
                    SpawnResponse::failure(err.to_string())
                }
            }
        }
    }
}
