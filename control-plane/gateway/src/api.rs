use std::{collections::HashMap, sync::Arc};

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use orama_config::{
    PlanTier,
    constants::{PROVISION_ESTIMATE_SECS, STATUS_POLL_PATH},
};
use orama_provisioner::ProvisionError;
use orama_registry::{
    ClusterId, ClusterState, NamespaceName, Placement, ReadinessVector, RegistryStore as _,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{credentials::Identity, router::GatewayContext};

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub wallet: String,
    pub nonce: String,
    pub signature: String,
    pub namespace: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub cluster_id: ClusterId,
    pub namespace: NamespaceName,
    pub status: ClusterState,
    pub nodes: Vec<String>,
    pub sql_ready: bool,
    pub cache_ready: bool,
    pub gateway_ready: bool,
    pub dns_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn poll_url(cluster_id: &ClusterId) -> String {
    format!("{STATUS_POLL_PATH}?id={cluster_id}")
}

/// `POST /v1/auth/api-key`. Wallet signature verification is delegated to
/// the auth collaborator; the control plane decides what the namespace needs:
/// nothing (`default`), an existing cluster, or a fresh provisioning run.
pub async fn auth_api_key(
    State(ctx): State<Arc<GatewayContext>>,
    Json(request): Json<AuthRequest>,
) -> Response {
    if let Err(err) = ctx
        .wallet_verifier
        .verify(&request.wallet, &request.nonce, &request.signature)
        .await
    {
        warn!(wallet = %request.wallet, error = %err, "wallet verification failed");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": err.to_string() })))
            .into_response();
    }

    let namespace = match NamespaceName::parse(request.namespace.clone()) {
        Ok(namespace) => namespace,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
                .into_response();
        }
    };

    if namespace.is_default() {
        let api_key = ctx.api_keys.issue(&namespace, &request.wallet);
        return (
            StatusCode::OK,
            Json(json!({
                "api_key": api_key,
                "namespace": namespace,
                "wallet": request.wallet,
            })),
        )
            .into_response();
    }

    let record = match ctx
        .provisioner
        .request_cluster(&namespace, &request.wallet, PlanTier::default())
        .await
    {
        Ok(record) => record,
        Err(ProvisionError::DefaultNamespace) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid namespace" })))
                .into_response();
        }
        Err(ProvisionError::Registry(err)) => {
            warn!(namespace = %namespace, error = %err, "cluster request failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    match record.state {
        ClusterState::Ready => {
            let api_key = ctx.api_keys.issue(&namespace, &request.wallet);
            (
                StatusCode::OK,
                Json(json!({
                    "api_key": api_key,
                    "namespace": namespace,
                    "wallet": request.wallet,
                    "cluster_id": record.id,
                })),
            )
                .into_response()
        }
        ClusterState::Requested | ClusterState::Provisioning => {
            info!(namespace = %namespace, cluster = %record.id, "provisioning in progress");
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "provisioning",
                    "cluster_id": record.id,
                    "poll_url": poll_url(&record.id),
                    "estimated_time_seconds": PROVISION_ESTIMATE_SECS,
                })),
            )
                .into_response()
        }
        ClusterState::Failed => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "failed",
                "cluster_id": record.id,
                "error": record.reason.unwrap_or_else(|| "provisioning failed".to_owned()),
            })),
        )
            .into_response(),
        ClusterState::Deprovisioning | ClusterState::Gone => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": record.state,
                "cluster_id": record.id,
                "error": "namespace is being torn down",
            })),
        )
            .into_response(),
    }
}

/// `GET /v1/namespace/status?id={cluster_id}`. The poll target every 202
/// response points at.
pub async fn namespace_status(
    State(ctx): State<Arc<GatewayContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(id) = params.get("id") else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing id" }))).into_response();
    };
    let cluster_id = ClusterId::from_string(id.clone());

    let cluster = match ctx.store.cluster(&cluster_id).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let namespace = match ctx.store.namespace_by_id(&cluster.namespace_id).await {
        Ok(Some(namespace)) => namespace,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let placements = ctx.store.placements(&cluster_id).await.unwrap_or_default();
    let readiness = ReadinessVector::from_placements(&placements, cluster.dns_ready);

    Json(StatusResponse {
        cluster_id,
        namespace: namespace.name,
        status: cluster.state,
        nodes: placements
            .iter()
            .map(|placement: &Placement| placement.host_id.to_string())
            .collect(),
        sql_ready: readiness.sql,
        cache_ready: readiness.cache,
        gateway_ready: readiness.gateway,
        dns_ready: readiness.dns,
        error: cluster.reason,
    })
    .into_response()
}

/// `DELETE /v1/namespace/delete`. The namespace comes from the API key, never
/// from the request body. Teardown continues in the background; clients poll
/// the status endpoint until the cluster reports `gone`.
pub async fn namespace_delete(
    State(ctx): State<Arc<GatewayContext>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(identity) = identity_from(&ctx, &headers, &params) else {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing or invalid api key" })))
            .into_response();
    };

    if identity.namespace.is_default() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "the default namespace cannot be deleted" })),
        )
            .into_response();
    }

    let namespace = match ctx.store.namespace_by_name(&identity.namespace).await {
        Ok(Some(namespace)) => namespace,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    let cluster = match ctx.store.latest_cluster_for_namespace(&namespace.id).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };

    if !matches!(cluster.state, ClusterState::Ready | ClusterState::Failed) {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("cluster in state '{}' cannot be deleted", cluster.state),
            })),
        )
            .into_response();
    }

    info!(namespace = %identity.namespace, cluster = %cluster.id, "namespace deletion requested");
    let deprovisioner = Arc::clone(&ctx.deprovisioner);
    let cluster_id = cluster.id.clone();
    tokio::spawn(async move {
        if let Err(err) = deprovisioner.deprovision(&cluster_id).await {
            warn!(cluster = %cluster_id, error = %err, "deprovisioning failed");
        }
    });

    (
        StatusCode::OK,
        Json(json!({
            "status": "deleted",
            "namespace": identity.namespace,
        })),
    )
        .into_response()
}

/// Identity from `Authorization: Bearer`, `X-API-Key`, or `?api_key=`.
pub fn identity_from(
    ctx: &GatewayContext,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Option<Identity> {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let header_key = headers.get("X-API-Key").and_then(|value| value.to_str().ok());
    let query_key = query.get("api_key").map(String::as_str);

    let token = bearer.or(header_key).or(query_key)?;
    ctx.api_keys.resolve(token)
}
