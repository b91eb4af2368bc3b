use std::{collections::HashMap, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use orama_provisioner::{Deprovisioner, Provisioner};
use orama_registry::{DeploymentKind, NamespaceName, RegistryStore};
use serde_json::json;
use tracing::warn;

use crate::{
    api,
    blobs::BlobStore,
    classify::{RouteClass, classify},
    credentials::{ApiKeys, WalletVerifier},
    proxy::forward,
    state::RouterState,
};

/// Everything the public front-end needs on every host.
pub struct GatewayContext {
    pub store: Arc<dyn RegistryStore>,
    pub provisioner: Arc<Provisioner>,
    pub deprovisioner: Arc<Deprovisioner>,
    pub api_keys: ApiKeys,
    pub wallet_verifier: Arc<dyn WalletVerifier>,
    pub blobs: Arc<dyn BlobStore>,
    pub routes: Arc<RouterState>,
    pub base_domain: String,
    pub http: reqwest::Client,
}

/// The public router every host serves: explicit control-plane endpoints
/// plus the classifying fallback that implements tenant and deployment
/// routing.
pub fn public_router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/v1/auth/api-key", post(api::auth_api_key))
        .route("/v1/namespace/status", get(api::namespace_status))
        .route("/v1/namespace/delete", delete(api::namespace_delete))
        .fallback(route_request)
        .with_state(ctx)
}

async fn route_request(State(ctx): State<Arc<GatewayContext>>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_owned();
    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned);
    let query = parse_query(request.uri().query());

    match classify(&path, host.as_deref(), &ctx.base_domain) {
        RouteClass::ControlPlane => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown endpoint" }))).into_response()
        }
        RouteClass::AcmeBypass => {
            // The ACME collaborator terminates these before they reach the
            // router in production; locally there is nothing to answer.
            StatusCode::NOT_FOUND.into_response()
        }
        RouteClass::DataPlane => {
            let Some(identity) = api::identity_from(&ctx, request.headers(), &query) else {
                return unauthorized();
            };
            forward_to_namespace(&ctx, &identity.namespace, request).await
        }
        RouteClass::NamespaceHost { name } => {
            let Ok(namespace) = NamespaceName::parse(name) else {
                return StatusCode::NOT_FOUND.into_response();
            };
            let Some(identity) = api::identity_from(&ctx, request.headers(), &query) else {
                return unauthorized();
            };
            // Isolation invariant: the namespace from the credentials must
            // match the namespace from the host. Mismatch is 403, never 404.
            if identity.namespace != namespace {
                warn!(
                    credential_namespace = %identity.namespace,
                    host_namespace = %namespace,
                    "cross-namespace request rejected"
                );
                return (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "api key does not belong to this namespace" })),
                )
                    .into_response();
            }
            forward_to_namespace(&ctx, &namespace, request).await
        }
        RouteClass::DeploymentHost { subdomain } => serve_deployment(&ctx, &subdomain, request).await,
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing or invalid api key" })),
    )
        .into_response()
}

/// Forward a data-plane request to the namespace's tenant gateway, balancing
/// across placements by least outstanding requests.
async fn forward_to_namespace(
    ctx: &GatewayContext,
    namespace: &NamespaceName,
    request: Request<Body>,
) -> Response {
    let Some(routes) = ctx.routes.cluster_routes(namespace).await else {
        return cluster_not_ready(namespace);
    };
    if !routes.ready {
        return cluster_not_ready(namespace);
    }
    let Some((target, _guard)) = RouterState::pick_target(&routes) else {
        return cluster_not_ready(namespace);
    };
    forward(&ctx.http, &target.base_url(), request).await
}

fn cluster_not_ready(namespace: &NamespaceName) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": format!("namespace '{namespace}' has no ready cluster") })),
    )
        .into_response()
}

/// Rule 4: deployment hosts read only the registry and the blob store, so
/// static content keeps serving even while the namespace cluster is down.
async fn serve_deployment(
    ctx: &GatewayContext,
    subdomain: &str,
    request: Request<Body>,
) -> Response {
    let Some(deployment) = ctx.routes.deployment(subdomain).await else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match deployment.kind {
        DeploymentKind::Static => match ctx.blobs.get(&deployment.content_id).await {
            Ok(bytes) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                bytes,
            )
                .into_response(),
            Err(err) => {
                warn!(subdomain, error = %err, "deployment blob unavailable");
                StatusCode::NOT_FOUND.into_response()
            }
        },
        DeploymentKind::ServerRendered => {
            // SSR bundles execute inside the namespace gateway; route there.
            let namespace = match ctx.store.namespace_by_id(&deployment.namespace_id).await {
                Ok(Some(namespace)) => namespace,
                Ok(None) => return StatusCode::NOT_FOUND.into_response(),
                Err(err) => {
                    warn!(subdomain, error = %err, "namespace lookup failed");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            };
            forward_to_namespace(ctx, &namespace.name, request).await
        }
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_owned(), value.to_owned()))
        })
        .collect()
}
