use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    response::{IntoResponse as _, Response},
};
use tracing::{debug, warn};

/// Largest request/response body the router will buffer while proxying.
const MAX_PROXY_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Forward a request to an upstream base URL, preserving method, path,
/// query, headers and body. Upstream failures surface as 502.
pub async fn forward(http: &reqwest::Client, base_url: &str, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_owned(), ToString::to_string);
    let url = format!("{base_url}{path_and_query}");

    let body = match to_bytes(body, MAX_PROXY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "failed to buffer proxy request body");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    debug!(method = %parts.method, %url, "proxying request");

    let mut upstream = http.request(parts.method.clone(), &url);
    for (name, value) in &parts.headers {
        // Hop-by-hop and length headers are recomputed by the client.
        if name == axum::http::header::HOST
            || name == axum::http::header::CONTENT_LENGTH
            || name == axum::http::header::CONNECTION
        {
            continue;
        }
        upstream = upstream.header(name, value);
    }

    let response = match upstream.body(body).send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(%url, error = %err, "upstream request failed");
            return (StatusCode::BAD_GATEWAY, "upstream unreachable").into_response();
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%url, error = %err, "failed to read upstream response");
            return (StatusCode::BAD_GATEWAY, "upstream read failed").into_response();
        }
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &headers {
        if name == axum::http::header::CONNECTION || name == axum::http::header::TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
