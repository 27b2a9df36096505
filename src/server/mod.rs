//! HTTP surface: health and validator endpoints, Prometheus metrics, and
//! the client-facing transaction WebSocket.

mod hub;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error_handling::PipelineStats;
use crate::transaction::Listener;
use crate::validator::Fetcher;

pub use hub::Hub;

/// Shared state behind every handler.
pub struct AppState {
    pub fetcher: Arc<Fetcher>,
    pub listener: Arc<Listener>,
    pub hub: Arc<Hub>,
    pub stats: Arc<PipelineStats>,
    pub allowed_origins: Vec<String>,
}

/// Builds the router with CORS configured from the exact-match origin
/// allow-list.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/validators", get(handle_validators))
        .route("/network-health", get(handle_network_health))
        .route("/transactions", get(handle_transactions_ws))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            cors_middleware,
        ))
        .with_state(state)
}

/// CORS on every response: `Access-Control-Allow-Origin` echoes the
/// request origin only on an exact allow-list match; the remaining CORS
/// headers always go out. Preflight short-circuits with 204.
async fn cors_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allowed_origin = origin.filter(|origin| {
        state
            .allowed_origins
            .iter()
            .any(|candidate| candidate == origin)
    });

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut(), allowed_origin.as_deref());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut(), allowed_origin.as_deref());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap, allowed_origin: Option<&str>) {
    if let Some(origin) = allowed_origin {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Content-Type, Content-Length, Accept-Encoding, Authorization, Accept, Origin, Cache-Control, X-Requested-With",
        ),
    );
}

/// Binds and serves until the cancellation token fires. A bind failure is
/// fatal to the process.
pub async fn serve(
    state: Arc<AppState>,
    listen_addr: &str,
    listen_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state);
    let addr = format!("{listen_addr}:{listen_port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind HTTP server to {addr}"))?;

    info!("HTTP server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server error")?;
    Ok(())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "validators_count": state.fetcher.get_all().len(),
        "last_validator_update": state.fetcher.get_last_update().map(|t| t.to_rfc3339()),
        "transaction_listener_active": state.listener.is_subscribed(),
        "websocket_clients": state.hub.client_count(),
        "min_payment_drops": state.listener.min_payment_drops(),
    }))
}

async fn handle_validators(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let validators = state.fetcher.get_all();
    Json(json!({
        "count": validators.len(),
        "validators": validators,
        "timestamp": state.fetcher.get_last_update().map(|t| t.to_rfc3339()),
    }))
}

async fn handle_network_health(State(state): State<Arc<AppState>>) -> Response {
    match state.fetcher.get_server_status().await {
        Ok(server) => Json(json!({
            "server": server,
            "websocket_clients": state.hub.client_count(),
            "transaction_listener_active": state.listener.is_subscribed(),
        }))
        .into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("{err:#}") })),
        )
            .into_response(),
    }
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.stats.render_prometheus(),
    )
        .into_response()
}

async fn handle_transactions_ws(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    // The origin gate comes first so a disallowed caller learns nothing
    // about the upgrade mechanics.
    if !origin_allowed(&headers, &state.allowed_origins) {
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "websocket upgrade required").into_response();
    };
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| ws::handle_socket(socket, hub))
}

/// Exact-match check of the `Origin` header against the allow-list.
fn origin_allowed(headers: &HeaderMap, allowed: &[String]) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    allowed.iter().any(|candidate| candidate == origin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_check_is_exact_match() {
        let allowed = vec![
            "http://localhost:3000".to_string(),
            "https://app.example".to_string(),
        ];

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, "http://localhost:3000".parse().unwrap());
        assert!(origin_allowed(&headers, &allowed));

        // Prefixes, subdomains, and schemes do not match loosely.
        headers.insert(header::ORIGIN, "http://localhost:3000.evil".parse().unwrap());
        assert!(!origin_allowed(&headers, &allowed));
        headers.insert(header::ORIGIN, "https://localhost:3000".parse().unwrap());
        assert!(!origin_allowed(&headers, &allowed));

        // A request without an Origin header is rejected.
        headers.remove(header::ORIGIN);
        assert!(!origin_allowed(&headers, &allowed));
    }
}
