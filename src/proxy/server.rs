// HTTP Surface
//
// One axum router: the metered JSON-RPC surface at POST /rpc (API key
// header or bearer token), a health probe, and the admin surface nested
// under /admin behind the admin key header. A background task drives the
// connection-billing cadence.

use crate::proxy::admin;
use crate::proxy::engine::ProxyEngine;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProxyEngine>,
    pub admin_key: Arc<String>,
}

/// Extract the caller's API key: `X-API-Key` or a bearer token.
fn caller_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

async fn rpc_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let api_key = caller_key(&headers).unwrap_or_default();

    let parsed: Value = match serde_json::from_str(&body) {
        Ok(parsed) => parsed,
        Err(_) => {
            let response = crate::rpc::RpcResponse::failure(
                None,
                crate::error::rpc_code::PARSE_ERROR,
                "parse error",
                None,
            );
            return (StatusCode::BAD_REQUEST, Json(serde_json::to_value(response).unwrap_or(Value::Null)));
        }
    };

    let response = state.engine.handle_rpc(&api_key, &parsed).await;

    // Metered responses ride HTTP 200; a blocking maintenance window is
    // the exception and surfaces as 503.
    let status = if response.error.is_some() && state.engine.maintenance.traffic_blocked() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(serde_json::to_value(response).unwrap_or(Value::Null)))
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let status = state.engine.maintenance.get_status();
    Json(json!({
        "status": "ok",
        "operational": status.operational,
        "healthy_backends": state.engine.balancer.healthy_count(),
        "buffer_state": state.engine.buffer.state(),
    }))
}

pub fn build_router(engine: Arc<ProxyEngine>, admin_key: &str) -> Router {
    let state = AppState {
        engine,
        admin_key: Arc::new(admin_key.to_string()),
    };

    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .nest("/admin", admin::router(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(120))),
        )
        .with_state(state)
}

/// Serve the proxy until the process is stopped. Also runs the
/// connection-billing tick at the configured cadence.
pub async fn run_server(engine: Arc<ProxyEngine>, admin_key: String, port: u16) -> crate::error::Result<()> {
    let tick_engine = engine.clone();
    let tick_seconds = engine.config.billing_tick_seconds.max(1);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(tick_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let charged = tick_engine.billing_tick();
            if charged > 0 {
                info!(sessions = charged, "connection billing tick");
            }
        }
    });

    let router = build_router(engine, &admin_key);
    let addr = format!("0.0.0.0:{}", port);
    info!(%addr, "proxy listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| crate::error::GateError::Io(format!("bind {}: {}", addr, e)))?;
    if let Err(e) = axum::serve(listener, router).await {
        warn!(error = %e, "server stopped with error");
        return Err(crate::error::GateError::Io(e.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_key_header_forms() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, "tg_abc".parse().unwrap());
        assert_eq!(caller_key(&headers).as_deref(), Some("tg_abc"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tg_xyz".parse().unwrap());
        assert_eq!(caller_key(&headers).as_deref(), Some("tg_xyz"));

        let headers = HeaderMap::new();
        assert!(caller_key(&headers).is_none());
    }
}
