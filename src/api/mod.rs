//! Control Plane - REST + WebSocket surface over the running instance
//!
//! Every request is authenticated by bearer token; WebSocket upgrades may
//! pass `?token=` instead because browsers cannot set custom headers on
//! upgrade requests. An empty configured secret disables authentication.

mod handlers;
mod stream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::Json;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app::reload::ReloadCoordinator;
use crate::app::runtime::ListenerManager;
use crate::error::Result;
use crate::logbus::{LogBus, LogLevel};
use crate::tunnel::{Mode, Tracker};

/// Shared state behind every handler
#[derive(Clone)]
pub struct ApiState {
    pub secret: String,
    pub mode: Arc<RwLock<Mode>>,
    pub log_level: Arc<RwLock<LogLevel>>,
    pub coordinator: Arc<ReloadCoordinator>,
    pub tracker: Arc<Tracker>,
    pub logbus: Arc<LogBus>,
    pub listeners: Arc<ListenerManager>,
    pub config_path: Option<PathBuf>,
}

/// Assemble the API router
pub fn router(state: ApiState) -> axum::Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    axum::Router::new()
        .route("/version", get(handlers::version))
        .route("/traffic", get(stream::traffic))
        .route("/logs", get(stream::logs))
        .route(
            "/configs",
            get(handlers::get_configs)
                .patch(handlers::patch_configs)
                .put(handlers::put_configs),
        )
        .route("/proxies", get(handlers::get_proxies))
        .route(
            "/proxies/{name}",
            get(handlers::get_proxy).put(handlers::select_proxy),
        )
        .route("/proxies/{name}/delay", get(handlers::proxy_delay))
        .route("/rules", get(handlers::get_rules))
        .route(
            "/connections",
            get(stream::connections).delete(handlers::close_all_connections),
        )
        .route("/connections/{id}", delete(handlers::close_connection))
        .route("/providers/proxies", get(handlers::get_providers))
        .route("/providers/proxies/{name}", put(handlers::refresh_provider))
        .route("/metrics", get(handlers::prometheus_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(cors)
        .with_state(state)
}

/// Bearer-token authentication, with `?token=` for WebSocket upgrades
async fn authenticate(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if state.secret.is_empty() {
        return next.run(request).await;
    }

    // Browser WebSocket cannot set custom headers
    if is_websocket_upgrade(&request) {
        if let Some(token) = query_param(&request, "token") {
            if token == state.secret {
                return next.run(request).await;
            }
            return unauthorized();
        }
    }

    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match header.split_once(' ') {
        Some(("Bearer", token)) if token == state.secret => next.run(request).await,
        _ => unauthorized(),
    }
}

fn is_websocket_upgrade(request: &Request<Body>) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn query_param(request: &Request<Body>, name: &str) -> Option<String> {
    let query = request.uri().query()?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "Unauthorized"})),
    )
        .into_response()
}

/// A `{message}` error body with the given status
pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"message": message.into()}))).into_response()
}

/// Serve the control plane until shutdown
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("RESTful API listening at {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            warn!("API server shutting down");
        })
        .await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{http_request, spawn_api};

    #[tokio::test]
    async fn test_auth_required_when_secret_set() {
        // No header is a 401, the right bearer is a 200
        let (addr, _state) = spawn_api("s").await;

        let (status, body) = http_request(addr, "GET", "/version", &[], "").await;
        assert_eq!(status, 401);
        assert!(body.contains("Unauthorized"));

        let (status, _) =
            http_request(addr, "GET", "/version", &[("Authorization", "Bearer s")], "").await;
        assert_eq!(status, 200);

        let (status, _) =
            http_request(addr, "GET", "/version", &[("Authorization", "Bearer wrong")], "").await;
        assert_eq!(status, 401);

        // A malformed header is also a 401
        let (status, _) =
            http_request(addr, "GET", "/version", &[("Authorization", "Basic s")], "").await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn test_empty_secret_disables_auth() {
        let (addr, _state) = spawn_api("").await;
        let (status, body) = http_request(addr, "GET", "/version", &[], "").await;
        assert_eq!(status, 200);
        assert!(body.contains("version"));
    }

    #[tokio::test]
    async fn test_websocket_token_upgrade() {
        // Upgrade with ?token=s is accepted, wrong token refused
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (addr, _state) = spawn_api("s").await;

        for (token, expected) in [("s", "101"), ("bad", "401")] {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let request = format!(
                "GET /traffic?token={} HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
                token, addr
            );
            stream.write_all(request.as_bytes()).await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(
                head.contains(expected),
                "token {} expected {} got {}",
                token,
                expected,
                head
            );
        }
    }
}
