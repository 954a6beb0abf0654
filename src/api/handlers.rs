//! REST handlers

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::Config;
use crate::logbus::LogLevel;
use crate::outbound::{probe_group, probe_once, Outbound, ProxySet, PROBE_TIMEOUT};
use crate::tunnel::Mode;

use super::{error_response, ApiState};

pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

// === /configs ===

pub async fn get_configs(State(state): State<ApiState>) -> Json<Value> {
    let (http_port, socks_port) = state.listeners.ports();
    Json(json!({
        "port": http_port,
        "socks-port": socks_port,
        "mode": state.mode.read().name(),
        "log-level": state.log_level.read().name(),
    }))
}

/// Partial reload: mode, log level and inbound ports
pub async fn patch_configs(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(mode) = body.get("mode").and_then(Value::as_str) {
        match Mode::from_str(mode) {
            Some(mode) => *state.mode.write() = mode,
            None => {
                return error_response(StatusCode::BAD_REQUEST, format!("unknown mode: {}", mode))
            }
        }
    }

    if let Some(level) = body.get("log-level").and_then(Value::as_str) {
        match LogLevel::from_str(level) {
            Some(level) => *state.log_level.write() = level,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unknown log level: {}", level),
                )
            }
        }
    }

    if let Some(port) = body.get("port") {
        match port.as_u64() {
            Some(port) if port <= u16::MAX as u64 => {
                if let Err(e) = state.listeners.set_http_port(port as u16).await {
                    return error_response(StatusCode::BAD_REQUEST, e.to_string());
                }
            }
            _ => return error_response(StatusCode::BAD_REQUEST, "invalid port"),
        }
    }

    if let Some(port) = body.get("socks-port") {
        match port.as_u64() {
            Some(port) if port <= u16::MAX as u64 => {
                if let Err(e) = state.listeners.set_socks_port(port as u16).await {
                    return error_response(StatusCode::BAD_REQUEST, e.to_string());
                }
            }
            _ => return error_response(StatusCode::BAD_REQUEST, "invalid socks-port"),
        }
    }

    StatusCode::NO_CONTENT.into_response()
}

/// Full reload from a config path. A rejected config leaves the previous
/// snapshots active.
pub async fn put_configs(
    State(state): State<ApiState>,
    Query(_params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let path = body
        .get("path")
        .and_then(Value::as_str)
        .map(std::path::PathBuf::from)
        .or_else(|| state.config_path.clone());
    let Some(path) = path else {
        return error_response(StatusCode::BAD_REQUEST, "no config path");
    };

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let (rules, proxies, resolver) = match crate::app::runtime::build_snapshots(&config) {
        Ok(parts) => parts,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    state.coordinator.swap_proxies(proxies);
    state.coordinator.swap_rules(rules);
    state.coordinator.swap_resolver(resolver);
    StatusCode::NO_CONTENT.into_response()
}

// === /proxies ===

/// One proxy or group as the UI sees it
fn proxy_json(set: &ProxySet, outbound: &Outbound) -> Value {
    let mut body = json!({
        "name": outbound.name(),
        "type": outbound.kind().name(),
        "alive": outbound.alive(),
        "udp": outbound.udp_supported(),
        "history": latency_history(set, outbound.name()),
    });
    if let Some(group) = outbound.as_group() {
        body["now"] = json!(group.now(set));
        body["all"] = json!(group.children());
    }
    body
}

/// Probe history recorded by whichever group watches this outbound
fn latency_history(set: &ProxySet, name: &str) -> Value {
    for outbound in set.groups() {
        if let Some(group) = outbound.as_group() {
            if let Some(ms) = group.latency_of(name) {
                return json!([{ "delay": ms }]);
            }
        }
    }
    json!([])
}

pub async fn get_proxies(State(state): State<ApiState>) -> Json<Value> {
    let set = state.coordinator.proxies.load();
    let mut proxies = serde_json::Map::new();
    for outbound in set.iter() {
        proxies.insert(outbound.name().to_string(), proxy_json(&set, outbound));
    }
    Json(json!({ "proxies": proxies }))
}

pub async fn get_proxy(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let set = state.coordinator.proxies.load();
    match set.get(&name) {
        Some(outbound) => Json(proxy_json(&set, outbound)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown proxy: {}", name)),
    }
}

/// PUT /proxies/{name} with `{"name": child}` switches a selector
pub async fn select_proxy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let set = state.coordinator.proxies.load();
    let Some(outbound) = set.get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown proxy: {}", name));
    };
    let Some(group) = outbound.as_group() else {
        return error_response(StatusCode::BAD_REQUEST, format!("{} is not a group", name));
    };
    let Some(child) = body.get("name").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "body must carry {name}");
    };

    match group.select(child) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// GET /proxies/{name}/delay?url=&timeout= probes on demand
pub async fn proxy_delay(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let set = state.coordinator.proxies.load();
    let Some(outbound) = set.get(&name) else {
        return error_response(StatusCode::NOT_FOUND, format!("unknown proxy: {}", name));
    };

    let url = params
        .get("url")
        .cloned()
        .or_else(|| outbound.as_group().map(|g| g.probe_url().to_string()))
        .unwrap_or_else(|| crate::outbound::DEFAULT_PROBE_URL.to_string());
    let timeout = params
        .get("timeout")
        .and_then(|t| t.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(PROBE_TIMEOUT);

    let resolver = state.coordinator.resolver.load();
    match probe_once(&set, &resolver, &name, &url, timeout).await {
        Ok(delay) => Json(json!({ "delay": delay })).into_response(),
        Err(crate::error::Error::Timeout) => {
            error_response(StatusCode::REQUEST_TIMEOUT, "probe timed out")
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

// === /rules ===

pub async fn get_rules(State(state): State<ApiState>) -> Json<Value> {
    let engine = state.coordinator.rules.load();
    let rules: Vec<Value> = engine
        .rules()
        .iter()
        .map(|rule| {
            json!({
                "type": rule.kind().name(),
                "payload": rule.payload(),
                "proxy": rule.target(),
            })
        })
        .collect();
    Json(json!({ "rules": rules }))
}

// === /connections ===

pub async fn close_all_connections(State(state): State<ApiState>) -> StatusCode {
    state.tracker.close_all();
    StatusCode::NO_CONTENT
}

pub async fn close_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, "invalid connection id");
    };
    if state.tracker.close(id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(StatusCode::NOT_FOUND, format!("no connection {}", id))
    }
}

// === /providers/proxies ===

pub async fn get_providers(State(state): State<ApiState>) -> Json<Value> {
    let set = state.coordinator.proxies.load();
    let proxies: Vec<Value> = set
        .iter()
        .map(|outbound| proxy_json(&set, outbound))
        .collect();
    Json(json!({
        "providers": {
            "default": {
                "name": "default",
                "type": "Proxies",
                "vehicleType": "Compatible",
                "proxies": proxies,
            }
        }
    }))
}

/// PUT /providers/proxies/{name} forces a health-check pass
pub async fn refresh_provider(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Response {
    if name != "default" {
        return error_response(StatusCode::NOT_FOUND, format!("unknown provider: {}", name));
    }
    let set = state.coordinator.proxies.load();
    let resolver = state.coordinator.resolver.load();
    tokio::spawn(async move {
        let groups: Vec<String> = set
            .groups()
            .map(|outbound| outbound.name().to_string())
            .collect();
        for group in groups {
            probe_group(&set, &resolver, &group).await;
        }
    });
    StatusCode::NO_CONTENT.into_response()
}

// === /metrics ===

pub async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder
        .encode(&crate::metrics::REGISTRY.gather(), &mut buffer)
        .is_err()
    {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed");
    }
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{http_request, spawn_api};

    #[tokio::test]
    async fn test_get_proxies_lists_group() {
        let (addr, _state) = spawn_api("").await;
        let (status, body) = http_request(addr, "GET", "/proxies", &[], "").await;
        assert_eq!(status, 200);
        assert!(body.contains("\"G\""));
        assert!(body.contains("Selector"));
        assert!(body.contains("\"now\":\"p1\""));
    }

    #[tokio::test]
    async fn test_selector_put_roundtrip() {
        // A valid PUT switches the selector; an invalid child
        // is a 400 and leaves the selection unchanged.
        let (addr, state) = spawn_api("").await;

        let (status, _) =
            http_request(addr, "PUT", "/proxies/G", &[], r#"{"name":"p2"}"#).await;
        assert_eq!(status, 204);
        let set = state.coordinator.proxies.load();
        assert_eq!(set.get("G").unwrap().as_group().unwrap().selected(), Some("p2"));

        let (status, _) =
            http_request(addr, "PUT", "/proxies/G", &[], r#"{"name":"ghost"}"#).await;
        assert_eq!(status, 400);
        assert_eq!(set.get("G").unwrap().as_group().unwrap().selected(), Some("p2"));

        let (status, _) =
            http_request(addr, "PUT", "/proxies/missing", &[], r#"{"name":"p1"}"#).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_get_rules() {
        let (addr, _state) = spawn_api("").await;
        let (status, body) = http_request(addr, "GET", "/rules", &[], "").await;
        assert_eq!(status, 200);
        assert!(body.contains("DomainSuffix"));
        assert!(body.contains("example.com"));
        assert!(body.contains("Match"));
    }

    #[tokio::test]
    async fn test_connection_endpoints() {
        let (addr, state) = spawn_api("").await;

        // Unknown and malformed ids
        let (status, _) = http_request(
            addr,
            "DELETE",
            "/connections/00000000-0000-0000-0000-000000000000",
            &[],
            "",
        )
        .await;
        assert_eq!(status, 404);
        let (status, _) = http_request(addr, "DELETE", "/connections/not-a-uuid", &[], "").await;
        assert_eq!(status, 400);

        // Close-all on an empty tracker is fine
        let (status, _) = http_request(addr, "DELETE", "/connections", &[], "").await;
        assert_eq!(status, 204);
        assert!(state.tracker.is_empty());
    }

    #[tokio::test]
    async fn test_patch_configs_mode() {
        let (addr, state) = spawn_api("").await;

        let (status, _) =
            http_request(addr, "PATCH", "/configs", &[], r#"{"mode":"global"}"#).await;
        assert_eq!(status, 204);
        assert_eq!(*state.mode.read(), crate::tunnel::Mode::Global);

        let (status, _) =
            http_request(addr, "PATCH", "/configs", &[], r#"{"mode":"bogus"}"#).await;
        assert_eq!(status, 400);

        let (_, body) = http_request(addr, "GET", "/configs", &[], "").await;
        assert!(body.contains("\"mode\":\"global\""));
    }

    #[tokio::test]
    async fn test_proxy_delay_unknown_is_404() {
        let (addr, _state) = spawn_api("").await;
        let (status, _) =
            http_request(addr, "GET", "/proxies/ghost/delay?timeout=100", &[], "").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn test_providers() {
        let (addr, _state) = spawn_api("").await;
        let (status, body) = http_request(addr, "GET", "/providers/proxies", &[], "").await;
        assert_eq!(status, 200);
        assert!(body.contains("\"default\""));

        let (status, _) =
            http_request(addr, "PUT", "/providers/proxies/ghost", &[], "{}").await;
        assert_eq!(status, 404);
        let (status, _) =
            http_request(addr, "PUT", "/providers/proxies/default", &[], "{}").await;
        assert_eq!(status, 204);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init_metrics();
        let (addr, _state) = spawn_api("").await;
        let (status, _body) = http_request(addr, "GET", "/metrics", &[], "").await;
        assert_eq!(status, 200);
    }
}
