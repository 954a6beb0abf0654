//! Streaming endpoints
//!
//! `/traffic`, `/logs` and `/connections` speak either chunked JSON lines
//! or a WebSocket text stream, depending on upgrade negotiation. Traffic
//! and connections tick at 1 Hz; logs are event-driven.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::logbus::LogLevel;

use super::{error_response, ApiState};

/// Tick interval for traffic and connection streams
const TICK: Duration = Duration::from_secs(1);

/// `WebSocketUpgrade` only implements `FromRequestParts`, not
/// `OptionalFromRequestParts`, so `Option<WebSocketUpgrade>` can't be used
/// directly as an extractor. This wrapper restores that behavior: present
/// the upgrade when negotiated, `None` otherwise.
pub(crate) struct MaybeWsUpgrade(Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for MaybeWsUpgrade
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeWsUpgrade(
            WebSocketUpgrade::from_request_parts(parts, state).await.ok(),
        ))
    }
}

/// Wrap a line channel into a chunked JSON response
fn json_lines(rx: mpsc::Receiver<String>) -> Response {
    let stream =
        ReceiverStream::new(rx).map(|line| Ok::<Bytes, Infallible>(Bytes::from(line)));
    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .expect("static response parts are valid")
}

// === /traffic ===

pub async fn traffic(
    State(state): State<ApiState>,
    MaybeWsUpgrade(ws): MaybeWsUpgrade,
) -> Response {
    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| traffic_ws(socket, state))
            .into_response(),
        None => {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(traffic_feed(state, tx));
            json_lines(rx)
        }
    }
}

fn traffic_line(state: &ApiState) -> String {
    let (up, down) = state.tracker.rates();
    format!("{}\n", json!({ "up": up, "down": down }))
}

async fn traffic_feed(state: ApiState, tx: mpsc::Sender<String>) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;
        if tx.send(traffic_line(&state)).await.is_err() {
            break;
        }
    }
}

async fn traffic_ws(mut socket: WebSocket, state: ApiState) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;
        let line = traffic_line(&state);
        if socket
            .send(Message::Text(line.trim_end().to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }
}

// === /connections ===

pub async fn connections(
    State(state): State<ApiState>,
    MaybeWsUpgrade(ws): MaybeWsUpgrade,
) -> Response {
    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| connections_ws(socket, state))
            .into_response(),
        None => {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(connections_feed(state, tx));
            json_lines(rx)
        }
    }
}

fn connections_line(state: &ApiState) -> String {
    let (up_total, down_total) = state.tracker.totals();
    let snapshot = state.tracker.snapshot();
    format!(
        "{}\n",
        json!({
            "uploadTotal": up_total,
            "downloadTotal": down_total,
            "connections": snapshot,
        })
    )
}

async fn connections_feed(state: ApiState, tx: mpsc::Sender<String>) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;
        if tx.send(connections_line(&state)).await.is_err() {
            break;
        }
    }
}

async fn connections_ws(mut socket: WebSocket, state: ApiState) {
    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;
        let line = connections_line(&state);
        if socket
            .send(Message::Text(line.trim_end().to_string().into()))
            .await
            .is_err()
        {
            break;
        }
    }
}

// === /logs ===

pub async fn logs(
    State(state): State<ApiState>,
    MaybeWsUpgrade(ws): MaybeWsUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let level_text = params.get("level").map(String::as_str).unwrap_or("info");
    let Some(level) = LogLevel::from_str(level_text) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            format!("unknown log level: {}", level_text),
        );
    };

    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| logs_ws(socket, state, level))
            .into_response(),
        None => {
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(logs_feed(state, level, tx));
            json_lines(rx)
        }
    }
}

async fn logs_feed(state: ApiState, level: LogLevel, tx: mpsc::Sender<String>) {
    let subscription = state.logbus.subscribe(level);
    while let Some(event) = subscription.recv().await {
        let Ok(line) = serde_json::to_string(&event) else {
            continue;
        };
        if tx.send(format!("{}\n", line)).await.is_err() {
            break;
        }
    }
}

async fn logs_ws(mut socket: WebSocket, state: ApiState, level: LogLevel) {
    let subscription = state.logbus.subscribe(level);
    while let Some(event) = subscription.recv().await {
        let Ok(line) = serde_json::to_string(&event) else {
            continue;
        };
        if socket.send(Message::Text(line.into())).await.is_err() {
            break;
        }
    }
}
