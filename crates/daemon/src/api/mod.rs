// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Local HTTP/WebSocket API.
//!
//! Read-current, stream-changes, aggregated cluster views, and the
//! wait-for endpoint. Binding is the one fatal step; everything behind a
//! connected client is best-effort, and a client that stops reading just
//! loses its stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::expose::Exposer;
use crate::state::{StateFrame, StateManager};

const GLOBAL_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WAIT_TIMEOUT: u64 = 60;

/// Dependencies shared by every handler.
pub struct ApiContext {
    pub state: StateManager,
    pub exposer: Option<Arc<dyn Exposer>>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("http server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// A bound, not yet serving, API listener.
pub struct BoundApi {
    pub local_addr: SocketAddr,
    listener: TcpListener,
    router: Router,
    cancel: CancellationToken,
}

/// Bind the listener. A busy port is fatal to startup.
pub async fn bind(addr: SocketAddr, ctx: ApiContext) -> Result<BoundApi, ApiError> {
    let cancel = ctx.cancel.clone();
    let mut router = Router::new()
        .route("/", get(root))
        .route("/v1/state", get(read_state))
        .route("/v1/state-stream", get(state_stream))
        .route("/v1/global-state", get(global_state))
        .route("/v1/global-state-stream", get(global_state_stream))
        .route("/v1/wait-for", get(wait_for))
        .with_state(Arc::new(ctx));

    // Development convenience: serve dashboard assets straight from disk.
    if let Ok(assets) = std::env::var("LIVE_UI") {
        info!(directory = %assets, "serving UI assets from disk");
        router = router.nest_service("/ui", tower_http::services::ServeDir::new(assets));
    }

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ApiError::Bind { addr, source })?;
    let local_addr = listener.local_addr().map_err(ApiError::Serve)?;
    info!(address = %local_addr, "starting HTTP");

    Ok(BoundApi { local_addr, listener, router, cancel })
}

impl BoundApi {
    /// Serve until the daemon's cancellation token fires.
    pub async fn serve(self) -> Result<(), ApiError> {
        let cancel = self.cancel;
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(ApiError::Serve)
    }
}

async fn root() -> &'static str {
    "Welcome to moor"
}

async fn read_state(State(ctx): State<Arc<ApiContext>>) -> Json<StateFrame> {
    Json(ctx.state.read_current().await)
}

async fn state_stream(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
) -> Response {
    ws.on_upgrade(move |socket| stream_local(socket, ctx))
}

async fn stream_local(socket: WebSocket, ctx: Arc<ApiContext>) {
    let Some((initial, mut frames)) = ctx.state.subscribe().await else {
        return;
    };
    let (mut sink, mut client) = socket.split();

    if send_json(&mut sink, &initial).await.is_err() {
        return;
    }
    loop {
        tokio::select! {
            incoming = client.next() => match incoming {
                // Any close (or error) from the client ends the stream.
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            },
            frame = frames.recv() => match frame {
                Ok(frame) => {
                    if send_json(&mut sink, &frame).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "state-stream client lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

async fn global_state(State(ctx): State<Arc<ApiContext>>) -> Response {
    let Some(exposer) = ctx.exposer.clone() else {
        return no_exposer();
    };
    let cancel = ctx.cancel.child_token();
    let mut states = exposer.receive_states(cancel.clone());
    let first = tokio::time::timeout(GLOBAL_READ_TIMEOUT, states.recv()).await;
    cancel.cancel();
    match first {
        Ok(Some(records)) => Json(records).into_response(),
        Ok(None) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

async fn global_state_stream(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<ApiContext>>,
) -> Response {
    let Some(exposer) = ctx.exposer.clone() else {
        return no_exposer();
    };
    ws.on_upgrade(move |socket| stream_global(socket, ctx, exposer))
}

async fn stream_global(socket: WebSocket, ctx: Arc<ApiContext>, exposer: Arc<dyn Exposer>) {
    let cancel = ctx.cancel.child_token();
    let mut states = exposer.receive_states(cancel.clone());
    let (mut sink, mut client) = socket.split();

    loop {
        tokio::select! {
            incoming = client.next() => match incoming {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            },
            records = states.recv() => match records {
                Some(records) => {
                    if send_json(&mut sink, &records).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
    cancel.cancel();
}

async fn send_json<T: serde::Serialize>(
    sink: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    sink.send(Message::Text(text.into())).await
}

fn no_exposer() -> Response {
    (StatusCode::NOT_IMPLEMENTED, "no exposer configured").into_response()
}

#[derive(Debug, Deserialize)]
struct WaitForQuery {
    scope: Option<String>,
    service: Option<String>,
    image: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum WaitScope {
    Local,
    Global,
}

#[derive(Debug, PartialEq, Eq)]
struct WaitParams {
    scope: WaitScope,
    service: String,
    image: String,
    timeout: Duration,
}

fn parse_wait_query(query: WaitForQuery) -> Result<WaitParams, String> {
    let scope = match query.scope.as_deref() {
        None | Some("local") => WaitScope::Local,
        Some("global") => WaitScope::Global,
        Some(other) => return Err(format!("bad scope {:?}", other)),
    };
    let service = query.service.filter(|s| !s.is_empty()).ok_or("service is required")?;
    let image = query.image.filter(|s| !s.is_empty()).ok_or("image is required")?;
    let timeout = match query.timeout.as_deref() {
        None => DEFAULT_WAIT_TIMEOUT,
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => secs,
            _ => return Err(format!("bad timeout {:?}", raw)),
        },
    };
    Ok(WaitParams { scope, service, image, timeout: Duration::from_secs(timeout) })
}

async fn wait_for(
    Query(query): Query<WaitForQuery>,
    State(ctx): State<Arc<ApiContext>>,
) -> Response {
    let params = match parse_wait_query(query) {
        Ok(params) => params,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };
    debug!(service = %params.service, image = %params.image, scope = ?params.scope, "wait-for");

    let satisfied = match params.scope {
        WaitScope::Local => {
            tokio::time::timeout(
                params.timeout,
                wait_local(&ctx.state, &params.service, &params.image),
            )
            .await
        }
        WaitScope::Global => {
            let Some(exposer) = ctx.exposer.clone() else {
                return no_exposer();
            };
            let cancel = ctx.cancel.child_token();
            let result = tokio::time::timeout(
                params.timeout,
                wait_global(exposer, cancel.clone(), &params.service, &params.image),
            )
            .await;
            cancel.cancel();
            result
        }
    };

    match satisfied {
        Ok(true) => Json(serde_json::json!({})).into_response(),
        // The underlying stream died; the daemon is shutting down.
        Ok(false) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(_) => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

async fn wait_local(state: &StateManager, service: &str, image: &str) -> bool {
    let Some((initial, mut frames)) = state.subscribe().await else {
        return false;
    };
    if frame_matches(&initial, service, image) {
        return true;
    }
    loop {
        match frames.recv().await {
            Ok(frame) => {
                if frame_matches(&frame, service, image) {
                    return true;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}

fn frame_matches(frame: &StateFrame, service: &str, image: &str) -> bool {
    frame.get(service).and_then(|snapshot| snapshot.deployed_image()) == Some(image)
}

async fn wait_global(
    exposer: Arc<dyn Exposer>,
    cancel: CancellationToken,
    service: &str,
    image: &str,
) -> bool {
    let mut states = exposer.receive_states(cancel);
    while let Some(records) = states.recv().await {
        let matched = records.iter().any(|record| {
            record.service == service
                && record.decode().and_then(|s| s.deployed_image().map(String::from))
                    == Some(image.to_string())
        });
        if matched {
            return true;
        }
    }
    false
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
