//! HTTP surface: the market WebSocket endpoint and a health probe.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{Connection, Outbound};
use crate::service::FeedService;

/// Grace period for the writer to flush a close frame after a forced close.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<FeedService>,
}

impl AppState {
    pub fn new(service: Arc<FeedService>) -> Self {
        Self { service }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/market", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub subscriptions: usize,
    pub counters: BTreeMap<String, u64>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let service = &state.service;
    Json(HealthResponse {
        status: if service.is_running() { "ok" } else { "stopped" },
        connections: service.registry().len(),
        subscriptions: service.registry().subscription_count(),
        counters: service.metrics().export(),
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.service))
}

async fn handle_socket(socket: WebSocket, service: Arc<FeedService>) {
    let (conn, mut outbound) = service.connect();
    let id = conn.id();
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(Utf8Bytes::from(text.to_string())),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let end = read_frames(&service, &conn, &mut stream, &mut writer).await;

    service.disconnect(&id);
    match end {
        ReadEnd::WriterStopped => return,
        ReadEnd::Closed => {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await;
        }
        ReadEnd::ClientGone => {}
    }
    writer.abort();
}

/// Why a socket's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    /// The connection was closed from our side (eviction or shutdown).
    Closed,
    /// The writer task exited, which only happens on a failed socket write.
    WriterStopped,
    /// The client closed the socket or the read side failed.
    ClientGone,
}

async fn read_frames<S>(
    service: &FeedService,
    conn: &Connection,
    stream: &mut S,
    writer: &mut JoinHandle<()>,
) -> ReadEnd
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let id = conn.id();
    let mut closed = conn.closed();
    loop {
        tokio::select! {
            biased;

            _ = closed.wait_for(|closed| *closed) => return ReadEnd::Closed,

            _ = &mut *writer => {
                debug!(connection_id = %id, "WebSocket writer stopped");
                return ReadEnd::WriterStopped;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => service.session().handle_text(conn, text.as_str()),
                Some(Ok(Message::Binary(data))) => service.session().handle_bytes(conn, &data),
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => conn.mark_alive(),
                Some(Ok(Message::Close(_))) | None => return ReadEnd::ClientGone,
                Some(Err(e)) => {
                    debug!(connection_id = %id, error = %e, "WebSocket read error");
                    return ReadEnd::ClientGone;
                }
            },
        }
    }
}
