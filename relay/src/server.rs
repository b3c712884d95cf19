use std::{future::Future, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderName, HeaderValue, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::Utc;
use codedropx_common::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::{
    config::RelayConfig,
    registry::{PeerDirectory, SessionRegistry},
    sweeper::spawn_sweeper,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    started_at: Arc<Instant>,
}

impl AppState {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            registry: SessionRegistry::new(PeerDirectory::new(), config.session_ttl()),
            started_at: Arc::new(Instant::now()),
        }
    }
}

pub fn router(state: AppState, config: &RelayConfig) -> Router {
    let router = Router::new()
        .route("/ws", get(upgrade))
        .route("/health", get(health))
        .with_state(state);

    if config.security_headers {
        router.layer(middleware::map_response(security_headers))
    } else {
        router
    }
}

/// Serves the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, config: RelayConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(&config);
    let sweeper = spawn_sweeper(state.registry.clone(), config.sweep_interval());
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("Relay listening on {}", addr);

    let result = axum::serve(listener, router(state, &config))
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server failed");
    sweeper.abort();
    info!("Relay stopped");
    result
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "timestamp": Utc::now().to_rfc3339(),
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

async fn security_headers(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    response
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.registry))
}

async fn handle_socket(socket: WebSocket, registry: SessionRegistry) {
    let (mut sender, mut receiver) = socket.split();
    let (peer_id, mut rx) = registry.peers().register();
    info!(peer = %peer_id, "Client connected");

    loop {
        tokio::select! {
            biased;
            Some(message) = rx.recv() => {
                if send_message(&mut sender, &message).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                debug!(peer = %peer_id, "Relay <- {}", text);
                                registry.handle(&peer_id, message);
                            }
                            Err(err) => {
                                warn!(peer = %peer_id, "Invalid message: {}", err);
                                let reply = ServerMessage::SessionError {
                                    message: format!("Invalid message: {err}"),
                                };
                                if send_message(&mut sender, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    registry.disconnect(&peer_id);
    registry.peers().remove(&peer_id);
    info!(peer = %peer_id, "Client disconnected");
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}
