//! WebSocket handler: telemetry streaming and ping/pong.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use protocol::{parse_client_message, ClientMessage, Pong};
use serde_json::json;
use tracing::{debug, info, warn};

use super::AppState;

/// Upgrades the connection and hands it to the session loop.
pub async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| handle_websocket_connection(socket, state))
}

/// One subscriber session: forwards telemetry frames, answers pings.
/// Failure to accept a frame ends the session; the broadcast channel drops
/// the receiver on its own.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState) {
    let mut rx = state.publisher.subscribe();
    let (mut sink, mut stream) = socket.split();
    info!(
        "Telemetry subscriber connected ({} active)",
        state.publisher.subscriber_count()
    );

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        // Slow consumer: skip ahead and keep streaming.
                        debug!("Subscriber lagged, skipped {skipped} frame(s)");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match parse_client_message(&text) {
                            Ok(ClientMessage::Ping) => {
                                let pong = Pong::at(Utc::now());
                                let reply = match serde_json::to_string(&pong) {
                                    Ok(r) => r,
                                    Err(_) => continue,
                                };
                                if sink.send(Message::Text(reply)).await.is_err() {
                                    break;
                                }
                            }
                            Err(_) => warn!("Unrecognized client message: {text}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    info!("Telemetry subscriber disconnected");
}

/// Liveness probe with a small diagnostic payload.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let controller = state.controller.read().await;
    Json(json!({
        "healthy": true,
        "running": controller.is_running(),
        "version": crate::VERSION,
        "subscribers": state.publisher.subscriber_count(),
    }))
}
