//! WebSocket push at `/socket`.
//!
//! Each client gets an independent cursor over the bounded event ring; a
//! slow client loses the oldest events (with a warning) instead of
//! stalling the producers.

use crate::state::AppContext;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Extension,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// WebSocket upgrade handler.
///
/// GET /socket
pub async fn socket_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

/// Handle an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    info!("WebSocket client connected");
    ctx.metrics.ws_clients.inc();

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = ctx.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            match events_rx.recv().await {
                Ok(event) => {
                    let Ok(json) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Bounded queue overflowed; the client lost the oldest
                    // events and resumes from here.
                    warn!(dropped = n, "WebSocket client lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    debug!(text = %text, "WebSocket message ignored");
                }
                Ok(Message::Close(_)) => {
                    debug!("WebSocket client sent close");
                    break;
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
                Err(e) => {
                    warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = send_task => debug!("WebSocket send task ended"),
        _ = recv_task => debug!("WebSocket receive task ended"),
    }

    ctx.metrics.ws_clients.dec();
    info!("WebSocket client disconnected");
}
