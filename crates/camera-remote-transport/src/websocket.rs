//! WebSocket hosting for remote camera sessions.
//!
//! Each accepted socket gets its own `SessionEndpoint`; text frames carry
//! JSON `ClientMessage`s in and `ServerMessage`s out.

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    dispatch::{ServerContext, serve_connection},
    protocol::{ClientMessage, ServerMessage},
};

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(context): State<ServerContext>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: ServerContext) {
    let (mut sender, receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let errors = tx.clone();
    let inbound = receiver
        .take_while(|msg| {
            let open = match msg {
                Ok(Message::Close(_)) => false,
                Ok(_) => true,
                Err(e) => {
                    tracing::error!("WebSocket error: {e}");
                    false
                }
            };
            futures::future::ready(open)
        })
        .filter_map(move |msg| {
            let parsed = match msg {
                Ok(Message::Text(text)) => parse_frame(text.as_str(), &errors),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => parse_frame(text, &errors),
                    Err(_) => None,
                },
                _ => None,
            };
            futures::future::ready(parsed)
        });

    serve_connection(Box::pin(inbound), tx, context).await;
    send_task.abort();
}

fn parse_frame(text: &str, errors: &mpsc::UnboundedSender<ServerMessage>) -> Option<ClientMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("Invalid client message: {e}");
            let _ = errors.send(ServerMessage::Error {
                message: format!("Invalid message: {e}"),
            });
            None
        }
    }
}

/// Create the WebSocket router, serving sessions at `/ws`.
///
/// # Example
/// ```ignore
/// let app = create_ws_router(ServerContext::new(factory, host));
/// ```
#[must_use]
pub fn create_ws_router(context: ServerContext) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(context)
}
