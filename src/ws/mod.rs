mod transport;

pub use transport::SocketRegistry;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::dispatch::{Dispatched, Dispatcher};

/// Router state shared by the WebSocket and HTTP handlers
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Dispatcher,
    pub sockets: Arc<SocketRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub name: Option<String>,
}

/// WebSocket upgrade handler.
///
/// The connection is registered before the upgrade completes. If the table
/// cannot take it the handshake fails with 503.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(server): State<ServerState>,
) -> Response {
    let connection_id = ulid::Ulid::new().to_string();
    tracing::info!(
        "WebSocket connection request: id={}, name={:?}",
        connection_id,
        params.name
    );

    if let Err(e) = server
        .dispatcher
        .on_connect(&connection_id, params.name)
        .await
    {
        tracing::error!("Rejecting connection {}: {}", connection_id, e);
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection could not be registered")
            .into_response();
    }

    let dispatcher = server.dispatcher.clone();
    let failed_id = connection_id.clone();
    ws.on_failed_upgrade(move |e| {
        tracing::warn!("Upgrade failed for {}: {}", failed_id, e);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.on_disconnect(&failed_id).await {
                tracing::error!("Cleanup of {} failed: {}", failed_id, e);
            }
        });
    })
    .on_upgrade(move |socket| handle_socket(socket, connection_id, server))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, connection_id: String, server: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = server.sockets.register(&connection_id).await;

    // Frames go out from their own task so a busy dispatcher never stalls them
    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                tracing::debug!("Writer for {} stopped", writer_id);
                break;
            }
        }
    });

    while let Some(ws_msg) = receiver.next().await {
        match ws_msg {
            Ok(Message::Text(text)) => {
                let body = text.as_str();
                tracing::debug!("Received message from {}: {}", connection_id, body);
                match server.dispatcher.on_message(&connection_id, body).await {
                    Ok(Dispatched::Started { request_id, .. }) => {
                        tracing::debug!("Streaming {} to {}", request_id, connection_id);
                    }
                    Ok(Dispatched::Cancelled { request_id }) => {
                        tracing::debug!("Cancel from {}: {:?}", connection_id, request_id);
                    }
                    Err(e) => {
                        tracing::debug!("Message from {} not dispatched: {}", connection_id, e);
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket {} closed", connection_id);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
        }
    }

    server.sockets.unregister(&connection_id).await;
    writer.abort();
    if let Err(e) = server.dispatcher.on_disconnect(&connection_id).await {
        tracing::error!("Couldn't disconnect connection {}: {}", connection_id, e);
    }
}
