use crate::error::{GatewayError, GatewayResult};
use crate::protocol::Frame;
use crate::retry::RetryPolicy;
use crate::state::{AppState, ConnectionStore};
use crate::types::RequestId;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Failure classes of the transport's per-connection send
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum SendError {
    /// The socket is closed; authoritative
    #[error("connection gone")]
    Gone,

    #[error("transient send failure: {0}")]
    Transient(String),
}

/// Gateway send primitive
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, connection_id: &str, text: String) -> Result<(), SendError>;

    /// Whether the transport currently holds an open socket for this id
    async fn is_connected(&self, connection_id: &str) -> bool;
}

/// Delivers frames to single connections
#[derive(Clone)]
pub struct Broadcaster {
    transport: Arc<dyn Transport>,
    connections: ConnectionStore,
    retry: RetryPolicy,
    /// Last sequence accepted per request
    last_sequence: Arc<Mutex<HashMap<RequestId, u64>>>,
}

impl Broadcaster {
    pub fn new(
        transport: Arc<dyn Transport>,
        connections: ConnectionStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            connections,
            retry,
            last_sequence: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send one frame.
    ///
    /// `Gone` removes the connection row and is returned as-is. Transient
    /// failures are retried with backoff before `DeliveryFailed`.
    pub async fn send(&self, connection_id: &str, frame: &Frame) -> GatewayResult<()> {
        self.accept_sequence(frame).await?;

        let text = serde_json::to_string(frame)
            .map_err(|e| GatewayError::InvalidMessage(e.to_string()))?;
        let result = self.deliver(connection_id, text).await;

        if frame.is_final() || matches!(result, Err(GatewayError::Gone(_))) {
            self.forget(&frame.request_id).await;
        }
        result
    }

    /// Drop ordering state for a finished request
    pub async fn forget(&self, request_id: &str) {
        self.last_sequence.lock().await.remove(request_id);
    }

    async fn accept_sequence(&self, frame: &Frame) -> GatewayResult<()> {
        let mut last = self.last_sequence.lock().await;
        match last.get(&frame.request_id) {
            Some(prev) if frame.sequence <= *prev => {
                tracing::warn!(
                    "Rejecting frame {} of {}: last sent was {}",
                    frame.sequence,
                    frame.request_id,
                    prev
                );
                Err(GatewayError::OutOfOrder {
                    request_id: frame.request_id.clone(),
                    sequence: frame.sequence,
                })
            }
            _ => {
                last.insert(frame.request_id.clone(), frame.sequence);
                Ok(())
            }
        }
    }

    async fn deliver(&self, connection_id: &str, text: String) -> GatewayResult<()> {
        let attempts = self.retry.attempts;

        for attempt in 1..=attempts {
            match self.transport.send(connection_id, text.clone()).await {
                Ok(()) => return Ok(()),
                Err(SendError::Gone) => {
                    tracing::warn!("Connection {} is gone, removing it", connection_id);
                    if let Err(e) = self.connections.remove(connection_id).await {
                        tracing::error!(
                            "Failed to remove gone connection {}: {}",
                            connection_id,
                            e
                        );
                    }
                    return Err(GatewayError::Gone(connection_id.to_string()));
                }
                Err(SendError::Transient(reason)) => {
                    tracing::warn!(
                        "Send to {} failed (attempt {}/{}): {}",
                        connection_id,
                        attempt,
                        attempts,
                        reason
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }

        Err(GatewayError::DeliveryFailed {
            connection_id: connection_id.to_string(),
            attempts,
        })
    }
}

/// Remove stored connections the transport no longer holds once they are
/// older than the grace period. Also clears rows left by a previous process.
pub async fn sweep_stale_connections(state: &AppState) -> usize {
    let rows = match state.connections.list().await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::error!("Connection sweep could not list rows: {}", e);
            return 0;
        }
    };

    let grace = chrono::Duration::from_std(state.config.connection_grace)
        .unwrap_or_else(|_| chrono::Duration::seconds(30));
    let cutoff = Utc::now() - grace;
    let transport = state.broadcaster.transport();
    let mut removed = 0;

    for conn in rows {
        if conn.connected_at > cutoff || transport.is_connected(&conn.id).await {
            continue;
        }
        state.sessions.cancel_active(&conn.id).await;
        match state.connections.remove(&conn.id).await {
            Ok(()) => {
                tracing::info!("Swept stale connection {}", conn.id);
                removed += 1;
            }
            Err(e) => tracing::error!("Failed to sweep connection {}: {}", conn.id, e),
        }
    }

    removed
}

/// Spawn a background task that periodically sweeps stale connection rows
pub fn spawn_connection_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(state.config.sweep_interval).await;
            let removed = sweep_stale_connections(&state).await;
            if removed > 0 {
                tracing::info!("Connection sweep removed {} rows", removed);
            }
        }
    });
}
