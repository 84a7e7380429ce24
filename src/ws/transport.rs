use crate::broadcast::{SendError, Transport};
use crate::types::ConnectionId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Outbound frames buffered per socket before sends start to back off
const OUTBOUND_CAPACITY: usize = 64;

/// In-process gateway transport: one bounded outbound queue per open socket.
/// The socket's writer task drains the queue.
pub struct SocketRegistry {
    sockets: RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>,
    send_timeout: Duration,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl SocketRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            sockets: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Open the outbound queue for a socket
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.sockets
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.sockets.write().await.remove(connection_id);
    }

    pub async fn len(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Transport for SocketRegistry {
    async fn send(&self, connection_id: &str, text: String) -> Result<(), SendError> {
        let sender = self.sockets.read().await.get(connection_id).cloned();
        let Some(sender) = sender else {
            return Err(SendError::Gone);
        };

        match sender.send_timeout(text, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(SendError::Gone),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(SendError::Transient("outbound queue full".to_string()))
            }
        }
    }

    async fn is_connected(&self, connection_id: &str) -> bool {
        self.sockets
            .read()
            .await
            .get(connection_id)
            .is_some_and(|tx| !tx.is_closed())
    }
}
