use super::kv::{KvStore, StoreError};
use crate::error::{GatewayError, GatewayResult};
use crate::types::Connection;
use std::sync::Arc;

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::StoreUnavailable(e.to_string())
    }
}

/// Registry of currently-open client connections, keyed by connection id
#[derive(Clone)]
pub struct ConnectionStore {
    backend: Arc<dyn KvStore>,
}

impl ConnectionStore {
    pub fn new(backend: Arc<dyn KvStore>) -> Self {
        Self { backend }
    }

    /// Idempotent upsert
    pub async fn put(&self, connection: &Connection) -> GatewayResult<()> {
        let value = serde_json::to_value(connection)
            .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
        self.backend.put(&connection.id, value).await?;
        Ok(())
    }

    /// Idempotent delete; an absent row counts as success
    pub async fn remove(&self, id: &str) -> GatewayResult<()> {
        self.backend.delete(id).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> GatewayResult<Connection> {
        let value = self
            .backend
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        serde_json::from_value(value).map_err(|e| {
            tracing::error!("Corrupt connection row {}: {}", id, e);
            GatewayError::NotFound(id.to_string())
        })
    }

    /// Liveness check run before every frame.
    ///
    /// A store error reports the connection as live; the transport's `Gone`
    /// is the authority on closed sockets.
    pub async fn exists(&self, id: &str) -> bool {
        match self.backend.get(id).await {
            Ok(row) => row.is_some(),
            Err(e) => {
                tracing::warn!("Liveness check for {} hit store error: {}", id, e);
                true
            }
        }
    }

    /// Every stored row; unreadable rows are skipped
    pub async fn list(&self) -> GatewayResult<Vec<Connection>> {
        let rows = self.backend.scan().await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_value(value) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!("Skipping unreadable connection row {}: {}", key, e);
                    None
                }
            })
            .collect())
    }

    pub async fn count(&self) -> GatewayResult<usize> {
        Ok(self.backend.scan().await?.len())
    }
}
