use crate::types::ConnectionId;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors surfaced by the connection registry and streaming core
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GatewayError {
    #[error("Connection store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    #[error("Connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("Connection {0} already has an active session")]
    SessionBusy(ConnectionId),

    #[error("No route for action '{0}'")]
    UnroutableAction(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Delivery to {connection_id} failed after {attempts} attempts")]
    DeliveryFailed {
        connection_id: ConnectionId,
        attempts: u32,
    },

    #[error("Connection {0} is gone")]
    Gone(ConnectionId),

    #[error("Frame {sequence} for request {request_id} arrived out of order")]
    OutOfOrder { request_id: String, sequence: u64 },
}

impl GatewayError {
    /// Code placed in Error frames; never includes internal detail
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::UnknownConnection(_) | GatewayError::NotFound(_) => "unknown_connection",
            GatewayError::SessionBusy(_) => "session_busy",
            GatewayError::UnroutableAction(_) => "unroutable_action",
            GatewayError::InvalidMessage(_) => "invalid_message",
            GatewayError::DeliveryFailed { .. } => "delivery_failed",
            GatewayError::Gone(_) => "gone",
            GatewayError::OutOfOrder { .. } => "out_of_order",
        }
    }
}
