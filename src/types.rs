use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque ID types
pub type ConnectionId = String;
pub type RequestId = String;

/// Display name used when the upgrade request carries no `name` parameter
pub const DEFAULT_USER_NAME: &str = "guest";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// A row of the connection table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub connected_at: DateTime<Utc>,
    pub state: ConnectionState,
    #[serde(default = "default_user_name")]
    pub user_name: String,
}

fn default_user_name() -> String {
    DEFAULT_USER_NAME.to_string()
}

impl Connection {
    /// A freshly opened connection stamped with the current time
    pub fn open(id: impl Into<ConnectionId>, user_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            connected_at: Utc::now(),
            state: ConnectionState::Open,
            user_name: user_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(default_user_name),
        }
    }
}

/// Why a session ended in `Failed`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", content = "code", rename_all = "snake_case")]
pub enum FailureReason {
    /// Provider raised an error; carries the sanitized error code only
    Provider(String),
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Pending,
    Streaming,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed(_) | SessionState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}
