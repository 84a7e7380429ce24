mod connection;
pub mod kv;
mod session;

pub use connection::ConnectionStore;
pub use session::{SessionHandle, SessionRegistry};

use crate::broadcast::{Broadcaster, Transport};
use crate::config::GatewayConfig;
use crate::llm::{LlmConfig, LlmManager};
use kv::KvStore;
use std::sync::Arc;

/// Shared gateway context handed to every event
pub struct AppState {
    pub config: GatewayConfig,
    pub connections: ConnectionStore,
    pub sessions: SessionRegistry,
    pub broadcaster: Broadcaster,
    pub llm: Option<LlmManager>,
    pub llm_config: LlmConfig,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        table: Arc<dyn KvStore>,
        transport: Arc<dyn Transport>,
        llm: Option<LlmManager>,
        llm_config: LlmConfig,
    ) -> Self {
        let connections = ConnectionStore::new(table);
        let broadcaster = Broadcaster::new(transport, connections.clone(), config.send_retry);
        Self {
            config,
            connections,
            sessions: SessionRegistry::new(),
            broadcaster,
            llm,
            llm_config,
        }
    }
}
