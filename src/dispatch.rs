//! Gateway event routing
//!
//! The dispatcher keeps no state of its own: every event reaches the
//! connection table and session registry through the `AppState` it carries.

use crate::config::BusyPolicy;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{Action, Frame, InboundMessage, ModelParameters};
use crate::state::{AppState, SessionHandle};
use crate::stream::StreamSession;
use crate::types::{Connection, RequestId, SessionState};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// How many times a replacing request retries after losing a claim race
const REPLACE_ATTEMPTS: u32 = 3;

/// What a message event turned into
#[derive(Debug)]
pub enum Dispatched {
    /// A new session is streaming; the task resolves to its terminal state
    Started {
        request_id: RequestId,
        session: Arc<SessionHandle>,
        task: JoinHandle<SessionState>,
    },
    /// A `cancel` action; carries the cancelled request, if one was active
    Cancelled { request_id: Option<RequestId> },
}

#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<AppState>,
}

impl Dispatcher {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Register a new connection, retrying store failures with backoff.
    /// An error here must fail the handshake.
    pub async fn on_connect(
        &self,
        connection_id: &str,
        user_name: Option<String>,
    ) -> GatewayResult<Connection> {
        let connection = Connection::open(connection_id, user_name);
        let policy = self.state.config.store_retry;

        let mut attempt = 1;
        loop {
            match self.state.connections.put(&connection).await {
                Ok(()) => {
                    tracing::info!(
                        "Added connection {} for user {}",
                        connection.id,
                        connection.user_name
                    );
                    return Ok(connection);
                }
                Err(e) if attempt < policy.attempts => {
                    tracing::warn!(
                        "Couldn't add connection {} (attempt {}/{}): {}",
                        connection_id,
                        attempt,
                        policy.attempts,
                        e
                    );
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Couldn't add connection {}: {}", connection_id, e);
                    return Err(e);
                }
            }
        }
    }

    /// Cancel the connection's active session, then drop its row.
    /// The order lets a racing token see the removal and stop on its own.
    pub async fn on_disconnect(&self, connection_id: &str) -> GatewayResult<()> {
        if let Some(session) = self.state.sessions.cancel_active(connection_id).await {
            tracing::info!(
                "Cancelled session {} of disconnecting {}",
                session.request_id(),
                connection_id
            );
        }

        self.state.connections.remove(connection_id).await?;
        tracing::info!("Disconnected connection {}", connection_id);
        Ok(())
    }

    /// Route a raw client message by its `action`
    pub async fn on_message(
        &self,
        connection_id: &str,
        raw_body: &str,
    ) -> GatewayResult<Dispatched> {
        match self.state.connections.get(connection_id).await {
            Ok(_) => {}
            Err(GatewayError::NotFound(id)) => {
                tracing::warn!("Dropping message from unknown connection {}", id);
                return Err(GatewayError::UnknownConnection(id));
            }
            Err(e) => return Err(e),
        }

        let message: InboundMessage = match serde_json::from_str(raw_body) {
            Ok(message) => message,
            Err(e) => {
                return Err(self
                    .reject(connection_id, GatewayError::InvalidMessage(e.to_string()))
                    .await)
            }
        };

        match Action::parse(&message.action) {
            Some(Action::InvokeModel) | Some(Action::ChatAgent) => {
                self.invoke(connection_id, message).await
            }
            Some(Action::Cancel) => {
                let cancelled = self.state.sessions.cancel_active(connection_id).await;
                Ok(Dispatched::Cancelled {
                    request_id: cancelled.map(|h| h.request_id().to_string()),
                })
            }
            None => Err(self
                .reject(connection_id, GatewayError::UnroutableAction(message.action))
                .await),
        }
    }

    async fn invoke(
        &self,
        connection_id: &str,
        message: InboundMessage,
    ) -> GatewayResult<Dispatched> {
        let prompt = match message.prompt.filter(|p| !p.trim().is_empty()) {
            Some(prompt) => prompt,
            None => {
                return Err(self
                    .reject(
                        connection_id,
                        GatewayError::InvalidMessage("missing prompt".to_string()),
                    )
                    .await)
            }
        };

        let session = match StreamSession::start(
            self.state.clone(),
            connection_id,
            prompt.clone(),
            message.parameters.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(GatewayError::SessionBusy(_)) => match self.state.config.busy_policy {
                BusyPolicy::Reject => {
                    return Err(self
                        .reject(
                            connection_id,
                            GatewayError::SessionBusy(connection_id.to_string()),
                        )
                        .await)
                }
                BusyPolicy::Replace => {
                    self.replace(connection_id, prompt, message.parameters)
                        .await?
                }
            },
            Err(e) => return Err(e),
        };

        let request_id = session.request_id().to_string();
        let handle = session.handle().clone();
        let task = tokio::spawn(session.run());

        Ok(Dispatched::Started {
            request_id,
            session: handle,
            task,
        })
    }

    /// Cancel the running session and claim the connection for a new one
    async fn replace(
        &self,
        connection_id: &str,
        prompt: String,
        parameters: ModelParameters,
    ) -> GatewayResult<StreamSession> {
        for _ in 0..REPLACE_ATTEMPTS {
            if let Some(old) = self.state.sessions.cancel_active(connection_id).await {
                tracing::info!(
                    "Replacing session {} on {}",
                    old.request_id(),
                    connection_id
                );
            }
            match StreamSession::start(
                self.state.clone(),
                connection_id,
                prompt.clone(),
                parameters.clone(),
            )
            .await
            {
                Err(GatewayError::SessionBusy(_)) => continue,
                other => return other,
            }
        }
        Err(GatewayError::SessionBusy(connection_id.to_string()))
    }

    /// Report a request-level error to the sender as an error frame
    async fn reject(&self, connection_id: &str, err: GatewayError) -> GatewayError {
        tracing::warn!("Rejecting message from {}: {}", connection_id, err);
        let request_id = ulid::Ulid::new().to_string();
        let frame = Frame::error(&request_id, 0, err.code());
        if let Err(e) = self.state.broadcaster.send(connection_id, &frame).await {
            tracing::warn!("Error frame to {} not delivered: {}", connection_id, e);
        }
        err
    }
}
