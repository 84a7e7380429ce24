//! Per-request streaming state machine.
//!
//! A `StreamSession` pulls one token at a time from the provider and pushes
//! each one as a frame before pulling the next, so a slow or dead client
//! throttles the provider instead of piling up frames in memory.

use crate::error::{GatewayError, GatewayResult};
use crate::llm::{InvokeRequest, LlmError, StreamEvent};
use crate::protocol::{Frame, ModelParameters};
use crate::state::{AppState, SessionHandle};
use crate::types::{FailureReason, SessionState};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;

/// Error code sent when a session outlives its time budget
pub const TIMEOUT_CODE: &str = "timeout";

pub struct StreamSession {
    state: Arc<AppState>,
    handle: Arc<SessionHandle>,
    prompt: String,
    parameters: ModelParameters,
    /// Sequence number of the next frame
    sequence: u64,
    tokens_sent: usize,
    response_len: usize,
    started: Instant,
}

impl StreamSession {
    /// Create a Pending session bound to `connection_id`.
    ///
    /// Fails with `UnknownConnection` if the connection is not registered and
    /// `SessionBusy` if it already has an active session.
    pub async fn start(
        state: Arc<AppState>,
        connection_id: &str,
        prompt: String,
        parameters: ModelParameters,
    ) -> GatewayResult<Self> {
        match state.connections.get(connection_id).await {
            Ok(_) => {}
            Err(GatewayError::NotFound(id)) => return Err(GatewayError::UnknownConnection(id)),
            Err(e) => return Err(e),
        }

        let request_id = ulid::Ulid::new().to_string();
        let handle = state.sessions.claim(connection_id, &request_id).await?;
        tracing::info!(
            "Session {} started on connection {}",
            request_id,
            connection_id
        );

        Ok(Self {
            state,
            handle,
            prompt,
            parameters,
            sequence: 0,
            tokens_sent: 0,
            response_len: 0,
            started: Instant::now(),
        })
    }

    pub fn request_id(&self) -> &str {
        self.handle.request_id()
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Drive the session to a terminal state and return it
    pub async fn run(mut self) -> SessionState {
        let limit = self.state.config.session_timeout;
        if tokio::time::timeout(limit, self.pump()).await.is_err() {
            self.on_timeout().await;
        }
        self.finish().await
    }

    fn invoke_request(&self) -> InvokeRequest {
        let llm_config = &self.state.llm_config;
        InvokeRequest {
            prompt: self.prompt.clone(),
            max_tokens: self
                .parameters
                .max_tokens
                .unwrap_or(llm_config.default_max_tokens),
            temperature: self
                .parameters
                .temperature
                .unwrap_or(llm_config.default_temperature),
            timeout: llm_config.default_timeout,
            model_override: None,
        }
    }

    async fn pump(&mut self) {
        let state = self.state.clone();
        let handle = self.handle.clone();

        let Some(llm) = state.llm.as_ref() else {
            self.on_provider_error(LlmError::ConfigError("no LLM providers".to_string()))
                .await;
            return;
        };

        let request = self.invoke_request();
        let model_id = self.parameters.model_id.clone();
        let opened = tokio::select! {
            biased;
            _ = handle.cancelled() => return,
            opened = llm.invoke(model_id.as_deref(), request) => opened,
        };
        let mut tokens = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.on_provider_error(e).await;
                return;
            }
        };

        loop {
            if handle.state().is_terminal() {
                return;
            }
            let next = tokio::select! {
                biased;
                _ = handle.cancelled() => return,
                next = tokens.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::Token(payload))) => {
                    if !self.on_token(payload).await {
                        return;
                    }
                }
                Some(Ok(StreamEvent::Complete)) => {
                    self.on_complete().await;
                    return;
                }
                Some(Err(e)) => {
                    self.on_provider_error(e).await;
                    return;
                }
                None => {
                    tracing::debug!(
                        "Provider stream for {} ended without completion marker",
                        self.request_id()
                    );
                    self.on_complete().await;
                    return;
                }
            }
        }
    }

    /// Emit one token frame. Returns false when the pull loop must stop.
    async fn on_token(&mut self, payload: String) -> bool {
        if payload.is_empty() {
            return true;
        }

        let connection_id = self.handle.connection_id().to_string();
        if !self.state.connections.exists(&connection_id).await {
            tracing::info!(
                "Connection {} no longer live, cancelling {}",
                connection_id,
                self.request_id()
            );
            self.handle.cancel();
            return false;
        }

        let _gate = self.handle.lock_sends().await;
        if self.handle.state().is_terminal() {
            return false;
        }
        self.handle.transition(SessionState::Streaming);

        let frame = Frame::token(self.request_id(), self.sequence, payload);
        self.sequence += 1;

        match self.state.broadcaster.send(&connection_id, &frame).await {
            Ok(()) => {
                self.tokens_sent += 1;
                self.response_len += frame.payload.len();
                true
            }
            Err(GatewayError::Gone(_)) => {
                self.handle.cancel();
                false
            }
            Err(e) => {
                // A missed frame does not abort an otherwise healthy stream
                tracing::warn!("Dropped frame {} of {}: {}", frame.sequence, frame.request_id, e);
                true
            }
        }
    }

    async fn on_complete(&mut self) {
        let _gate = self.handle.lock_sends().await;
        if !self.handle.transition(SessionState::Completed) {
            return;
        }
        let frame = Frame::end(
            self.request_id(),
            self.sequence,
            &self.state.config.end_sentinel,
        );
        self.sequence += 1;
        if let Err(e) = self
            .state
            .broadcaster
            .send(self.handle.connection_id(), &frame)
            .await
        {
            tracing::warn!("End frame for {} not delivered: {}", frame.request_id, e);
        }
    }

    async fn on_provider_error(&mut self, err: LlmError) {
        tracing::error!("Provider failed for {}: {}", self.request_id(), err);
        self.fail(FailureReason::Provider(err.code().to_string()), err.code())
            .await;
    }

    async fn on_timeout(&mut self) {
        tracing::warn!(
            "Session {} exceeded {:?}",
            self.request_id(),
            self.state.config.session_timeout
        );
        self.fail(FailureReason::Timeout, TIMEOUT_CODE).await;
    }

    /// Enter `Failed` and send one error frame, best-effort
    async fn fail(&mut self, reason: FailureReason, code: &str) {
        let _gate = self.handle.lock_sends().await;
        if !self.handle.transition(SessionState::Failed(reason)) {
            return;
        }
        let frame = Frame::error(self.request_id(), self.sequence, code);
        self.sequence += 1;
        if let Err(e) = self
            .state
            .broadcaster
            .send(self.handle.connection_id(), &frame)
            .await
        {
            tracing::debug!("Error frame for {} not delivered: {}", frame.request_id, e);
        }
    }

    async fn finish(self) -> SessionState {
        // A stray exit path still leaves the session terminal
        self.handle.cancel();

        self.state.sessions.release(&self.handle).await;
        self.state.broadcaster.forget(self.request_id()).await;

        let outcome = self.handle.state();
        tracing::info!(
            "Session {} finished as {:?}: {} tokens, {} chars in {:?}",
            self.request_id(),
            outcome,
            self.tokens_sent,
            self.response_len,
            self.started.elapsed()
        );
        outcome
    }
}
