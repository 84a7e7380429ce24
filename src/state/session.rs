use crate::error::{GatewayError, GatewayResult};
use crate::types::{ConnectionId, RequestId, SessionState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Shared view of one session's lifecycle.
///
/// The stream task owns the transitions driven by the provider; any holder
/// may `cancel()`. Terminal states are sticky.
#[derive(Debug)]
pub struct SessionHandle {
    request_id: RequestId,
    connection_id: ConnectionId,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    /// Held for the duration of each frame send
    send_gate: Mutex<()>,
}

impl SessionHandle {
    fn new(connection_id: &str, request_id: &str) -> Self {
        let (state, _rx) = watch::channel(SessionState::Pending);
        Self {
            request_id: request_id.to_string(),
            connection_id: connection_id.to_string(),
            cancel: CancellationToken::new(),
            state,
            send_gate: Mutex::new(()),
        }
    }

    /// Serialize a frame send against outside cancellation
    pub async fn lock_sends(&self) -> MutexGuard<'_, ()> {
        self.send_gate.lock().await
    }

    /// Cancel once any in-flight send has settled, so no frame of this
    /// session is delivered after this returns
    pub async fn cancel_after_send(&self) -> bool {
        let _gate = self.send_gate.lock().await;
        self.cancel()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state changes (used by tests and the status endpoint)
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Apply a transition. Returns false when the move is not allowed:
    /// nothing leaves a terminal state, and `Streaming` never returns to
    /// `Pending`.
    pub fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = match (&*current, &next) {
                (c, _) if c.is_terminal() => false,
                (SessionState::Pending, SessionState::Streaming) => true,
                (_, n) if n.is_terminal() => true,
                _ => false,
            };
            if allowed {
                *current = next.clone();
            }
            allowed
        })
    }

    /// Move any non-terminal state to `Cancelled` and wake the pull loop.
    /// Returns true only for the call that performed the transition.
    pub fn cancel(&self) -> bool {
        let moved = self.transition(SessionState::Cancelled);
        if moved {
            tracing::info!(
                "Cancelled session {} on connection {}",
                self.request_id,
                self.connection_id
            );
            self.cancel.cancel();
        }
        moved
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once `cancel()` has run
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Wait until the session reaches a terminal state
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => state.clone(),
            // Sender lives as long as self, so this only happens on teardown
            Err(_) => self.state(),
        };
        state
    }
}

/// Tracks the active session per connection.
///
/// `claim` is the conditional put that keeps at most one Pending/Streaming
/// session per connection: the check and the insert happen under one lock.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    active: Arc<Mutex<HashMap<ConnectionId, Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new Pending session, or fail with `SessionBusy`
    pub async fn claim(
        &self,
        connection_id: &str,
        request_id: &str,
    ) -> GatewayResult<Arc<SessionHandle>> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(connection_id) {
            if existing.state().is_active() {
                return Err(GatewayError::SessionBusy(connection_id.to_string()));
            }
        }

        let handle = Arc::new(SessionHandle::new(connection_id, request_id));
        active.insert(connection_id.to_string(), handle.clone());
        tracing::debug!(
            "Session {} claimed connection {}",
            request_id,
            connection_id
        );
        Ok(handle)
    }

    pub async fn active(&self, connection_id: &str) -> Option<Arc<SessionHandle>> {
        self.active
            .lock()
            .await
            .get(connection_id)
            .filter(|h| h.state().is_active())
            .cloned()
    }

    /// Cancel and forget the active session of a connection, if any.
    /// Returns once the session can no longer emit frames.
    ///
    /// The entry stays registered until the cancel lands, so a concurrent
    /// `claim` keeps seeing the connection as busy.
    pub async fn cancel_active(&self, connection_id: &str) -> Option<Arc<SessionHandle>> {
        let handle = self.active.lock().await.get(connection_id).cloned()?;
        handle.cancel_after_send().await;

        let mut active = self.active.lock().await;
        if active
            .get(connection_id)
            .is_some_and(|h| h.request_id() == handle.request_id())
        {
            active.remove(connection_id);
        }
        Some(handle)
    }

    /// Forget a finished session. Only removes the entry if it still belongs
    /// to this request, so a replacement session is never dropped.
    pub async fn release(&self, handle: &SessionHandle) {
        let mut active = self.active.lock().await;
        if active
            .get(handle.connection_id())
            .is_some_and(|h| h.request_id() == handle.request_id())
        {
            active.remove(handle.connection_id());
        }
    }

    pub async fn active_count(&self) -> usize {
        self.active
            .lock()
            .await
            .values()
            .filter(|h| h.state().is_active())
            .count()
    }

    /// Cancel every tracked session (shutdown)
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.active.lock().await.drain().map(|(_, h)| h).collect();
        drained.iter().filter(|h| h.cancel()).count()
    }
}
