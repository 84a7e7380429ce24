use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamgate::broadcast::{sweep_stale_connections, SendError, Transport};
use streamgate::config::{BusyPolicy, GatewayConfig};
use streamgate::dispatch::{Dispatched, Dispatcher};
use streamgate::error::{GatewayError, GatewayResult};
use streamgate::llm::{
    InvokeRequest, LlmConfig, LlmError, LlmManager, LlmProvider, LlmResult, StreamEvent,
    TokenStream,
};
use streamgate::protocol::{Frame, FrameKind, END_SENTINEL};
use streamgate::retry::RetryPolicy;
use streamgate::state::kv::{FileKv, KvStore, MemoryKv, StoreError, StoreResult};
use streamgate::state::{AppState, SessionHandle};
use streamgate::types::{Connection, ConnectionState, FailureReason, SessionState};
use tokio::task::JoinHandle;

/// One step of a scripted provider stream
#[derive(Debug, Clone)]
enum Step {
    Token(&'static str),
    Pause(Duration),
    Fail(LlmError),
    Complete,
}

/// Provider that plays one script per invocation, in order
#[derive(Clone, Default)]
struct ScriptedProvider {
    scripts: Arc<Mutex<VecDeque<Vec<Step>>>>,
    requests: Arc<Mutex<Vec<InvokeRequest>>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            requests: Arc::default(),
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn invoke(&self, request: InvokeRequest) -> LlmResult<TokenStream> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::ConfigError("script exhausted".to_string()))?;

        let events = stream::iter(script).filter_map(|step| async move {
            match step {
                Step::Token(t) => Some(Ok(StreamEvent::Token(t.to_string()))),
                Step::Pause(d) => {
                    tokio::time::sleep(d).await;
                    None
                }
                Step::Fail(e) => Some(Err(e)),
                Step::Complete => Some(Ok(StreamEvent::Complete)),
            }
        });
        Ok(Box::pin(events))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn default_model(&self) -> &str {
        "script-1"
    }
}

/// Transport that keeps every delivered frame
#[derive(Default)]
struct RecordingTransport {
    frames: Mutex<Vec<(String, Frame)>>,
    attached: Mutex<HashSet<String>>,
    gone: Mutex<HashSet<String>>,
    /// Upcoming sends that fail as transient
    transient_failures: Mutex<u32>,
}

impl RecordingTransport {
    fn attach(&self, connection_id: &str) {
        self.attached.lock().unwrap().insert(connection_id.to_string());
    }

    fn mark_gone(&self, connection_id: &str) {
        self.gone.lock().unwrap().insert(connection_id.to_string());
    }

    fn all(&self) -> Vec<(String, Frame)> {
        self.frames.lock().unwrap().clone()
    }

    fn frames_for(&self, request_id: &str) -> Vec<Frame> {
        self.all()
            .into_iter()
            .map(|(_, f)| f)
            .filter(|f| f.request_id == request_id)
            .collect()
    }

    fn frames_to(&self, connection_id: &str) -> Vec<Frame> {
        self.all()
            .into_iter()
            .filter(|(c, _)| c == connection_id)
            .map(|(_, f)| f)
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, connection_id: &str, text: String) -> Result<(), SendError> {
        if self.gone.lock().unwrap().contains(connection_id) {
            return Err(SendError::Gone);
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SendError::Transient("socket busy".to_string()));
            }
        }
        let frame: Frame = serde_json::from_str(&text).expect("frames are JSON");
        self.frames
            .lock()
            .unwrap()
            .push((connection_id.to_string(), frame));
        Ok(())
    }

    async fn is_connected(&self, connection_id: &str) -> bool {
        self.attached.lock().unwrap().contains(connection_id)
            && !self.gone.lock().unwrap().contains(connection_id)
    }
}

/// Memory table that records the watched session's state at each delete
#[derive(Default)]
struct WatchedKv {
    inner: MemoryKv,
    watched: Mutex<Option<Arc<SessionHandle>>>,
    seen_on_delete: Mutex<Vec<SessionState>>,
}

#[async_trait]
impl KvStore for WatchedKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        if let Some(handle) = self.watched.lock().unwrap().as_ref() {
            self.seen_on_delete.lock().unwrap().push(handle.state());
        }
        self.inner.delete(key).await
    }

    async fn scan(&self) -> StoreResult<Vec<(String, Value)>> {
        self.inner.scan().await
    }
}

/// Memory table whose next `put`s fail
#[derive(Default)]
struct FailingPutKv {
    inner: MemoryKv,
    failures_left: Mutex<u32>,
    put_attempts: Mutex<u32>,
}

impl FailingPutKv {
    fn failing(times: u32) -> Self {
        Self {
            failures_left: Mutex::new(times),
            ..Self::default()
        }
    }
}

#[async_trait]
impl KvStore for FailingPutKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> StoreResult<()> {
        *self.put_attempts.lock().unwrap() += 1;
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Unavailable("table throttled".to_string()));
            }
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn scan(&self) -> StoreResult<Vec<(String, Value)>> {
        self.inner.scan().await
    }
}

struct Harness {
    dispatcher: Dispatcher,
    transport: Arc<RecordingTransport>,
    provider: ScriptedProvider,
}

impl Harness {
    fn state(&self) -> &Arc<AppState> {
        self.dispatcher.state()
    }

    async fn connect(&self, connection_id: &str) {
        self.dispatcher
            .on_connect(connection_id, Some("tester".to_string()))
            .await
            .expect("connect should succeed");
        self.transport.attach(connection_id);
    }

    async fn invoke(&self, connection_id: &str, prompt: &str) -> GatewayResult<Dispatched> {
        let body = serde_json::json!({ "action": "invokeModel", "prompt": prompt }).to_string();
        self.dispatcher.on_message(connection_id, &body).await
    }
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        send_retry: RetryPolicy::new(2, Duration::from_millis(1)),
        store_retry: RetryPolicy::new(2, Duration::from_millis(1)),
        ..GatewayConfig::default()
    }
}

fn harness_with(
    config: GatewayConfig,
    table: Arc<dyn KvStore>,
    scripts: Vec<Vec<Step>>,
) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let provider = ScriptedProvider::new(scripts);
    let manager = LlmManager::new(vec![Box::new(provider.clone())]);
    let state = Arc::new(AppState::new(
        config,
        table,
        transport.clone(),
        Some(manager),
        LlmConfig::default(),
    ));
    Harness {
        dispatcher: Dispatcher::new(state),
        transport,
        provider,
    }
}

fn harness(scripts: Vec<Vec<Step>>) -> Harness {
    harness_with(test_config(), Arc::new(MemoryKv::new()), scripts)
}

fn started(
    dispatched: GatewayResult<Dispatched>,
) -> (String, Arc<SessionHandle>, JoinHandle<SessionState>) {
    match dispatched {
        Ok(Dispatched::Started {
            request_id,
            session,
            task,
        }) => (request_id, session, task),
        other => panic!("Expected a started session, got {:?}", other),
    }
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn hang() -> Step {
    Step::Pause(Duration::from_secs(30))
}

#[tokio::test]
async fn test_happy_path_streams_ordered_frames() {
    let h = harness(vec![vec![Step::Token("He"), Step::Token("llo"), Step::Complete]]);
    h.connect("c1").await;

    let (request_id, _session, task) = started(h.invoke("c1", "hi").await);
    assert_eq!(task.await.unwrap(), SessionState::Completed);

    let frames = h.transport.frames_for(&request_id);
    assert_eq!(
        frames,
        vec![
            Frame::token(&request_id, 0, "He"),
            Frame::token(&request_id, 1, "llo"),
            Frame::end(&request_id, 2, END_SENTINEL),
        ]
    );
    assert_eq!(h.state().sessions.active_count().await, 0);
}

#[tokio::test]
async fn test_defaults_and_model_routing_reach_provider() {
    let h = harness(vec![vec![Step::Complete], vec![Step::Complete]]);
    h.connect("c1").await;

    let (_, _, task) = started(h.invoke("c1", "first").await);
    task.await.unwrap();

    let body = serde_json::json!({
        "action": "chatAgent",
        "prompt": "second",
        "parameters": { "modelId": "scripted:big-model", "maxTokens": 64, "temperature": 0.7 }
    })
    .to_string();
    let (_, _, task) = started(h.dispatcher.on_message("c1", &body).await);
    task.await.unwrap();

    let requests = h.provider.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].prompt, "first");
    assert_eq!(requests[0].max_tokens, 256);
    assert_eq!(requests[0].temperature, 0.0);
    assert_eq!(requests[0].model_override, None);
    assert_eq!(requests[1].model_override.as_deref(), Some("big-model"));
    assert_eq!(requests[1].max_tokens, 64);
    assert!((requests[1].temperature - 0.7).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_newer_request_replaces_running_session() {
    let h = harness(vec![
        vec![Step::Token("a"), hang()],
        vec![Step::Token("b"), Step::Complete],
    ]);
    h.connect("c1").await;

    let (first_id, first, first_task) = started(h.invoke("c1", "one").await);
    let transport = h.transport.clone();
    wait_until(|| transport.frames_to("c1").len() == 1).await;

    let (second_id, _, second_task) = started(h.invoke("c1", "two").await);
    assert_eq!(first.state(), SessionState::Cancelled);
    assert_eq!(first_task.await.unwrap(), SessionState::Cancelled);
    assert_eq!(second_task.await.unwrap(), SessionState::Completed);

    let all = h.transport.all();
    let last_first = all.iter().rposition(|(_, f)| f.request_id == first_id).unwrap();
    let first_second = all.iter().position(|(_, f)| f.request_id == second_id).unwrap();
    assert!(last_first < first_second);

    assert_eq!(h.transport.frames_for(&first_id), vec![Frame::token(&first_id, 0, "a")]);
    let second = h.transport.frames_for(&second_id);
    assert_eq!(second.len(), 2);
    assert_eq!(second[1].kind, FrameKind::End);
}

#[tokio::test]
async fn test_reject_policy_admits_one_of_concurrent_requests() {
    let config = GatewayConfig {
        busy_policy: BusyPolicy::Reject,
        ..test_config()
    };
    let scripts = (0..8).map(|_| vec![hang()]).collect();
    let h = harness_with(config, Arc::new(MemoryKv::new()), scripts);
    h.connect("c1").await;

    let results = futures::future::join_all((0..8).map(|i| {
        let dispatcher = h.dispatcher.clone();
        async move {
            let body = serde_json::json!({ "action": "invokeModel", "prompt": format!("p{}", i) })
                .to_string();
            dispatcher.on_message("c1", &body).await
        }
    }))
    .await;

    let mut started_sessions = Vec::new();
    let mut busy = 0;
    for result in results {
        match result {
            Ok(Dispatched::Started { session, .. }) => started_sessions.push(session),
            Err(GatewayError::SessionBusy(_)) => busy += 1,
            other => panic!("Unexpected result {:?}", other),
        }
    }
    assert_eq!(started_sessions.len(), 1);
    assert_eq!(busy, 7);

    let busy_frames: Vec<Frame> = h
        .transport
        .frames_to("c1")
        .into_iter()
        .filter(|f| f.kind == FrameKind::Error)
        .collect();
    assert_eq!(busy_frames.len(), 7);
    assert!(busy_frames.iter().all(|f| f.payload == "session_busy"));

    h.dispatcher.on_disconnect("c1").await.unwrap();
    assert_eq!(started_sessions[0].finished().await, SessionState::Cancelled);
}

#[tokio::test]
async fn test_unknown_connection_gets_no_frames() {
    let h = harness(vec![vec![Step::Complete]]);

    let result = h.invoke("ghost", "hello").await;
    assert!(matches!(result, Err(GatewayError::UnknownConnection(id)) if id == "ghost"));
    assert!(h.transport.all().is_empty());
    assert!(h.provider.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_provider_failure_sends_single_sanitized_error() {
    let h = harness(vec![vec![
        Step::Token("par"),
        Step::Fail(LlmError::ApiError("upstream 500: internal stack trace".to_string())),
        Step::Token("never"),
    ]]);
    h.connect("c1").await;

    let (request_id, _, task) = started(h.invoke("c1", "hi").await);
    assert_eq!(
        task.await.unwrap(),
        SessionState::Failed(FailureReason::Provider("provider_error".to_string()))
    );

    let frames = h.transport.frames_for(&request_id);
    assert_eq!(
        frames,
        vec![
            Frame::token(&request_id, 0, "par"),
            Frame::error(&request_id, 1, "provider_error"),
        ]
    );
    assert!(!frames[1].payload.contains("stack trace"));
}

#[tokio::test]
async fn test_missing_providers_fail_before_streaming() {
    let transport = Arc::new(RecordingTransport::default());
    let state = Arc::new(AppState::new(
        test_config(),
        Arc::new(MemoryKv::new()),
        transport.clone(),
        None,
        LlmConfig::default(),
    ));
    let dispatcher = Dispatcher::new(state);
    dispatcher.on_connect("c1", None).await.unwrap();

    let body = r#"{"action":"invokeModel","prompt":"hi"}"#;
    let (request_id, _, task) = started(dispatcher.on_message("c1", body).await);
    assert!(matches!(task.await.unwrap(), SessionState::Failed(_)));
    assert_eq!(
        transport.frames_for(&request_id),
        vec![Frame::error(&request_id, 0, "provider_unavailable")]
    );
}

#[tokio::test]
async fn test_disconnect_cancels_before_row_removal() {
    let table = Arc::new(WatchedKv::default());
    let h = harness_with(
        test_config(),
        table.clone(),
        vec![vec![
            Step::Token("a"),
            Step::Pause(Duration::from_millis(50)),
            Step::Token("b"),
            Step::Pause(Duration::from_millis(50)),
            Step::Token("c"),
            Step::Complete,
        ]],
    );
    h.connect("c1").await;

    let (request_id, session, task) = started(h.invoke("c1", "hi").await);
    *table.watched.lock().unwrap() = Some(session.clone());
    let transport = h.transport.clone();
    wait_until(|| !transport.frames_to("c1").is_empty()).await;

    h.dispatcher.on_disconnect("c1").await.unwrap();
    let sent_at_disconnect = h.transport.frames_for(&request_id).len();

    assert_eq!(
        table.seen_on_delete.lock().unwrap().clone(),
        vec![SessionState::Cancelled]
    );
    assert_eq!(task.await.unwrap(), SessionState::Cancelled);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.transport.frames_for(&request_id).len(), sent_at_disconnect);
    assert!(matches!(
        h.state().connections.get("c1").await,
        Err(GatewayError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_action_stops_active_session() {
    let h = harness(vec![vec![Step::Token("a"), hang()]]);
    h.connect("c1").await;

    let (request_id, _, task) = started(h.invoke("c1", "hi").await);
    let cancelled = h
        .dispatcher
        .on_message("c1", r#"{"action":"cancel"}"#)
        .await
        .unwrap();
    assert!(matches!(
        cancelled,
        Dispatched::Cancelled { request_id: Some(ref id) } if *id == request_id
    ));
    assert_eq!(task.await.unwrap(), SessionState::Cancelled);

    // Nothing left to cancel
    let again = h
        .dispatcher
        .on_message("c1", r#"{"action":"cancel"}"#)
        .await
        .unwrap();
    assert!(matches!(again, Dispatched::Cancelled { request_id: None }));

    // The connection stays usable
    assert!(h.state().connections.exists("c1").await);
}

#[tokio::test]
async fn test_unroutable_action_gets_error_frame() {
    let h = harness(vec![]);
    h.connect("c1").await;

    let result = h
        .dispatcher
        .on_message("c1", r#"{"action":"deleteEverything","prompt":"x"}"#)
        .await;
    assert!(matches!(result, Err(GatewayError::UnroutableAction(a)) if a == "deleteEverything"));

    let frames = h.transport.frames_to("c1");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, FrameKind::Error);
    assert_eq!(frames[0].payload, "unroutable_action");
    assert_eq!(frames[0].sequence, 0);
}

#[tokio::test]
async fn test_malformed_and_empty_messages_are_rejected() {
    let h = harness(vec![]);
    h.connect("c1").await;

    assert!(matches!(
        h.dispatcher.on_message("c1", "not json").await,
        Err(GatewayError::InvalidMessage(_))
    ));
    assert!(matches!(
        h.invoke("c1", "   ").await,
        Err(GatewayError::InvalidMessage(_))
    ));

    let frames = h.transport.frames_to("c1");
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f.payload == "invalid_message"));
    assert!(h.provider.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_session_timeout_fails_with_timeout_frame() {
    let config = GatewayConfig {
        session_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let h = harness_with(
        config,
        Arc::new(MemoryKv::new()),
        vec![vec![Step::Token("slow"), hang()]],
    );
    h.connect("c1").await;

    let (request_id, _, task) = started(h.invoke("c1", "hi").await);
    assert_eq!(
        task.await.unwrap(),
        SessionState::Failed(FailureReason::Timeout)
    );
    assert_eq!(
        h.transport.frames_for(&request_id),
        vec![
            Frame::token(&request_id, 0, "slow"),
            Frame::error(&request_id, 1, "timeout"),
        ]
    );
}

#[tokio::test]
async fn test_gone_socket_cancels_session_and_drops_row() {
    let h = harness(vec![vec![
        Step::Token("a"),
        Step::Pause(Duration::from_millis(30)),
        Step::Token("b"),
        hang(),
    ]]);
    h.connect("c1").await;

    let (request_id, _, task) = started(h.invoke("c1", "hi").await);
    let transport = h.transport.clone();
    wait_until(|| !transport.frames_to("c1").is_empty()).await;
    h.transport.mark_gone("c1");

    assert_eq!(task.await.unwrap(), SessionState::Cancelled);
    assert_eq!(h.transport.frames_for(&request_id).len(), 1);
    assert!(!h.state().connections.exists("c1").await);
}

#[tokio::test]
async fn test_sweeper_removes_only_stale_detached_rows() {
    let h = harness(vec![]);
    h.connect("live").await;

    let stale = Connection {
        id: "stale".to_string(),
        connected_at: Utc::now() - chrono::Duration::seconds(120),
        state: ConnectionState::Open,
        user_name: "ghost".to_string(),
    };
    h.state().connections.put(&stale).await.unwrap();
    // Fresh rows are inside the grace period even without a socket
    h.state()
        .connections
        .put(&Connection::open("handshaking", None))
        .await
        .unwrap();

    assert_eq!(sweep_stale_connections(h.state()).await, 1);
    assert!(!h.state().connections.exists("stale").await);
    assert!(h.state().connections.exists("live").await);
    assert!(h.state().connections.exists("handshaking").await);
}

#[tokio::test]
async fn test_file_table_rows_survive_restart_until_swept() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connections.json");

    {
        let table = Arc::new(FileKv::open(&path).await.unwrap());
        let h = harness_with(test_config(), table, vec![]);
        h.connect("before-restart").await;
        let mut row = h.state().connections.get("before-restart").await.unwrap();
        row.connected_at = Utc::now() - chrono::Duration::seconds(300);
        h.state().connections.put(&row).await.unwrap();
    }

    let table = Arc::new(FileKv::open(&path).await.unwrap());
    let h = harness_with(test_config(), table, vec![]);
    let row = h.state().connections.get("before-restart").await.unwrap();
    assert_eq!(row.user_name, "tester");

    assert_eq!(sweep_stale_connections(h.state()).await, 1);
    assert_eq!(h.state().connections.count().await.unwrap(), 0);

    // The removal was persisted too
    let reopened = FileKv::open(&path).await.unwrap();
    assert!(reopened.scan().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sessions_on_different_connections_are_independent() {
    let h = harness(vec![
        vec![Step::Token("x"), Step::Complete],
        vec![Step::Token("y"), Step::Complete],
    ]);
    h.connect("c1").await;
    h.connect("c2").await;

    let (id1, _, t1) = started(h.invoke("c1", "one").await);
    let (id2, _, t2) = started(h.invoke("c2", "two").await);
    assert_eq!(t1.await.unwrap(), SessionState::Completed);
    assert_eq!(t2.await.unwrap(), SessionState::Completed);

    assert!(h.transport.frames_to("c1").iter().all(|f| f.request_id == id1));
    assert!(h.transport.frames_to("c2").iter().all(|f| f.request_id == id2));
}

#[tokio::test]
async fn test_connect_retries_store_then_fails() {
    let table = Arc::new(FailingPutKv::failing(u32::MAX));
    let h = harness_with(test_config(), table.clone(), vec![]);

    let result = h.dispatcher.on_connect("c1", None).await;
    assert!(matches!(result, Err(GatewayError::StoreUnavailable(_))));
    assert_eq!(*table.put_attempts.lock().unwrap(), 2);
    assert!(!h.state().connections.exists("c1").await);
    assert_eq!(h.state().connections.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_connect_survives_one_store_failure() {
    let table = Arc::new(FailingPutKv::failing(1));
    let h = harness_with(test_config(), table.clone(), vec![]);

    let connection = h.dispatcher.on_connect("c1", None).await.unwrap();
    assert_eq!(connection.id, "c1");
    assert_eq!(*table.put_attempts.lock().unwrap(), 2);
    assert!(h.state().connections.exists("c1").await);
}

#[tokio::test]
async fn test_undeliverable_frame_does_not_end_session() {
    let h = harness(vec![vec![
        Step::Token("lost"),
        Step::Token("kept"),
        Step::Complete,
    ]]);
    h.connect("c1").await;
    // Both attempts of the first frame fail
    *h.transport.transient_failures.lock().unwrap() = 2;

    let (request_id, _, task) = started(h.invoke("c1", "hi").await);
    assert_eq!(task.await.unwrap(), SessionState::Completed);

    assert_eq!(
        h.transport.frames_for(&request_id),
        vec![
            Frame::token(&request_id, 1, "kept"),
            Frame::end(&request_id, 2, END_SENTINEL),
        ]
    );
    assert!(h.state().connections.exists("c1").await);
}

#[tokio::test]
async fn test_session_cancels_when_row_disappears() {
    let h = harness(vec![vec![
        Step::Token("a"),
        Step::Pause(Duration::from_millis(30)),
        Step::Token("b"),
        hang(),
    ]]);
    h.connect("c1").await;

    let (request_id, session, task) = started(h.invoke("c1", "hi").await);
    let transport = h.transport.clone();
    wait_until(|| !transport.frames_to("c1").is_empty()).await;

    // Row removed behind the dispatcher's back
    h.state().connections.remove("c1").await.unwrap();

    assert_eq!(task.await.unwrap(), SessionState::Cancelled);
    assert_eq!(session.state(), SessionState::Cancelled);
    assert_eq!(
        h.transport.frames_for(&request_id),
        vec![Frame::token(&request_id, 0, "a")]
    );
}
