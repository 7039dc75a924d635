//! The per-workspace app-server client.
//!
//! Owns the agent subprocess and everything attached to it: the pending
//! request table, the turn registry, token-usage caches, the stderr tail,
//! and the restart task. One client serializes its spawn/handshake under a
//! start lock, its stdin writes under a writer lock, and its table
//! mutation under a data lock; many clients run concurrently in one
//! process.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use car_domain::config::AppServerConfig;
use car_domain::error::{Error, Result};
use car_sessions::process_records::{
    delete_process_record, workspace_id_for_path, write_process_record, ProcessRecord,
};

use crate::circuit::CircuitBreaker;
use crate::launcher::{self, AgentProcess, StderrTail};
use crate::protocol::{self, Incoming, RpcError, APPROVAL_METHODS, LEGACY_APPROVAL_METHODS};
use crate::transport::{oversize_notification_params, Frame, LineAssembler};
use crate::turns::{extract_turn_snapshot, TurnRegistry, TurnResult};

/// Synthetic notification emitted when an oversize stdout line is dropped.
/// Never originates from the wire.
pub const OVERSIZE_DROPPED_METHOD: &str = "car/app_server/oversizedMessageDropped";

/// Process-record kind for managed app-server children.
pub const PROCESS_RECORD_KIND: &str = "codex_app_server";

const READ_CHUNK_SIZE: usize = 64 * 1024;
const INVALID_JSON_PREVIEW_BYTES: usize = 200;
const USAGE_CACHE_CAPACITY: usize = 64;
const CIRCUIT_OPEN_RESTART_PAUSE: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pluggable handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reply to a server-initiated approval request.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalDecision {
    /// Shaped as `{"decision": "<string>"}` on the wire.
    Decision(String),
    /// A full result object, e.g. `{"approve": true}`.
    Payload(Value),
}

impl ApprovalDecision {
    pub fn into_result(self) -> Value {
        match self {
            ApprovalDecision::Decision(decision) => json!({ "decision": decision }),
            ApprovalDecision::Payload(value) => value,
        }
    }
}

/// Answers server-initiated approval requests. Runs on its own task so the
/// transport stays drained while a human decides.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn decide(&self, request: &Value) -> Result<ApprovalDecision>;
}

/// Receives every inbound notification raw, plus the synthetic oversize
/// notification.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn notify(&self, message: Value);
}

struct Handlers {
    approval: Option<Arc<dyn ApprovalHandler>>,
    notification: Option<Arc<dyn NotificationHandler>>,
    default_approval_decision: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct ClientData {
    pending: HashMap<String, PendingRequest>,
    turns: TurnRegistry,
    usage_by_thread: LruCache<String, Value>,
    usage_by_turn: LruCache<String, Value>,
}

struct ProcessHandles {
    child: tokio::process::Child,
    pid: Option<u32>,
    pgid: Option<i32>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: StderrTail,
    record_key: Option<String>,
}

struct ClientInner {
    command: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    workspace_id: Option<String>,
    config: AppServerConfig,

    handlers: Mutex<Handlers>,
    start_lock: AsyncMutex<()>,
    writer: AsyncMutex<Option<ChildStdin>>,
    data: Mutex<ClientData>,
    process: Mutex<Option<ProcessHandles>>,

    disconnected_tx: watch::Sender<bool>,
    closed: AtomicBool,
    initialized: AtomicBool,
    /// Oversize checks are suspended during the handshake window.
    unbounded_read: AtomicBool,
    include_client_version: AtomicBool,
    restart_backoff_ms: AtomicU64,
    restart_task: Mutex<Option<JoinHandle<()>>>,
    /// Guards disconnect handling against stale reader tasks.
    generation: AtomicU64,
    last_used_at: Mutex<Instant>,
    circuit: CircuitBreaker,
}

/// Client for one agent subprocess, cheap to clone.
#[derive(Clone)]
pub struct AppServerClient {
    inner: Arc<ClientInner>,
}

/// Optional knobs for `turn/start` and `review/start`.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Full input item list; when absent the prompt text becomes a single
    /// `{type: "text"}` item.
    pub input_items: Option<Vec<Value>>,
    pub approval_policy: Option<String>,
    pub sandbox_policy: Option<Value>,
    pub model: Option<String>,
    pub effort: Option<String>,
    /// Extra params merged verbatim.
    pub extra: Option<Map<String, Value>>,
}

/// Promise-shaped handle returned by starting a turn.
#[derive(Clone)]
pub struct TurnHandle {
    client: AppServerClient,
    pub turn_id: String,
    pub thread_id: String,
}

impl TurnHandle {
    /// Wait for the turn's terminal event, interleaving stall detection.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<TurnResult> {
        self.client
            .wait_for_turn(&self.turn_id, Some(&self.thread_id), timeout)
            .await
    }
}

impl AppServerClient {
    pub fn new(
        command: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
        config: AppServerConfig,
    ) -> Self {
        let workspace_id = cwd.as_deref().map(workspace_id_for_path);
        let (disconnected_tx, _) = watch::channel(true);
        let restart_backoff_ms = config.restart_backoff_initial.as_millis() as u64;
        Self {
            inner: Arc::new(ClientInner {
                command,
                cwd,
                env,
                workspace_id,
                config,
                handlers: Mutex::new(Handlers {
                    approval: None,
                    notification: None,
                    default_approval_decision: "cancel".into(),
                }),
                start_lock: AsyncMutex::new(()),
                writer: AsyncMutex::new(None),
                data: Mutex::new(ClientData {
                    pending: HashMap::new(),
                    turns: TurnRegistry::default(),
                    usage_by_thread: LruCache::new(
                        NonZeroUsize::new(USAGE_CACHE_CAPACITY).expect("nonzero"),
                    ),
                    usage_by_turn: LruCache::new(
                        NonZeroUsize::new(USAGE_CACHE_CAPACITY).expect("nonzero"),
                    ),
                }),
                process: Mutex::new(None),
                disconnected_tx,
                closed: AtomicBool::new(false),
                initialized: AtomicBool::new(false),
                unbounded_read: AtomicBool::new(false),
                include_client_version: AtomicBool::new(true),
                restart_backoff_ms: AtomicU64::new(restart_backoff_ms),
                restart_task: Mutex::new(None),
                generation: AtomicU64::new(0),
                last_used_at: Mutex::new(Instant::now()),
                circuit: CircuitBreaker::new("app-server"),
            }),
        }
    }

    // ── Handler wiring ───────────────────────────────────────────

    pub fn set_approval_handler(&self, handler: Option<Arc<dyn ApprovalHandler>>) {
        self.inner.handlers.lock().approval = handler;
    }

    pub fn set_notification_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        self.inner.handlers.lock().notification = handler;
    }

    pub fn set_default_approval_decision(&self, decision: &str) {
        let trimmed = decision.trim();
        if !trimmed.is_empty() {
            self.inner.handlers.lock().default_approval_decision = trimmed.to_string();
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn and initialize the subprocess if it is not already running.
    /// Safe to call many times.
    pub async fn start(&self) -> Result<()> {
        self.ensure_process().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Final shutdown: cancels the restart task, terminates the process
    /// tree, and fails everything pending.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.restart_task.lock().take() {
            task.abort();
        }
        self.terminate_process().await;
        fail_pending(&self.inner, "client closed");
        let _ = self.inner.disconnected_tx.send(true);
    }

    /// Wait until the client observes a disconnect.
    pub async fn wait_for_disconnect(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.inner.disconnected_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, wait)
                .await
                .map_err(|_| Error::Timeout("waiting for disconnect".into())),
            None => {
                wait.await;
                Ok(())
            }
        }
    }

    /// Last-used bookkeeping for the supervisor's idle policies.
    pub fn touch(&self) {
        *self.inner.last_used_at.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_used_at.lock().elapsed()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.inner
            .process
            .lock()
            .as_ref()
            .map(|p| p.stderr_tail.snapshot())
            .unwrap_or_default()
    }

    // ── RPC surface ──────────────────────────────────────────────

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_process().await?;
        self.request_raw(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_process().await?;
        tracing::info!(method = %method, summary = %params_summary(method, params.as_ref()), "app_server.notify");
        let message = protocol::build_message(None, Some(method), params, None, None);
        self.send_message(&message).await
    }

    pub async fn thread_start(&self, cwd: &str, extra: Option<Map<String, Value>>) -> Result<Value> {
        let mut params = Map::new();
        params.insert("cwd".into(), json!(cwd));
        if let Some(extra) = extra {
            params.extend(extra);
        }
        let result = self
            .request("thread/start", Some(Value::Object(params)), None)
            .await?;
        normalize_id_result(result, "thread/start", protocol::extract_thread_id_from_result)
    }

    pub async fn thread_resume(&self, thread_id: &str) -> Result<Value> {
        let params = json!({ "threadId": thread_id });
        let result = self.request("thread/resume", Some(params), None).await?;
        normalize_id_result(result, "thread/resume", protocol::extract_thread_id_from_result)
    }

    /// `thread/list`, aliasing whatever collection key the backend used to
    /// the canonical `threads`.
    pub async fn thread_list(&self) -> Result<Value> {
        let mut result = self.request("thread/list", Some(json!({})), None).await?;
        if let Some(obj) = result.as_object_mut() {
            if !obj.contains_key("threads") {
                for key in ["data", "items", "results"] {
                    if let Some(list) = obj.get(key).filter(|v| v.is_array()).cloned() {
                        obj.insert("threads".into(), list);
                        break;
                    }
                }
            }
        }
        Ok(result)
    }

    pub async fn thread_archive(&self, thread_id: &str) -> Result<Value> {
        self.request("thread/archive", Some(json!({ "threadId": thread_id })), None)
            .await
    }

    pub async fn model_list(&self) -> Result<Value> {
        self.request("model/list", Some(json!({})), None).await
    }

    pub async fn account_read(&self) -> Result<Value> {
        self.request("account/read", Some(json!({})), None).await
    }

    pub async fn rate_limits_read(&self) -> Result<Value> {
        self.request("account/rateLimits/read", Some(json!({})), None)
            .await
    }

    /// Start a turn and register its state machine.
    pub async fn turn_start(
        &self,
        thread_id: &str,
        text: &str,
        options: TurnOptions,
    ) -> Result<TurnHandle> {
        let mut params = Map::new();
        params.insert("threadId".into(), json!(thread_id));
        let input = options
            .input_items
            .clone()
            .map(Value::Array)
            .unwrap_or_else(|| json!([{ "type": "text", "text": text }]));
        params.insert("input".into(), input);
        apply_turn_options(&mut params, &options);
        let result = self
            .request("turn/start", Some(Value::Object(params)), None)
            .await?;
        self.register_started_turn("turn/start", thread_id, &result)
    }

    /// Start a review turn (`review/start`): same lifecycle as a regular
    /// turn, with a review target and delivery mode instead of input.
    pub async fn review_start(
        &self,
        thread_id: &str,
        target: Value,
        delivery: &str,
        options: TurnOptions,
    ) -> Result<TurnHandle> {
        let mut params = Map::new();
        params.insert("threadId".into(), json!(thread_id));
        params.insert("target".into(), target);
        params.insert("delivery".into(), json!(delivery));
        apply_turn_options(&mut params, &options);
        let result = self
            .request("review/start", Some(Value::Object(params)), None)
            .await?;
        self.register_started_turn("review/start", thread_id, &result)
    }

    fn register_started_turn(
        &self,
        method: &str,
        thread_id: &str,
        result: &Value,
    ) -> Result<TurnHandle> {
        if !result.is_object() {
            return Err(Error::Protocol(format!("{method} returned non-object result")));
        }
        let turn_id = protocol::extract_turn_id_from_result(result)
            .ok_or_else(|| Error::Protocol(format!("{method} response missing turn id")))?;
        self.inner
            .data
            .lock()
            .turns
            .register(&turn_id, thread_id, self.inner.config.output_policy);
        Ok(TurnHandle {
            client: self.clone(),
            turn_id,
            thread_id: thread_id.to_string(),
        })
    }

    /// Ask the server to interrupt a turn. The local future stays pending;
    /// the server sends the terminal event.
    pub async fn turn_interrupt(&self, turn_id: &str, thread_id: Option<&str>) -> Result<Value> {
        let thread_id = match thread_id {
            Some(thread_id) => thread_id.to_string(),
            None => {
                let data = self.inner.data.lock();
                let lookup = data.turns.lookup(turn_id, None);
                data.turns
                    .get(&lookup)
                    .and_then(|state| state.thread_id.clone())
                    .ok_or_else(|| {
                        Error::Protocol(format!("unknown thread id for turn {turn_id}"))
                    })?
            }
        };
        self.request(
            "turn/interrupt",
            Some(json!({ "turnId": turn_id, "threadId": thread_id })),
            None,
        )
        .await
    }

    /// Token-usage caches are best-effort per turn and authoritative per
    /// thread.
    pub fn token_usage_for_thread(&self, thread_id: &str) -> Option<Value> {
        self.inner
            .data
            .lock()
            .usage_by_thread
            .peek(thread_id)
            .cloned()
    }

    pub fn token_usage_for_turn(&self, turn_id: &str) -> Option<Value> {
        self.inner.data.lock().usage_by_turn.peek(turn_id).cloned()
    }

    // ── Turn waiting & stall recovery ────────────────────────────

    pub async fn wait_for_turn(
        &self,
        turn_id: &str,
        thread_id: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<TurnResult> {
        let (mut rx, state_thread_id) = {
            let mut data = self.inner.data.lock();
            let lookup = data.turns.lookup(turn_id, thread_id);
            let existing = match data.turns.get(&lookup) {
                None => {
                    return Err(Error::Protocol(format!(
                        "unknown turn id {turn_id} (thread {thread_id:?})"
                    )))
                }
                Some(state) => state.outcome(),
            };
            if let Some(outcome) = existing {
                data.turns.remove(&lookup);
                return outcome.map_err(Into::into);
            }
            let state = data.turns.get(&lookup).expect("turn state present");
            (state.subscribe(), state.thread_id.clone())
        };
        let effective_thread = thread_id
            .map(str::to_string)
            .or(state_thread_id);
        let timeout = timeout.or(self.inner.config.turn_timeout);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let slice = self.wait_slice(deadline, turn_id)?;
            match tokio::time::timeout(slice, rx.changed()).await {
                Ok(changed) => {
                    let outcome = rx.borrow().clone();
                    if let Some(outcome) = outcome {
                        let mut data = self.inner.data.lock();
                        let lookup = data.turns.lookup(turn_id, effective_thread.as_deref());
                        data.turns.remove(&lookup);
                        return outcome.map_err(Into::into);
                    }
                    if changed.is_err() {
                        // Sender gone without a value: the registry was
                        // torn down under us.
                        return Err(Error::disconnected());
                    }
                }
                Err(_elapsed) => {
                    self.maybe_recover_stalled_turn(turn_id, effective_thread.as_deref())
                        .await;
                }
            }
        }
    }

    fn wait_slice(&self, deadline: Option<Instant>, turn_id: &str) -> Result<Duration> {
        let poll = self.inner.config.turn_stall_poll_interval;
        match deadline {
            None => Ok(poll),
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return Err(Error::Timeout(format!("turn {turn_id} timed out")));
                }
                Ok(poll.min(deadline - now))
            }
        }
    }

    /// Quiet self-heal for a stalled turn: probe `thread/resume` and merge
    /// whatever the snapshot reveals. The waiter's own deadline always
    /// wins; recovery never extends it.
    async fn maybe_recover_stalled_turn(&self, turn_id: &str, thread_id: Option<&str>) {
        let Some(stall_timeout) = self.inner.config.turn_stall_timeout else {
            return;
        };
        let min_interval = self.inner.config.turn_stall_recovery_min_interval;

        let probe = {
            let mut data = self.inner.data.lock();
            let lookup = data.turns.lookup(turn_id, thread_id);
            let Some(state) = data.turns.get_mut(&lookup) else {
                return;
            };
            if state.is_done() {
                return;
            }
            let idle = state.last_event_at.elapsed();
            if idle < stall_timeout {
                return;
            }
            if let Some(last) = state.last_recovery_at {
                if last.elapsed() < min_interval {
                    return;
                }
            }
            let Some(thread_id) = thread_id
                .map(str::to_string)
                .or_else(|| state.thread_id.clone())
            else {
                state.last_event_at = Instant::now();
                return;
            };
            state.last_recovery_at = Some(Instant::now());
            state.recovery_attempts += 1;
            tracing::warn!(
                turn_id = %turn_id,
                thread_id = %thread_id,
                idle_seconds = idle.as_secs_f64(),
                last_method = state.last_method.as_deref().unwrap_or(""),
                recovery_attempts = state.recovery_attempts,
                "app_server.turn_stalled"
            );
            thread_id
        };

        let snapshot = match self.thread_resume(&probe).await {
            Ok(payload) => extract_turn_snapshot(&payload, turn_id),
            Err(e) => {
                tracing::warn!(
                    turn_id = %turn_id,
                    thread_id = %probe,
                    error = %e,
                    "app_server.turn_recovery.failed"
                );
                None
            }
        };

        let policy = self.inner.config.output_policy;
        let mut data = self.inner.data.lock();
        let lookup = data.turns.lookup(turn_id, Some(probe.as_str()));
        let Some(state) = data.turns.get_mut(&lookup) else {
            return;
        };
        match snapshot {
            None => state.last_event_at = Instant::now(),
            Some(snapshot) => {
                if !snapshot.agent_messages.is_empty() {
                    state.agent_messages = snapshot.agent_messages;
                }
                state.errors.extend(snapshot.errors);
                if let Some(status) = snapshot.status {
                    state.status = Some(status);
                }
                let terminal = state
                    .status
                    .as_deref()
                    .map(|s| protocol::status_is_terminal(&json!(s)))
                    .unwrap_or(false);
                if terminal {
                    state.resolve_from_state(policy);
                } else {
                    state.last_event_at = Instant::now();
                }
            }
        }
    }

    // ── Spawn / handshake ────────────────────────────────────────

    async fn ensure_process(&self) -> Result<()> {
        self.inner.circuit.check()?;
        let _guard = self.inner.start_lock.lock().await;
        if self.is_closed() {
            return Err(Error::Disconnected("client closed".into()));
        }
        {
            let mut process = self.inner.process.lock();
            let alive = process
                .as_mut()
                .map(|p| p.child.try_wait().ok().flatten().is_none())
                .unwrap_or(false);
            if alive && self.is_initialized() {
                return Ok(());
            }
        }
        let attempt = async {
            self.spawn_process().await?;
            self.initialize_handshake().await
        };
        match attempt.await {
            Ok(()) => {
                self.inner.circuit.record_success();
                Ok(())
            }
            Err(e) => {
                self.inner.circuit.record_failure();
                Err(e)
            }
        }
    }

    async fn spawn_process(&self) -> Result<()> {
        self.terminate_process().await;
        let agent = launcher::spawn_agent(
            &self.inner.command,
            self.inner.cwd.as_deref(),
            &self.inner.env,
        )?;
        let AgentProcess {
            child,
            stdin,
            stdout,
            pid,
            pgid,
            stderr_tail,
            stderr_task,
        } = agent;

        let record_key = self.write_record(pid, pgid);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.writer.lock().await = Some(stdin);
        let reader_task = tokio::spawn(read_loop(self.inner.clone(), stdout, generation));
        *self.inner.process.lock() = Some(ProcessHandles {
            child,
            pid,
            pgid,
            reader_task,
            stderr_task,
            stderr_tail,
            record_key,
        });
        self.inner.initialized.store(false, Ordering::SeqCst);
        let _ = self.inner.disconnected_tx.send(false);
        tracing::info!(
            pid = pid.unwrap_or(0),
            cwd = self
                .inner
                .cwd
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            "app_server.spawned"
        );
        Ok(())
    }

    fn write_record(&self, pid: Option<u32>, pgid: Option<i32>) -> Option<String> {
        let cwd = self.inner.cwd.as_deref()?;
        let pid = pid?;
        let mut record = ProcessRecord::new(
            PROCESS_RECORD_KIND,
            self.inner.workspace_id.clone(),
            pid,
            &self.inner.command,
        );
        record.pgid = pgid;
        record.metadata = json!({ "cwd": cwd.display().to_string() });
        match write_process_record(cwd, &record) {
            Ok(()) => Some(record.record_key()),
            Err(e) => {
                tracing::warn!(error = %e, "app_server.registry.write_failed");
                None
            }
        }
    }

    async fn initialize_handshake(&self) -> Result<()> {
        self.inner.unbounded_read.store(true, Ordering::SeqCst);
        let result = self.do_initialize().await;
        self.inner.unbounded_read.store(false, Ordering::SeqCst);
        result?;
        self.send_message(&protocol::build_message(None, Some("initialized"), None, None, None))
            .await?;
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.restart_backoff_ms.store(
            self.inner.config.restart_backoff_initial.as_millis() as u64,
            Ordering::SeqCst,
        );
        tracing::info!("app_server.initialized");
        Ok(())
    }

    /// `initialize` with `clientInfo`. Backends older than the version
    /// field reject unknown fields with -32600; retry once without it,
    /// then treat the failure as permanent.
    async fn do_initialize(&self) -> Result<Value> {
        let include_version = self.inner.include_client_version.load(Ordering::SeqCst);
        let params = initialize_params(include_version);
        match self.request_raw("initialize", Some(params), None).await {
            Ok(result) => Ok(result),
            Err(Error::Response {
                code: Some(-32600), ..
            }) if include_version => {
                self.inner
                    .include_client_version
                    .store(false, Ordering::SeqCst);
                tracing::warn!(error_code = -32600i64, "app_server.initialize.retry");
                self.request_raw("initialize", Some(initialize_params(false)), None)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn terminate_process(&self) {
        let handles = self.inner.process.lock().take();
        *self.inner.writer.lock().await = None;
        let Some(mut handles) = handles else { return };
        handles.reader_task.abort();
        if let Some(task) = handles.stderr_task.take() {
            task.abort();
        }
        if let (Some(record_key), Some(cwd)) = (handles.record_key.take(), self.inner.cwd.as_deref())
        {
            if let Err(e) = delete_process_record(cwd, PROCESS_RECORD_KIND, &record_key) {
                tracing::warn!(error = %e, "app_server.registry.delete_failed");
            }
        }
        launcher::terminate_child(&mut handles.child, handles.pgid).await;
    }

    // ── Sending ──────────────────────────────────────────────────

    async fn request_raw(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut data = self.inner.data.lock();
            data.pending.insert(
                request_id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
        }
        tracing::info!(
            request_id = %request_id,
            method = %method,
            summary = %params_summary(method, params.as_ref()),
            "app_server.request"
        );
        let message = protocol::build_message(
            Some(&json!(request_id.clone())),
            Some(method),
            params,
            None,
            None,
        );
        if let Err(e) = self.send_message(&message).await {
            self.inner.data.lock().pending.remove(&request_id);
            return Err(e);
        }
        let timeout = timeout.or(self.inner.config.request_timeout);
        let received = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.data.lock().pending.remove(&request_id);
                    return Err(Error::Timeout(format!("{method} request timed out")));
                }
            },
            None => rx.await,
        };
        match received {
            Ok(result) => result,
            Err(_) => Err(Error::disconnected()),
        }
    }

    async fn send_message(&self, message: &Value) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::Disconnected("app-server process is not running".into()))?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        stdin
            .write_all(&line)
            .await
            .map_err(|_| Error::disconnected())?;
        stdin.flush().await.map_err(|_| Error::disconnected())?;
        Ok(())
    }

}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn read_loop(inner: Arc<ClientInner>, mut stdout: ChildStdout, generation: u64) {
    let mut assembler = LineAssembler::new(
        inner.config.max_message_bytes,
        inner.config.oversize_preview_bytes,
        inner.config.max_oversize_drain_bytes,
    );
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        assembler.set_unbounded(inner.unbounded_read.load(Ordering::SeqCst));
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for frame in assembler.push_chunk(&chunk[..n]) {
                    handle_frame(&inner, frame).await;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "app_server.read.failed");
                break;
            }
        }
    }
    for frame in assembler.finish() {
        handle_frame(&inner, frame).await;
    }
    handle_disconnect(&inner, generation).await;
}

async fn handle_frame(inner: &Arc<ClientInner>, frame: Frame) {
    match frame {
        Frame::Line(line) => {
            if line.is_empty() {
                return;
            }
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) if message.is_object() => handle_message(inner, message).await,
                Ok(_) => {}
                Err(e) => {
                    let preview: String = trimmed
                        .chars()
                        .take(INVALID_JSON_PREVIEW_BYTES)
                        .collect();
                    tracing::warn!(
                        preview = %preview,
                        length = trimmed.len(),
                        error = %e,
                        "app_server.read.invalid_json"
                    );
                }
            }
        }
        Frame::OversizeDropped(dropped) => {
            let params = oversize_notification_params(
                inner.config.max_message_bytes,
                inner.config.max_oversize_drain_bytes,
                &dropped,
            );
            tracing::warn!(
                bytes_dropped = dropped.bytes_dropped,
                preview_bytes = dropped.preview.len(),
                inferred_method = params
                    .get("inferredMethod")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or(""),
                truncated = dropped.truncated,
                aborted = dropped.aborted,
                "app_server.read.oversize_dropped"
            );
            let handler = inner.handlers.lock().notification.clone();
            if let Some(handler) = handler {
                handler
                    .notify(json!({ "method": OVERSIZE_DROPPED_METHOD, "params": params }))
                    .await;
            }
        }
    }
}

async fn handle_message(inner: &Arc<ClientInner>, message: Value) {
    let Some(incoming) = protocol::classify(&message) else {
        return;
    };
    match incoming {
        Incoming::Response { id, result, error } => handle_response(inner, id, result, error),
        Incoming::ServerRequest { id, method, params } => {
            // Approval handlers may block on a human; keep the reader
            // draining by answering on a separate task.
            let inner = inner.clone();
            tokio::spawn(async move {
                handle_server_request(&inner, id, method, params).await;
            });
        }
        Incoming::Notification { method, params } => {
            handle_turn_notification(inner, &method, &message, &params);
            let handler = inner.handlers.lock().notification.clone();
            if let Some(handler) = handler {
                handler.notify(message).await;
            }
        }
    }
}

fn handle_response(
    inner: &Arc<ClientInner>,
    request_id: String,
    result: Option<Value>,
    error: Option<RpcError>,
) {
    let pending = inner.data.lock().pending.remove(&request_id);
    let Some(pending) = pending else {
        tracing::debug!(request_id = %request_id, "app_server.response.unmatched");
        return;
    };
    match error {
        Some(error) => {
            if error.code == -32600 {
                tracing::warn!(
                    request_id = %request_id,
                    method = %pending.method,
                    error_code = error.code,
                    error_message = %error.message,
                    "app_server.response.invalid_request"
                );
            }
            tracing::warn!(
                request_id = %request_id,
                method = %pending.method,
                error_code = error.code,
                error_message = %error.message,
                "app_server.response.error"
            );
            let _ = pending.tx.send(Err(Error::Response {
                method: Some(pending.method.clone()),
                code: Some(error.code),
                message: error.message,
            }));
        }
        None => {
            tracing::info!(request_id = %request_id, method = %pending.method, "app_server.response");
            let _ = pending.tx.send(Ok(result.unwrap_or(Value::Null)));
        }
    }
}

async fn handle_server_request(inner: &Arc<ClientInner>, id: Value, method: String, params: Value) {
    let client = AppServerClient {
        inner: inner.clone(),
    };
    let is_approval = APPROVAL_METHODS.contains(&method.as_str())
        || LEGACY_APPROVAL_METHODS.contains(&method.as_str());
    if !is_approval {
        let error = RpcError {
            code: -32601,
            message: format!("Unsupported method: {method}"),
            data: None,
        };
        let reply = protocol::build_message(Some(&id), None, None, None, Some(&error));
        let _ = client.send_message(&reply).await;
        return;
    }

    tracing::info!(
        request_id = %id,
        method = %method,
        turn_id = protocol::extract_turn_id(&params).as_deref().unwrap_or(""),
        "app_server.approval.requested"
    );
    let (handler, default_decision) = {
        let handlers = inner.handlers.lock();
        (
            handlers.approval.clone(),
            handlers.default_approval_decision.clone(),
        )
    };
    let request = protocol::build_message(Some(&id), Some(&method), Some(params), None, None);
    let decision = match handler {
        None => ApprovalDecision::Decision(default_decision),
        Some(handler) => match handler.decide(&request).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    request_id = %id,
                    method = %method,
                    error = %e,
                    "app_server.approval.failed"
                );
                let error = RpcError {
                    code: -32001,
                    message: "approval handler failed".into(),
                    data: None,
                };
                let reply = protocol::build_message(Some(&id), None, None, None, Some(&error));
                let _ = client.send_message(&reply).await;
                return;
            }
        },
    };
    let result = decision.into_result();
    tracing::info!(
        request_id = %id,
        method = %method,
        decision = result.get("decision").and_then(serde_json::Value::as_str).unwrap_or(""),
        "app_server.approval.responded"
    );
    let reply = protocol::build_message(Some(&id), None, None, Some(result), None);
    let _ = client.send_message(&reply).await;
}

/// Feed the turn registry. Raw forwarding to the notification handler
/// happens separately; this only mutates per-turn state.
fn handle_turn_notification(inner: &Arc<ClientInner>, method: &str, message: &Value, params: &Value) {
    let policy = inner.config.output_policy;
    let turn_id = match method {
        "item/completed" => protocol::extract_turn_id(params)
            .or_else(|| params.get("item").and_then(|i| protocol::extract_turn_id(i))),
        _ => protocol::extract_turn_id(params)
            .or_else(|| params.get("turn").and_then(|t| protocol::extract_turn_id(t))),
    };
    let thread_id = protocol::extract_thread_id_for_turn(params);

    let mut data = inner.data.lock();

    if matches!(
        method,
        "turn/tokenUsage" | "turn/usage" | "thread/tokenUsage/updated"
    ) {
        let usage = params
            .get("usage")
            .or_else(|| params.get("tokenUsage"))
            .filter(|u| u.is_object())
            .cloned();
        if let Some(usage) = usage {
            if let Some(thread_id) = &thread_id {
                data.usage_by_thread.put(thread_id.clone(), usage.clone());
            }
            if let Some(turn_id) = &turn_id {
                data.usage_by_turn.put(turn_id.clone(), usage);
            }
        }
    }

    let Some(turn_id) = turn_id else {
        return;
    };

    match method {
        "item/agentMessage/delta" => {
            if let Some(state) = data
                .turns
                .resolve_for_notification(&turn_id, thread_id.as_deref())
            {
                state.apply_agent_message_delta(message, params);
            }
        }
        "item/completed" => {
            if let Some(state) = data
                .turns
                .resolve_for_notification(&turn_id, thread_id.as_deref())
            {
                state.apply_item_completed(message, params);
            }
        }
        "turn/completed" => {
            if let Some(state) = data
                .turns
                .resolve_for_notification(&turn_id, thread_id.as_deref())
            {
                state.apply_turn_completed(message, params, policy);
            }
        }
        "error" | "turn/error" => {
            if let Some(state) = data
                .turns
                .resolve_for_notification(&turn_id, thread_id.as_deref())
            {
                state.apply_error(message, params);
            }
        }
        _ => {
            // Anything else carrying a turn id still counts as liveness
            // for stall detection.
            let lookup = data.turns.lookup(&turn_id, thread_id.as_deref());
            if let Some(state) = data.turns.get_mut(&lookup) {
                state.mark_event(method);
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Disconnect & restart
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_disconnect(inner: &Arc<ClientInner>, generation: u64) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    inner.initialized.store(false, Ordering::SeqCst);
    let _ = inner.disconnected_tx.send(true);
    let closed = inner.closed.load(Ordering::SeqCst);
    let (pending, active_turns, pending_turns) = {
        let data = inner.data.lock();
        (
            data.pending.len(),
            data.turns.len(),
            data.turns.pending_len(),
        )
    };
    let (pid, stderr_tail) = {
        let process = inner.process.lock();
        (
            process.as_ref().and_then(|p| p.pid),
            process
                .as_ref()
                .map(|p| p.stderr_tail.snapshot())
                .unwrap_or_default(),
        )
    };
    tracing::warn!(
        auto_restart = inner.config.auto_restart,
        pid = pid.unwrap_or(0),
        pending_requests = pending,
        active_turns,
        pending_turns,
        closed,
        stderr_tail = ?stderr_tail,
        "app_server.disconnected"
    );
    if !closed {
        fail_pending(inner, "app-server disconnected");
    }
    if inner.config.auto_restart && !closed {
        schedule_restart(inner);
    }
}

fn fail_pending(inner: &Arc<ClientInner>, reason: &str) {
    let mut data = inner.data.lock();
    for (_, pending) in data.pending.drain() {
        let _ = pending.tx.send(Err(Error::Disconnected(reason.into())));
    }
    data.turns.fail_all(reason);
    data.usage_by_thread.clear();
    data.usage_by_turn.clear();
}

fn schedule_restart(inner: &Arc<ClientInner>) {
    let mut task_guard = inner.restart_task.lock();
    if task_guard
        .as_ref()
        .map(|task| !task.is_finished())
        .unwrap_or(false)
    {
        return;
    }
    let inner = inner.clone();
    *task_guard = Some(tokio::spawn(async move {
        restart_after_disconnect(inner).await;
    }));
}

/// Exponential backoff with proportional jitter, capped, with a bounded
/// attempt count. The backoff floor resets on the first post-attempt
/// success (inside the handshake).
async fn restart_after_disconnect(inner: Arc<ClientInner>) {
    let client = AppServerClient {
        inner: inner.clone(),
    };
    let initial_ms = inner.config.restart_backoff_initial.as_millis() as u64;
    let max_ms = inner.config.restart_backoff_max.as_millis() as u64;
    for attempt in 1..=inner.config.max_restart_attempts {
        let base_ms = inner.restart_backoff_ms.load(Ordering::SeqCst).max(initial_ms);
        let jitter_ms = (base_ms as f64
            * inner.config.restart_backoff_jitter_ratio
            * rand::rng().random::<f64>()) as u64;
        let delay = Duration::from_millis(base_ms + jitter_ms);
        tokio::time::sleep(delay).await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        match client.ensure_process().await {
            Ok(()) => {
                tracing::info!(
                    attempt,
                    delay_seconds = delay.as_secs_f64(),
                    "app_server.restarted"
                );
                return;
            }
            Err(Error::CircuitOpen { cooldown_seconds }) => {
                tracing::warn!(
                    attempt,
                    cooldown_seconds,
                    "app_server.restart.failed"
                );
                tokio::time::sleep(CIRCUIT_OPEN_RESTART_PAUSE).await;
            }
            Err(e) => {
                let next_ms = (base_ms * 2).clamp(initial_ms, max_ms);
                inner.restart_backoff_ms.store(next_ms, Ordering::SeqCst);
                tracing::warn!(
                    attempt,
                    delay_seconds = delay.as_secs_f64(),
                    next_delay_seconds = Duration::from_millis(next_ms).as_secs_f64(),
                    error = %e,
                    "app_server.restart.failed"
                );
            }
        }
    }
    tracing::error!(
        attempts = inner.config.max_restart_attempts,
        "app_server.restart.failed"
    );
    // Exhausted: the client is permanently closed.
    inner.closed.store(true, Ordering::SeqCst);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn initialize_params(include_version: bool) -> Value {
    let mut client_info = Map::new();
    client_info.insert("name".into(), json!("car"));
    if include_version {
        client_info.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    }
    json!({ "clientInfo": client_info })
}

fn apply_turn_options(params: &mut Map<String, Value>, options: &TurnOptions) {
    if let Some(approval_policy) = &options.approval_policy {
        params.insert("approvalPolicy".into(), json!(approval_policy));
    }
    if let Some(sandbox_policy) = &options.sandbox_policy {
        if let Some(normalized) = protocol::normalize_sandbox_policy(sandbox_policy) {
            params.insert("sandboxPolicy".into(), normalized);
        }
    }
    if let Some(model) = &options.model {
        params.insert("model".into(), json!(model));
    }
    if let Some(effort) = &options.effort {
        params.insert("effort".into(), json!(effort));
    }
    if let Some(extra) = &options.extra {
        params.extend(extra.clone());
    }
}

fn normalize_id_result(
    mut result: Value,
    method: &str,
    extract: fn(&Value) -> Option<String>,
) -> Result<Value> {
    if !result.is_object() {
        return Err(Error::Protocol(format!("{method} returned non-object result")));
    }
    if result.get("id").is_none() {
        if let Some(id) = extract(&result) {
            result
                .as_object_mut()
                .expect("checked object above")
                .insert("id".into(), json!(id));
        }
    }
    Ok(result)
}

/// Log-safe parameter summary: ids, sizes and counts only, never content.
fn params_summary(method: &str, params: Option<&Value>) -> String {
    let Some(params) = params.and_then(Value::as_object) else {
        return String::new();
    };
    match method {
        "turn/start" | "review/start" => {
            let input_chars: usize = params
                .get("input")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get("text").and_then(Value::as_str))
                        .map(str::len)
                        .sum()
                })
                .unwrap_or(0);
            format!(
                "thread_id={} input_chars={}",
                params
                    .get("threadId")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
                input_chars
            )
        }
        "turn/interrupt" => format!(
            "turn_id={} thread_id={}",
            params.get("turnId").and_then(Value::as_str).unwrap_or(""),
            params.get("threadId").and_then(Value::as_str).unwrap_or("")
        ),
        "thread/start" => format!(
            "cwd={}",
            params.get("cwd").and_then(Value::as_str).unwrap_or("")
        ),
        "thread/resume" => format!(
            "thread_id={}",
            params.get("threadId").and_then(Value::as_str).unwrap_or("")
        ),
        _ => format!("param_keys={}", params.len()),
    }
}
