//! The façade surfaces talk to: picks a backend flavor, applies
//! per-request policy, streams canonical events, and persists
//! per-conversation session ids through the thread-id registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_stream::stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use car_domain::error::{Error, Result};
use car_domain::run_event::{BoxStream, DeltaType, RunEvent};
use car_sessions::ThreadIdRegistry;

use crate::backend::{AgentBackend, TurnPolicy};
use crate::opencode::is_session_missing_message;

/// Context for the most recent backend run.
#[derive(Debug, Clone, Default)]
pub struct BackendContext {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub turn_id: Option<String>,
    pub thread_info: Option<Value>,
}

/// One turn's worth of input to [`BackendOrchestrator::run_turn`].
#[derive(Debug, Clone)]
pub struct RunTurnRequest {
    pub agent_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub reasoning: Option<String>,
    /// Abstract key (e.g. `"pma"`, `"doc_chat:spec"`) used to persist the
    /// session id across process restarts.
    pub session_key: Option<String>,
    /// Explicit session id; wins over the persisted mapping.
    pub session_id: Option<String>,
    pub workspace_root: PathBuf,
}

pub struct BackendOrchestrator {
    backends: Mutex<HashMap<String, Arc<dyn AgentBackend>>>,
    threads: Arc<ThreadIdRegistry>,
    reuse_session: bool,
    base_policy: Mutex<TurnPolicy>,
    /// Shared with in-flight streams so they can update it mid-turn.
    context: Arc<Mutex<Option<BackendContext>>>,
    active: Mutex<Option<Arc<dyn AgentBackend>>>,
}

impl BackendOrchestrator {
    pub fn new(threads: Arc<ThreadIdRegistry>, reuse_session: bool) -> Self {
        Self {
            backends: Mutex::new(HashMap::new()),
            threads,
            reuse_session,
            base_policy: Mutex::new(TurnPolicy::default()),
            context: Arc::new(Mutex::new(None)),
            active: Mutex::new(None),
        }
    }

    /// Register a backend flavor under its agent id (`"codex"`,
    /// `"opencode"`, ...).
    pub fn register_backend(&self, agent_id: &str, backend: Arc<dyn AgentBackend>) {
        self.backends.lock().insert(agent_id.to_string(), backend);
    }

    /// Policy applied to every turn unless the request overrides parts.
    pub fn set_base_policy(&self, policy: TurnPolicy) {
        *self.base_policy.lock() = policy;
    }

    fn backend_for(&self, agent_id: &str) -> Result<Arc<dyn AgentBackend>> {
        self.backends
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unsupported agent_id: {agent_id}")))
    }

    /// Pre-warm a session without running a turn.
    pub async fn start_session(
        &self,
        agent_id: &str,
        workspace_root: &std::path::Path,
        session_id: Option<&str>,
    ) -> Result<String> {
        let backend = self.backend_for(agent_id)?;
        *self.active.lock() = Some(backend.clone());
        let session = backend.start_session(workspace_root, session_id).await?;
        *self.context.lock() = Some(BackendContext {
            agent_id: agent_id.to_string(),
            session_id: Some(session.clone()),
            turn_id: None,
            thread_info: backend.last_thread_info(),
        });
        Ok(session)
    }

    /// Run a turn, streaming canonical events.
    ///
    /// Session resolution: an explicit id wins; otherwise, with
    /// `reuse_session` on, the persisted mapping for `session_key` is
    /// resumed. A session the backend no longer knows clears the mapping
    /// and restarts the turn once on a fresh session.
    pub async fn run_turn(&self, request: RunTurnRequest) -> Result<BoxStream<'static, RunEvent>> {
        let backend = self.backend_for(&request.agent_id)?;
        *self.active.lock() = Some(backend.clone());

        let mut policy = self.base_policy.lock().clone();
        if request.model.is_some() {
            policy.model = request.model.clone();
        }
        if request.reasoning.is_some() {
            policy.reasoning_effort = request.reasoning.clone();
        }
        backend.configure(policy);

        let mut resume = request.session_id.clone();
        if resume.is_none() && self.reuse_session {
            if let Some(key) = &request.session_key {
                resume = self.threads.get(key).unwrap_or_default();
            }
        }

        let threads = self.threads.clone();
        let reuse_session = self.reuse_session;
        let context = ContextHandle {
            context: self.context.clone(),
        };
        let agent_id = request.agent_id.clone();
        let session_key = request.session_key.clone();
        let workspace_root = request.workspace_root.clone();
        let prompt = request.prompt.clone();

        Ok(Box::pin(stream! {
            let mut attempt = 0u32;
            let mut resume = resume;
            'turn: loop {
                attempt += 1;
                let session = match backend
                    .start_session(&workspace_root, resume.as_deref())
                    .await
                {
                    Ok(session) => session,
                    Err(e) => {
                        yield RunEvent::failed(e.to_string());
                        return;
                    }
                };
                if reuse_session {
                    if let Some(key) = &session_key {
                        if let Err(e) = threads.set(key, &session) {
                            tracing::warn!(session_key = %key, error = %e, "failed to persist thread id");
                        }
                    }
                }
                context.update(&agent_id, Some(session.clone()), None, backend.last_thread_info());

                let mut inner = backend.run_turn(&session, &prompt).await;
                let mut skipped_user_echo = false;
                while let Some(event) = inner.next().await {
                    match &event {
                        // On the retry pass the replayed preamble is
                        // suppressed so the surface sees one Started and
                        // one user-message echo per turn.
                        RunEvent::Started { .. } if attempt > 1 => continue,
                        RunEvent::OutputDelta {
                            delta_type: DeltaType::UserMessage,
                            ..
                        } if attempt > 1 && !skipped_user_echo => {
                            skipped_user_echo = true;
                            continue;
                        }
                        RunEvent::Failed { error_message, .. }
                            if attempt == 1
                                && resume.is_some()
                                && is_session_missing_message(error_message) =>
                        {
                            tracing::info!(
                                session_id = %session,
                                "session vanished mid-turn, restarting once"
                            );
                            if let Some(key) = &session_key {
                                let _ = threads.reset(key);
                            }
                            resume = None;
                            continue 'turn;
                        }
                        _ => {}
                    }
                    let terminal = event.is_terminal();
                    context.update(
                        &agent_id,
                        Some(session.clone()),
                        backend.last_turn_id(),
                        backend.last_thread_info(),
                    );
                    yield event;
                    if terminal {
                        return;
                    }
                }
                // Stream ended without a terminal event: surface that as a
                // failure rather than hanging the caller.
                yield RunEvent::failed("backend stream ended without a terminal event");
                return;
            }
        }))
    }

    /// Best-effort interrupt of the current run. A missing session or
    /// turn id is logged, never fatal.
    pub async fn interrupt(&self, agent_id: &str) {
        let session_id = self
            .context
            .lock()
            .as_ref()
            .and_then(|c| c.session_id.clone());
        let Some(session_id) = session_id else {
            tracing::warn!(agent_id = %agent_id, "nothing to interrupt: no session");
            return;
        };
        match self.backend_for(agent_id) {
            Ok(backend) => backend.interrupt(&session_id).await,
            Err(e) => tracing::warn!(agent_id = %agent_id, error = %e, "interrupt skipped"),
        }
    }

    pub fn get_context(&self) -> Option<BackendContext> {
        self.context.lock().clone()
    }

    pub fn get_last_turn_id(&self) -> Option<String> {
        if let Some(backend) = self.active.lock().as_ref() {
            if let Some(turn_id) = backend.last_turn_id() {
                return Some(turn_id);
            }
        }
        self.context.lock().as_ref().and_then(|c| c.turn_id.clone())
    }

    pub fn get_last_thread_info(&self) -> Option<Value> {
        if let Some(backend) = self.active.lock().as_ref() {
            if let Some(info) = backend.last_thread_info() {
                return Some(info);
            }
        }
        self.context
            .lock()
            .as_ref()
            .and_then(|c| c.thread_info.clone())
    }

    pub fn get_last_token_total(&self) -> Option<Value> {
        self.active
            .lock()
            .as_ref()
            .and_then(|backend| backend.last_token_total())
    }

    // ── Thread-id registry passthrough ───────────────────────────

    pub fn get_thread_id(&self, session_key: &str) -> Option<String> {
        self.threads.get(session_key).unwrap_or_default()
    }

    pub fn set_thread_id(&self, session_key: &str, thread_id: &str) -> Result<()> {
        self.threads.set(session_key, thread_id)
    }

    pub fn reset_thread_id(&self, session_key: &str) -> bool {
        self.threads.reset(session_key).unwrap_or(false)
    }

    pub async fn close_all(&self) {
        let backends: Vec<Arc<dyn AgentBackend>> =
            self.backends.lock().values().cloned().collect();
        for backend in backends {
            backend.close().await;
        }
        *self.active.lock() = None;
        *self.context.lock() = None;
    }
}

/// Updates the orchestrator context from inside a running stream.
struct ContextHandle {
    context: Arc<Mutex<Option<BackendContext>>>,
}

impl ContextHandle {
    fn update(
        &self,
        agent_id: &str,
        session_id: Option<String>,
        turn_id: Option<String>,
        thread_info: Option<Value>,
    ) {
        let mut context = self.context.lock();
        let entry = context.get_or_insert_with(BackendContext::default);
        entry.agent_id = agent_id.to_string();
        if session_id.is_some() {
            entry.session_id = session_id;
        }
        if turn_id.is_some() {
            entry.turn_id = turn_id;
        }
        if thread_info.is_some() {
            entry.thread_info = thread_info;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockBackend {
        session_seq: AtomicU32,
        turn_seq: AtomicU32,
        /// First run_turn call fails with a session-missing error.
        fail_first_turn: bool,
        last_turn: Mutex<Option<String>>,
    }

    impl MockBackend {
        fn new(fail_first_turn: bool) -> Arc<Self> {
            Arc::new(Self {
                session_seq: AtomicU32::new(0),
                turn_seq: AtomicU32::new(0),
                fail_first_turn,
                last_turn: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl AgentBackend for MockBackend {
        fn configure(&self, _policy: TurnPolicy) {}

        async fn start_session(
            &self,
            _workspace_root: &Path,
            resume_session: Option<&str>,
        ) -> Result<String> {
            if let Some(resume) = resume_session {
                return Ok(resume.to_string());
            }
            let n = self.session_seq.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("sess-{n}"))
        }

        async fn run_turn(&self, session_id: &str, prompt: &str) -> BoxStream<'static, RunEvent> {
            let turn = self.turn_seq.fetch_add(1, Ordering::SeqCst) + 1;
            *self.last_turn.lock() = Some(format!("turn-{turn}"));
            let fail = self.fail_first_turn && turn == 1;
            let session_id = session_id.to_string();
            let prompt = prompt.to_string();
            Box::pin(stream! {
                yield RunEvent::started(&session_id, None, None);
                yield RunEvent::output_delta(prompt.clone(), DeltaType::UserMessage);
                if fail {
                    yield RunEvent::failed("turn request failed (status 404)");
                    return;
                }
                yield RunEvent::output_delta("answer", DeltaType::AssistantStream);
                yield RunEvent::completed("answer");
            })
        }

        async fn interrupt(&self, _session_id: &str) {}

        fn last_turn_id(&self) -> Option<String> {
            self.last_turn.lock().clone()
        }

        fn last_thread_info(&self) -> Option<Value> {
            None
        }

        fn last_token_total(&self) -> Option<Value> {
            None
        }

        async fn close(&self) {}
    }

    fn orchestrator(reuse: bool) -> (tempfile::TempDir, BackendOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let threads = Arc::new(ThreadIdRegistry::new(dir.path().join("threads.json")));
        (dir, BackendOrchestrator::new(threads, reuse))
    }

    fn request(session_key: Option<&str>) -> RunTurnRequest {
        RunTurnRequest {
            agent_id: "codex".into(),
            prompt: "hello".into(),
            model: None,
            reasoning: None,
            session_key: session_key.map(str::to_string),
            session_id: None,
            workspace_root: PathBuf::from("/tmp/ws"),
        }
    }

    async fn collect(stream: BoxStream<'static, RunEvent>) -> Vec<RunEvent> {
        stream.collect::<Vec<_>>().await
    }

    #[tokio::test]
    async fn run_turn_streams_and_persists_mapping() {
        let (_dir, orchestrator) = orchestrator(true);
        orchestrator.register_backend("codex", MockBackend::new(false));

        let events = collect(
            orchestrator
                .run_turn(request(Some("pma")))
                .await
                .unwrap(),
        )
        .await;

        let started: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, RunEvent::Started { .. }))
            .collect();
        assert_eq!(started.len(), 1);
        assert!(matches!(events.last().unwrap(), RunEvent::Completed { .. }));
        assert_eq!(
            orchestrator.get_thread_id("pma").as_deref(),
            Some("sess-1")
        );
        let context = orchestrator.get_context().unwrap();
        assert_eq!(context.agent_id, "codex");
        assert_eq!(context.session_id.as_deref(), Some("sess-1"));
        assert_eq!(orchestrator.get_last_turn_id().as_deref(), Some("turn-1"));
    }

    #[tokio::test]
    async fn persisted_session_is_resumed() {
        let (_dir, orchestrator) = orchestrator(true);
        orchestrator.register_backend("codex", MockBackend::new(false));
        orchestrator.set_thread_id("pma", "sess-old").unwrap();

        let events = collect(
            orchestrator
                .run_turn(request(Some("pma")))
                .await
                .unwrap(),
        )
        .await;
        match events.first().unwrap() {
            RunEvent::Started { session_id, .. } => assert_eq!(session_id, "sess-old"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_missing_clears_mapping_and_restarts_once() {
        let (_dir, orchestrator) = orchestrator(true);
        let backend = MockBackend::new(true);
        orchestrator.register_backend("codex", backend.clone());
        orchestrator.set_thread_id("pma", "sess-stale").unwrap();

        let events = collect(
            orchestrator
                .run_turn(request(Some("pma")))
                .await
                .unwrap(),
        )
        .await;

        // Exactly one Started, one user echo, one terminal Completed.
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, RunEvent::Started { .. }))
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(
                    e,
                    RunEvent::OutputDelta {
                        delta_type: DeltaType::UserMessage,
                        ..
                    }
                ))
                .count(),
            1
        );
        assert!(matches!(events.last().unwrap(), RunEvent::Completed { .. }));
        // The stale mapping was replaced by the fresh session.
        assert_eq!(
            orchestrator.get_thread_id("pma").as_deref(),
            Some("sess-1")
        );
        assert_eq!(backend.turn_seq.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_session_missing_is_fatal() {
        let (_dir, orchestrator) = orchestrator(true);
        // Every turn 404s; no resume mapping exists, so no retry applies.
        let backend = MockBackend::new(true);
        backend.turn_seq.store(0, Ordering::SeqCst);
        orchestrator.register_backend("codex", backend.clone());

        let events = collect(
            orchestrator
                .run_turn(request(None))
                .await
                .unwrap(),
        )
        .await;
        assert!(matches!(events.last().unwrap(), RunEvent::Failed { .. }));
        assert_eq!(backend.turn_seq.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_agent_is_config_error() {
        let (_dir, orchestrator) = orchestrator(false);
        let err = match orchestrator.run_turn(request(None)).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn reset_thread_id_round_trip() {
        let (_dir, orchestrator) = orchestrator(true);
        orchestrator.set_thread_id("doc_chat:spec", "th-1").unwrap();
        assert_eq!(
            orchestrator.get_thread_id("doc_chat:spec").as_deref(),
            Some("th-1")
        );
        assert!(orchestrator.reset_thread_id("doc_chat:spec"));
        assert_eq!(orchestrator.get_thread_id("doc_chat:spec"), None);
        assert!(!orchestrator.reset_thread_id("doc_chat:spec"));
    }
}
