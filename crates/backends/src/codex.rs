//! App-server flavored backend: sessions are threads, turns are
//! `turn/start`, progress arrives as JSON-RPC notifications that the
//! normalizer turns into canonical events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use car_app_server::{
    AppServerClient, NotificationHandler, TurnOptions, WorkspaceSupervisor,
};
use car_domain::error::{Error, Result};
use car_domain::run_event::{BoxStream, DeltaType, RunEvent};

use crate::approval::ApprovalBridge;
use crate::backend::{AgentBackend, TurnPolicy};
use crate::normalize::EventNormalizer;

struct BackendState {
    workspace_root: PathBuf,
    policy: TurnPolicy,
    client: Option<AppServerClient>,
    thread_id: Option<String>,
    turn_id: Option<String>,
    thread_info: Option<Value>,
    last_token_total: Option<Value>,
}

/// Forwards raw notifications outward and feeds the normalizer; the
/// current turn's event queue is swapped in per turn.
struct QueueHandler {
    state: Arc<Mutex<BackendState>>,
    normalizer: Arc<Mutex<EventNormalizer>>,
    sink: Mutex<Option<mpsc::UnboundedSender<RunEvent>>>,
    external: Mutex<Option<Arc<dyn NotificationHandler>>>,
}

impl QueueHandler {
    fn set_sink(&self, sink: Option<mpsc::UnboundedSender<RunEvent>>) {
        *self.sink.lock() = sink;
    }
}

#[async_trait]
impl NotificationHandler for QueueHandler {
    async fn notify(&self, message: Value) {
        let external = self.external.lock().clone();
        if let Some(external) = external {
            external.notify(message.clone()).await;
        }

        // Drop notifications for threads this backend does not own.
        let notification_thread = message
            .get("params")
            .and_then(car_app_server::protocol::extract_thread_id_for_turn);
        let our_thread = self.state.lock().thread_id.clone();
        if let (Some(ours), Some(theirs)) = (&our_thread, &notification_thread) {
            if ours != theirs {
                return;
            }
        }

        let event = self.normalizer.lock().map(&message);
        let Some(event) = event else { return };
        if let RunEvent::TokenUsage { usage, .. } = &event {
            self.state.lock().last_token_total = Some(usage.clone());
        }
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            let _ = sink.send(event);
        }
    }
}

pub struct CodexAppServerBackend {
    supervisor: WorkspaceSupervisor,
    bridge: Arc<ApprovalBridge>,
    state: Arc<Mutex<BackendState>>,
    normalizer: Arc<Mutex<EventNormalizer>>,
    queue: Arc<QueueHandler>,
}

impl CodexAppServerBackend {
    pub fn new(
        supervisor: WorkspaceSupervisor,
        workspace_root: PathBuf,
        bridge: Arc<ApprovalBridge>,
    ) -> Self {
        let state = Arc::new(Mutex::new(BackendState {
            workspace_root,
            policy: TurnPolicy::default(),
            client: None,
            thread_id: None,
            turn_id: None,
            thread_info: None,
            last_token_total: None,
        }));
        let normalizer = Arc::new(Mutex::new(EventNormalizer::new()));
        let queue = Arc::new(QueueHandler {
            state: state.clone(),
            normalizer: normalizer.clone(),
            sink: Mutex::new(None),
            external: Mutex::new(None),
        });
        Self {
            supervisor,
            bridge,
            state,
            normalizer,
            queue,
        }
    }

    /// Raw notification pass-through for surfaces that want
    /// vendor-specific progress.
    pub fn set_raw_notification_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        *self.queue.external.lock() = handler;
    }

    pub fn approval_bridge(&self) -> Arc<ApprovalBridge> {
        self.bridge.clone()
    }

    async fn ensure_client(&self) -> Result<AppServerClient> {
        let (existing, workspace_root) = {
            let state = self.state.lock();
            (state.client.clone(), state.workspace_root.clone())
        };
        let client = match existing {
            Some(client) if !client.is_closed() => client,
            _ => {
                let client = self.supervisor.get_client(&workspace_root).await?;
                self.state.lock().client = Some(client.clone());
                client
            }
        };
        client.set_approval_handler(Some(self.bridge.clone()));
        client.set_notification_handler(Some(self.queue.clone()));
        if let Some(decision) = self.state.lock().policy.default_approval_decision.clone() {
            client.set_default_approval_decision(&decision);
        }
        Ok(client)
    }

    fn turn_options(policy: &TurnPolicy) -> TurnOptions {
        TurnOptions {
            approval_policy: policy.approval_policy.clone(),
            sandbox_policy: policy.sandbox_policy.clone(),
            model: policy.model.clone(),
            effort: policy.reasoning_effort.clone(),
            ..Default::default()
        }
    }

    /// Terminal event for a finished turn: success statuses complete,
    /// everything else (including unknown) fails with the best message we
    /// have.
    fn terminal_event(result: &car_app_server::TurnResult) -> RunEvent {
        if result.is_success() {
            RunEvent::completed(result.final_message.clone())
        } else {
            let reason = if !result.errors.is_empty() {
                result.errors.join("; ")
            } else {
                match result.status.as_deref() {
                    Some(status) => format!("turn {status}"),
                    None => "turn ended without a terminal status".to_string(),
                }
            };
            RunEvent::failed(reason)
        }
    }
}

#[async_trait]
impl AgentBackend for CodexAppServerBackend {
    fn configure(&self, policy: TurnPolicy) {
        self.state.lock().policy = policy;
    }

    async fn start_session(
        &self,
        workspace_root: &Path,
        resume_session: Option<&str>,
    ) -> Result<String> {
        {
            let mut state = self.state.lock();
            if state.workspace_root != workspace_root {
                state.workspace_root = workspace_root.to_path_buf();
                state.client = None;
                state.thread_id = None;
                state.thread_info = None;
            }
            // Never carry a stale turn id into a new session.
            state.turn_id = None;
        }
        self.normalizer.lock().begin_turn(None);
        let client = self.ensure_client().await?;

        if let Some(resume) = resume_session.filter(|s| !s.is_empty()) {
            match client.thread_resume(resume).await {
                Ok(result) => {
                    let thread_id = result
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or(resume)
                        .to_string();
                    let mut state = self.state.lock();
                    state.thread_info = Some(result);
                    state.thread_id = Some(thread_id.clone());
                    return Ok(thread_id);
                }
                Err(e) => {
                    tracing::info!(
                        thread_id = %resume,
                        error = %e,
                        "thread resume failed, starting fresh"
                    );
                    let mut state = self.state.lock();
                    state.thread_id = None;
                    state.thread_info = None;
                }
            }
        }

        let workspace = self.state.lock().workspace_root.clone();
        let result = client
            .thread_start(&workspace.to_string_lossy(), None)
            .await?;
        let thread_id = result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("thread/start response missing thread id".into()))?;
        let mut state = self.state.lock();
        state.thread_info = Some(result);
        state.thread_id = Some(thread_id.clone());
        Ok(thread_id)
    }

    async fn run_turn(&self, session_id: &str, prompt: &str) -> BoxStream<'static, RunEvent> {
        let state = self.state.clone();
        let normalizer = self.normalizer.clone();
        let queue = self.queue.clone();
        let bridge = self.bridge.clone();
        let supervisor = self.supervisor.clone();
        let session_id = session_id.to_string();
        let prompt = prompt.to_string();

        Box::pin(stream! {
            let backend = CodexAppServerBackend {
                supervisor,
                bridge: bridge.clone(),
                state: state.clone(),
                normalizer: normalizer.clone(),
                queue: queue.clone(),
            };

            if !session_id.is_empty() {
                let mut guard = state.lock();
                guard.thread_id = Some(session_id.clone());
                guard.turn_id = None;
            }
            let thread_id = state.lock().thread_id.clone();
            let thread_id = match thread_id {
                Some(thread_id) => thread_id,
                None => {
                    let workspace = state.lock().workspace_root.clone();
                    match backend.start_session(&workspace, None).await {
                        Ok(thread_id) => thread_id,
                        Err(e) => {
                            yield RunEvent::failed(e.to_string());
                            return;
                        }
                    }
                }
            };
            let client = match backend.ensure_client().await {
                Ok(client) => client,
                Err(e) => {
                    yield RunEvent::failed(e.to_string());
                    return;
                }
            };

            yield RunEvent::started(&thread_id, Some(&thread_id), None);
            yield RunEvent::output_delta(prompt.clone(), DeltaType::UserMessage);

            let (tx, mut rx) = mpsc::unbounded_channel();
            queue.set_sink(Some(tx.clone()));
            bridge.set_event_sink(Some(tx));
            normalizer.lock().begin_turn(None);

            let (policy_options, turn_timeout) = {
                let guard = state.lock();
                (
                    CodexAppServerBackend::turn_options(&guard.policy),
                    guard.policy.turn_timeout,
                )
            };
            let handle = match client.turn_start(&thread_id, &prompt, policy_options).await {
                Ok(handle) => handle,
                Err(e) => {
                    queue.set_sink(None);
                    bridge.set_event_sink(None);
                    yield RunEvent::failed(e.to_string());
                    return;
                }
            };
            {
                let mut guard = state.lock();
                guard.turn_id = Some(handle.turn_id.clone());
            }
            normalizer.lock().set_turn_id(Some(handle.turn_id.clone()));

            let wait_handle = handle.clone();
            let mut wait_task = tokio::spawn(async move {
                wait_handle.wait(turn_timeout).await
            });

            enum Step {
                Event(Option<RunEvent>),
                Terminal(Result<car_app_server::TurnResult>),
            }

            let mut failure_from_stream: Option<String> = None;
            let terminal = loop {
                let step = tokio::select! {
                    maybe_event = rx.recv() => Step::Event(maybe_event),
                    result = &mut wait_task => Step::Terminal(flatten_wait(result)),
                };
                match step {
                    // Terminal events are emitted exactly once, from the
                    // turn result below; a streamed turn/error is
                    // remembered as the failure reason instead.
                    Step::Event(Some(RunEvent::Failed { error_message, .. })) => {
                        failure_from_stream = Some(error_message);
                    }
                    Step::Event(Some(event)) => yield event,
                    Step::Event(None) => {
                        break finish_wait(&mut wait_task).await;
                    }
                    Step::Terminal(result) => {
                        let mut drained = Vec::new();
                        while let Ok(event) = rx.try_recv() {
                            drained.push(event);
                        }
                        for event in drained {
                            match event {
                                RunEvent::Failed { error_message, .. } => {
                                    failure_from_stream = Some(error_message);
                                }
                                event => yield event,
                            }
                        }
                        break result;
                    }
                }
            };

            queue.set_sink(None);
            bridge.set_event_sink(None);
            normalizer.lock().begin_turn(None);

            match terminal {
                Ok(result) => {
                    let mut event = CodexAppServerBackend::terminal_event(&result);
                    if let (RunEvent::Failed { error_message, .. }, Some(streamed)) =
                        (&mut event, failure_from_stream)
                    {
                        if error_message.starts_with("turn ") {
                            *error_message = streamed;
                        }
                    }
                    yield event;
                }
                Err(e) => yield RunEvent::failed(e.to_string()),
            }
        })
    }

    async fn interrupt(&self, session_id: &str) {
        let (client, turn_id, thread_id) = {
            let state = self.state.lock();
            let thread_id = if session_id.is_empty() {
                state.thread_id.clone()
            } else {
                Some(session_id.to_string())
            };
            (state.client.clone(), state.turn_id.clone(), thread_id)
        };
        let Some(client) = client else { return };
        match turn_id {
            Some(turn_id) => {
                match client.turn_interrupt(&turn_id, thread_id.as_deref()).await {
                    Ok(_) => {
                        tracing::info!(
                            turn_id = %turn_id,
                            thread_id = thread_id.as_deref().unwrap_or("unknown"),
                            "turn interrupted"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(turn_id = %turn_id, error = %e, "failed to interrupt turn");
                    }
                }
            }
            None => {
                tracing::warn!(
                    thread_id = thread_id.as_deref().unwrap_or("unknown"),
                    "cannot interrupt turn: missing turn id"
                );
            }
        }
    }

    fn last_turn_id(&self) -> Option<String> {
        self.state.lock().turn_id.clone()
    }

    fn last_thread_info(&self) -> Option<Value> {
        self.state.lock().thread_info.clone()
    }

    fn last_token_total(&self) -> Option<Value> {
        self.state.lock().last_token_total.clone()
    }

    async fn close(&self) {
        self.state.lock().client = None;
    }
}

async fn finish_wait(
    wait_task: &mut tokio::task::JoinHandle<Result<car_app_server::TurnResult>>,
) -> Result<car_app_server::TurnResult> {
    flatten_wait(wait_task.await)
}

fn flatten_wait(
    result: std::result::Result<Result<car_app_server::TurnResult>, tokio::task::JoinError>,
) -> Result<car_app_server::TurnResult> {
    match result {
        Ok(inner) => inner,
        Err(join_error) => Err(Error::Other(format!("turn wait task failed: {join_error}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use car_app_server::TurnResult;

    fn result(status: Option<&str>, messages: Vec<&str>, errors: Vec<&str>) -> TurnResult {
        TurnResult {
            turn_id: "t-1".into(),
            status: status.map(str::to_string),
            final_message: messages.last().map(|m| m.to_string()).unwrap_or_default(),
            agent_messages: messages.into_iter().map(str::to_string).collect(),
            errors: errors.into_iter().map(str::to_string).collect(),
            raw_events: Vec::new(),
        }
    }

    #[test]
    fn success_statuses_complete() {
        for status in ["completed", "done", "succeeded"] {
            let event =
                CodexAppServerBackend::terminal_event(&result(Some(status), vec!["hi"], vec![]));
            match event {
                RunEvent::Completed { final_message, .. } => assert_eq!(final_message, "hi"),
                other => panic!("unexpected for {status}: {other:?}"),
            }
        }
    }

    #[test]
    fn failure_statuses_fail_with_reason() {
        for status in ["failed", "cancelled", "interrupted", "stopped"] {
            let event = CodexAppServerBackend::terminal_event(&result(Some(status), vec![], vec![]));
            match event {
                RunEvent::Failed { error_message, .. } => {
                    assert!(error_message.contains(status), "{error_message}");
                }
                other => panic!("unexpected for {status}: {other:?}"),
            }
        }
    }

    #[test]
    fn errors_take_precedence_in_failure_reason() {
        let event = CodexAppServerBackend::terminal_event(&result(
            Some("failed"),
            vec![],
            vec!["rate limited", "quota"],
        ));
        match event {
            RunEvent::Failed { error_message, .. } => {
                assert_eq!(error_message, "rate limited; quota");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_status_is_terminal_unknown_not_success() {
        let event = CodexAppServerBackend::terminal_event(&result(None, vec!["partial"], vec![]));
        assert!(matches!(event, RunEvent::Failed { .. }));
        let event =
            CodexAppServerBackend::terminal_event(&result(Some("exploded"), vec![], vec![]));
        assert!(matches!(event, RunEvent::Failed { .. }));
    }
}
