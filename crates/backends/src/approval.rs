//! Approval bridge: answers server-initiated approval requests.
//!
//! Three modes: a fixed decision, an operator prompt that surfaces an
//! `ApprovalRequested` event and waits (bounded) for an external
//! decision, and a policy predicate over the request params. Whatever the
//! mode, the reply is well-formed and produced within the deadline; the
//! reader loop is never blocked because the client invokes handlers on a
//! separate task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use car_app_server::{ApprovalDecision, ApprovalHandler};
use car_domain::error::Result;
use car_domain::run_event::RunEvent;

use crate::normalize::describe_approval_request;

/// Predicate over approval request params.
pub type ApprovalPolicyFn = dyn Fn(&Value) -> bool + Send + Sync;

#[derive(Clone)]
pub enum ApprovalMode {
    /// Always reply with the same decision.
    Fixed { approve: bool },
    /// Surface the request as a RunEvent and wait for [`ApprovalBridge::resolve`].
    /// Falls back to `default_approve` at the deadline.
    Operator {
        timeout: Duration,
        default_approve: bool,
    },
    /// Decide from the request params, e.g. "allow `git status`, deny the
    /// rest".
    Policy(Arc<ApprovalPolicyFn>),
}

pub struct ApprovalBridge {
    mode: Mutex<ApprovalMode>,
    event_sink: Mutex<Option<mpsc::UnboundedSender<RunEvent>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<bool>>>,
}

impl ApprovalBridge {
    pub fn new(mode: ApprovalMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            event_sink: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_mode(&self, mode: ApprovalMode) {
        *self.mode.lock() = mode;
    }

    /// Route `ApprovalRequested` events for the current turn.
    pub fn set_event_sink(&self, sink: Option<mpsc::UnboundedSender<RunEvent>>) {
        *self.event_sink.lock() = sink;
    }

    /// Resolve a pending operator prompt. Returns whether the request was
    /// still waiting.
    pub fn resolve(&self, request_id: &str, approve: bool) -> bool {
        match self.pending.lock().remove(request_id) {
            Some(tx) => tx.send(approve).is_ok(),
            None => false,
        }
    }

    pub fn pending_requests(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    fn emit_requested(&self, request_id: &str, request: &Value) {
        let params = request.get("params").cloned().unwrap_or(Value::Null);
        let description = describe_approval_request(request);
        let sink = self.event_sink.lock().clone();
        if let Some(sink) = sink {
            let _ = sink.send(RunEvent::approval_requested(request_id, description, params));
        }
    }

    /// The prompt is registered before the event is emitted so a surface
    /// reacting immediately can always resolve it.
    async fn decide_approve(&self, request_id: &str, request: &Value) -> bool {
        let mode = self.mode.lock().clone();
        match mode {
            ApprovalMode::Fixed { approve } => {
                self.emit_requested(request_id, request);
                approve
            }
            ApprovalMode::Policy(policy) => {
                self.emit_requested(request_id, request);
                let params = request.get("params").cloned().unwrap_or(Value::Null);
                policy(&params)
            }
            ApprovalMode::Operator {
                timeout,
                default_approve,
            } => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().insert(request_id.to_string(), tx);
                self.emit_requested(request_id, request);
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(approve)) => approve,
                    // Timed out or the surface dropped the prompt.
                    _ => {
                        self.pending.lock().remove(request_id);
                        tracing::info!(
                            request_id = %request_id,
                            default_approve,
                            "approval prompt timed out, using default"
                        );
                        default_approve
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ApprovalHandler for ApprovalBridge {
    async fn decide(&self, request: &Value) -> Result<ApprovalDecision> {
        let request_id = request
            .get("id")
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        let approve = self.decide_approve(&request_id, request).await;

        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        if car_app_server::protocol::LEGACY_APPROVAL_METHODS.contains(&method) {
            // Legacy methods expect a decision string rather than a flag.
            let decision = if approve { "approved" } else { "denied" };
            return Ok(ApprovalDecision::Decision(decision.into()));
        }
        Ok(ApprovalDecision::Payload(json!({ "approve": approve })))
    }
}
