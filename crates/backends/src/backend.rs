//! The backend seam: anything that can run turns and stream canonical
//! events.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use car_domain::error::Result;
use car_domain::run_event::{BoxStream, RunEvent};

/// Per-request policy applied before a turn starts.
#[derive(Debug, Clone, Default)]
pub struct TurnPolicy {
    /// Opaque approval policy string, forwarded verbatim (`"never"`,
    /// `"on-request"`, ...).
    pub approval_policy: Option<String>,
    /// Sandbox policy; normalized to the canonical `{type}` object at the
    /// wire.
    pub sandbox_policy: Option<Value>,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    /// Bounds one turn end to end.
    pub turn_timeout: Option<Duration>,
    /// Decision used when no approval handler resolves in time.
    pub default_approval_decision: Option<String>,
}

/// A backend flavor: owns sessions against one agent runtime and streams
/// turn progress as canonical events.
///
/// Contract for [`run_turn`]: the stream begins with exactly one
/// `Started`, ends with exactly one `Completed` or `Failed`, and never
/// yields after the terminal event.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Apply per-request policy. Takes effect for subsequent turns.
    fn configure(&self, policy: TurnPolicy);

    /// Resolve or create a session. `resume_session` is tried first and
    /// falls back to a fresh session when the backend no longer knows it.
    /// Returns the authoritative session id.
    async fn start_session(
        &self,
        workspace_root: &Path,
        resume_session: Option<&str>,
    ) -> Result<String>;

    /// Run one turn against an existing session.
    async fn run_turn(&self, session_id: &str, prompt: &str) -> BoxStream<'static, RunEvent>;

    /// Best-effort interrupt of the in-flight turn.
    async fn interrupt(&self, session_id: &str);

    fn last_turn_id(&self) -> Option<String>;
    fn last_thread_info(&self) -> Option<Value>;
    fn last_token_total(&self) -> Option<Value>;

    async fn close(&self);
}
