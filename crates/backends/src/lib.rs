//! Backend flavors and the orchestrator façade.
//!
//! Two first-class ways to talk to an agent exist: the app-server flavor
//! (JSON-RPC subprocess, threads and turns) and the opencode flavor
//! (HTTP sessions with chunked streaming). Both present the same
//! canonical [`car_domain::RunEvent`] stream; the orchestrator picks a
//! flavor, applies per-request policy, and persists session ids through
//! the thread-id registry.

pub mod approval;
pub mod backend;
pub mod codex;
pub mod normalize;
pub mod opencode;
pub mod orchestrator;

pub use approval::{ApprovalBridge, ApprovalMode};
pub use backend::{AgentBackend, TurnPolicy};
pub use codex::CodexAppServerBackend;
pub use normalize::EventNormalizer;
pub use opencode::OpenCodeBackend;
pub use orchestrator::{BackendContext, BackendOrchestrator, RunTurnRequest};
