//! App-server client: supervises agent subprocesses and speaks the
//! newline-delimited JSON-RPC dialect over their stdio.
//!
//! The pieces, bottom up:
//! - **launcher**: spawn the agent binary as a process group, wire pipes,
//!   terminate the whole tree cleanly.
//! - **transport**: assemble stdout bytes into length-bounded frames with
//!   the oversize drain protocol.
//! - **protocol**: JSON-RPC message shapes, id extraction, sandbox policy
//!   normalization, terminal-status heuristics.
//! - **turns**: per-turn state machines with streaming accumulation, the
//!   pending-by-turn-id merge path, and resume-snapshot recovery.
//! - **client**: the per-workspace [`AppServerClient`] tying it together
//!   (pending requests, handshake, stall recovery, auto-restart).
//! - **supervisor**: one client per workspace root, idle TTL, LRU caps.

pub mod circuit;
pub mod client;
pub mod launcher;
pub mod protocol;
pub mod supervisor;
pub mod transport;
pub mod turns;

pub use circuit::CircuitBreaker;
pub use client::{
    AppServerClient, ApprovalDecision, ApprovalHandler, NotificationHandler, TurnHandle,
    TurnOptions, OVERSIZE_DROPPED_METHOD,
};
pub use supervisor::WorkspaceSupervisor;
pub use turns::TurnResult;
