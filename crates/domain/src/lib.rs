//! Shared domain types for the backend session core.
//!
//! Everything the other crates agree on lives here: the workspace-wide
//! error type, the canonical [`run_event::RunEvent`] model emitted to
//! surfaces, and the plain config structs that tune timeouts and limits.

pub mod config;
pub mod error;
pub mod run_event;

pub use config::{AppServerConfig, OutputPolicy, SupervisorConfig};
pub use error::{Error, Result};
pub use run_event::{now_iso, BoxStream, DeltaType, RunEvent};
