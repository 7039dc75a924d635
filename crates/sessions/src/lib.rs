//! Persistent per-workspace state for the backend session core.
//!
//! Three small file-backed stores, all using the same discipline: an
//! advisory file lock around read-modify-write, atomic temp-then-rename
//! writes, and corrupt files moved aside with a machine-readable notice
//! instead of crashing.

pub mod delivery_targets;
mod fslock;
pub mod process_records;
pub mod thread_registry;

pub use delivery_targets::{DeliveryTarget, DeliveryTargetStore};
pub use process_records::{
    delete_process_record, list_process_records, workspace_id_for_path, write_process_record,
    ProcessRecord,
};
pub use thread_registry::{default_app_server_threads_path, ThreadIdRegistry};
