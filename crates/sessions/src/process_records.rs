//! Records of managed child processes, one JSON file per child, for
//! doctor-style diagnostics. Written on spawn, removed on close; a record
//! left behind names a process that was not shut down cleanly.
//!
//! Layout: `<workspace>/.car/processes/<kind>/<key>.json`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use car_domain::error::Result;

use crate::fslock::atomic_write;

const STATE_DIR: &str = ".car";

/// Stable short id for a workspace path.
pub fn workspace_id_for_path(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    /// Process category, e.g. `"codex_app_server"`.
    pub kind: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub pid: u32,
    #[serde(default)]
    pub pgid: Option<i32>,
    pub command: Vec<String>,
    /// Pid of the supervising process that owns this child.
    pub owner_pid: u32,
    /// RFC3339 spawn time.
    pub started_at: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ProcessRecord {
    pub fn new(kind: &str, workspace_id: Option<String>, pid: u32, command: &[String]) -> Self {
        Self {
            kind: kind.to_string(),
            workspace_id,
            pid,
            pgid: None,
            command: command.to_vec(),
            owner_pid: std::process::id(),
            started_at: car_domain::run_event::now_iso(),
            metadata: Value::Null,
        }
    }

    /// Key the record file is named after.
    pub fn record_key(&self) -> String {
        self.pid.to_string()
    }
}

fn records_dir(workspace_root: &Path, kind: &str) -> PathBuf {
    workspace_root.join(STATE_DIR).join("processes").join(kind)
}

fn record_path(workspace_root: &Path, kind: &str, key: &str) -> PathBuf {
    records_dir(workspace_root, kind).join(format!("{key}.json"))
}

pub fn write_process_record(workspace_root: &Path, record: &ProcessRecord) -> Result<()> {
    let path = record_path(workspace_root, &record.kind, &record.record_key());
    let rendered = serde_json::to_string_pretty(record)?;
    atomic_write(&path, &format!("{rendered}\n"))
}

pub fn delete_process_record(workspace_root: &Path, kind: &str, key: &str) -> Result<()> {
    let path = record_path(workspace_root, kind, key);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// All parseable records of one kind. Unreadable files are skipped.
pub fn list_process_records(workspace_root: &Path, kind: &str) -> Result<Vec<ProcessRecord>> {
    let dir = records_dir(workspace_root, kind);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        match serde_json::from_str::<ProcessRecord>(&raw) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "skipping bad process record");
            }
        }
    }
    records.sort_by_key(|r| r.pid);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: u32) -> ProcessRecord {
        let mut record = ProcessRecord::new(
            "codex_app_server",
            Some("abc123def456".into()),
            pid,
            &["codex".into(), "app-server".into()],
        );
        record.pgid = Some(pid as i32);
        record.metadata = serde_json::json!({"cwd": "/tmp/ws"});
        record
    }

    #[test]
    fn write_read_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record(4242);
        write_process_record(dir.path(), &rec).unwrap();

        // A fresh read (as a restarted supervisor would do) sees the same record.
        let listed = list_process_records(dir.path(), "codex_app_server").unwrap();
        assert_eq!(listed, vec![rec.clone()]);
        let listed_again = list_process_records(dir.path(), "codex_app_server").unwrap();
        assert_eq!(listed_again, vec![rec]);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record(77);
        write_process_record(dir.path(), &rec).unwrap();
        delete_process_record(dir.path(), "codex_app_server", &rec.record_key()).unwrap();
        delete_process_record(dir.path(), "codex_app_server", &rec.record_key()).unwrap();
        assert!(list_process_records(dir.path(), "codex_app_server")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn records_are_separated_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        write_process_record(dir.path(), &record(1)).unwrap();
        let mut other = record(2);
        other.kind = "opencode".into();
        write_process_record(dir.path(), &other).unwrap();

        assert_eq!(
            list_process_records(dir.path(), "codex_app_server")
                .unwrap()
                .len(),
            1
        );
        assert_eq!(list_process_records(dir.path(), "opencode").unwrap().len(), 1);
        assert!(list_process_records(dir.path(), "unknown").unwrap().is_empty());
    }

    #[test]
    fn bad_record_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_process_record(dir.path(), &record(5)).unwrap();
        let bad = dir
            .path()
            .join(STATE_DIR)
            .join("processes/codex_app_server/garbage.json");
        std::fs::write(&bad, "not json").unwrap();
        assert_eq!(
            list_process_records(dir.path(), "codex_app_server")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn workspace_id_is_stable_and_short() {
        let a = workspace_id_for_path(Path::new("/tmp/ws-a"));
        let b = workspace_id_for_path(Path::new("/tmp/ws-b"));
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert_eq!(a, workspace_id_for_path(Path::new("/tmp/ws-a")));
    }
}
