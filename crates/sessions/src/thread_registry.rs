//! File-backed mapping from abstract session keys to app-server thread
//! ids, so surfaces can resume conversations across process restarts.
//!
//! On-disk schema is a flat JSON object `{session_key: thread_id}`.
//! Every mutation takes the advisory lock, reads, mutates, and writes via
//! temp-file + atomic rename. Unparsable JSON is moved aside with a
//! timestamp suffix and a corruption notice; the registry then starts
//! empty rather than failing.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use car_domain::error::Result;

use crate::fslock::{atomic_write, corruption_stamp, FileLock};

/// Default location under a state root.
pub fn default_app_server_threads_path(state_root: &Path) -> PathBuf {
    state_root.join("app_server_threads.json")
}

pub struct ThreadIdRegistry {
    path: PathBuf,
}

impl ThreadIdRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, session_key: &str) -> Result<Option<String>> {
        let _lock = FileLock::acquire(&self.path)?;
        Ok(self.load_locked().remove(session_key))
    }

    /// Map a session key to a thread id, overwriting any previous value.
    pub fn set(&self, session_key: &str, thread_id: &str) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut map = self.load_locked();
        map.insert(session_key.to_string(), thread_id.to_string());
        self.save_locked(&map)
    }

    /// Remove a key so the next turn starts a fresh thread. Returns whether
    /// a mapping existed.
    pub fn reset(&self, session_key: &str) -> Result<bool> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut map = self.load_locked();
        let existed = map.remove(session_key).is_some();
        if existed {
            self.save_locked(&map)?;
        }
        Ok(existed)
    }

    pub fn reset_all(&self) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        self.save_locked(&BTreeMap::new())
    }

    pub fn entries(&self) -> Result<BTreeMap<String, String>> {
        let _lock = FileLock::acquire(&self.path)?;
        Ok(self.load_locked())
    }

    fn load_locked(&self) -> BTreeMap<String, String> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return BTreeMap::new(),
        };
        match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
            Ok(map) => map,
            Err(e) => {
                self.quarantine_corrupt(&e.to_string());
                BTreeMap::new()
            }
        }
    }

    fn save_locked(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let rendered = serde_json::to_string_pretty(map)?;
        atomic_write(&self.path, &format!("{rendered}\n"))
    }

    /// Move the unparsable file aside and leave a machine-readable notice.
    fn quarantine_corrupt(&self, detail: &str) {
        let stamp = corruption_stamp();
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app_server_threads.json".into());
        let backup_path = self.path.with_file_name(format!("{name}.corrupt.{stamp}"));
        let backup_value = match std::fs::rename(&self.path, &backup_path) {
            Ok(()) => backup_path.to_string_lossy().into_owned(),
            Err(_) => String::new(),
        };
        tracing::warn!(
            path = %self.path.display(),
            backup = %backup_value,
            "thread registry corrupt, starting empty"
        );
        let notice = json!({
            "status": "corrupt",
            "message": "thread registry reset due to unparsable JSON",
            "detail": detail,
            "detected_at": stamp,
            "backup_path": backup_value,
        });
        let notice_path = self.path.with_file_name(format!("{name}.corrupt.json"));
        let rendered = serde_json::to_string_pretty(&notice).unwrap_or_default();
        let _ = atomic_write(&notice_path, &format!("{rendered}\n"));
    }
}
