//! Persisted set of canonical delivery targets with an optional active
//! pointer. Surfaces route turn output by these keys:
//! `web`, `local:<relpath>`, `chat:<platform>:<chat_id>[:<thread_id>]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use car_domain::error::{Error, Result};

use crate::fslock::{atomic_write, FileLock};

const STORE_VERSION: u32 = 1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Target keys
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A canonical delivery address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    Web,
    Local {
        relpath: String,
    },
    Chat {
        platform: String,
        chat_id: String,
        thread_id: Option<String>,
    },
}

impl DeliveryTarget {
    pub fn chat(platform: &str, chat_id: &str, thread_id: Option<&str>) -> Self {
        DeliveryTarget::Chat {
            platform: platform.trim().to_ascii_lowercase(),
            chat_id: chat_id.to_string(),
            thread_id: thread_id.map(str::to_string),
        }
    }

    /// Render the canonical key. Parsing the result yields this target
    /// back (round-trip law).
    pub fn canonical_key(&self) -> String {
        match self {
            DeliveryTarget::Web => "web".to_string(),
            DeliveryTarget::Local { relpath } => format!("local:{relpath}"),
            DeliveryTarget::Chat {
                platform,
                chat_id,
                thread_id,
            } => match thread_id {
                Some(thread_id) => format!("chat:{platform}:{chat_id}:{thread_id}"),
                None => format!("chat:{platform}:{chat_id}"),
            },
        }
    }

    /// Parse a canonical key; unknown shapes yield `None`.
    pub fn parse_key(key: &str) -> Option<Self> {
        let key = key.trim();
        if key == "web" {
            return Some(DeliveryTarget::Web);
        }
        if let Some(relpath) = key.strip_prefix("local:") {
            if relpath.is_empty() {
                return None;
            }
            return Some(DeliveryTarget::Local {
                relpath: relpath.to_string(),
            });
        }
        let rest = key.strip_prefix("chat:")?;
        let mut parts = rest.splitn(3, ':');
        let platform = parts.next()?.trim();
        let chat_id = parts.next()?.trim();
        if platform.is_empty() || chat_id.is_empty() {
            return None;
        }
        let thread_id = parts
            .next()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        Some(DeliveryTarget::Chat {
            platform: platform.to_ascii_lowercase(),
            chat_id: chat_id.to_string(),
            thread_id,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreState {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    last_delivery_by_target: BTreeMap<String, Value>,
    #[serde(default)]
    active_target_key: Option<String>,
}

/// File-backed delivery target store with the usual lock + atomic-write
/// discipline.
pub struct DeliveryTargetStore {
    path: PathBuf,
}

impl DeliveryTargetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add a target; returns its canonical key. Adding an existing target
    /// is a no-op.
    pub fn add(&self, target: &DeliveryTarget) -> Result<String> {
        let key = target.canonical_key();
        let _lock = FileLock::acquire(&self.path)?;
        let mut state = self.load_locked();
        if !state.targets.contains(&key) {
            state.targets.push(key.clone());
            self.save_locked(&state)?;
        }
        Ok(key)
    }

    /// Remove a target by key; clears the active pointer when it pointed
    /// at the removed target. Returns whether the target existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut state = self.load_locked();
        let before = state.targets.len();
        state.targets.retain(|t| t != key);
        let existed = state.targets.len() != before;
        if existed {
            if state.active_target_key.as_deref() == Some(key) {
                state.active_target_key = None;
            }
            state.last_delivery_by_target.remove(key);
            self.save_locked(&state)?;
        }
        Ok(existed)
    }

    pub fn list(&self) -> Result<Vec<DeliveryTarget>> {
        let _lock = FileLock::acquire(&self.path)?;
        Ok(self
            .load_locked()
            .targets
            .iter()
            .filter_map(|key| DeliveryTarget::parse_key(key))
            .collect())
    }

    /// Point the active marker at a stored target, or clear it with `None`.
    pub fn set_active(&self, key: Option<&str>) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut state = self.load_locked();
        if let Some(key) = key {
            if !state.targets.contains(&key.to_string()) {
                return Err(Error::Config(format!("unknown delivery target: {key}")));
            }
            state.active_target_key = Some(key.to_string());
        } else {
            state.active_target_key = None;
        }
        self.save_locked(&state)
    }

    pub fn active(&self) -> Result<Option<DeliveryTarget>> {
        let _lock = FileLock::acquire(&self.path)?;
        Ok(self
            .load_locked()
            .active_target_key
            .as_deref()
            .and_then(DeliveryTarget::parse_key))
    }

    /// Record delivery metadata (timestamps, message ids) for a target.
    pub fn record_delivery(&self, key: &str, info: Value) -> Result<()> {
        let _lock = FileLock::acquire(&self.path)?;
        let mut state = self.load_locked();
        state
            .last_delivery_by_target
            .insert(key.to_string(), info);
        self.save_locked(&state)
    }

    pub fn last_delivery(&self, key: &str) -> Result<Option<Value>> {
        let _lock = FileLock::acquire(&self.path)?;
        Ok(self.load_locked().last_delivery_by_target.remove(key))
    }

    fn load_locked(&self) -> StoreState {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => {
                return StoreState {
                    version: STORE_VERSION,
                    ..Default::default()
                }
            }
        };
        match serde_json::from_str::<StoreState>(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "delivery target store unreadable, starting empty"
                );
                StoreState {
                    version: STORE_VERSION,
                    ..Default::default()
                }
            }
        }
    }

    fn save_locked(&self, state: &StoreState) -> Result<()> {
        let mut state = state.clone();
        state.version = STORE_VERSION;
        let rendered = serde_json::to_string_pretty(&state)?;
        atomic_write(&self.path, &format!("{rendered}\n"))
    }
}
