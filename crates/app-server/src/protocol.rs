//! JSON-RPC 2.0 dialect spoken with the agent subprocess.
//!
//! Each message is a single line of compact JSON. Three inbound shapes
//! exist: responses (`id`, no `method`), server-initiated requests
//! (`id` + `method`), and notifications (`method` only). Outbound ids are
//! always opaque UUID strings; inbound ids may be numbers or strings.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Approval request methods the server may initiate.
pub const APPROVAL_METHODS: [&str; 2] = [
    "item/commandExecution/requestApproval",
    "item/fileChange/requestApproval",
];

/// Legacy approval aliases answered with `{decision}`-shaped replies.
pub const LEGACY_APPROVAL_METHODS: [&str; 2] = ["execCommandApproval", "applyPatchApproval"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// An inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A reply to one of our requests. The id is normalized to a string.
    Response {
        id: String,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    /// A server-initiated request we must answer. The id is kept verbatim
    /// so the reply echoes the server's own shape (number or string).
    ServerRequest {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Classify an inbound JSON object. Non-objects and id-less, method-less
/// payloads yield `None`.
pub fn classify(message: &Value) -> Option<Incoming> {
    let obj = message.as_object()?;
    let id = obj.get("id");
    let method = obj.get("method").and_then(Value::as_str);
    match (id, method) {
        (Some(id), None) => {
            let id = normalize_id(id)?;
            let error = obj
                .get("error")
                .filter(|e| !e.is_null())
                .and_then(|e| serde_json::from_value::<RpcError>(e.clone()).ok());
            Some(Incoming::Response {
                id,
                result: obj.get("result").cloned(),
                error,
            })
        }
        (Some(id), Some(method)) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method: method.to_string(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method: method.to_string(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, None) => None,
    }
}

/// Normalize a wire id (string or number) to a string for matching.
pub fn normalize_id(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Assemble an outbound message from any combination of parts.
pub fn build_message(
    id: Option<&Value>,
    method: Option<&str>,
    params: Option<Value>,
    result: Option<Value>,
    error: Option<&RpcError>,
) -> Value {
    let mut obj = Map::new();
    if let Some(id) = id {
        obj.insert("id".into(), id.clone());
    }
    if let Some(method) = method {
        obj.insert("method".into(), Value::String(method.to_string()));
    }
    if let Some(params) = params {
        obj.insert("params".into(), params);
    }
    if let Some(result) = result {
        obj.insert("result".into(), result);
    }
    if let Some(error) = error {
        obj.insert("error".into(), json!({"code": error.code, "message": error.message}));
    }
    Value::Object(obj)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Id extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pull a turn id out of a params or item object. Accepts camelCase and
/// snake_case keys and a nested `turn` object; never falls back to a bare
/// `id` (that would misread item ids on notifications).
pub fn extract_turn_id(value: &Value) -> Option<String> {
    str_field(value, "turnId")
        .or_else(|| str_field(value, "turn_id"))
        .or_else(|| {
            let turn = value.get("turn")?;
            str_field(turn, "id")
                .or_else(|| str_field(turn, "turnId"))
                .or_else(|| str_field(turn, "turn_id"))
        })
}

/// Turn id from a request *result*, where a bare `id` is authoritative.
pub fn extract_turn_id_from_result(value: &Value) -> Option<String> {
    extract_turn_id(value).or_else(|| str_field(value, "id"))
}

/// Thread id from a params object, without the bare-`id` fallback.
pub fn extract_thread_id(value: &Value) -> Option<String> {
    str_field(value, "threadId")
        .or_else(|| str_field(value, "thread_id"))
        .or_else(|| {
            let thread = value.get("thread")?;
            str_field(thread, "id")
                .or_else(|| str_field(thread, "threadId"))
                .or_else(|| str_field(thread, "thread_id"))
        })
}

/// Thread id from a request *result*, where a bare `id` is authoritative.
pub fn extract_thread_id_from_result(value: &Value) -> Option<String> {
    extract_thread_id(value).or_else(|| str_field(value, "id"))
}

/// Thread id accompanying a turn-scoped notification.
pub fn extract_thread_id_for_turn(params: &Value) -> Option<String> {
    extract_thread_id(params).or_else(|| {
        let turn = params.get("turn")?;
        str_field(turn, "threadId").or_else(|| str_field(turn, "thread_id"))
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal status heuristics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const TERMINAL_STATUSES: [&str; 12] = [
    "completed",
    "complete",
    "done",
    "failed",
    "error",
    "errored",
    "cancelled",
    "canceled",
    "interrupted",
    "stopped",
    "success",
    "succeeded",
];

const SUCCESS_STATUSES: [&str; 5] = ["completed", "complete", "done", "success", "succeeded"];

/// Pull a status string out of a status value that may be a plain string
/// or an object keyed by `type` / `status` / `state`.
pub fn extract_status_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => ["type", "status", "state"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Whether a status names a terminal turn state. Servers coin new values;
/// unknown statuses are not terminal here (the caller treats an unknown
/// status *after* `turn/completed` as terminal-unknown instead).
pub fn status_is_terminal(value: &Value) -> bool {
    extract_status_value(value)
        .map(|s| TERMINAL_STATUSES.contains(&s.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Whether a terminal status maps to success.
pub fn status_is_success(status: &str) -> bool {
    SUCCESS_STATUSES.contains(&status.to_ascii_lowercase().as_str())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Item text extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assistant text from a completed item: either a direct non-blank `text`
/// field or the concatenation of text-bearing `content` parts.
pub fn extract_agent_message_text(item: &Value) -> Option<String> {
    if !item.is_object() {
        return None;
    }
    if let Some(text) = item.get("text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }
    let content = item.get("content")?.as_array()?;
    let mut parts: Vec<&str> = Vec::new();
    for entry in content {
        let entry_type = entry.get("type").and_then(Value::as_str);
        if !matches!(entry_type, None | Some("output_text") | Some("text") | Some("message")) {
            continue;
        }
        if let Some(text) = entry.get("text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                parts.push(text);
            }
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.concat())
    }
}

/// Review output attached to a completed item, in any of the shapes
/// backends emit it: `exitedReviewMode.review`, a `review`-typed item's
/// `text`, or a bare `review` field.
pub fn extract_review_text(item: &Value) -> Option<String> {
    if !item.is_object() {
        return None;
    }
    if let Some(review) = item
        .get("exitedReviewMode")
        .and_then(|e| e.get("review"))
        .and_then(Value::as_str)
    {
        if !review.trim().is_empty() {
            return Some(review.to_string());
        }
    }
    if item.get("type").and_then(Value::as_str) == Some("review") {
        if let Some(text) = item.get("text").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }
    item.get("review")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Human-readable error text from a turn-scoped error payload: `error`
/// may be an object (`message` + `additionalDetails`/`details`) or a bare
/// string, with a top-level `message` fallback.
pub fn extract_error_message(payload: &Value) -> Option<String> {
    if !payload.is_object() {
        return None;
    }
    let error = payload.get("error");
    let mut message: Option<String> = None;
    let mut details: Option<String> = None;
    match error {
        Some(Value::Object(obj)) => {
            message = obj
                .get("message")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            details = obj
                .get("additionalDetails")
                .or_else(|| obj.get("details"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
        }
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                message = Some(trimmed.to_string());
            }
        }
        _ => {}
    }
    if message.is_none() {
        message = payload
            .get("message")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }
    match (message, details) {
        (Some(m), Some(d)) if d != m => Some(format!("{m} ({d})")),
        (None, Some(d)) => Some(d),
        (m, _) => m,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox policy normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SANDBOX_CANONICAL: [(&str, &str); 4] = [
    ("dangerfullaccess", "dangerFullAccess"),
    ("readonly", "readOnly"),
    ("workspacewrite", "workspaceWrite"),
    ("externalsandbox", "externalSandbox"),
];

fn canonical_sandbox_type(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if cleaned.is_empty() {
        return raw.trim().to_string();
    }
    let lowered = cleaned.to_ascii_lowercase();
    SANDBOX_CANONICAL
        .iter()
        .find(|(k, _)| *k == lowered)
        .map(|(_, v)| (*v).to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Normalize a caller-supplied sandbox policy into the `{type}` object the
/// wire expects. Strings are canonicalized by stripping non-alphanumerics
/// and lowercasing; objects get their `type` field canonicalized in place;
/// unknown values pass through unchanged. Idempotent.
pub fn normalize_sandbox_policy(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(obj) => {
            if let Some(type_value) = obj.get("type").and_then(Value::as_str) {
                let canonical = canonical_sandbox_type(type_value);
                if canonical != type_value {
                    let mut updated = obj.clone();
                    updated.insert("type".into(), Value::String(canonical));
                    return Some(Value::Object(updated));
                }
            }
            Some(value.clone())
        }
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            Some(json!({"type": canonical_sandbox_type(trimmed)}))
        }
        other => Some(other.clone()),
    }
}
