//! Per-turn state machines and the turn registry.
//!
//! A turn is keyed by `(thread_id, turn_id)`. Notifications may race the
//! `turn/start` response, so turns without a known thread id live in a
//! pending-by-turn-id map and are merged into the keyed map once the
//! response lands. Each state resolves exactly once, either from a
//! terminal notification, a resume-snapshot during stall recovery, or a
//! disconnect.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;

use car_domain::config::OutputPolicy;
use car_domain::error::Error;

use crate::protocol;

/// Trailing window of raw protocol messages kept per turn.
pub const MAX_TURN_RAW_EVENTS: usize = 200;

pub type TurnKey = (String, String);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The outcome of a finished turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub turn_id: String,
    pub status: Option<String>,
    pub final_message: String,
    pub agent_messages: Vec<String>,
    pub errors: Vec<String>,
    pub raw_events: Vec<Value>,
}

impl TurnResult {
    /// Whether the observed terminal status maps to success. Buffered
    /// agent messages are returned either way.
    pub fn is_success(&self) -> bool {
        self.status
            .as_deref()
            .map(protocol::status_is_success)
            .unwrap_or(false)
    }
}

/// Clonable failure pushed through the resolution channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnFailure {
    Disconnected(String),
}

impl From<TurnFailure> for Error {
    fn from(failure: TurnFailure) -> Self {
        match failure {
            TurnFailure::Disconnected(msg) => Error::Disconnected(msg),
        }
    }
}

pub type TurnOutcome = Result<TurnResult, TurnFailure>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnState {
    pub turn_id: String,
    pub thread_id: Option<String>,
    pub status: Option<String>,
    pub agent_messages: Vec<String>,
    pub agent_message_deltas: HashMap<String, String>,
    pub errors: Vec<String>,
    pub raw_events: VecDeque<Value>,
    pub last_event_at: Instant,
    pub last_method: Option<String>,
    pub recovery_attempts: u32,
    pub last_recovery_at: Option<Instant>,
    resolver: watch::Sender<Option<TurnOutcome>>,
}

impl TurnState {
    pub fn new(turn_id: &str, thread_id: Option<&str>) -> Self {
        let (resolver, _) = watch::channel(None);
        Self {
            turn_id: turn_id.to_string(),
            thread_id: thread_id.map(str::to_string),
            status: None,
            agent_messages: Vec::new(),
            agent_message_deltas: HashMap::new(),
            errors: Vec::new(),
            raw_events: VecDeque::new(),
            last_event_at: Instant::now(),
            last_method: None,
            recovery_attempts: 0,
            last_recovery_at: None,
            resolver,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<TurnOutcome>> {
        self.resolver.subscribe()
    }

    pub fn is_done(&self) -> bool {
        self.resolver.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<TurnOutcome> {
        self.resolver.borrow().clone()
    }

    /// Resolve exactly once; later calls are ignored.
    pub fn resolve(&mut self, outcome: TurnOutcome) {
        self.resolver.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        });
    }

    pub fn mark_event(&mut self, method: &str) {
        self.last_event_at = Instant::now();
        self.last_method = Some(method.to_string());
    }

    pub fn record_raw(&mut self, message: &Value) {
        self.raw_events.push_back(message.clone());
        while self.raw_events.len() > MAX_TURN_RAW_EVENTS {
            self.raw_events.pop_front();
        }
    }

    /// Append an assistant message, deduplicating against the last entry.
    pub fn append_agent_message(&mut self, candidate: Option<String>) {
        let Some(candidate) = candidate else { return };
        if candidate.is_empty() {
            return;
        }
        if self.agent_messages.last() == Some(&candidate) {
            return;
        }
        self.agent_messages.push(candidate);
    }

    pub fn accumulate_delta(&mut self, item_id: &str, delta: &str) {
        self.agent_message_deltas
            .entry(item_id.to_string())
            .or_default()
            .push_str(delta);
    }

    /// Messages for the result: finalized messages when any exist,
    /// otherwise whatever accumulated in the delta buffers.
    fn agent_messages_for_result(&self) -> Vec<String> {
        if !self.agent_messages.is_empty() {
            return self.agent_messages.clone();
        }
        self.agent_message_deltas
            .values()
            .filter(|text| !text.is_empty())
            .cloned()
            .collect()
    }

    pub fn build_result(&self, policy: OutputPolicy) -> TurnResult {
        let agent_messages = self.agent_messages_for_result();
        let cleaned: Vec<String> = agent_messages
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        let final_message = match policy {
            OutputPolicy::FinalOnly => cleaned.last().cloned().unwrap_or_default(),
            OutputPolicy::AllAgentMessages => cleaned.join("\n\n"),
        };
        TurnResult {
            turn_id: self.turn_id.clone(),
            status: self.status.clone(),
            final_message,
            agent_messages,
            errors: self.errors.clone(),
            raw_events: self.raw_events.iter().cloned().collect(),
        }
    }

    /// Resolve from the current buffered state, then drop accumulators so
    /// a terminally-resolved turn holds no streaming buffers.
    pub fn resolve_from_state(&mut self, policy: OutputPolicy) {
        if self.is_done() {
            return;
        }
        let result = self.build_result(policy);
        self.resolve(Ok(result));
        self.agent_message_deltas.clear();
    }

    // ── Notification application ─────────────────────────────────

    pub fn apply_agent_message_delta(&mut self, message: &Value, params: &Value) {
        if let (Some(item_id), Some(delta)) = (
            params.get("itemId").and_then(Value::as_str),
            params
                .get("delta")
                .or_else(|| params.get("text"))
                .and_then(Value::as_str),
        ) {
            self.accumulate_delta(item_id, delta);
        }
        self.mark_event("item/agentMessage/delta");
        self.record_raw(message);
    }

    pub fn apply_item_completed(&mut self, message: &Value, params: &Value) {
        let item = params.get("item");
        let mut text: Option<String> = None;
        if let Some(item) = item {
            if item.get("type").and_then(Value::as_str) == Some("agentMessage") {
                text = protocol::extract_agent_message_text(item);
                if text.is_none() {
                    if let Some(item_id) = params.get("itemId").and_then(Value::as_str) {
                        text = self.agent_message_deltas.remove(item_id);
                    }
                }
                self.append_agent_message(text.clone());
            }
            let review = protocol::extract_review_text(item);
            if review.is_some() && review != text {
                self.append_agent_message(review);
            }
        }
        tracing::info!(
            turn_id = %self.turn_id,
            item_type = item
                .and_then(|i| i.get("type"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or(""),
            "app_server.item.completed"
        );
        self.mark_event("item/completed");
        self.record_raw(message);
    }

    pub fn apply_error(&mut self, message: &Value, params: &Value) {
        if let Some(error_message) = protocol::extract_error_message(params) {
            self.errors.push(error_message.clone());
            tracing::warn!(
                turn_id = %self.turn_id,
                thread_id = self.thread_id.as_deref().unwrap_or(""),
                message = %error_message,
                "app_server.turn_error"
            );
        }
        self.mark_event("error");
        self.record_raw(message);
    }

    pub fn apply_turn_completed(&mut self, message: &Value, params: &Value, policy: OutputPolicy) {
        self.mark_event("turn/completed");
        self.record_raw(message);
        let status = params
            .get("status")
            .and_then(|s| protocol::extract_status_value(s))
            .or_else(|| {
                params
                    .get("turn")
                    .and_then(|turn| turn.get("status"))
                    .and_then(|s| protocol::extract_status_value(s))
            });
        if status.is_some() {
            self.status = status;
        }
        tracing::info!(
            turn_id = %self.turn_id,
            status = self.status.as_deref().unwrap_or(""),
            "app_server.turn.completed"
        );
        self.resolve_from_state(policy);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a `(turn_id, thread_id?)` lookup landed.
pub enum TurnLookup {
    Keyed(TurnKey),
    Pending(String),
    Ambiguous,
    Missing,
}

#[derive(Default)]
pub struct TurnRegistry {
    turns: HashMap<TurnKey, TurnState>,
    pending_turns: HashMap<String, TurnState>,
}

impl TurnRegistry {
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.pending_turns.is_empty()
    }

    /// Locate the state for a turn. Exact `(thread, turn)` key first, then
    /// a unique bare-turn-id match (with a thread-mismatch warning), then
    /// the pending map. Multiple matches are ambiguous and not used.
    pub fn lookup(&self, turn_id: &str, thread_id: Option<&str>) -> TurnLookup {
        if let Some(thread_id) = thread_id {
            let key = (thread_id.to_string(), turn_id.to_string());
            if self.turns.contains_key(&key) {
                return TurnLookup::Keyed(key);
            }
        }
        let matches: Vec<&TurnKey> = self
            .turns
            .keys()
            .filter(|(_, candidate)| candidate == turn_id)
            .collect();
        match matches.len() {
            1 => {
                let key = matches[0].clone();
                if let Some(requested) = thread_id {
                    if requested != key.0 {
                        tracing::warn!(
                            turn_id = %turn_id,
                            requested_thread_id = %requested,
                            actual_thread_id = %key.0,
                            "app_server.turn.thread_mismatch"
                        );
                    }
                }
                TurnLookup::Keyed(key)
            }
            0 => {
                if self.pending_turns.contains_key(turn_id) {
                    TurnLookup::Pending(turn_id.to_string())
                } else {
                    TurnLookup::Missing
                }
            }
            n => {
                tracing::warn!(turn_id = %turn_id, matches = n, "app_server.turn.ambiguous");
                TurnLookup::Ambiguous
            }
        }
    }

    pub fn get_mut(&mut self, lookup: &TurnLookup) -> Option<&mut TurnState> {
        match lookup {
            TurnLookup::Keyed(key) => self.turns.get_mut(key),
            TurnLookup::Pending(turn_id) => self.pending_turns.get_mut(turn_id),
            _ => None,
        }
    }

    pub fn get(&self, lookup: &TurnLookup) -> Option<&TurnState> {
        match lookup {
            TurnLookup::Keyed(key) => self.turns.get(key),
            TurnLookup::Pending(turn_id) => self.pending_turns.get(turn_id),
            _ => None,
        }
    }

    /// State for a notification: existing state, else a fresh keyed state
    /// when the thread is known, else a provisional pending state.
    pub fn resolve_for_notification(
        &mut self,
        turn_id: &str,
        thread_id: Option<&str>,
    ) -> Option<&mut TurnState> {
        match self.lookup(turn_id, thread_id) {
            TurnLookup::Keyed(key) => self.turns.get_mut(&key),
            TurnLookup::Pending(id) => self.pending_turns.get_mut(&id),
            TurnLookup::Ambiguous => None,
            TurnLookup::Missing => {
                if let Some(thread_id) = thread_id {
                    let key = (thread_id.to_string(), turn_id.to_string());
                    Some(
                        self.turns
                            .entry(key)
                            .or_insert_with(|| TurnState::new(turn_id, Some(thread_id))),
                    )
                } else {
                    Some(
                        self.pending_turns
                            .entry(turn_id.to_string())
                            .or_insert_with(|| TurnState::new(turn_id, None)),
                    )
                }
            }
        }
    }

    /// Register a turn after `turn/start` resolves, merging any provisional
    /// state that accumulated while the response was in flight.
    pub fn register(&mut self, turn_id: &str, thread_id: &str, policy: OutputPolicy) {
        let key = (thread_id.to_string(), turn_id.to_string());
        let pending = self.pending_turns.remove(turn_id);
        match (self.turns.contains_key(&key), pending) {
            (false, Some(mut pending)) => {
                pending.thread_id = Some(thread_id.to_string());
                self.turns.insert(key, pending);
            }
            (true, Some(pending)) => {
                let target = self.turns.get_mut(&key).expect("key checked above");
                merge_turn_state(target, pending, policy);
            }
            (false, None) => {
                self.turns
                    .insert(key, TurnState::new(turn_id, Some(thread_id)));
            }
            (true, None) => {}
        }
    }

    pub fn remove(&mut self, lookup: &TurnLookup) {
        match lookup {
            TurnLookup::Keyed(key) => {
                self.turns.remove(key);
            }
            TurnLookup::Pending(turn_id) => {
                self.pending_turns.remove(turn_id);
            }
            _ => {}
        }
    }

    /// Fail every unresolved turn (disconnect path) and clear the maps.
    pub fn fail_all(&mut self, reason: &str) {
        for state in self.turns.values_mut() {
            state.resolve(Err(TurnFailure::Disconnected(reason.to_string())));
        }
        for state in self.pending_turns.values_mut() {
            state.resolve(Err(TurnFailure::Disconnected(reason.to_string())));
        }
        self.turns.clear();
        self.pending_turns.clear();
    }
}

/// Merge a provisional (pending-by-turn-id) state into the keyed entry.
fn merge_turn_state(target: &mut TurnState, source: TurnState, policy: OutputPolicy) {
    for message in source.agent_messages {
        target.append_agent_message(Some(message));
    }
    for (item_id, delta) in source.agent_message_deltas {
        target.agent_message_deltas.insert(item_id, delta);
    }
    for event in source.raw_events {
        target.record_raw(&event);
    }
    target.errors.extend(source.errors);
    if target.status.is_none() {
        target.status = source.status;
    }
    if source.resolver.borrow().is_some() {
        target.resolve_from_state(policy);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resume-snapshot walking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a `thread/resume` snapshot reveals about one turn.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TurnSnapshot {
    pub status: Option<String>,
    pub agent_messages: Vec<String>,
    pub errors: Vec<String>,
    pub found: bool,
}

/// Walk a `thread/resume` snapshot for the target turn. The shape varies
/// across backends (`turns` / `data` / `results` collections, a nested
/// `thread`, a single `turn`, bare `items`); novel shapes yield `None`
/// rather than failing.
pub fn extract_turn_snapshot(payload: &Value, target_turn_id: &str) -> Option<TurnSnapshot> {
    if !payload.is_object() {
        return None;
    }
    let mut snapshot = TurnSnapshot::default();
    if collect_from_entry(payload, target_turn_id, &mut snapshot) {
        snapshot.found = true;
    }
    for key in ["turns", "data", "results"] {
        if let Some(turns) = payload.get(key).and_then(Value::as_array) {
            collect_from_list(turns, target_turn_id, &mut snapshot);
        }
    }
    if let Some(thread) = payload.get("thread").filter(|t| t.is_object()) {
        if let Some(items) = thread.get("items").and_then(Value::as_array) {
            for item in items {
                collect_from_item(item, target_turn_id, &mut snapshot);
            }
        }
        if let Some(turns) = thread.get("turns").and_then(Value::as_array) {
            collect_from_list(turns, target_turn_id, &mut snapshot);
        }
    }
    if let Some(turn) = payload.get("turn") {
        if collect_from_entry(turn, target_turn_id, &mut snapshot) {
            snapshot.found = true;
        }
    }
    if let Some(items) = payload.get("items").and_then(Value::as_array) {
        for item in items {
            collect_from_item(item, target_turn_id, &mut snapshot);
        }
    }
    if snapshot.status.is_none() {
        if let Some(status) = payload.get("status") {
            snapshot.status = protocol::extract_status_value(status);
        }
    }
    if !snapshot.found
        && snapshot.agent_messages.is_empty()
        && snapshot.errors.is_empty()
        && snapshot.status.is_none()
    {
        return None;
    }
    Some(snapshot)
}

fn collect_from_list(turns: &[Value], target_turn_id: &str, snapshot: &mut TurnSnapshot) {
    for turn in turns {
        if collect_from_entry(turn, target_turn_id, snapshot) {
            snapshot.found = true;
        }
    }
}

fn collect_from_entry(turn: &Value, target_turn_id: &str, snapshot: &mut TurnSnapshot) -> bool {
    if !turn.is_object() {
        return false;
    }
    if protocol::extract_turn_id_from_result(turn).as_deref() != Some(target_turn_id) {
        return false;
    }
    if snapshot.status.is_none() {
        if let Some(status) = turn.get("status") {
            snapshot.status = protocol::extract_status_value(status);
        }
    }
    collect_agent_messages(turn, target_turn_id, &mut snapshot.agent_messages);
    collect_errors(turn, &mut snapshot.errors);
    true
}

fn collect_from_item(item: &Value, target_turn_id: &str, snapshot: &mut TurnSnapshot) {
    if !item.is_object() {
        return;
    }
    if protocol::extract_turn_id(item).as_deref() != Some(target_turn_id) {
        return;
    }
    if let Some(text) = protocol::extract_agent_message_text(item) {
        snapshot.agent_messages.push(text);
    }
}

fn collect_agent_messages(container: &Value, target_turn_id: &str, out: &mut Vec<String>) {
    for key in ["items", "messages"] {
        let Some(entries) = container.get(key).and_then(Value::as_array) else {
            continue;
        };
        for entry in entries {
            if !entry.is_object() {
                continue;
            }
            if let Some(entry_turn_id) = protocol::extract_turn_id(entry) {
                if entry_turn_id != target_turn_id {
                    continue;
                }
            }
            if let Some(text) = protocol::extract_agent_message_text(entry) {
                out.push(text);
            } else if entry.get("role").and_then(Value::as_str) == Some("assistant") {
                if let Some(text) = entry.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        out.push(text.to_string());
                    }
                }
            }
        }
    }
}

fn collect_errors(container: &Value, out: &mut Vec<String>) {
    if let Some(message) = protocol::extract_error_message(container) {
        out.push(message);
    }
    if let Some(entries) = container.get("errors").and_then(Value::as_array) {
        for entry in entries {
            match entry {
                Value::String(s) if !s.trim().is_empty() => out.push(s.trim().to_string()),
                Value::Object(_) => {
                    if let Some(message) = protocol::extract_error_message(entry) {
                        out.push(message);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed(turn_id: &str, status: &str) -> (Value, Value) {
        let params = json!({"turnId": turn_id, "status": status});
        let message = json!({"method": "turn/completed", "params": params});
        (message, params)
    }

    #[test]
    fn delta_then_completed_finalizes_message() {
        let mut state = TurnState::new("t-1", Some("th-1"));
        let params = json!({"turnId": "t-1", "itemId": "m-1", "delta": "Hel"});
        state.apply_agent_message_delta(&json!({"method": "item/agentMessage/delta"}), &params);
        let params = json!({"turnId": "t-1", "itemId": "m-1", "delta": "lo"});
        state.apply_agent_message_delta(&json!({"method": "item/agentMessage/delta"}), &params);

        let item_params = json!({
            "turnId": "t-1",
            "itemId": "m-1",
            "item": {"type": "agentMessage", "text": "Hello"}
        });
        state.apply_item_completed(&json!({"method": "item/completed"}), &item_params);
        assert_eq!(state.agent_messages, vec!["Hello"]);

        let (message, params) = completed("t-1", "completed");
        state.apply_turn_completed(&message, &params, OutputPolicy::FinalOnly);
        let result = state.outcome().unwrap().unwrap();
        assert_eq!(result.status.as_deref(), Some("completed"));
        assert_eq!(result.final_message, "Hello");
        assert_eq!(result.agent_messages, vec!["Hello"]);
        assert!(result.errors.is_empty());
        assert!(result.is_success());
        // Accumulators are dropped on terminal resolution.
        assert!(state.agent_message_deltas.is_empty());
    }

    #[test]
    fn item_completed_without_text_pops_accumulator() {
        let mut state = TurnState::new("t-1", Some("th-1"));
        state.accumulate_delta("m-1", "streamed");
        let params = json!({"turnId": "t-1", "itemId": "m-1", "item": {"type": "agentMessage"}});
        state.apply_item_completed(&json!({}), &params);
        assert_eq!(state.agent_messages, vec!["streamed"]);
        assert!(state.agent_message_deltas.is_empty());
    }

    #[test]
    fn adjacent_duplicate_messages_are_deduped() {
        let mut state = TurnState::new("t-1", None);
        state.append_agent_message(Some("same".into()));
        state.append_agent_message(Some("same".into()));
        state.append_agent_message(Some("other".into()));
        state.append_agent_message(Some("same".into()));
        assert_eq!(state.agent_messages, vec!["same", "other", "same"]);
    }

    #[test]
    fn resolution_is_idempotent() {
        let mut state = TurnState::new("t-1", Some("th-1"));
        let (message, params) = completed("t-1", "completed");
        state.apply_turn_completed(&message, &params, OutputPolicy::FinalOnly);
        let first = state.outcome().unwrap().unwrap();
        // A second terminal event changes nothing.
        let (message, params) = completed("t-1", "failed");
        state.apply_turn_completed(&message, &params, OutputPolicy::FinalOnly);
        let second = state.outcome().unwrap().unwrap();
        assert_eq!(first.status, second.status);
    }

    #[test]
    fn raw_events_stay_bounded() {
        let mut state = TurnState::new("t-1", None);
        for i in 0..(MAX_TURN_RAW_EVENTS + 50) {
            state.record_raw(&json!({"seq": i}));
        }
        assert_eq!(state.raw_events.len(), MAX_TURN_RAW_EVENTS);
        assert_eq!(state.raw_events.front().unwrap()["seq"], 50);
    }

    #[test]
    fn status_from_nested_turn_object() {
        let mut state = TurnState::new("t-1", Some("th-1"));
        let params = json!({"turnId": "t-1", "turn": {"status": {"type": "interrupted"}}});
        state.apply_turn_completed(&json!({}), &params, OutputPolicy::FinalOnly);
        let result = state.outcome().unwrap().unwrap();
        assert_eq!(result.status.as_deref(), Some("interrupted"));
        assert!(!result.is_success());
    }

    #[test]
    fn all_agent_messages_policy_joins() {
        let mut state = TurnState::new("t-1", None);
        state.append_agent_message(Some("first".into()));
        state.append_agent_message(Some("second".into()));
        let result = state.build_result(OutputPolicy::AllAgentMessages);
        assert_eq!(result.final_message, "first\n\nsecond");
        let result = state.build_result(OutputPolicy::FinalOnly);
        assert_eq!(result.final_message, "second");
    }

    #[test]
    fn result_falls_back_to_delta_buffers() {
        let mut state = TurnState::new("t-1", None);
        state.accumulate_delta("m-1", "partial answer");
        let result = state.build_result(OutputPolicy::FinalOnly);
        assert_eq!(result.final_message, "partial answer");
    }

    #[test]
    fn registry_merges_pending_into_keyed() {
        let mut registry = TurnRegistry::default();
        // Notifications arrive before turn/start returns.
        let state = registry.resolve_for_notification("t-1", None).unwrap();
        state.accumulate_delta("m-1", "early");
        let params = json!({"turnId": "t-1", "itemId": "m-1", "item": {"type": "agentMessage"}});
        registry
            .resolve_for_notification("t-1", None)
            .unwrap()
            .apply_item_completed(&json!({}), &params);
        assert_eq!(registry.pending_len(), 1);

        registry.register("t-1", "th-1", OutputPolicy::FinalOnly);
        assert_eq!(registry.pending_len(), 0);
        let lookup = registry.lookup("t-1", Some("th-1"));
        let state = registry.get(&lookup).unwrap();
        assert_eq!(state.agent_messages, vec!["early"]);
        assert_eq!(state.thread_id.as_deref(), Some("th-1"));
    }

    #[test]
    fn terminal_before_start_survives_merge() {
        let mut registry = TurnRegistry::default();
        let state = registry.resolve_for_notification("t-1", None).unwrap();
        state.append_agent_message(Some("done early".into()));
        let params = json!({"turnId": "t-1", "status": "completed"});
        registry
            .resolve_for_notification("t-1", None)
            .unwrap()
            .apply_turn_completed(&json!({}), &params, OutputPolicy::FinalOnly);

        registry.register("t-1", "th-1", OutputPolicy::FinalOnly);
        let lookup = registry.lookup("t-1", Some("th-1"));
        let state = registry.get(&lookup).unwrap();
        let result = state.outcome().unwrap().unwrap();
        assert_eq!(result.status.as_deref(), Some("completed"));
        assert_eq!(result.final_message, "done early");
    }

    #[test]
    fn lookup_by_bare_turn_id() {
        let mut registry = TurnRegistry::default();
        registry.register("t-1", "th-1", OutputPolicy::FinalOnly);
        match registry.lookup("t-1", None) {
            TurnLookup::Keyed(key) => assert_eq!(key, ("th-1".into(), "t-1".into())),
            _ => panic!("expected keyed match"),
        }
        // Same turn id on two threads is ambiguous.
        registry.register("t-1", "th-2", OutputPolicy::FinalOnly);
        assert!(matches!(registry.lookup("t-1", None), TurnLookup::Ambiguous));
    }

    #[test]
    fn fail_all_resolves_everything() {
        let mut registry = TurnRegistry::default();
        registry.register("t-1", "th-1", OutputPolicy::FinalOnly);
        let mut rx = {
            let lookup = registry.lookup("t-1", Some("th-1"));
            registry.get(&lookup).unwrap().subscribe()
        };
        registry.resolve_for_notification("t-2", None);
        registry.fail_all("app-server disconnected");
        assert!(registry.is_empty());
        let outcome = rx.borrow_and_update().clone().unwrap();
        assert!(matches!(outcome, Err(TurnFailure::Disconnected(_))));
    }

    // ── Snapshot walking ─────────────────────────────────────────

    #[test]
    fn snapshot_from_turns_collection() {
        let payload = json!({
            "id": "th-1",
            "turns": [{
                "id": "t-4",
                "status": "completed",
                "items": [{"type": "agentMessage", "text": "Done"}]
            }]
        });
        let snapshot = extract_turn_snapshot(&payload, "t-4").unwrap();
        assert!(snapshot.found);
        assert_eq!(snapshot.status.as_deref(), Some("completed"));
        assert_eq!(snapshot.agent_messages, vec!["Done"]);
    }

    #[test]
    fn snapshot_from_nested_thread() {
        let payload = json!({
            "thread": {
                "id": "th-1",
                "turns": [{"turnId": "t-9", "status": "failed", "errors": ["exploded"]}],
                "items": [{"turnId": "t-9", "type": "agentMessage", "text": "partial"}]
            }
        });
        let snapshot = extract_turn_snapshot(&payload, "t-9").unwrap();
        assert!(snapshot.found);
        assert_eq!(snapshot.status.as_deref(), Some("failed"));
        assert_eq!(snapshot.errors, vec!["exploded"]);
        assert_eq!(snapshot.agent_messages, vec!["partial"]);
    }

    #[test]
    fn snapshot_ignores_other_turns() {
        let payload = json!({
            "turns": [
                {"id": "t-1", "status": "completed"},
                {"id": "t-2", "status": "failed"}
            ]
        });
        let snapshot = extract_turn_snapshot(&payload, "t-2").unwrap();
        assert_eq!(snapshot.status.as_deref(), Some("failed"));
    }

    #[test]
    fn snapshot_novel_shape_is_none() {
        assert!(extract_turn_snapshot(&json!({"unknown": []}), "t-1").is_none());
        assert!(extract_turn_snapshot(&json!([1, 2, 3]), "t-1").is_none());
    }

    #[test]
    fn snapshot_assistant_role_fallback() {
        let payload = json!({
            "turns": [{
                "id": "t-1",
                "messages": [{"role": "assistant", "text": "from role"}]
            }]
        });
        let snapshot = extract_turn_snapshot(&payload, "t-1").unwrap();
        assert_eq!(snapshot.agent_messages, vec!["from role"]);
    }
}
