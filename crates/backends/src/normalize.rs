//! Protocol normalizer: raw app-server notifications in, canonical
//! [`RunEvent`]s out.
//!
//! Hides vendor field names and method variants from surfaces. Reasoning
//! "thinking" previews are accumulated per item and re-emitted whole on
//! each delta so surfaces can replace rather than append; buffers are
//! cleared when the reasoning item completes and when the turn ends.

use std::collections::HashMap;

use serde_json::{json, Value};

use car_domain::run_event::{DeltaType, RunEvent};

/// Per-turn normalizer state. Create one per backend and call
/// [`EventNormalizer::begin_turn`] at each turn boundary.
#[derive(Default)]
pub struct EventNormalizer {
    reasoning_buffers: HashMap<String, String>,
    current_turn_id: Option<String>,
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new turn; stale buffers never leak across turns.
    pub fn begin_turn(&mut self, turn_id: Option<String>) {
        self.current_turn_id = turn_id;
        self.reasoning_buffers.clear();
    }

    pub fn set_turn_id(&mut self, turn_id: Option<String>) {
        self.current_turn_id = turn_id;
    }

    /// Map one raw notification to a canonical event, if it has one.
    pub fn map(&mut self, message: &Value) -> Option<RunEvent> {
        let method = message.get("method").and_then(Value::as_str)?;
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
        let method_lower = method.to_ascii_lowercase();

        match method {
            "item/reasoning/summaryTextDelta" => {
                let delta = params.get("delta").and_then(Value::as_str)?;
                let buffer = self.accumulate_reasoning(&params, delta);
                if buffer.trim().is_empty() {
                    return None;
                }
                Some(RunEvent::notice("thinking", buffer))
            }
            "item/reasoning/summaryPartAdded" => {
                self.accumulate_reasoning(&params, "\n\n");
                None
            }
            "item/agentMessage/delta" => {
                let content = extract_output_delta(&params)?;
                Some(RunEvent::output_delta(content, DeltaType::AssistantStream))
            }
            "item/toolCall/start" => {
                let (tool_name, tool_input) = normalize_tool_name(&params);
                Some(RunEvent::tool_call(
                    if tool_name.is_empty() {
                        "toolCall".to_string()
                    } else {
                        tool_name
                    },
                    tool_input,
                ))
            }
            "item/toolCall/end" => None,
            "item/completed" => self.map_item_completed(&params),
            "turn/tokenUsage" | "turn/usage" | "thread/tokenUsage/updated" => {
                let usage = params
                    .get("usage")
                    .or_else(|| params.get("tokenUsage"))
                    .filter(|u| u.is_object())
                    .cloned()?;
                Some(RunEvent::token_usage(usage))
            }
            "turn/error" => {
                self.clear_reasoning(&params);
                let error_message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");
                Some(RunEvent::failed(error_message))
            }
            _ if method == "turn/streamDelta" || method_lower.contains("outputdelta") => {
                let content = extract_output_delta(&params)?;
                Some(RunEvent::output_delta(
                    content,
                    output_delta_type_for_method(&method_lower),
                ))
            }
            _ => None,
        }
    }

    fn map_item_completed(&mut self, params: &Value) -> Option<RunEvent> {
        let item = params.get("item");
        if let Some(item) = item {
            match item.get("type").and_then(Value::as_str) {
                Some("reasoning") => {
                    self.clear_reasoning(params);
                    return None;
                }
                Some("agentMessage") => {
                    let text = item.get("text").and_then(Value::as_str)?;
                    if text.trim().is_empty() {
                        return None;
                    }
                    return Some(RunEvent::output_delta(text, DeltaType::AssistantStream));
                }
                _ => {}
            }
        }
        let (tool_name, tool_input) = normalize_tool_name(params);
        if tool_name.is_empty() {
            return None;
        }
        Some(RunEvent::tool_call(tool_name, tool_input))
    }

    fn reasoning_key(&self, params: &Value) -> Option<String> {
        for key in ["itemId", "item_id", "turnId", "turn_id"] {
            if let Some(value) = params.get(key).and_then(Value::as_str) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        self.current_turn_id.clone()
    }

    fn accumulate_reasoning(&mut self, params: &Value, delta: &str) -> String {
        let Some(key) = self.reasoning_key(params) else {
            return delta.to_string();
        };
        let buffer = self.reasoning_buffers.entry(key).or_default();
        buffer.push_str(delta);
        buffer.clone()
    }

    fn clear_reasoning(&mut self, params: &Value) {
        if let Some(key) = self.reasoning_key(params) {
            self.reasoning_buffers.remove(&key);
        }
    }

    /// Buffers must be empty for any terminally-resolved turn.
    pub fn reasoning_buffers_empty(&self) -> bool {
        self.reasoning_buffers.is_empty()
    }
}

/// Pull streamed text out of a delta payload, wherever the vendor put it.
fn extract_output_delta(params: &Value) -> Option<String> {
    for key in ["delta", "text", "output"] {
        if let Some(value) = params.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Command-execution and file-change output streams are log lines, not
/// assistant prose.
fn output_delta_type_for_method(method_lower: &str) -> DeltaType {
    match method_lower.trim() {
        "item/commandexecution/outputdelta" | "item/filechange/outputdelta" => DeltaType::LogLine,
        _ => DeltaType::AssistantStream,
    }
}

/// Normalized `(tool_name, tool_input)` for tool-shaped items.
fn normalize_tool_name(params: &Value) -> (String, Value) {
    let item = params.get("item").filter(|i| i.is_object());
    let item_type = item
        .and_then(|i| i.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");

    match item_type {
        "commandExecution" => {
            let command = item
                .and_then(|i| i.get("command"))
                .or_else(|| params.get("command"));
            let rendered = match command {
                Some(Value::Array(parts)) => parts
                    .iter()
                    .map(|part| {
                        part.as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| part.to_string())
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string(),
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
            if rendered.is_empty() {
                ("commandExecution".to_string(), json!({}))
            } else {
                (rendered.clone(), json!({ "command": rendered }))
            }
        }
        "fileChange" => {
            let files: Vec<String> = item
                .and_then(|i| i.get("files"))
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if files.is_empty() {
                ("fileChange".to_string(), json!({}))
            } else {
                ("fileChange".to_string(), json!({ "files": files }))
            }
        }
        "tool" => {
            let name = item
                .and_then(|i| {
                    i.get("name")
                        .or_else(|| i.get("tool"))
                        .or_else(|| i.get("id"))
                })
                .and_then(Value::as_str)
                .unwrap_or("");
            if name.is_empty() {
                ("tool".to_string(), json!({}))
            } else {
                (name.to_string(), json!({}))
            }
        }
        _ => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("");
            let input = params
                .get("input")
                .filter(|i| i.is_object())
                .cloned()
                .unwrap_or_else(|| json!({}));
            (name.to_string(), input)
        }
    }
}

/// Short human description for an approval request.
pub fn describe_approval_request(request: &Value) -> String {
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let command = request
        .get("params")
        .and_then(|p| p.get("command"))
        .and_then(Value::as_str);
    match (method, command) {
        (_, Some(command)) => format!("approve command: {command}"),
        ("item/fileChange/requestApproval", None) => "approve file changes".to_string(),
        ("", None) => "approval requested".to_string(),
        (method, None) => method.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(method: &str, params: Value) -> Value {
        json!({ "method": method, "params": params })
    }

    #[test]
    fn agent_message_delta_maps_to_assistant_stream() {
        let mut normalizer = EventNormalizer::new();
        let event = normalizer
            .map(&notification(
                "item/agentMessage/delta",
                json!({"turnId": "t-1", "delta": "Hel"}),
            ))
            .unwrap();
        match event {
            RunEvent::OutputDelta {
                content,
                delta_type,
                ..
            } => {
                assert_eq!(content, "Hel");
                assert_eq!(delta_type, DeltaType::AssistantStream);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reasoning_deltas_accumulate_into_notices() {
        let mut normalizer = EventNormalizer::new();
        let first = normalizer
            .map(&notification(
                "item/reasoning/summaryTextDelta",
                json!({"turnId": "t-2", "itemId": "r-1", "delta": "**Insp"}),
            ))
            .unwrap();
        let second = normalizer
            .map(&notification(
                "item/reasoning/summaryTextDelta",
                json!({"turnId": "t-2", "itemId": "r-1", "delta": "ecting**"}),
            ))
            .unwrap();
        match (first, second) {
            (
                RunEvent::RunNotice { kind, message, .. },
                RunEvent::RunNotice {
                    message: second_message,
                    ..
                },
            ) => {
                assert_eq!(kind, "thinking");
                assert_eq!(message, "**Insp");
                assert_eq!(second_message, "**Inspecting**");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn summary_part_added_inserts_separator() {
        let mut normalizer = EventNormalizer::new();
        normalizer.map(&notification(
            "item/reasoning/summaryTextDelta",
            json!({"itemId": "r-1", "delta": "part one"}),
        ));
        assert!(normalizer
            .map(&notification(
                "item/reasoning/summaryPartAdded",
                json!({"itemId": "r-1"}),
            ))
            .is_none());
        let event = normalizer
            .map(&notification(
                "item/reasoning/summaryTextDelta",
                json!({"itemId": "r-1", "delta": "part two"}),
            ))
            .unwrap();
        match event {
            RunEvent::RunNotice { message, .. } => {
                assert_eq!(message, "part one\n\npart two");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reasoning_buffer_cleared_on_item_completed() {
        let mut normalizer = EventNormalizer::new();
        normalizer.map(&notification(
            "item/reasoning/summaryTextDelta",
            json!({"itemId": "r-1", "delta": "thinking..."}),
        ));
        assert!(!normalizer.reasoning_buffers_empty());
        let event = normalizer.map(&notification(
            "item/completed",
            json!({"itemId": "r-1", "item": {"type": "reasoning"}}),
        ));
        assert!(event.is_none());
        assert!(normalizer.reasoning_buffers_empty());
    }

    #[test]
    fn begin_turn_clears_buffers() {
        let mut normalizer = EventNormalizer::new();
        normalizer.map(&notification(
            "item/reasoning/summaryTextDelta",
            json!({"itemId": "r-1", "delta": "stale"}),
        ));
        normalizer.begin_turn(Some("t-9".into()));
        assert!(normalizer.reasoning_buffers_empty());
    }

    #[test]
    fn stream_delta_and_output_delta_variants() {
        let mut normalizer = EventNormalizer::new();
        let event = normalizer
            .map(&notification("turn/streamDelta", json!({"delta": "x"})))
            .unwrap();
        assert!(matches!(
            event,
            RunEvent::OutputDelta {
                delta_type: DeltaType::AssistantStream,
                ..
            }
        ));

        let event = normalizer
            .map(&notification(
                "item/commandExecution/outputDelta",
                json!({"output": "building..."}),
            ))
            .unwrap();
        match event {
            RunEvent::OutputDelta {
                content,
                delta_type,
                ..
            } => {
                assert_eq!(content, "building...");
                assert_eq!(delta_type, DeltaType::LogLine);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn tool_call_normalization() {
        let mut normalizer = EventNormalizer::new();
        let event = normalizer
            .map(&notification(
                "item/completed",
                json!({"item": {"type": "commandExecution", "command": ["git", "status"]}}),
            ))
            .unwrap();
        match event {
            RunEvent::ToolCall {
                tool_name,
                tool_input,
                ..
            } => {
                assert_eq!(tool_name, "git status");
                assert_eq!(tool_input, json!({"command": "git status"}));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let event = normalizer
            .map(&notification(
                "item/completed",
                json!({"item": {"type": "fileChange", "files": ["a.rs", "b.rs"]}}),
            ))
            .unwrap();
        match event {
            RunEvent::ToolCall {
                tool_name,
                tool_input,
                ..
            } => {
                assert_eq!(tool_name, "fileChange");
                assert_eq!(tool_input, json!({"files": ["a.rs", "b.rs"]}));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let event = normalizer
            .map(&notification(
                "item/toolCall/start",
                json!({"name": "search", "input": {"query": "foo"}}),
            ))
            .unwrap();
        match event {
            RunEvent::ToolCall {
                tool_name,
                tool_input,
                ..
            } => {
                assert_eq!(tool_name, "search");
                assert_eq!(tool_input, json!({"query": "foo"}));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn completed_agent_message_item_is_assistant_stream() {
        let mut normalizer = EventNormalizer::new();
        let event = normalizer
            .map(&notification(
                "item/completed",
                json!({"item": {"type": "agentMessage", "text": "Hello"}}),
            ))
            .unwrap();
        assert!(matches!(
            event,
            RunEvent::OutputDelta {
                delta_type: DeltaType::AssistantStream,
                ..
            }
        ));
        // Reasoning text never surfaces through agent messages.
        assert!(normalizer
            .map(&notification(
                "item/completed",
                json!({"item": {"type": "agentMessage", "text": "  "}}),
            ))
            .is_none());
    }

    #[test]
    fn token_usage_variants() {
        let mut normalizer = EventNormalizer::new();
        for method in ["turn/tokenUsage", "turn/usage", "thread/tokenUsage/updated"] {
            let event = normalizer
                .map(&notification(method, json!({"usage": {"totalTokens": 5}})))
                .unwrap();
            assert!(matches!(event, RunEvent::TokenUsage { .. }));
        }
        let event = normalizer
            .map(&notification(
                "thread/tokenUsage/updated",
                json!({"tokenUsage": {"totalTokens": 7}}),
            ))
            .unwrap();
        match event {
            RunEvent::TokenUsage { usage, .. } => assert_eq!(usage["totalTokens"], 7),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn turn_error_is_failed_and_clears_buffers() {
        let mut normalizer = EventNormalizer::new();
        normalizer.begin_turn(Some("t-1".into()));
        normalizer.map(&notification(
            "item/reasoning/summaryTextDelta",
            json!({"turnId": "t-1", "delta": "hmm"}),
        ));
        let event = normalizer
            .map(&notification("turn/error", json!({"turnId": "t-1", "message": "boom"})))
            .unwrap();
        match event {
            RunEvent::Failed { error_message, .. } => assert_eq!(error_message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(normalizer.reasoning_buffers_empty());
    }

    #[test]
    fn unknown_methods_are_ignored() {
        let mut normalizer = EventNormalizer::new();
        assert!(normalizer
            .map(&notification("thread/archived", json!({})))
            .is_none());
        assert!(normalizer.map(&json!({"no_method": true})).is_none());
    }
}
