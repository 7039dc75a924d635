use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

/// A boxed async stream, used for turn event streaming.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Current UTC time as an RFC3339 string with a trailing `Z`.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Classification of an [`RunEvent::OutputDelta`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaType {
    /// The prompt echoed back at the start of a turn.
    UserMessage,
    /// Streaming assistant output.
    AssistantStream,
    /// Command-execution or file-change output lines.
    LogLine,
    /// Unclassified text.
    Text,
}

/// Canonical, vendor-neutral events emitted to surfaces during a turn.
///
/// Contract:
/// - A turn emits exactly one `Started` first.
/// - Progress arrives as `OutputDelta` / `ToolCall` / `ApprovalRequested` /
///   `TokenUsage` / `RunNotice` in wire order.
/// - A turn ends with exactly one terminal event: `Completed` or `Failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "started")]
    Started {
        timestamp: String,
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },

    #[serde(rename = "output_delta")]
    OutputDelta {
        timestamp: String,
        content: String,
        delta_type: DeltaType,
    },

    #[serde(rename = "tool_call")]
    ToolCall {
        timestamp: String,
        tool_name: String,
        tool_input: Value,
    },

    #[serde(rename = "approval_requested")]
    ApprovalRequested {
        timestamp: String,
        request_id: String,
        description: String,
        context: Value,
    },

    #[serde(rename = "token_usage")]
    TokenUsage { timestamp: String, usage: Value },

    /// Out-of-band notices (reasoning previews, oversize warnings, ...).
    #[serde(rename = "run_notice")]
    RunNotice {
        timestamp: String,
        kind: String,
        message: String,
        #[serde(skip_serializing_if = "Value::is_null")]
        data: Value,
    },

    #[serde(rename = "completed")]
    Completed {
        timestamp: String,
        final_message: String,
    },

    #[serde(rename = "failed")]
    Failed {
        timestamp: String,
        error_message: String,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunEvent::Completed { .. } | RunEvent::Failed { .. })
    }

    pub fn started(session_id: &str, thread_id: Option<&str>, turn_id: Option<&str>) -> Self {
        RunEvent::Started {
            timestamp: now_iso(),
            session_id: session_id.to_string(),
            thread_id: thread_id.map(str::to_string),
            turn_id: turn_id.map(str::to_string),
        }
    }

    pub fn output_delta(content: impl Into<String>, delta_type: DeltaType) -> Self {
        RunEvent::OutputDelta {
            timestamp: now_iso(),
            content: content.into(),
            delta_type,
        }
    }

    pub fn tool_call(tool_name: impl Into<String>, tool_input: Value) -> Self {
        RunEvent::ToolCall {
            timestamp: now_iso(),
            tool_name: tool_name.into(),
            tool_input,
        }
    }

    pub fn approval_requested(
        request_id: impl Into<String>,
        description: impl Into<String>,
        context: Value,
    ) -> Self {
        RunEvent::ApprovalRequested {
            timestamp: now_iso(),
            request_id: request_id.into(),
            description: description.into(),
            context,
        }
    }

    pub fn token_usage(usage: Value) -> Self {
        RunEvent::TokenUsage {
            timestamp: now_iso(),
            usage,
        }
    }

    pub fn notice(kind: impl Into<String>, message: impl Into<String>) -> Self {
        RunEvent::RunNotice {
            timestamp: now_iso(),
            kind: kind.into(),
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn completed(final_message: impl Into<String>) -> Self {
        RunEvent::Completed {
            timestamp: now_iso(),
            final_message: final_message.into(),
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        RunEvent::Failed {
            timestamp: now_iso(),
            error_message: error_message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_events() {
        assert!(RunEvent::completed("done").is_terminal());
        assert!(RunEvent::failed("boom").is_terminal());
        assert!(!RunEvent::started("s-1", None, None).is_terminal());
        assert!(!RunEvent::notice("thinking", "...").is_terminal());
    }

    #[test]
    fn serializes_with_type_tag() {
        let json =
            serde_json::to_value(RunEvent::output_delta("hi", DeltaType::AssistantStream)).unwrap();
        assert_eq!(json["type"], "output_delta");
        assert_eq!(json["delta_type"], "assistant_stream");
        assert_eq!(json["content"], "hi");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn started_omits_absent_ids() {
        let json = serde_json::to_value(RunEvent::started("sess", None, None)).unwrap();
        assert!(json.get("thread_id").is_none());
        assert!(json.get("turn_id").is_none());
    }
}
