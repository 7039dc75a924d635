//! HTTP-session flavored backend.
//!
//! The agent exposes an HTTP server: sessions are created over REST and a
//! turn streams back as chunked, line-delimited JSON events. The same
//! canonical event stream comes out the other end, and the same stall
//! timeout applies between chunks. A missing session surfaces as a 404 so
//! the orchestrator can reset any cached session id.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use car_domain::error::{Error, Result};
use car_domain::run_event::{BoxStream, DeltaType, RunEvent};

use crate::backend::{AgentBackend, TurnPolicy};

const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether a failure message names a session the server no longer knows.
pub fn is_session_missing_message(message: &str) -> bool {
    message.contains("status 404")
}

struct State {
    policy: TurnPolicy,
    session_id: Option<String>,
    last_turn_id: Option<String>,
    last_token_total: Option<Value>,
}

pub struct OpenCodeBackend {
    base_url: String,
    http: reqwest::Client,
    state: Arc<Mutex<State>>,
}

impl OpenCodeBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            state: Arc::new(Mutex::new(State {
                policy: TurnPolicy::default(),
                session_id: None,
                last_turn_id: None,
                last_token_total: None,
            })),
        }
    }

    fn stall_timeout(&self) -> Duration {
        self.state
            .lock()
            .policy
            .turn_timeout
            .unwrap_or(DEFAULT_STALL_TIMEOUT)
            .min(DEFAULT_STALL_TIMEOUT)
    }

    async fn create_session(&self, workspace_root: &Path) -> Result<String> {
        let url = format!("{}/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "cwd": workspace_root.to_string_lossy() }))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!(
                "session create failed (status {})",
                status.as_u16()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol("session create response missing id".into()))
    }

    async fn probe_session(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/session/{}", self.base_url, session_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(Error::Http(format!(
            "session probe failed (status {})",
            status.as_u16()
        )))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream-line parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, PartialEq)]
enum LineEvent {
    Delta(String),
    Tool { name: String, input: Value },
    Usage(Value),
    Done { message: Option<String> },
    Error(String),
}

/// Parse one line of the chunked turn stream. Unknown shapes are skipped.
fn parse_stream_line(line: &str) -> Option<LineEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let event_type = value.get("type").and_then(Value::as_str)?;
    match event_type {
        "text" | "delta" => {
            let text = value
                .get("text")
                .or_else(|| value.get("delta"))
                .and_then(Value::as_str)?;
            Some(LineEvent::Delta(text.to_string()))
        }
        "tool" | "tool_call" => {
            let name = value.get("name").and_then(Value::as_str)?.to_string();
            let input = value
                .get("input")
                .filter(|i| i.is_object())
                .cloned()
                .unwrap_or_else(|| json!({}));
            Some(LineEvent::Tool { name, input })
        }
        "usage" | "tokens" => value
            .get("usage")
            .filter(|u| u.is_object())
            .cloned()
            .map(LineEvent::Usage),
        "done" | "completed" => Some(LineEvent::Done {
            message: value
                .get("message")
                .or_else(|| value.get("text"))
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "error" => Some(LineEvent::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )),
        _ => None,
    }
}

#[async_trait]
impl AgentBackend for OpenCodeBackend {
    fn configure(&self, policy: TurnPolicy) {
        self.state.lock().policy = policy;
    }

    async fn start_session(
        &self,
        workspace_root: &Path,
        resume_session: Option<&str>,
    ) -> Result<String> {
        if let Some(resume) = resume_session.filter(|s| !s.is_empty()) {
            match self.probe_session(resume).await {
                Ok(()) => {
                    self.state.lock().session_id = Some(resume.to_string());
                    return Ok(resume.to_string());
                }
                Err(e) => {
                    tracing::info!(
                        session_id = %resume,
                        error = %e,
                        "session resume failed, creating fresh"
                    );
                }
            }
        }
        let session_id = self.create_session(workspace_root).await?;
        self.state.lock().session_id = Some(session_id.clone());
        Ok(session_id)
    }

    async fn run_turn(&self, session_id: &str, prompt: &str) -> BoxStream<'static, RunEvent> {
        let state = self.state.clone();
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let stall_timeout = self.stall_timeout();
        let session_id = session_id.to_string();
        let prompt = prompt.to_string();

        Box::pin(stream! {
            yield RunEvent::started(&session_id, None, None);
            yield RunEvent::output_delta(prompt.clone(), DeltaType::UserMessage);

            let turn_id = uuid::Uuid::new_v4().to_string();
            state.lock().last_turn_id = Some(turn_id);

            let (model, reasoning) = {
                let guard = state.lock();
                (
                    guard.policy.model.clone(),
                    guard.policy.reasoning_effort.clone(),
                )
            };
            let mut body = json!({ "text": prompt });
            if let Some(model) = model {
                body["model"] = json!(model);
            }
            if let Some(reasoning) = reasoning {
                body["reasoning"] = json!(reasoning);
            }

            let url = format!("{base_url}/session/{session_id}/message");
            let response = match http.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    yield RunEvent::failed(format!("HTTP: {e}"));
                    return;
                }
            };
            let status = response.status();
            if !status.is_success() {
                yield RunEvent::failed(format!(
                    "turn request failed (status {})",
                    status.as_u16()
                ));
                return;
            }

            let mut response = response;
            let mut buffer = String::new();
            let mut streamed_text = String::new();
            let mut done: Option<Option<String>> = None;

            'read: loop {
                let chunk = match tokio::time::timeout(stall_timeout, response.chunk()).await {
                    Ok(Ok(Some(bytes))) => bytes,
                    Ok(Ok(None)) => break 'read,
                    Ok(Err(e)) => {
                        yield RunEvent::failed(format!("HTTP: {e}"));
                        return;
                    }
                    Err(_) => {
                        yield RunEvent::failed(format!(
                            "turn stalled for {}s with no output",
                            stall_timeout.as_secs()
                        ));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    match parse_stream_line(&line) {
                        Some(LineEvent::Delta(text)) => {
                            streamed_text.push_str(&text);
                            yield RunEvent::output_delta(text, DeltaType::AssistantStream);
                        }
                        Some(LineEvent::Tool { name, input }) => {
                            yield RunEvent::tool_call(name, input);
                        }
                        Some(LineEvent::Usage(usage)) => {
                            state.lock().last_token_total = Some(usage.clone());
                            yield RunEvent::token_usage(usage);
                        }
                        Some(LineEvent::Done { message }) => {
                            done = Some(message);
                            break 'read;
                        }
                        Some(LineEvent::Error(message)) => {
                            yield RunEvent::failed(message);
                            return;
                        }
                        None => {}
                    }
                }
            }

            match done {
                Some(Some(message)) => yield RunEvent::completed(message),
                // The stream closing cleanly is completion; the final
                // message is whatever streamed.
                Some(None) | None => yield RunEvent::completed(streamed_text),
            }
        })
    }

    async fn interrupt(&self, session_id: &str) {
        let session_id = if session_id.is_empty() {
            self.state.lock().session_id.clone()
        } else {
            Some(session_id.to_string())
        };
        let Some(session_id) = session_id else {
            tracing::warn!("cannot interrupt: no session");
            return;
        };
        let url = format!("{}/session/{}/interrupt", self.base_url, session_id);
        match self.http.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(session_id = %session_id, "session interrupted");
            }
            Ok(response) => {
                tracing::warn!(
                    session_id = %session_id,
                    status = response.status().as_u16(),
                    "interrupt request rejected"
                );
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "interrupt request failed");
            }
        }
    }

    fn last_turn_id(&self) -> Option<String> {
        self.state.lock().last_turn_id.clone()
    }

    fn last_thread_info(&self) -> Option<Value> {
        None
    }

    fn last_token_total(&self) -> Option<Value> {
        self.state.lock().last_token_total.clone()
    }

    async fn close(&self) {
        self.state.lock().session_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_and_delta_lines() {
        assert_eq!(
            parse_stream_line(r#"{"type":"text","text":"hello"}"#),
            Some(LineEvent::Delta("hello".into()))
        );
        assert_eq!(
            parse_stream_line(r#"{"type":"delta","delta":"world"}"#),
            Some(LineEvent::Delta("world".into()))
        );
    }

    #[test]
    fn parses_tool_lines() {
        assert_eq!(
            parse_stream_line(r#"{"type":"tool","name":"bash","input":{"cmd":"ls"}}"#),
            Some(LineEvent::Tool {
                name: "bash".into(),
                input: json!({"cmd": "ls"})
            })
        );
    }

    #[test]
    fn parses_usage_done_error() {
        assert_eq!(
            parse_stream_line(r#"{"type":"usage","usage":{"totalTokens":12}}"#),
            Some(LineEvent::Usage(json!({"totalTokens": 12})))
        );
        assert_eq!(
            parse_stream_line(r#"{"type":"done","message":"final"}"#),
            Some(LineEvent::Done {
                message: Some("final".into())
            })
        );
        assert_eq!(
            parse_stream_line(r#"{"type":"done"}"#),
            Some(LineEvent::Done { message: None })
        );
        assert_eq!(
            parse_stream_line(r#"{"type":"error","message":"boom"}"#),
            Some(LineEvent::Error("boom".into()))
        );
    }

    #[test]
    fn skips_garbage_and_unknown_lines() {
        assert_eq!(parse_stream_line(""), None);
        assert_eq!(parse_stream_line("not json"), None);
        assert_eq!(parse_stream_line(r#"{"type":"heartbeat"}"#), None);
        assert_eq!(parse_stream_line(r#"{"no_type":1}"#), None);
    }

    #[test]
    fn session_missing_detection() {
        assert!(is_session_missing_message("session probe failed (status 404)"));
        assert!(is_session_missing_message("turn request failed (status 404)"));
        assert!(!is_session_missing_message("turn request failed (status 500)"));
        assert!(!is_session_missing_message("turn stalled for 60s"));
    }
}
