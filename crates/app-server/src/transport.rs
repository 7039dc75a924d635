//! Framing for the newline-delimited stdout stream.
//!
//! [`LineAssembler`] is a pure state machine over byte chunks. Complete
//! lines come out as [`Frame::Line`]; lines exceeding the byte limit are
//! discarded via the drain protocol and come out as a single
//! [`Frame::OversizeDropped`] carrying the dropped byte count and a bounded
//! preview for metadata sniffing. The absolute drain limit bounds how much
//! of a runaway line is even counted before draining goes silent.

use serde_json::Value;

/// One output of the assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A complete line (without its trailing newline).
    Line(Vec<u8>),
    /// An oversize line was discarded.
    OversizeDropped(OversizeDropped),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OversizeDropped {
    pub bytes_dropped: usize,
    /// Head of the dropped line, capped at the preview limit.
    pub preview: Vec<u8>,
    /// EOF arrived before the line's newline.
    pub truncated: bool,
    /// The absolute drain limit was hit; counting stopped there.
    pub aborted: bool,
}

/// Metadata regex-sniffed from an oversize preview.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferredMetadata {
    pub method: Option<String>,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
}

/// Sniff `method` / `threadId` / `turnId` from the head of a dropped line.
pub fn infer_oversize_metadata(preview: &[u8]) -> InferredMetadata {
    let text = String::from_utf8_lossy(preview);
    let capture = |pattern: &str| -> Option<String> {
        let re = regex::Regex::new(pattern).ok()?;
        let value = re.captures(&text)?.get(1)?.as_str().trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    };
    InferredMetadata {
        method: capture(r#""method"\s*:\s*"([^"]+)""#),
        thread_id: capture(r#""threadId"\s*:\s*"([^"]+)""#)
            .or_else(|| capture(r#""thread_id"\s*:\s*"([^"]+)""#)),
        turn_id: capture(r#""turnId"\s*:\s*"([^"]+)""#)
            .or_else(|| capture(r#""turn_id"\s*:\s*"([^"]+)""#)),
    }
}

/// Build the synthetic notification params for one oversize drop.
pub fn oversize_notification_params(
    byte_limit: usize,
    drain_limit: usize,
    dropped: &OversizeDropped,
) -> Value {
    let meta = infer_oversize_metadata(&dropped.preview);
    let mut params = serde_json::Map::new();
    params.insert("byteLimit".into(), byte_limit.into());
    params.insert("bytesDropped".into(), dropped.bytes_dropped.into());
    if let Some(method) = meta.method {
        params.insert("inferredMethod".into(), method.into());
    }
    if let Some(thread_id) = meta.thread_id {
        params.insert("threadId".into(), thread_id.into());
    }
    if let Some(turn_id) = meta.turn_id {
        params.insert("turnId".into(), turn_id.into());
    }
    if dropped.truncated {
        params.insert("truncated".into(), true.into());
    }
    if dropped.aborted {
        params.insert("aborted".into(), true.into());
        params.insert("drainLimit".into(), drain_limit.into());
    }
    Value::Object(params)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LineAssembler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LineAssembler {
    max_message_bytes: usize,
    preview_bytes: usize,
    max_drain_bytes: usize,
    /// Skip the oversize check (handshake window).
    unbounded: bool,

    buffer: Vec<u8>,
    dropping: bool,
    drain_limit_reached: bool,
    preview: Vec<u8>,
    dropped: usize,
}

impl LineAssembler {
    pub fn new(max_message_bytes: usize, preview_bytes: usize, max_drain_bytes: usize) -> Self {
        Self {
            max_message_bytes,
            preview_bytes,
            max_drain_bytes,
            unbounded: false,
            buffer: Vec::new(),
            dropping: false,
            drain_limit_reached: false,
            preview: Vec::new(),
            dropped: 0,
        }
    }

    /// Toggle the oversize check off for the handshake window.
    pub fn set_unbounded(&mut self, unbounded: bool) {
        self.unbounded = unbounded;
    }

    /// Feed one chunk of bytes; returns the frames it completes.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        if self.dropping {
            self.drain_chunk(chunk, &mut out);
        } else {
            self.collect_chunk(chunk, &mut out);
        }
        out
    }

    /// Signal EOF; flushes any trailing line or pending oversize state.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        if self.dropping {
            if !self.drain_limit_reached && self.dropped > 0 {
                out.push(Frame::OversizeDropped(OversizeDropped {
                    bytes_dropped: self.dropped,
                    preview: std::mem::take(&mut self.preview),
                    truncated: true,
                    aborted: false,
                }));
            }
            self.reset_drop_state();
            return out;
        }
        if self.buffer.is_empty() {
            return out;
        }
        let buffer = std::mem::take(&mut self.buffer);
        if !self.unbounded && buffer.len() > self.max_message_bytes {
            let preview_len = buffer.len().min(self.preview_bytes);
            out.push(Frame::OversizeDropped(OversizeDropped {
                bytes_dropped: buffer.len(),
                preview: buffer[..preview_len].to_vec(),
                truncated: true,
                aborted: false,
            }));
        } else {
            out.push(Frame::Line(buffer));
        }
        out
    }

    fn collect_chunk(&mut self, chunk: &[u8], out: &mut Vec<Frame>) {
        self.buffer.extend_from_slice(chunk);
        self.split_lines(out);
        // The in-flight partial line can already be over the limit.
        if !self.unbounded && self.buffer.len() > self.max_message_bytes {
            let preview_len = self.buffer.len().min(self.preview_bytes);
            self.preview = self.buffer[..preview_len].to_vec();
            self.dropped = self.buffer.len();
            self.buffer.clear();
            self.dropping = true;
        }
    }

    fn drain_chunk(&mut self, chunk: &[u8], out: &mut Vec<Frame>) {
        let Some(newline_index) = chunk.iter().position(|&b| b == b'\n') else {
            self.track_fragment(chunk, out);
            return;
        };
        let before = &chunk[..=newline_index];
        let after = &chunk[newline_index + 1..];
        if !self.drain_limit_reached {
            self.append_preview(before);
            self.dropped += before.len();
            out.push(Frame::OversizeDropped(OversizeDropped {
                bytes_dropped: self.dropped,
                preview: std::mem::take(&mut self.preview),
                truncated: false,
                aborted: false,
            }));
        }
        self.reset_drop_state();
        if !after.is_empty() {
            self.collect_chunk(after, out);
        }
    }

    fn track_fragment(&mut self, chunk: &[u8], out: &mut Vec<Frame>) {
        if self.drain_limit_reached {
            return;
        }
        self.append_preview(chunk);
        self.dropped += chunk.len();
        if self.dropped >= self.max_drain_bytes {
            out.push(Frame::OversizeDropped(OversizeDropped {
                bytes_dropped: self.dropped,
                preview: std::mem::take(&mut self.preview),
                truncated: false,
                aborted: true,
            }));
            self.drain_limit_reached = true;
        }
    }

    fn append_preview(&mut self, chunk: &[u8]) {
        if self.preview.len() >= self.preview_bytes {
            return;
        }
        let remaining = self.preview_bytes - self.preview.len();
        self.preview
            .extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }

    fn split_lines(&mut self, out: &mut Vec<Frame>) {
        while let Some(newline_index) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline_index).collect();
            line.pop();
            if !self.unbounded && line.len() > self.max_message_bytes {
                let preview_len = line.len().min(self.preview_bytes);
                out.push(Frame::OversizeDropped(OversizeDropped {
                    // The newline is part of the dropped frame.
                    bytes_dropped: line.len() + 1,
                    preview: line[..preview_len].to_vec(),
                    truncated: false,
                    aborted: false,
                }));
            } else {
                out.push(Frame::Line(line));
            }
        }
    }

    fn reset_drop_state(&mut self) {
        self.dropping = false;
        self.drain_limit_reached = false;
        self.preview.clear();
        self.dropped = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Line(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                _ => None,
            })
            .collect()
    }

    fn drops(frames: &[Frame]) -> Vec<&OversizeDropped> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::OversizeDropped(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn assembles_lines_across_chunks() {
        let mut asm = LineAssembler::new(1024, 64, 4096);
        let mut frames = asm.push_chunk(b"{\"a\":1}\n{\"b\"");
        frames.extend(asm.push_chunk(b":2}\n"));
        assert_eq!(lines(&frames), vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn eof_flushes_trailing_line() {
        let mut asm = LineAssembler::new(1024, 64, 4096);
        assert!(asm.push_chunk(b"{\"tail\":true}").is_empty());
        let frames = asm.finish();
        assert_eq!(lines(&frames), vec!["{\"tail\":true}"]);
    }

    #[test]
    fn line_exactly_at_limit_succeeds() {
        let limit = 32;
        let mut asm = LineAssembler::new(limit, 16, 4096);
        let mut payload = vec![b'x'; limit];
        payload.push(b'\n');
        let frames = asm.push_chunk(&payload);
        assert_eq!(lines(&frames).len(), 1);
        assert!(drops(&frames).is_empty());
    }

    #[test]
    fn one_byte_over_limit_drops_once() {
        let limit = 32;
        let mut asm = LineAssembler::new(limit, 16, 4096);
        let mut payload = vec![b'x'; limit + 1];
        payload.push(b'\n');
        let frames = asm.push_chunk(&payload);
        let dropped = drops(&frames);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].bytes_dropped, limit + 2); // includes the newline
        assert!(!dropped[0].aborted);
        assert!(!dropped[0].truncated);
        assert!(lines(&frames).is_empty());
    }

    #[test]
    fn parsing_resumes_after_drop() {
        let mut asm = LineAssembler::new(8, 4, 4096);
        let frames = asm.push_chunk(b"xxxxxxxxxxxx\n{\"ok\":1}\n");
        assert_eq!(drops(&frames).len(), 1);
        assert_eq!(lines(&frames), vec!["{\"ok\":1}"]);
    }

    #[test]
    fn consecutive_oversize_lines_each_drop() {
        let mut asm = LineAssembler::new(8, 4, 4096);
        let frames = asm.push_chunk(b"aaaaaaaaaaaa\nbbbbbbbbbbbb\n");
        assert_eq!(drops(&frames).len(), 2);
        assert!(lines(&frames).is_empty());
    }

    #[test]
    fn drain_limit_aborts() {
        let mut asm = LineAssembler::new(8, 4, 32);
        let mut frames = asm.push_chunk(&[b'z'; 16]);
        // Not yet at the drain limit.
        assert!(drops(&frames).is_empty());
        frames = asm.push_chunk(&[b'z'; 32]);
        let dropped = drops(&frames);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].aborted);
        assert!(dropped[0].bytes_dropped >= 32);
        // Further bytes drain silently until the newline.
        let frames = asm.push_chunk(&[b'z'; 64]);
        assert!(frames.is_empty());
        let frames = asm.push_chunk(b"\n{\"after\":1}\n");
        assert_eq!(drops(&frames).len(), 0);
        assert_eq!(lines(&frames), vec!["{\"after\":1}"]);
    }

    #[test]
    fn eof_mid_drain_is_truncated() {
        let mut asm = LineAssembler::new(8, 4, 4096);
        asm.push_chunk(&[b'q'; 20]);
        let frames = asm.finish();
        let dropped = drops(&frames);
        assert_eq!(dropped.len(), 1);
        assert!(dropped[0].truncated);
        assert_eq!(dropped[0].bytes_dropped, 20);
    }

    #[test]
    fn preview_is_capped() {
        let mut asm = LineAssembler::new(8, 4, 4096);
        let frames = asm.push_chunk(b"0123456789abcdef\n");
        let dropped = drops(&frames);
        assert_eq!(dropped[0].preview, b"0123");
    }

    #[test]
    fn unbounded_skips_oversize_check() {
        let mut asm = LineAssembler::new(8, 4, 4096);
        asm.set_unbounded(true);
        let frames = asm.push_chunk(b"xxxxxxxxxxxxxxxx\n");
        assert_eq!(lines(&frames).len(), 1);
        assert!(drops(&frames).is_empty());
    }

    #[test]
    fn metadata_sniffing() {
        let preview = br#"{"method":"item/agentMessage/delta","params":{"threadId":"th-1","turnId":"t-9","delta":"#;
        let meta = infer_oversize_metadata(preview);
        assert_eq!(meta.method.as_deref(), Some("item/agentMessage/delta"));
        assert_eq!(meta.thread_id.as_deref(), Some("th-1"));
        assert_eq!(meta.turn_id.as_deref(), Some("t-9"));
    }

    #[test]
    fn metadata_sniffing_snake_case() {
        let meta = infer_oversize_metadata(br#"{"thread_id":"a","turn_id":"b"}"#);
        assert_eq!(meta.thread_id.as_deref(), Some("a"));
        assert_eq!(meta.turn_id.as_deref(), Some("b"));
        assert!(meta.method.is_none());
    }

    #[test]
    fn notification_params_shape() {
        let dropped = OversizeDropped {
            bytes_dropped: 73_400_320,
            preview: br#"{"method":"turn/streamDelta","turnId":"t-1""#.to_vec(),
            truncated: false,
            aborted: false,
        };
        let params = oversize_notification_params(52_428_800, 104_857_600, &dropped);
        assert_eq!(params["byteLimit"], 52_428_800);
        assert_eq!(params["bytesDropped"], 73_400_320);
        assert_eq!(params["inferredMethod"], "turn/streamDelta");
        assert_eq!(params["turnId"], "t-1");
        assert!(params.get("truncated").is_none());
        assert!(params.get("aborted").is_none());
    }

    #[test]
    fn notification_params_aborted_carries_drain_limit() {
        let dropped = OversizeDropped {
            bytes_dropped: 100,
            preview: Vec::new(),
            truncated: false,
            aborted: true,
        };
        let params = oversize_notification_params(50, 100, &dropped);
        assert_eq!(params["aborted"], true);
        assert_eq!(params["drainLimit"], 100);
    }
}
