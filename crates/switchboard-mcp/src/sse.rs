//! Server-sent-events decoding.
//!
//! Two entry points: a one-shot decoder for streamable-HTTP responses whose
//! whole body is already in memory, and an incremental [`SseDecoder`] fed
//! from a live byte stream by the SSE connector.

use anyhow::Context as _;

/// A decoded SSE event: optional `event:` name plus joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Decode every blank-line-delimited event's data payload from a complete
/// buffer. Comments and unknown fields are ignored.
pub fn decode_sse_events(buf: &str) -> Vec<String> {
    let mut decoder = SseDecoder::new();
    let mut out: Vec<String> = decoder.feed(buf).into_iter().map(|e| e.data).collect();
    if let Some(last) = decoder.flush() {
        out.push(last.data);
    }
    out
}

pub fn parse_first_json_message_from_sse(body: &str) -> anyhow::Result<serde_json::Value> {
    let events = decode_sse_events(body);
    let first = events.first().context("no sse events")?;
    serde_json::from_str(first).context("parse sse data as json")
}

/// Incremental SSE decoder. Feed chunks as they arrive; complete events are
/// returned as soon as their terminating blank line is seen.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text, returning every event completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(ev) = self.take_line(line.trim_end_matches(['\n', '\r'])) {
                out.push(ev);
            }
        }
        out
    }

    /// Finish decoding, yielding a trailing event that was never terminated
    /// by a blank line.
    pub fn flush(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end_matches('\r');
        if !rest.is_empty() {
            self.take_line(rest);
        }
        self.complete()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.complete();
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim_start().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_lines.push(rest.trim_start().to_string());
        }
        None
    }

    fn complete(&mut self) -> Option<SseEvent> {
        if self.data_lines.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}
