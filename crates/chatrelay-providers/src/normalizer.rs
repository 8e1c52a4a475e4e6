//! Upstream stream bodies to canonical events.
//!
//! Bodies are split into lines across chunk boundaries and each line is
//! decoded according to the back-end's [`WireFormat`]. The resulting stream
//! always starts with [`CanonicalEvent::RoleAnnounce`] and ends with exactly
//! one terminal event, even when the upstream closes without a terminator.

use bytes::BytesMut;
use chatrelay_protocol::{CanonicalEvent, ErrorKind};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::transport::ByteStream;

/// Maximum bytes buffered while waiting for a line terminator (10MB)
const MAX_LINE_BUFFER: usize = 10 * 1024 * 1024;

const DONE_SENTINEL: &str = "[DONE]";

pub type EventStream = Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>;

/// Encoding of an upstream streaming body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFormat {
    /// One JSON object per line carrying the next token
    TokenDelta { stop_marker: Option<String> },
    /// JSON objects tagged by `type`: status updates, tokens, final answer
    DiscriminatedEvent,
    /// JSON objects carrying the whole answer so far
    FullTextSnapshot,
}

impl WireFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TokenDelta { .. } => "token_delta",
            Self::DiscriminatedEvent => "discriminated_event",
            Self::FullTextSnapshot => "full_text_snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineOutcome {
    Skip,
    Content(String),
    Finished,
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct TokenFrame {
    token: TokenText,
}

#[derive(Debug, Deserialize)]
struct TokenText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    token: Option<String>,
}

/// Line-level decoder holding the per-stream parse state
#[derive(Debug)]
pub struct LineDecoder {
    format: WireFormat,
    /// Bytes of snapshot text already emitted
    offset: usize,
    emitted_content: bool,
    malformed: usize,
}

impl LineDecoder {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            offset: 0,
            emitted_content: false,
            malformed: 0,
        }
    }

    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }

    pub(crate) fn decode(&mut self, line: &str) -> LineOutcome {
        let Some(payload) = sse_payload(line) else {
            return LineOutcome::Skip;
        };
        if payload.is_empty() {
            return LineOutcome::Skip;
        }

        let outcome = match &self.format {
            WireFormat::TokenDelta { stop_marker } => {
                let stop_marker = stop_marker.clone();
                self.decode_token(payload, stop_marker.as_deref())
            }
            WireFormat::DiscriminatedEvent => decode_event(payload),
            WireFormat::FullTextSnapshot => self.decode_snapshot(payload),
        };

        match &outcome {
            LineOutcome::Malformed(detail) => {
                self.malformed += 1;
                tracing::warn!(
                    kind = ErrorKind::UpstreamProtocol.as_str(),
                    format = self.format.name(),
                    detail = %detail,
                    "skipping malformed stream line"
                );
            }
            LineOutcome::Skip => {
                tracing::debug!(format = self.format.name(), "ignoring stream line");
            }
            _ => {}
        }
        outcome
    }

    fn decode_token(&mut self, payload: &str, stop_marker: Option<&str>) -> LineOutcome {
        let frame: TokenFrame = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(e) => return LineOutcome::Malformed(format!("{}: {}", e, payload)),
        };

        let text = frame.token.text;
        if stop_marker.is_some_and(|stop| text.trim() == stop) {
            return LineOutcome::Finished;
        }

        if self.emitted_content {
            return LineOutcome::Content(text);
        }

        // Leading whitespace of the first token belongs to the prompt's cursor
        let trimmed = text.trim_start();
        if trimmed.is_empty() {
            return LineOutcome::Skip;
        }
        self.emitted_content = true;
        LineOutcome::Content(trimmed.to_string())
    }

    fn decode_snapshot(&mut self, payload: &str) -> LineOutcome {
        if payload.starts_with(DONE_SENTINEL) {
            return LineOutcome::Finished;
        }

        let frame: Value = match serde_json::from_str(payload) {
            Ok(frame) => frame,
            Err(e) => return LineOutcome::Malformed(format!("{}: {}", e, payload)),
        };

        let role = frame.pointer("/message/author/role").and_then(Value::as_str);
        let status = frame.pointer("/message/status").and_then(Value::as_str);
        if role != Some("assistant") || status != Some("in_progress") {
            return LineOutcome::Skip;
        }

        let Some(content) = frame
            .pointer("/message/content/parts/0")
            .and_then(Value::as_str)
        else {
            return LineOutcome::Skip;
        };
        if content.is_empty() {
            return LineOutcome::Skip;
        }

        let delta = content.get(self.offset..).unwrap_or_default().to_string();
        self.offset = content.len();

        if delta.is_empty() {
            LineOutcome::Skip
        } else {
            LineOutcome::Content(delta)
        }
    }
}

fn decode_event(payload: &str) -> LineOutcome {
    let frame: EventFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(e) => return LineOutcome::Malformed(format!("{}: {}", e, payload)),
    };

    match frame.kind.as_str() {
        "stream" => {
            let token = frame.token.unwrap_or_default().replace('\0', "");
            if token.is_empty() {
                LineOutcome::Skip
            } else {
                LineOutcome::Content(token)
            }
        }
        "finalAnswer" => LineOutcome::Finished,
        _ => LineOutcome::Skip,
    }
}

/// Data carried by one body line; `None` for SSE comments and non-data fields
fn sse_payload(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        return Some(data.trim_start());
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return None;
    }
    Some(line)
}

enum NextChunk {
    Cancelled,
    Chunk(Option<crate::error::RelayResult<bytes::Bytes>>),
}

/// Decode `body` into canonical events.
///
/// Cancelling `cancel` drops the body and ends the stream with
/// `Error(Cancelled)`.
pub fn normalize(body: ByteStream, format: WireFormat, cancel: CancellationToken) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut body = body;
        let mut decoder = LineDecoder::new(format);
        let mut buffer = BytesMut::new();
        // Bytes of `buffer` already searched for a line terminator
        let mut scanned = 0usize;
        let mut eof = false;

        yield CanonicalEvent::RoleAnnounce;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => NextChunk::Cancelled,
                chunk = body.next() => NextChunk::Chunk(chunk),
            };

            match next {
                NextChunk::Cancelled => {
                    drop(body);
                    tracing::info!("stream cancelled by caller");
                    yield CanonicalEvent::error(ErrorKind::Cancelled, "request cancelled");
                    return;
                }
                NextChunk::Chunk(Some(Ok(bytes))) => buffer.extend_from_slice(&bytes),
                NextChunk::Chunk(Some(Err(e))) => {
                    tracing::warn!(
                        kind = ErrorKind::UpstreamDisconnected.as_str(),
                        error = %e,
                        "upstream body failed"
                    );
                    break;
                }
                NextChunk::Chunk(None) => {
                    eof = true;
                    if !buffer.is_empty() {
                        buffer.extend_from_slice(b"\n");
                    }
                }
            }

            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let pos = scanned + offset;
                let raw = buffer.split_to(pos + 1);
                scanned = 0;
                let line = String::from_utf8_lossy(&raw[..pos]).trim_end_matches('\r').to_string();

                match decoder.decode(&line) {
                    LineOutcome::Content(text) => yield CanonicalEvent::delta(text),
                    LineOutcome::Finished => {
                        tracing::debug!(malformed = decoder.malformed_lines(), "stream finished");
                        yield CanonicalEvent::Finished;
                        return;
                    }
                    LineOutcome::Skip | LineOutcome::Malformed(_) => {}
                }
            }
            scanned = buffer.len();

            // Only the unterminated tail counts against the limit
            if buffer.len() > MAX_LINE_BUFFER {
                tracing::warn!(
                    kind = ErrorKind::UpstreamProtocol.as_str(),
                    buffered = buffer.len(),
                    "stream line exceeded maximum size"
                );
                yield CanonicalEvent::error(
                    ErrorKind::UpstreamProtocol,
                    "stream line exceeded maximum size",
                );
                return;
            }

            if eof {
                tracing::warn!(
                    kind = ErrorKind::UpstreamDisconnected.as_str(),
                    "upstream closed without a terminator"
                );
                break;
            }
        }

        tracing::debug!(malformed = decoder.malformed_lines(), "synthesizing finish");
        yield CanonicalEvent::Finished;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::error::{RelayError, RelayResult};

    fn body(chunks: &[&str]) -> ByteStream {
        let chunks: Vec<RelayResult<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }

    async fn collect(body: ByteStream, format: WireFormat) -> Vec<CanonicalEvent> {
        normalize(body, format, CancellationToken::new())
            .collect()
            .await
    }

    fn deltas(events: &[CanonicalEvent]) -> Vec<&str> {
        events.iter().filter_map(|e| e.as_delta()).collect()
    }

    fn snapshot(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "message": {
                    "author": { "role": "assistant" },
                    "status": "in_progress",
                    "content": { "content_type": "text", "parts": [text] }
                }
            })
        )
    }

    fn assert_well_formed(events: &[CanonicalEvent]) {
        assert_eq!(events.first(), Some(&CanonicalEvent::RoleAnnounce));
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1);
        assert!(events.last().is_some_and(CanonicalEvent::is_terminal));
    }

    #[tokio::test]
    async fn test_snapshot_emits_suffixes() {
        let lines = [snapshot("ab"), snapshot("abcd"), snapshot("abcdef")];
        let mut chunks: Vec<&str> = lines.iter().map(String::as_str).collect();
        chunks.push("data: [DONE]\n\n");

        let events = collect(body(&chunks), WireFormat::FullTextSnapshot).await;
        assert_eq!(deltas(&events), vec!["ab", "cd", "ef"]);
        assert_eq!(events.last(), Some(&CanonicalEvent::Finished));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_snapshot_ignores_other_messages() {
        let user_echo = format!(
            "data: {}\n",
            serde_json::json!({
                "message": {
                    "author": { "role": "user" },
                    "status": "finished_successfully",
                    "content": { "parts": ["hello"] }
                }
            })
        );
        let hi = snapshot("hi");
        let refs = vec![
            user_echo.as_str(),
            "event: delta_encoding\n",
            hi.as_str(),
            "data: [DONE]\n",
        ];

        let events = collect(body(&refs), WireFormat::FullTextSnapshot).await;
        assert_eq!(deltas(&events), vec!["hi"]);
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let line = snapshot("hello world");
        let (head, tail) = line.split_at(17);
        let events = collect(body(&[head, tail]), WireFormat::FullTextSnapshot).await;
        assert_eq!(deltas(&events), vec!["hello world"]);
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_missing_terminator_synthesizes_finish() {
        let events = collect(
            body(&["{\"type\":\"stream\",\"token\":\"Hel\"}\n{\"type\":\"stream\",\"token\":\"lo\"}"]),
            WireFormat::DiscriminatedEvent,
        )
        .await;
        assert_eq!(deltas(&events), vec!["Hel", "lo"]);
        assert_eq!(events.last(), Some(&CanonicalEvent::Finished));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_malformed_first_line_is_skipped() {
        let events = collect(
            body(&["not json at all\n", "data:{\"token\":{\"text\":\" Hi\"}}\n"]),
            WireFormat::TokenDelta { stop_marker: None },
        )
        .await;
        assert_eq!(deltas(&events), vec!["Hi"]);
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_token_delta_stop_marker_and_first_trim() {
        let events = collect(
            body(&[
                "data:{\"token\":{\"text\":\"  Hello\"}}\n",
                "data:{\"token\":{\"text\":\" world\"}}\n",
                "data:{\"token\":{\"text\":\"</s>\"}}\n",
                "data:{\"token\":{\"text\":\"ignored\"}}\n",
            ]),
            WireFormat::TokenDelta {
                stop_marker: Some("</s>".to_string()),
            },
        )
        .await;
        assert_eq!(deltas(&events), vec!["Hello", " world"]);
        assert_eq!(events.last(), Some(&CanonicalEvent::Finished));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_final_answer_stops_reading() {
        let events = collect(
            body(&[
                "{\"type\":\"status\",\"status\":\"started\"}\n",
                "{\"type\":\"stream\",\"token\":\"Hi\\u0000\\u0000\"}\n",
                "{\"type\":\"finalAnswer\",\"text\":\"Hi\"}\n",
                "{\"type\":\"stream\",\"token\":\"late\"}\n",
            ]),
            WireFormat::DiscriminatedEvent,
        )
        .await;
        assert_eq!(deltas(&events), vec!["Hi"]);
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_body_error_ends_with_finish() {
        let chunks: Vec<RelayResult<Bytes>> = vec![
            Ok(Bytes::from("{\"type\":\"stream\",\"token\":\"partial\"}\n")),
            Err(RelayError::InvalidResponse("connection reset".to_string())),
        ];
        let events = collect(
            Box::pin(futures::stream::iter(chunks)),
            WireFormat::DiscriminatedEvent,
        )
        .await;
        assert_eq!(deltas(&events), vec!["partial"]);
        assert_eq!(events.last(), Some(&CanonicalEvent::Finished));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_empty_body() {
        let events = collect(body(&[]), WireFormat::FullTextSnapshot).await;
        assert_eq!(
            events,
            vec![CanonicalEvent::RoleAnnounce, CanonicalEvent::Finished]
        );
    }

    #[tokio::test]
    async fn test_cancellation_ends_with_error() {
        let first: Vec<RelayResult<Bytes>> =
            vec![Ok(Bytes::from("{\"type\":\"stream\",\"token\":\"a\"}\n"))];
        let body: ByteStream =
            Box::pin(futures::stream::iter(first).chain(futures::stream::pending()));
        let cancel = CancellationToken::new();
        let mut events = normalize(body, WireFormat::DiscriminatedEvent, cancel.clone());

        assert_eq!(events.next().await, Some(CanonicalEvent::RoleAnnounce));
        assert_eq!(events.next().await, Some(CanonicalEvent::delta("a")));

        cancel.cancel();
        match events.next().await {
            Some(CanonicalEvent::Error { kind, .. }) => assert_eq!(kind, ErrorKind::Cancelled),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events.next().await, None);
    }

    #[tokio::test]
    async fn test_large_chunk_of_short_lines() {
        let line = "{\"type\":\"stream\",\"token\":\"x\"}\n";
        let count = MAX_LINE_BUFFER / line.len() + 10;
        let mut chunk = line.repeat(count);
        chunk.push_str("{\"type\":\"finalAnswer\",\"text\":\"\"}\n");

        let events = collect(body(&[&chunk]), WireFormat::DiscriminatedEvent).await;
        assert_eq!(deltas(&events).len(), count);
        assert_eq!(events.last(), Some(&CanonicalEvent::Finished));
        assert_well_formed(&events);
    }

    #[tokio::test]
    async fn test_oversized_line_is_a_protocol_error() {
        let head = "{\"type\":\"stream\",\"token\":\"a\"}\n".to_string();
        let tail = "x".repeat(MAX_LINE_BUFFER + 1);

        let events = collect(body(&[&head, &tail]), WireFormat::DiscriminatedEvent).await;
        assert_eq!(deltas(&events), vec!["a"]);
        match events.last() {
            Some(CanonicalEvent::Error { kind, .. }) => {
                assert_eq!(*kind, ErrorKind::UpstreamProtocol)
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_well_formed(&events);
    }

    #[test]
    fn test_sse_payload() {
        assert_eq!(sse_payload("data: {}"), Some("{}"));
        assert_eq!(sse_payload("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_payload(": keep-alive"), None);
        assert_eq!(sse_payload("event: ping"), None);
        assert_eq!(sse_payload("{\"type\":\"stream\"}"), Some("{\"type\":\"stream\"}"));
    }

    #[test]
    fn test_snapshot_concatenation_matches_final_text() {
        let mut decoder = LineDecoder::new(WireFormat::FullTextSnapshot);
        let mut text = String::new();
        let mut joined = String::new();
        for word in ["The", " quick", " brown", " fox", ""] {
            text.push_str(word);
            if let LineOutcome::Content(delta) = decoder.decode(snapshot(&text).trim()) {
                joined.push_str(&delta);
            }
        }
        assert_eq!(joined, text);
        assert_eq!(decoder.malformed_lines(), 0);
    }

    #[test]
    fn test_malformed_lines_are_counted() {
        let mut decoder = LineDecoder::new(WireFormat::DiscriminatedEvent);
        assert!(matches!(decoder.decode("{oops"), LineOutcome::Malformed(_)));
        assert!(matches!(decoder.decode("{\"type\":\"status\"}"), LineOutcome::Skip));
        assert_eq!(decoder.malformed_lines(), 1);
    }
}
