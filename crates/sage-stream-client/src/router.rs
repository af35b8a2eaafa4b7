//! Line decoding and envelope routing.
//!
//! The router is the single entry point for every line the transport yields.
//! It classifies the line by its `type` discriminator and hands it to the
//! chunk reassembler or the message merger. Reassembled payloads go through
//! the same classification again, so a chunked message is indistinguishable
//! from one that arrived whole.

use sage_stream_core::MessageId;
use serde_json::Value;

use crate::chunk::{ChunkReassembler, Reassembly};
use crate::error::StreamError;
use crate::merger::{MergeOutcome, MessageMerger};
use crate::protocol::{Envelope, StreamEnd};

/// Reassembled payloads may themselves be chunk frames; this bounds the recursion.
pub const MAX_NESTING_DEPTH: usize = 4;

/// Longest line prefix kept in a `LineParse` error.
const MAX_LINE_PREVIEW: usize = 256;

// =============================================================================
// Line decoding
// =============================================================================

/// Splits a byte stream into newline-delimited lines.
///
/// Transport chunks do not respect line boundaries, so partial lines are
/// buffered until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no terminator.
    scanned: usize,
}

impl LineDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, StreamError>> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=from + offset).collect();
            line.pop();
            lines.push(decode_line(line));
            from = 0;
        }
        self.scanned = self.buffer.len();
        lines
    }

    /// Flush a trailing line that never got its terminator.
    pub fn finish(&mut self) -> Option<Result<String, StreamError>> {
        if self.buffer.is_empty() {
            return None;
        }
        self.scanned = 0;
        Some(decode_line(std::mem::take(&mut self.buffer)))
    }

    /// Number of bytes waiting for a line terminator.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(mut line: Vec<u8>) -> Result<String, StreamError> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).map_err(|e| StreamError::LineParse {
        reason: e.to_string(),
        line: preview(&String::from_utf8_lossy(e.as_bytes())),
    })
}

fn preview(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_PREVIEW) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

// =============================================================================
// Routing
// =============================================================================

/// What one routed line produced.
#[derive(Debug)]
pub enum Routed {
    /// A message was created or updated.
    Merged(MergeOutcome),
    /// A chunk frame was accepted; its stream is not complete yet.
    Buffered(MessageId),
    /// The terminal marker arrived.
    StreamEnd(StreamEnd),
    /// The line, frame or payload was rejected. Routing continues.
    Failed(StreamError),
}

/// Classifies lines and dispatches them to the reassembler or the merger.
#[derive(Debug, Default)]
pub struct EnvelopeRouter {
    reassembler: ChunkReassembler,
}

impl EnvelopeRouter {
    /// Create a router with no chunk streams in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one line.
    ///
    /// Blank lines produce nothing. A line may produce several results: a
    /// `stream_end` reports every dropped chunk stream before the marker itself.
    pub fn route(&mut self, line: &str, merger: &mut MessageMerger) -> Vec<Routed> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let mut routed = Vec::new();
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => self.route_value(value, merger, 0, &mut routed),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed stream line");
                routed.push(Routed::Failed(StreamError::LineParse {
                    reason: e.to_string(),
                    line: preview(trimmed),
                }));
            }
        }
        routed
    }

    /// Route an already-decoded value.
    pub fn route_value(
        &mut self,
        value: Value,
        merger: &mut MessageMerger,
        depth: usize,
        routed: &mut Vec<Routed>,
    ) {
        let envelope = match Envelope::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, depth, "Skipping envelope with invalid shape");
                routed.push(Routed::Failed(StreamError::LineParse {
                    reason: e.to_string(),
                    line: String::new(),
                }));
                return;
            }
        };

        match envelope {
            Envelope::Chunk(frame) => {
                let message_id = frame.message_id().clone();
                match self.reassembler.accept(frame) {
                    Ok(Reassembly::Pending) => routed.push(Routed::Buffered(message_id)),
                    Ok(Reassembly::Complete(_)) if depth + 1 >= MAX_NESTING_DEPTH => {
                        tracing::warn!(message_id = %message_id, depth, "Reassembled payload nested too deeply");
                        routed.push(Routed::Failed(StreamError::InvalidFrame {
                            message_id,
                            reason: format!(
                                "reassembled payload exceeds nesting depth {MAX_NESTING_DEPTH}"
                            ),
                        }));
                    }
                    Ok(Reassembly::Complete(payload)) => {
                        tracing::debug!(message_id = %message_id, "Routing reassembled payload");
                        self.route_value(payload, merger, depth + 1, routed);
                    }
                    Err(e) => {
                        tracing::warn!(message_id = %message_id, error = %e, "Chunk frame rejected");
                        routed.push(Routed::Failed(e));
                    }
                }
            }
            Envelope::StreamEnd(end) => {
                routed.extend(self.drain_dropped().into_iter().map(Routed::Failed));
                routed.push(Routed::StreamEnd(end));
            }
            Envelope::Message(envelope) => {
                routed.push(Routed::Merged(merger.apply(*envelope)));
            }
        }
    }

    /// Remove every incomplete chunk stream, reporting each as dropped.
    pub fn drain_dropped(&mut self) -> Vec<StreamError> {
        let dropped = self.reassembler.drain();
        for error in &dropped {
            tracing::warn!(error = %error, "Chunk stream dropped");
        }
        dropped
    }

    /// Number of chunk streams being reassembled.
    #[must_use]
    pub fn in_flight_streams(&self) -> usize {
        self.reassembler.in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::rolling_checksum;
    use serde_json::json;

    fn route_all(router: &mut EnvelopeRouter, merger: &mut MessageMerger, lines: &[String]) -> Vec<Routed> {
        lines
            .iter()
            .flat_map(|line| router.route(line, merger))
            .collect()
    }

    // =========================================================================
    // LineDecoder
    // =========================================================================

    #[test]
    fn decoder_buffers_partial_lines() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"{\"a\":").is_empty());
        assert_eq!(decoder.buffered(), 5);

        let lines: Vec<String> = decoder
            .push(b"1}\r\n{\"b\":2}\n{\"c\"")
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);

        assert_eq!(decoder.finish().unwrap().unwrap(), "{\"c\"");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn decoder_handles_byte_at_a_time_delivery() {
        let mut decoder = LineDecoder::new();
        let body = b"{\"a\":1}\n{\"b\":22}\n\n{\"c\":3}\n";
        let mut lines = Vec::new();
        for byte in body {
            lines.extend(decoder.push(std::slice::from_ref(byte)).into_iter().map(Result::unwrap));
        }
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":22}", "", "{\"c\":3}"]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn decoder_finds_terminator_after_long_partial_line() {
        let mut decoder = LineDecoder::new();
        let long = "x".repeat(4096);
        for piece in long.as_bytes().chunks(7) {
            assert!(decoder.push(piece).is_empty());
        }
        assert_eq!(decoder.buffered(), 4096);

        let lines = decoder.push(b"\nrest");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].as_ref().unwrap().len(), 4096);
        assert_eq!(decoder.buffered(), 4);

        let lines = decoder.push(b"\n");
        assert_eq!(lines[0].as_ref().unwrap(), "rest");
    }

    #[test]
    fn decoder_rejects_invalid_utf8() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"\xff\xfe\n");
        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(StreamError::LineParse { .. })));
    }

    // =========================================================================
    // Routing
    // =========================================================================

    #[test]
    fn blank_lines_are_ignored() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();
        assert!(router.route("", &mut merger).is_empty());
        assert!(router.route("   \t", &mut merger).is_empty());
        assert!(merger.is_empty());
    }

    #[test]
    fn malformed_line_does_not_stop_routing() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();

        let bad = router.route("{not json", &mut merger);
        assert!(matches!(bad[..], [Routed::Failed(StreamError::LineParse { .. })]));

        let good = router.route(
            r#"{"type":"normal","message_id":"m1","role":"assistant","content":"ok"}"#,
            &mut merger,
        );
        assert!(matches!(good[..], [Routed::Merged(MergeOutcome { created: true, .. })]));
        assert_eq!(merger.len(), 1);
    }

    #[test]
    fn oversized_chunk_count_fails_without_panicking() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();

        let routed = router.route(
            r#"{"type":"chunk_start","message_id":"m1","total_chunks":18446744073709551615}"#,
            &mut merger,
        );
        assert!(matches!(
            &routed[..],
            [Routed::Failed(StreamError::InvalidFrame { message_id, .. })] if message_id.as_str() == "m1"
        ));
        assert_eq!(router.in_flight_streams(), 0);

        let routed = router.route(
            r#"{"type":"json_chunk","message_id":"m2","chunk_index":0,"total_chunks":10000000000,"chunk_data":"{}"}"#,
            &mut merger,
        );
        assert!(matches!(routed[..], [Routed::Failed(StreamError::InvalidFrame { .. })]));
        assert!(merger.is_empty());
    }

    #[test]
    fn unknown_role_is_a_line_parse_error() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();
        let routed = router.route(r#"{"message_id":"m1","role":"system","content":"x"}"#, &mut merger);
        assert!(matches!(routed[..], [Routed::Failed(StreamError::LineParse { .. })]));
        assert!(merger.is_empty());
    }

    #[test]
    fn chunked_message_routes_like_a_whole_one() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();

        let payload = json!({
            "type": "final_answer",
            "message_id": "big",
            "role": "assistant",
            "content": "Hello World",
        })
        .to_string();
        let (first, second) = payload.split_at(payload.len() / 2);

        let lines = vec![
            json!({"type": "chunk_start", "message_id": "big", "total_chunks": 2}).to_string(),
            json!({
                "type": "json_chunk", "message_id": "big", "chunk_index": 1,
                "total_chunks": 2, "chunk_data": second, "checksum": rolling_checksum(second),
            })
            .to_string(),
            json!({
                "type": "json_chunk", "message_id": "big", "chunk_index": 0,
                "total_chunks": 2, "chunk_data": first, "checksum": rolling_checksum(first),
            })
            .to_string(),
            json!({"type": "chunk_end", "message_id": "big"}).to_string(),
        ];

        let routed = route_all(&mut router, &mut merger, &lines);
        assert!(matches!(routed[0], Routed::Buffered(_)));
        assert!(matches!(routed[1], Routed::Buffered(_)));
        assert!(matches!(routed[2], Routed::Merged(MergeOutcome { created: true, .. })));
        // chunk_end after completion is a no-op
        assert!(matches!(routed[3], Routed::Buffered(_)));

        let message = &merger.messages()[0];
        assert_eq!(message.id.as_str(), "big");
        assert_eq!(message.kind, "final_answer");
        assert_eq!(message.display_content, "Hello World");
        assert_eq!(router.in_flight_streams(), 0);
    }

    #[test]
    fn stream_end_reports_dropped_streams_first() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();

        let lines = vec![
            json!({"type": "chunk_start", "message_id": "c1", "total_chunks": 3}).to_string(),
            json!({
                "type": "json_chunk", "message_id": "c1", "chunk_index": 0,
                "total_chunks": 3, "chunk_data": "{\"a\"",
            })
            .to_string(),
            json!({"type": "stream_end", "session_id": "s1", "total_stream_count": 4}).to_string(),
        ];

        let routed = route_all(&mut router, &mut merger, &lines);
        assert_eq!(routed.len(), 4);
        assert!(matches!(
            &routed[2],
            Routed::Failed(StreamError::DroppedStream { received: 1, total: 3, .. })
        ));
        match &routed[3] {
            Routed::StreamEnd(end) => assert_eq!(end.total_stream_count, Some(4)),
            other => panic!("expected stream end, got {other:?}"),
        }
        assert!(merger.is_empty());
    }

    #[test]
    fn corrupt_chunk_only_affects_its_message() {
        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();

        let lines = vec![
            json!({
                "type": "json_chunk", "message_id": "c1", "chunk_index": 0,
                "total_chunks": 1, "chunk_data": "{}", "checksum": 1,
            })
            .to_string(),
            r#"{"type":"normal","message_id":"m2","content":"fine"}"#.to_string(),
        ];

        let routed = route_all(&mut router, &mut merger, &lines);
        assert!(matches!(routed[0], Routed::Failed(StreamError::ChecksumMismatch { .. })));
        assert!(matches!(routed[1], Routed::Merged(_)));
        assert_eq!(merger.get(&MessageId::new("m2").unwrap()).unwrap().display_content, "fine");
    }

    #[test]
    fn nesting_depth_is_bounded() {
        // Wrap a message in chunk frames MAX_NESTING_DEPTH times.
        let mut payload = json!({"type": "normal", "message_id": "deep", "content": "x"});
        for level in 0..MAX_NESTING_DEPTH {
            let data = payload.to_string();
            payload = json!({
                "type": "json_chunk", "message_id": format!("wrap{level}"), "chunk_index": 0,
                "total_chunks": 1, "chunk_data": data,
            });
        }

        let mut router = EnvelopeRouter::new();
        let mut merger = MessageMerger::new();
        let routed = router.route(&payload.to_string(), &mut merger);

        assert!(matches!(routed[..], [Routed::Failed(StreamError::InvalidFrame { .. })]));
        assert!(merger.is_empty());
    }
}
