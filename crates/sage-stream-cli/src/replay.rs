//! Offline replay of recorded NDJSON streams.
//!
//! Feeds a captured response body through the same decoder, router and merger
//! a live session uses, without a backend.

use std::path::Path;

use anyhow::Context;
use sage_stream_client::{EnvelopeRouter, LineDecoder, MessageMerger, Routed};
use sage_stream_core::Message;
use serde::Serialize;

/// Result of replaying one recording.
#[derive(Debug, Serialize)]
pub struct Replay {
    /// The reconstructed conversation.
    pub messages: Vec<Message>,
    /// Every recoverable error, in order.
    pub errors: Vec<String>,
    /// Number of `stream_end` markers seen.
    pub completed_streams: usize,
}

/// Replay a recorded body.
pub fn replay(body: &[u8]) -> Replay {
    let mut decoder = LineDecoder::new();
    let mut router = EnvelopeRouter::new();
    let mut merger = MessageMerger::new();
    let mut errors = Vec::new();
    let mut completed_streams = 0;

    let mut lines = decoder.push(body);
    lines.extend(decoder.finish());

    for line in lines {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        };
        for routed in router.route(&line, &mut merger) {
            match routed {
                Routed::Failed(e) => errors.push(e.to_string()),
                Routed::StreamEnd(_) => {
                    merger.complete_open();
                    completed_streams += 1;
                }
                Routed::Merged(_) | Routed::Buffered(_) => {}
            }
        }
    }

    errors.extend(router.drain_dropped().iter().map(ToString::to_string));
    if merger.has_open() {
        tracing::warn!("Recording ends without stream_end; some messages are incomplete");
    }

    Replay {
        messages: merger.messages().to_vec(),
        errors,
        completed_streams,
    }
}

/// Replay a recording from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn replay_file(path: &Path) -> anyhow::Result<Replay> {
    let body = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    tracing::debug!(path = %path.display(), bytes = body.len(), "Replaying recording");
    Ok(replay(&body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_stream_client::rolling_checksum;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn replays_recording_from_file() {
        let payload = json!({"type": "final_answer", "message_id": "big", "content": "Hello World"}).to_string();
        let (head, tail) = payload.split_at(10);
        let lines = [
            json!({"type": "thinking", "message_id": "t1", "content": "Hmm"}),
            json!({"type": "chunk_start", "message_id": "big", "total_chunks": 2}),
            json!({"type": "json_chunk", "message_id": "big", "chunk_index": 1, "total_chunks": 2,
                   "chunk_data": tail, "checksum": rolling_checksum(tail)}),
            json!({"type": "json_chunk", "message_id": "big", "chunk_index": 0, "total_chunks": 2,
                   "chunk_data": head, "checksum": rolling_checksum(head)}),
            json!({"type": "stream_end"}),
        ];

        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in &lines {
            writeln!(file, "{line}").unwrap();
        }
        // A garbage line in the middle of a recording is skipped.
        writeln!(file, "not json").unwrap();

        let replay = replay_file(file.path()).unwrap();
        assert_eq!(replay.completed_streams, 1);
        assert_eq!(replay.errors.len(), 1);
        assert_eq!(replay.messages.len(), 2);
        assert_eq!(replay.messages[1].display_content, "Hello World");
        assert!(replay.messages.iter().all(|m| m.is_final));
    }

    #[test]
    fn truncated_recording_reports_dropped_stream() {
        let body = format!(
            "{}\n{}",
            json!({"type": "chunk_start", "message_id": "big", "total_chunks": 3}),
            json!({"type": "json_chunk", "message_id": "big", "chunk_index": 0, "total_chunks": 3, "chunk_data": "{"}),
        );

        let replay = replay(body.as_bytes());
        assert_eq!(replay.completed_streams, 0);
        assert_eq!(replay.errors, vec!["chunk stream for big dropped with 1/3 chunks"]);
        assert!(replay.messages.is_empty());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(replay_file(&dir.path().join("absent.ndjson")).is_err());
    }
}
