//! Reassembly of chunk-fragmented envelopes.
//!
//! When a serialized envelope exceeds the backend's size threshold it is sent
//! as a `chunk_start` frame, `total_chunks` `json_chunk` frames, and a
//! `chunk_end` frame. [`ChunkReassembler`] buffers the fragments per message id
//! and hands back the decoded JSON value once every slot is filled or
//! `chunk_end` arrives, whichever comes first.
//!
//! Completed streams are forgotten immediately; the reassembler keeps no
//! state for identities it has already delivered.

use std::collections::HashMap;

use sage_stream_core::MessageId;
use serde_json::Value;

use crate::error::StreamError;
use crate::protocol::ChunkFrame;

/// Modulus applied to the rolling hash carried in `checksum`.
pub const CHECKSUM_MODULUS: i64 = 1_000_000;

/// Rolling hash of a chunk payload, as carried in a frame's `checksum`.
///
/// `h = h * 31 + unit` over the UTF-16 code units with 32-bit wrapping, then
/// the absolute value modulo [`CHECKSUM_MODULUS`]. It detects truncation and
/// garbling; it is not a security boundary.
#[must_use]
pub fn rolling_checksum(data: &str) -> i64 {
    let hash = data
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)));
    i64::from(hash.unsigned_abs()) % CHECKSUM_MODULUS
}

/// Largest `total_chunks` a frame may announce.
///
/// Slots are allocated up front, so the wire value is bounded before any
/// allocation happens.
pub const MAX_TOTAL_CHUNKS: usize = 65_536;

/// Reject a `total_chunks` that is zero or above [`MAX_TOTAL_CHUNKS`].
fn check_total_chunks(
    message_id: &MessageId,
    total_chunks: usize,
    frame: &str,
) -> Result<(), StreamError> {
    let reason = if total_chunks == 0 {
        format!("{frame} announced zero chunks")
    } else if total_chunks > MAX_TOTAL_CHUNKS {
        format!("{frame} announced {total_chunks} chunks, limit is {MAX_TOTAL_CHUNKS}")
    } else {
        return Ok(());
    };
    Err(StreamError::InvalidFrame {
        message_id: message_id.clone(),
        reason,
    })
}

/// Outcome of feeding one frame to the reassembler.
#[derive(Debug, Clone, PartialEq)]
pub enum Reassembly {
    /// More frames are needed.
    Pending,
    /// The payload is complete and decoded.
    Complete(Value),
}

/// Reconstruction state for one fragmented payload.
#[derive(Debug)]
struct ChunkStream {
    total_chunks: usize,
    received_chunks: usize,
    slots: Vec<Option<String>>,
    expected_size: Option<usize>,
}

impl ChunkStream {
    fn new(total_chunks: usize, expected_size: Option<usize>) -> Self {
        Self {
            total_chunks,
            received_chunks: 0,
            slots: vec![None; total_chunks],
            expected_size,
        }
    }

    const fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }

    fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.is_none().then_some(index))
            .collect()
    }

    fn concatenate(&self) -> String {
        self.slots.iter().flatten().map(String::as_str).collect()
    }
}

/// Buffers chunk frames per message id until a payload can be decoded.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    streams: HashMap<MessageId, ChunkStream>,
}

impl ChunkReassembler {
    /// Create an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of payloads currently being reassembled.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if a stream for `message_id` is being reassembled.
    #[must_use]
    pub fn is_tracking(&self, message_id: &MessageId) -> bool {
        self.streams.contains_key(message_id)
    }

    /// Feed one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is rejected (bad index or checksum) or if a
    /// completed stream does not decode to JSON. In both cases the error is tied
    /// to the frame's message id only.
    pub fn accept(&mut self, frame: ChunkFrame) -> Result<Reassembly, StreamError> {
        match frame {
            ChunkFrame::ChunkStart {
                message_id,
                total_chunks,
                total_size,
                ..
            } => {
                check_total_chunks(&message_id, total_chunks, "chunk_start")?;
                tracing::debug!(message_id = %message_id, total_chunks, "Chunk stream started");
                let stream = ChunkStream::new(total_chunks, total_size);
                if let Some(stale) = self.streams.insert(message_id.clone(), stream) {
                    tracing::warn!(
                        message_id = %message_id,
                        received = stale.received_chunks,
                        total = stale.total_chunks,
                        "Discarding stale chunk stream replaced by a new chunk_start"
                    );
                }
                Ok(Reassembly::Pending)
            }
            ChunkFrame::JsonChunk {
                message_id,
                chunk_index,
                total_chunks,
                chunk_data,
                checksum,
            } => self.accept_chunk(message_id, chunk_index, total_chunks, chunk_data, checksum),
            ChunkFrame::ChunkEnd { message_id, .. } => {
                if self.streams.contains_key(&message_id) {
                    self.complete(&message_id)
                } else {
                    tracing::debug!(message_id = %message_id, "chunk_end for a stream that is already complete");
                    Ok(Reassembly::Pending)
                }
            }
        }
    }

    fn accept_chunk(
        &mut self,
        message_id: MessageId,
        chunk_index: usize,
        total_chunks: usize,
        chunk_data: String,
        checksum: Option<i64>,
    ) -> Result<Reassembly, StreamError> {
        if !self.streams.contains_key(&message_id) {
            check_total_chunks(&message_id, total_chunks, "json_chunk")?;
            // json_chunk before its chunk_start: rebuild the stream from the frame
            tracing::debug!(message_id = %message_id, chunk_index, "Creating chunk stream from out-of-order json_chunk");
            self.streams
                .insert(message_id.clone(), ChunkStream::new(total_chunks, None));
        }

        let Some(stream) = self.streams.get_mut(&message_id) else {
            return Ok(Reassembly::Pending);
        };

        if chunk_index >= stream.total_chunks {
            return Err(StreamError::InvalidFrame {
                message_id,
                reason: format!(
                    "chunk_index {chunk_index} out of range for {} chunks",
                    stream.total_chunks
                ),
            });
        }

        if let Some(expected) = checksum {
            let actual = rolling_checksum(&chunk_data);
            if actual != expected {
                return Err(StreamError::ChecksumMismatch {
                    message_id,
                    chunk_index,
                    expected,
                    actual,
                });
            }
        }

        let slot = &mut stream.slots[chunk_index];
        if slot.is_some() {
            tracing::debug!(message_id = %message_id, chunk_index, "Ignoring duplicate chunk");
            return Ok(Reassembly::Pending);
        }
        *slot = Some(chunk_data);
        stream.received_chunks += 1;

        if stream.is_complete() {
            self.complete(&message_id)
        } else {
            Ok(Reassembly::Pending)
        }
    }

    /// Remove the stream and decode its payload.
    fn complete(&mut self, message_id: &MessageId) -> Result<Reassembly, StreamError> {
        let Some(stream) = self.streams.remove(message_id) else {
            return Ok(Reassembly::Pending);
        };

        let raw = stream.concatenate();
        let missing = stream.missing();
        if !missing.is_empty() {
            return Err(StreamError::Reassembly {
                message_id: message_id.clone(),
                reason: format!("chunk_end arrived with missing chunks {missing:?}"),
                raw,
            });
        }

        if let Some(expected) = stream.expected_size {
            let actual = raw.chars().count();
            if actual != expected {
                tracing::warn!(message_id = %message_id, expected, actual, "Reassembled payload size differs from announced size");
            }
        }

        match serde_json::from_str(&raw) {
            Ok(value) => {
                tracing::debug!(message_id = %message_id, chunks = stream.total_chunks, "Chunk stream reassembled");
                Ok(Reassembly::Complete(value))
            }
            Err(e) => Err(StreamError::Reassembly {
                message_id: message_id.clone(),
                reason: e.to_string(),
                raw,
            }),
        }
    }

    /// Remove every incomplete stream, reporting each as dropped.
    pub fn drain(&mut self) -> Vec<StreamError> {
        let mut dropped: Vec<StreamError> = self
            .streams
            .drain()
            .map(|(message_id, stream)| StreamError::DroppedStream {
                message_id,
                received: stream.received_chunks,
                total: stream.total_chunks,
            })
            .collect();
        dropped.sort_by(|a, b| a.message_id().cmp(&b.message_id()));
        dropped
    }
}
