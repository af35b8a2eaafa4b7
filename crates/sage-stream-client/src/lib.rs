//! Streaming client for the Sage agent backend.
//!
//! The backend answers a chat request with newline-delimited JSON: partial
//! message envelopes that share a `message_id`, chunk frames for payloads too
//! large to send whole, and a terminal `stream_end` marker. This crate turns
//! that stream back into an ordered conversation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SessionController                        │
//! │   send / interrupt / select_agent / update_config / pump     │
//! └─────────────────────────────────────────────────────────────┘
//!        │ open_stream                         ▲ TransportEvent
//!        ▼                                     │ (mpsc)
//! ┌──────────────┐   bytes   ┌────────────────────────────────┐
//! │  Transport   │──────────▶│ reader task (LineDecoder)       │
//! │ (HTTP/NDJSON)│           └────────────────────────────────┘
//! └──────────────┘
//!                              │ lines, applied in pump()
//!                              ▼
//!                     ┌─────────────────┐
//!                     │ EnvelopeRouter  │
//!                     └─────────────────┘
//!                       │             │
//!                       ▼             ▼
//!             ┌──────────────────┐ ┌───────────────┐
//!             │ ChunkReassembler │ │ MessageMerger │──▶ SessionObserver
//!             └──────────────────┘ └───────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use sage_stream_client::{ClientConfig, HttpTransport, SessionController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("http://localhost:8080");
//! let transport = Arc::new(HttpTransport::new(config.clone())?);
//! let mut session = SessionController::new(transport, config);
//!
//! session.send("What changed in the last release?").await?;
//! session.run_until_settled().await;
//!
//! for turn in session.turns() {
//!     for reply in &turn.replies {
//!         println!("{}", reply.display_content);
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Session States
//!
//! - `Idle` → `Sending` (send)
//! - `Sending` → `Streaming` (first envelope), `Interrupted`, `Errored` or `Idle`
//! - `Streaming` → `Idle` (`stream_end`), `Interrupted` or `Errored`
//! - `Interrupted`, `Errored` → `Sending` (next send)
//!
//! See the [`lifecycle`] module for transition validation helpers.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod chunk;
pub mod config;
pub mod error;
pub mod grouping;
pub mod lifecycle;
pub mod merger;
pub mod observer;
pub mod protocol;
pub mod router;
pub mod session;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod transport;

pub use chunk::{rolling_checksum, ChunkReassembler, Reassembly};
pub use config::{Agent, AgentSettings, ClientConfig, ConfigField, ConfigResolver, ResolvedConfig};
pub use error::{ErrorKind, Result, SessionError, StreamError, TransportError};
pub use grouping::{group_turns, GroupingConfig, Turn};
pub use lifecycle::SessionState;
pub use merger::{MergeOutcome, MergeStrategy, MessageMerger};
pub use observer::{ChannelObserver, NoopObserver, SessionEvent, SessionEvents, SessionObserver};
pub use protocol::{ChunkFrame, Envelope, MessageEnvelope, StreamEnd, StreamRequest};
pub use router::{EnvelopeRouter, LineDecoder, Routed};
pub use session::SessionController;
pub use transport::{ByteStream, HttpTransport, Transport, TransportEvent};

// Re-export commonly used types from core for convenience
pub use sage_stream_core::{Annotation, Message, MessageId, Role, SessionId, ToolCall, ToolCallStatus};
