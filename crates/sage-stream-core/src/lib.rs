//! Core types for sage-stream.
//!
//! This crate provides the foundational types shared by the stream client and
//! its front ends:
//!
//! - **Identifiers**: opaque, strongly-typed ids for messages, sessions and agents
//! - **Messages**: the conversation message model that streamed partials fold into
//! - **Error types**: common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use sage_stream_core::{Message, MessageId, Role, SessionId};
//!
//! let session_id = SessionId::generate();
//! let prompt = Message::user("Summarize the release notes");
//! assert_eq!(prompt.role, Role::User);
//!
//! let id: MessageId = "msg_01".parse().unwrap();
//! assert_eq!(id.as_str(), "msg_01");
//! # let _ = session_id;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod message;

pub use error::{CoreError, Result};
pub use ids::{AgentId, IdError, MessageId, SessionId};
pub use message::{kinds, Annotation, Message, Role, ToolCall, ToolCallStatus};
