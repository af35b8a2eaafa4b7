//! Conversation message model.
//!
//! A [`Message`] is the unit of conversation state. Streamed partials that share
//! a [`MessageId`] are folded into one record, so the collection never contains
//! two entries with the same id.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::ids::MessageId;

/// Well-known message kinds emitted by the backend.
///
/// The kind is an open string; these constants only name the values the client
/// treats specially or groups by default.
pub mod kinds {
    /// Plain conversational text.
    pub const NORMAL: &str = "normal";
    /// The designated final answer of a turn.
    pub const FINAL_ANSWER: &str = "final_answer";
    /// Assistant request to invoke one or more tools.
    pub const TOOL_CALL: &str = "tool_call";
    /// Result of a tool invocation.
    pub const TOOL_CALL_RESULT: &str = "tool_call_result";
    /// Token accounting report.
    pub const TOKEN_USAGE: &str = "token_usage";
    /// Free-form model reasoning.
    pub const THINKING: &str = "thinking";
    /// Query rewrite step.
    pub const REWRITE: &str = "rewrite";
    /// Task analysis step.
    pub const TASK_ANALYSIS: &str = "task_analysis";
    /// Task decomposition step.
    pub const TASK_DECOMPOSITION: &str = "task_decomposition";
    /// Planning step.
    pub const PLANNING: &str = "planning";
    /// Execution step description.
    pub const EXECUTION: &str = "execution";
    /// Observation step.
    pub const OBSERVATION: &str = "observation";
    /// Summary of a completed stage.
    pub const STAGE_SUMMARY: &str = "stage_summary";
    /// Result of a delegated subtask.
    pub const DO_SUBTASK_RESULT: &str = "do_subtask_result";
    /// Routing decision between agents.
    pub const TASK_ROUTER: &str = "task_router";
    /// Backend-reported error.
    pub const ERROR: &str = "error";
}

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Authored by the person using the client.
    User,
    /// Produced by the agent.
    Assistant,
    /// Output of a tool invocation.
    Tool,
}

impl Role {
    /// Wire representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(CoreError::UnknownRole(other.to_string())),
        }
    }
}

/// Progress of a single tool invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Requested, no result yet.
    #[default]
    Pending,
    /// A result arrived.
    Completed,
    /// The tool reported an error, or the stream failed before a result.
    Failed,
    /// The turn was interrupted before a result arrived.
    Cancelled,
}

/// A tool invocation requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call identifier, referenced by the tool message that answers it.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Raw JSON-encoded arguments.
    #[serde(default)]
    pub arguments: String,
    /// Tool output, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Invocation progress.
    #[serde(default)]
    pub status: ToolCallStatus,
    /// Error detail when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCall {
    /// Create a pending tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
            result: None,
            status: ToolCallStatus::Pending,
            error: None,
        }
    }

    /// Returns true if no result has been recorded yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ToolCallStatus::Pending
    }
}

/// Why the client finalized a message on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum Annotation {
    /// The user interrupted the turn.
    Interrupted,
    /// The stream failed; carries the failure detail.
    Error(String),
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id within the session.
    pub id: MessageId,
    /// Conversation role.
    pub role: Role,
    /// Semantic subtype, see [`kinds`].
    pub kind: String,
    /// Machine-oriented content accumulator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    /// Human-oriented content accumulator.
    #[serde(default)]
    pub display_content: String,
    /// Tool invocations, in request order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages, the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Time of first observation.
    pub timestamp: DateTime<Utc>,
    /// Newest timestamp seen for this id.
    pub updated_at: DateTime<Utc>,
    /// Set once the last partial for this id has been applied.
    pub is_final: bool,
    /// Set when the client finalized the message locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<Annotation>,
    /// Envelope fields the client does not model explicitly.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create an empty, non-final message.
    #[must_use]
    pub fn new(id: MessageId, role: Role, kind: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            kind: kind.into(),
            raw_content: None,
            display_content: String::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            timestamp,
            updated_at: timestamp,
            is_final: false,
            annotation: None,
            metadata: Map::new(),
        }
    }

    /// Create a final user message with a freshly generated id.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut message = Self::new(MessageId::generate(), Role::User, kinds::NORMAL, Utc::now());
        message.raw_content = Some(text.clone());
        message.display_content = text;
        message.is_final = true;
        message
    }

    /// Check if this is a user message.
    #[must_use]
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    /// Returns true if the message has the given kind.
    #[must_use]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// The content to send back upstream as conversation history.
    #[must_use]
    pub fn history_content(&self) -> &str {
        self.raw_content.as_deref().unwrap_or(&self.display_content)
    }

    /// Find a tool call by id.
    pub fn tool_call_mut(&mut self, call_id: &str) -> Option<&mut ToolCall> {
        self.tool_calls.iter_mut().find(|call| call.id == call_id)
    }

    /// Mark the message final on the client's behalf.
    ///
    /// `notice` is appended to the display content. Pending tool calls are
    /// cancelled on interrupt and failed on error.
    pub fn finalize(&mut self, annotation: Annotation, notice: &str) {
        let (status, error) = match &annotation {
            Annotation::Interrupted => (ToolCallStatus::Cancelled, None),
            Annotation::Error(detail) => (ToolCallStatus::Failed, Some(detail.clone())),
        };
        for call in self.tool_calls.iter_mut().filter(|call| call.is_pending()) {
            call.status = status;
            call.error.clone_from(&error);
        }
        self.display_content.push_str(notice);
        self.is_final = true;
        self.annotation = Some(annotation);
    }
}
