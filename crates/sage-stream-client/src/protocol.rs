//! Wire types for the Sage streaming protocol.
//!
//! The backend answers a stream request with newline-delimited JSON. Each line is
//! one envelope: a chunk frame (`chunk_start` / `json_chunk` / `chunk_end`), the
//! terminal marker (`stream_end`), or a message envelope carrying a partial
//! update for one conversation message.
//!
//! Endpoint: POST /api/stream

use chrono::{DateTime, Utc};
use sage_stream_core::{AgentId, Message, MessageId, Role, SessionId, ToolCall};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// `type` discriminators with protocol-level meaning.
pub mod frame_types {
    /// Announces a fragmented payload.
    pub const CHUNK_START: &str = "chunk_start";
    /// One fragment of a payload.
    pub const JSON_CHUNK: &str = "json_chunk";
    /// Closes a fragmented payload.
    pub const CHUNK_END: &str = "chunk_end";
    /// Terminal marker for one request.
    pub const STREAM_END: &str = "stream_end";
}

// =============================================================================
// Server -> Client
// =============================================================================

/// One fragment-related frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkFrame {
    /// A payload for `message_id` follows in `total_chunks` fragments.
    ChunkStart {
        /// Identity of the message being fragmented.
        message_id: MessageId,
        /// Number of fragments announced.
        total_chunks: usize,
        /// Character count of the whole payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_size: Option<usize>,
        /// `type` of the payload being fragmented.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_type: Option<String>,
    },
    /// One fragment.
    JsonChunk {
        /// Identity of the message being fragmented.
        message_id: MessageId,
        /// Zero-based position of this fragment.
        chunk_index: usize,
        /// Number of fragments announced.
        total_chunks: usize,
        /// Fragment text.
        chunk_data: String,
        /// Rolling hash of `chunk_data` modulo 1,000,000.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<i64>,
    },
    /// All fragments for `message_id` have been sent.
    ChunkEnd {
        /// Identity of the message being fragmented.
        message_id: MessageId,
        /// Number of fragments sent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<usize>,
    },
}

impl ChunkFrame {
    /// The message identity correlating this frame with its stream.
    #[must_use]
    pub const fn message_id(&self) -> &MessageId {
        match self {
            Self::ChunkStart { message_id, .. }
            | Self::JsonChunk { message_id, .. }
            | Self::ChunkEnd { message_id, .. } => message_id,
        }
    }
}

/// Terminal marker ending the stream for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnd {
    /// Session the stream belonged to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Server time, seconds since the epoch.
    #[serde(default)]
    pub timestamp: Option<f64>,
    /// Number of results the server produced.
    #[serde(default)]
    pub total_stream_count: Option<u64>,
}

/// A tool invocation as it appears on the wire (OpenAI-compatible).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Call identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Always `"function"` for calls produced by this client.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    /// Function name and arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<WireFunction>,
    /// Flat-form name, used by some producers instead of `function.name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Flat-form arguments.
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub arguments: Option<String>,
}

/// Function part of a [`WireToolCall`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFunction {
    /// Tool name.
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments.
    #[serde(default, deserialize_with = "lenient_text")]
    pub arguments: Option<String>,
}

impl WireToolCall {
    /// Convert to the message model; `position` names calls that arrive without an id.
    #[must_use]
    pub fn into_tool_call(self, position: usize) -> ToolCall {
        let id = self.id.unwrap_or_else(|| format!("call_{position}"));
        let (name, arguments) = match self.function {
            Some(function) => (function.name, function.arguments.or(self.arguments)),
            None => (self.name.unwrap_or_default(), self.arguments),
        };
        ToolCall::new(id, name, arguments.unwrap_or_default())
    }
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: Some(call.id.clone()),
            call_type: Some("function".to_string()),
            function: Some(WireFunction {
                name: call.name.clone(),
                arguments: Some(call.arguments.clone()),
            }),
            name: None,
            arguments: None,
        }
    }
}

/// A partial update for one conversation message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message kind (`type` on the wire).
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Message identity; may be missing on malformed producers.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Conversation role.
    #[serde(default)]
    pub role: Option<Role>,
    /// Machine-oriented content delta.
    #[serde(default, deserialize_with = "lenient_text")]
    pub content: Option<String>,
    /// Human-oriented content delta.
    #[serde(default, deserialize_with = "lenient_text")]
    pub show_content: Option<String>,
    /// Tool invocations requested by the assistant.
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
    /// For tool messages, the call being answered.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Server time, seconds since the epoch.
    #[serde(default)]
    pub timestamp: Option<f64>,
    /// Marks the last partial for this id.
    #[serde(default)]
    pub is_final: Option<bool>,
    /// Session the message belongs to.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Any other field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageEnvelope {
    /// Role, defaulting to assistant for producers that omit it.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role.unwrap_or(Role::Assistant)
    }

    /// Kind, defaulting to `normal`.
    #[must_use]
    pub fn kind(&self) -> &str {
        self.kind
            .as_deref()
            .unwrap_or(sage_stream_core::kinds::NORMAL)
    }

    /// Delta for the display accumulator.
    ///
    /// The backend strips `show_content` from its external stream, so `content`
    /// stands in when `show_content` is absent.
    #[must_use]
    pub fn display_delta(&self) -> &str {
        self.show_content
            .as_deref()
            .or(self.content.as_deref())
            .unwrap_or_default()
    }

    /// Envelope time, or now if the producer sent none.
    #[must_use]
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.timestamp.and_then(timestamp_from_secs).unwrap_or_else(Utc::now)
    }

    /// Returns true if a tool envelope reports a failed invocation.
    #[must_use]
    pub fn reports_tool_error(&self) -> bool {
        self.extra.get("is_error").and_then(Value::as_bool) == Some(true)
            || self.extra.get("error").is_some_and(|v| !v.is_null())
    }
}

/// Convert fractional epoch seconds to a UTC timestamp.
#[must_use]
pub fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let millis = (secs * 1000.0).round() as i64;
    DateTime::from_timestamp_millis(millis)
}

/// Accept a string, null, or any other JSON value (rendered as JSON text).
fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

/// One classified envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A chunk frame for the reassembler.
    Chunk(ChunkFrame),
    /// The terminal marker.
    StreamEnd(StreamEnd),
    /// A message update for the merger.
    Message(Box<MessageEnvelope>),
}

impl Envelope {
    /// Classify a decoded JSON value by its `type` discriminator.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not match the shape its `type` implies.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let discriminator = value.get("type").and_then(Value::as_str).unwrap_or_default();
        match discriminator {
            frame_types::CHUNK_START | frame_types::JSON_CHUNK | frame_types::CHUNK_END => {
                serde_json::from_value(value).map(Self::Chunk)
            }
            frame_types::STREAM_END => serde_json::from_value(value).map(Self::StreamEnd),
            _ => serde_json::from_value(value).map(|envelope| Self::Message(Box::new(envelope))),
        }
    }
}

// =============================================================================
// Client -> Server
// =============================================================================

/// One prior message sent upstream as conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    /// Conversation role.
    pub role: Role,
    /// Message content.
    pub content: String,
    /// Message identity.
    pub message_id: MessageId,
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: String,
    /// Tool invocations, for assistant messages.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    /// Call answered, for tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&Message> for HistoryMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.history_content().to_string(),
            message_id: message.id.clone(),
            kind: message.kind.clone(),
            tool_calls: message.tool_calls.iter().map(WireToolCall::from).collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

/// Body of a stream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    /// Full conversation history, including the new user message.
    pub messages: Vec<HistoryMessage>,
    /// Session identity.
    pub session_id: SessionId,
    /// Selected agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Free-form context handed to the agent.
    #[serde(default)]
    pub system_context: Map<String, Value>,
    /// Workflows the agent may run.
    #[serde(default)]
    pub available_workflows: Map<String, Value>,
    /// Model selection and sampling parameters.
    #[serde(default)]
    pub llm_model_config: Map<String, Value>,
    /// Prefix prepended to the system prompt.
    #[serde(default)]
    pub system_prefix: String,
    /// Tools the agent may call.
    #[serde(default)]
    pub available_tools: Vec<String>,
    /// Enables the deep-thinking phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deep_thinking: Option<bool>,
    /// Enables multi-agent orchestration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_agent: Option<bool>,
    /// Upper bound on agent loop iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loop_count: Option<u32>,
    /// Ask the agent for follow-up suggestions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub more_suggest: Option<bool>,
    /// Skills the agent may use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_skills: Option<Vec<String>>,
}

/// Body of the out-of-band interrupt call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRequest {
    /// Reason recorded by the backend.
    pub message: String,
}

/// Error response from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    /// Error message.
    #[serde(alias = "message")]
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn classifies_chunk_frames() {
        let value = json!({"type": "chunk_start", "message_id": "m1", "total_chunks": 2, "total_size": 40});
        match Envelope::from_value(value).unwrap() {
            Envelope::Chunk(ChunkFrame::ChunkStart { message_id, total_chunks, total_size, .. }) => {
                assert_eq!(message_id.as_str(), "m1");
                assert_eq!(total_chunks, 2);
                assert_eq!(total_size, Some(40));
            }
            other => panic!("Expected ChunkStart, got {other:?}"),
        }
    }

    #[test]
    fn json_chunk_tolerates_extra_fields() {
        let value = json!({
            "type": "json_chunk", "message_id": "m1", "chunk_id": "m1_0",
            "chunk_index": 0, "total_chunks": 1, "chunk_data": "{}",
            "chunk_size": 2, "is_final": true, "checksum": 123
        });
        match Envelope::from_value(value).unwrap() {
            Envelope::Chunk(ChunkFrame::JsonChunk { checksum, chunk_data, .. }) => {
                assert_eq!(checksum, Some(123));
                assert_eq!(chunk_data, "{}");
            }
            other => panic!("Expected JsonChunk, got {other:?}"),
        }
    }

    #[test]
    fn classifies_stream_end() {
        let value = json!({"type": "stream_end", "session_id": "s1", "timestamp": 1.5, "total_stream_count": 7});
        match Envelope::from_value(value).unwrap() {
            Envelope::StreamEnd(end) => {
                assert_eq!(end.session_id.as_deref(), Some("s1"));
                assert_eq!(end.total_stream_count, Some(7));
            }
            other => panic!("Expected StreamEnd, got {other:?}"),
        }
    }

    #[test]
    fn classifies_message_envelope_and_keeps_extras() {
        let value = json!({
            "type": "final_answer", "message_id": "m2", "role": "assistant",
            "content": "Hi", "timestamp": 1_700_000_000.25, "agent_name": "Sage"
        });
        match Envelope::from_value(value).unwrap() {
            Envelope::Message(envelope) => {
                assert_eq!(envelope.kind(), "final_answer");
                assert_eq!(envelope.role(), Role::Assistant);
                assert_eq!(envelope.display_delta(), "Hi");
                assert_eq!(envelope.extra["agent_name"], "Sage");
                assert_eq!(envelope.observed_at().timestamp_millis(), 1_700_000_000_250);
            }
            other => panic!("Expected Message, got {other:?}"),
        }
    }

    #[test]
    fn unknown_role_is_rejected() {
        let value = json!({"type": "normal", "message_id": "m1", "role": "narrator"});
        assert!(Envelope::from_value(value).is_err());
    }

    #[test]
    fn chunk_frame_missing_fields_is_rejected() {
        let value = json!({"type": "json_chunk", "message_id": "m1"});
        assert!(Envelope::from_value(value).is_err());
    }

    #[test]
    fn show_content_wins_over_content() {
        let envelope = MessageEnvelope {
            content: Some("raw".into()),
            show_content: Some("shown".into()),
            ..MessageEnvelope::default()
        };
        assert_eq!(envelope.display_delta(), "shown");
    }

    #[test]
    fn non_string_content_is_rendered_as_json() {
        let value = json!({"type": "tool_call_result", "message_id": "t1", "role": "tool", "content": {"ok": true}});
        let Envelope::Message(envelope) = Envelope::from_value(value).unwrap() else {
            panic!("Expected Message");
        };
        assert_eq!(envelope.content.as_deref(), Some(r#"{"ok":true}"#));
    }

    // =========================================================================
    // Tool calls
    // =========================================================================

    #[test]
    fn wire_tool_call_openai_shape() {
        let wire: WireToolCall = serde_json::from_value(json!({
            "id": "call_9", "type": "function",
            "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}
        }))
        .unwrap();
        let call = wire.into_tool_call(0);
        assert_eq!(call.id, "call_9");
        assert_eq!(call.name, "search");
        assert_eq!(call.arguments, r#"{"q":"rust"}"#);
        assert!(call.is_pending());
    }

    #[test]
    fn wire_tool_call_flat_shape_without_id() {
        let wire: WireToolCall =
            serde_json::from_value(json!({"name": "read_file", "arguments": {"path": "a.md"}})).unwrap();
        let call = wire.into_tool_call(3);
        assert_eq!(call.id, "call_3");
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments, r#"{"path":"a.md"}"#);
    }

    // =========================================================================
    // Requests
    // =========================================================================

    #[test]
    fn stream_request_omits_unset_optionals() {
        let user = Message::user("Hello");
        let request = StreamRequest {
            messages: vec![HistoryMessage::from(&user)],
            session_id: SessionId::new("s1").unwrap(),
            agent_id: None,
            system_context: Map::new(),
            available_workflows: Map::new(),
            llm_model_config: Map::new(),
            system_prefix: String::new(),
            available_tools: vec!["search".into()],
            deep_thinking: Some(true),
            multi_agent: None,
            max_loop_count: Some(10),
            more_suggest: None,
            available_skills: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Hello");
        assert_eq!(json["messages"][0]["type"], "normal");
        assert_eq!(json["deep_thinking"], true);
        assert_eq!(json["max_loop_count"], 10);
        assert!(json.get("multi_agent").is_none());
        assert!(json.get("agent_id").is_none());
    }

    #[test]
    fn timestamp_conversion_rejects_nan() {
        assert!(timestamp_from_secs(f64::NAN).is_none());
        assert_eq!(timestamp_from_secs(2.0).unwrap().timestamp(), 2);
    }
}
