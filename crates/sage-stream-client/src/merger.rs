//! Folding message envelopes into the conversation.
//!
//! The backend streams each message as many partial envelopes sharing one
//! `message_id`. The merger keeps the ordered message list and applies each
//! partial to the message it belongs to:
//!
//! - **Replace**: tool messages and `tool_call_result` updates are emitted
//!   whole, so a later envelope overwrites every field.
//! - **Append**: everything else streams text deltas, which are concatenated.
//!
//! Messages are never removed except by [`MessageMerger::clear`].

use std::collections::HashMap;

use sage_stream_core::{kinds, Annotation, Message, MessageId, Role, ToolCall, ToolCallStatus};
use serde_json::Value;

use crate::protocol::MessageEnvelope;

/// How an envelope is applied to an existing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Overwrite the message wholesale.
    Replace,
    /// Concatenate content and overwrite scalars.
    Append,
}

impl MergeStrategy {
    /// Choose the strategy for an incoming envelope.
    #[must_use]
    pub fn select(role: Role, kind: &str) -> Self {
        if role == Role::Tool || kind == kinds::TOOL_CALL_RESULT {
            Self::Replace
        } else {
            Self::Append
        }
    }
}

/// Result of applying one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The message that was created or updated.
    pub id: MessageId,
    /// True if the envelope introduced a new message.
    pub created: bool,
    /// The strategy used to update an existing message.
    pub strategy: Option<MergeStrategy>,
}

/// Ordered collection of conversation messages, keyed by id.
#[derive(Debug, Default)]
pub struct MessageMerger {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
}

impl MessageMerger {
    /// Create an empty merger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index.get(id).map(|&position| &self.messages[position])
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns true if there are no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns true if any message is still receiving partials.
    #[must_use]
    pub fn has_open(&self) -> bool {
        self.messages.iter().any(|message| !message.is_final)
    }

    /// Append a locally authored user message and return its id.
    pub fn user_message(&mut self, text: impl Into<String>) -> MessageId {
        let message = Message::user(text);
        let id = message.id.clone();
        self.insert(message);
        id
    }

    /// Apply one partial envelope.
    pub fn apply(&mut self, envelope: MessageEnvelope) -> MergeOutcome {
        let id = envelope_id(&envelope);
        let strategy = MergeStrategy::select(envelope.role(), envelope.kind());

        if envelope.role() == Role::Tool {
            self.link_tool_result(&envelope);
        }

        if let Some(&position) = self.index.get(&id) {
            let message = &mut self.messages[position];
            match strategy {
                MergeStrategy::Replace => replace(message, envelope),
                MergeStrategy::Append => append(message, envelope),
            }
            tracing::debug!(message_id = %id, ?strategy, "Merged partial into message");
            return MergeOutcome {
                id,
                created: false,
                strategy: Some(strategy),
            };
        }

        tracing::debug!(message_id = %id, role = %envelope.role(), kind = envelope.kind(), "New message");
        self.insert(build(id.clone(), envelope, strategy));
        MergeOutcome {
            id,
            created: true,
            strategy: None,
        }
    }

    /// Mark every non-final message final on the client's behalf.
    ///
    /// Returns the ids of the messages that were touched.
    pub fn finalize_open(&mut self, annotation: &Annotation, notice: &str) -> Vec<MessageId> {
        let mut touched = Vec::new();
        for message in self.messages.iter_mut().filter(|m| !m.is_final) {
            message.finalize(annotation.clone(), notice);
            touched.push(message.id.clone());
        }
        touched
    }

    /// Mark every non-final message final after a clean end of stream.
    pub fn complete_open(&mut self) -> Vec<MessageId> {
        let mut touched = Vec::new();
        for message in self.messages.iter_mut().filter(|m| !m.is_final) {
            message.is_final = true;
            touched.push(message.id.clone());
        }
        touched
    }

    /// Drop every message.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
    }

    fn insert(&mut self, message: Message) {
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
    }

    /// Update the assistant-side `ToolCall` answered by a tool envelope.
    fn link_tool_result(&mut self, envelope: &MessageEnvelope) {
        let Some(call_id) = envelope.tool_call_id.as_deref() else {
            return;
        };
        let Some(call) = self
            .messages
            .iter_mut()
            .rev()
            .find_map(|message| message.tool_call_mut(call_id))
        else {
            tracing::debug!(tool_call_id = call_id, "Tool result for an unknown call");
            return;
        };

        call.result = envelope.content.clone().or_else(|| envelope.show_content.clone());
        if envelope.reports_tool_error() {
            call.status = ToolCallStatus::Failed;
            call.error = Some(tool_error_detail(envelope));
        } else {
            call.status = ToolCallStatus::Completed;
            call.error = None;
        }
    }
}

fn envelope_id(envelope: &MessageEnvelope) -> MessageId {
    match envelope.message_id.as_deref().map(MessageId::new) {
        Some(Ok(id)) => id,
        _ => {
            let id = MessageId::generate_local();
            tracing::warn!(message_id = %id, "Envelope without message_id, synthesized a local id");
            id
        }
    }
}

fn tool_error_detail(envelope: &MessageEnvelope) -> String {
    match envelope.extra.get("error") {
        Some(Value::String(detail)) => detail.clone(),
        Some(value) if !value.is_null() && value.as_bool().is_none() => value.to_string(),
        _ => envelope.display_delta().to_string(),
    }
}

fn tool_calls(envelope: &mut MessageEnvelope) -> Vec<ToolCall> {
    envelope
        .tool_calls
        .take()
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, call)| call.into_tool_call(position))
        .collect()
}

fn build(id: MessageId, mut envelope: MessageEnvelope, strategy: MergeStrategy) -> Message {
    let observed = envelope.observed_at();
    let mut message = Message::new(id, envelope.role(), envelope.kind(), observed);
    message.display_content = envelope.display_delta().to_string();
    message.tool_calls = tool_calls(&mut envelope);
    message.raw_content = envelope.content.take();
    message.tool_call_id = envelope.tool_call_id.take();
    // Tool results arrive whole.
    message.is_final = envelope
        .is_final
        .unwrap_or(strategy == MergeStrategy::Replace);
    message.metadata = std::mem::take(&mut envelope.extra);
    message
}

fn replace(message: &mut Message, envelope: MessageEnvelope) {
    let first_seen = message.timestamp;
    let mut replacement = build(message.id.clone(), envelope, MergeStrategy::Replace);
    replacement.updated_at = replacement.timestamp;
    replacement.timestamp = first_seen;
    *message = replacement;
}

fn append(message: &mut Message, mut envelope: MessageEnvelope) {
    message.display_content.push_str(envelope.display_delta());
    if let Some(content) = envelope.content.take() {
        message
            .raw_content
            .get_or_insert_with(String::new)
            .push_str(&content);
    }
    if let Some(kind) = envelope.kind.take() {
        message.kind = kind;
    }
    if let Some(is_final) = envelope.is_final {
        message.is_final = is_final;
    }
    if let Some(call_id) = envelope.tool_call_id.take() {
        message.tool_call_id = Some(call_id);
    }
    message.updated_at = envelope.observed_at();

    for call in tool_calls(&mut envelope) {
        match message.tool_calls.iter_mut().find(|c| c.id == call.id) {
            Some(existing) => *existing = call,
            None => message.tool_calls.push(call),
        }
    }
    message.metadata.extend(envelope.extra);
}
