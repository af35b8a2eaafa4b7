//! Turn grouping for display.
//!
//! A derived, read-only view over the message list: each user message opens a
//! turn, and the assistant's internal reasoning is separated from its replies.
//! Front ends differ only in which kinds count as reasoning, which is
//! expressed through [`GroupingConfig`].

use sage_stream_core::{kinds, Message};
use serde::{Deserialize, Serialize};

/// Which message kinds count as internal reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Kinds collected into a turn's `thinking` section.
    #[serde(default = "GroupingConfig::default_thinking_kinds")]
    pub thinking_kinds: Vec<String>,

    /// Kind always shown as a reply, even if listed in `thinking_kinds`.
    #[serde(default = "GroupingConfig::default_final_answer_kind")]
    pub final_answer_kind: String,
}

impl GroupingConfig {
    fn default_thinking_kinds() -> Vec<String> {
        [
            kinds::TASK_ANALYSIS,
            kinds::TASK_DECOMPOSITION,
            kinds::PLANNING,
            kinds::EXECUTION,
            kinds::OBSERVATION,
            kinds::THINKING,
            kinds::TOOL_CALL,
            kinds::TOOL_CALL_RESULT,
            kinds::REWRITE,
            kinds::TASK_ROUTER,
            kinds::STAGE_SUMMARY,
            kinds::DO_SUBTASK_RESULT,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    fn default_final_answer_kind() -> String {
        kinds::FINAL_ANSWER.to_string()
    }

    /// Returns true if `message` belongs in a turn's reasoning section.
    #[must_use]
    pub fn is_thinking(&self, message: &Message) -> bool {
        !message.is_user()
            && message.kind != self.final_answer_kind
            && self.thinking_kinds.iter().any(|kind| *kind == message.kind)
    }
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            thinking_kinds: Self::default_thinking_kinds(),
            final_answer_kind: Self::default_final_answer_kind(),
        }
    }
}

/// One user prompt and everything produced in response.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn<'a> {
    /// The prompt; `None` for messages that precede any user message.
    pub user: Option<&'a Message>,
    /// Internal reasoning steps, in arrival order.
    pub thinking: Vec<&'a Message>,
    /// Visible replies, in arrival order.
    pub replies: Vec<&'a Message>,
}

impl<'a> Turn<'a> {
    const fn new(user: Option<&'a Message>) -> Self {
        Self {
            user,
            thinking: Vec::new(),
            replies: Vec::new(),
        }
    }

    /// The turn's final answer, if one has arrived.
    #[must_use]
    pub fn final_answer(&self, config: &GroupingConfig) -> Option<&'a Message> {
        self.replies
            .iter()
            .rev()
            .copied()
            .find(|message| message.kind == config.final_answer_kind)
    }
}

/// Group messages into turns.
#[must_use]
pub fn group_turns<'a>(messages: &'a [Message], config: &GroupingConfig) -> Vec<Turn<'a>> {
    let mut turns: Vec<Turn<'a>> = Vec::new();

    for message in messages {
        if message.is_user() {
            turns.push(Turn::new(Some(message)));
            continue;
        }
        if turns.is_empty() {
            turns.push(Turn::new(None));
        }
        let Some(turn) = turns.last_mut() else {
            continue;
        };
        if config.is_thinking(message) {
            turn.thinking.push(message);
        } else {
            turn.replies.push(message);
        }
    }

    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sage_stream_core::{MessageId, Role};

    fn assistant(id: &str, kind: &str) -> Message {
        Message::new(MessageId::new(id).unwrap(), Role::Assistant, kind, Utc::now())
    }

    fn ids(messages: &[&Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn splits_reasoning_from_replies() {
        let messages = vec![
            Message::user("plan a trip"),
            assistant("a1", kinds::TASK_ANALYSIS),
            assistant("a2", kinds::TOOL_CALL),
            assistant("a3", kinds::FINAL_ANSWER),
            Message::user("thanks"),
            assistant("a4", kinds::NORMAL),
        ];

        let config = GroupingConfig::default();
        let turns = group_turns(&messages, &config);
        assert_eq!(turns.len(), 2);

        assert_eq!(turns[0].user.unwrap().display_content, "plan a trip");
        assert_eq!(ids(&turns[0].thinking), vec!["a1", "a2"]);
        assert_eq!(ids(&turns[0].replies), vec!["a3"]);
        assert_eq!(turns[0].final_answer(&config).unwrap().id.as_str(), "a3");

        assert_eq!(ids(&turns[1].replies), vec!["a4"]);
        assert!(turns[1].final_answer(&config).is_none());
    }

    #[test]
    fn messages_before_first_prompt_get_their_own_turn() {
        let messages = vec![assistant("a0", kinds::NORMAL), Message::user("hi")];
        let turns = group_turns(&messages, &GroupingConfig::default());

        assert_eq!(turns.len(), 2);
        assert!(turns[0].user.is_none());
        assert_eq!(ids(&turns[0].replies), vec!["a0"]);
    }

    #[test]
    fn final_answer_kind_is_never_hidden() {
        let config = GroupingConfig {
            thinking_kinds: vec![kinds::FINAL_ANSWER.to_string(), kinds::PLANNING.to_string()],
            ..GroupingConfig::default()
        };
        let messages = vec![
            Message::user("q"),
            assistant("p", kinds::PLANNING),
            assistant("f", kinds::FINAL_ANSWER),
        ];

        let turns = group_turns(&messages, &config);
        assert_eq!(ids(&turns[0].thinking), vec!["p"]);
        assert_eq!(ids(&turns[0].replies), vec!["f"]);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: GroupingConfig = serde_json::from_str(r#"{"thinking_kinds":["planning"]}"#).unwrap();
        assert_eq!(config.thinking_kinds, vec!["planning"]);
        assert_eq!(config.final_answer_kind, "final_answer");
    }
}
