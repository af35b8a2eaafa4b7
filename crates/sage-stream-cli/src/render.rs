//! Incremental terminal rendering of a session.

use std::collections::HashMap;
use std::io::Write;

use sage_stream_client::{group_turns, ErrorKind, GroupingConfig, SessionObserver, SessionState};
use sage_stream_core::{Message, MessageId};

/// Prints each message's new text as it streams in.
pub struct TerminalObserver<W: Write + Send> {
    out: W,
    grouping: GroupingConfig,
    printed: HashMap<MessageId, String>,
    current: Option<MessageId>,
}

impl<W: Write + Send> TerminalObserver<W> {
    /// Create a renderer writing to `out`.
    pub fn new(out: W, grouping: GroupingConfig) -> Self {
        Self {
            out,
            grouping,
            printed: HashMap::new(),
            current: None,
        }
    }

    /// Consume the renderer, returning its writer.
    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            tracing::debug!(error = %e, "Terminal write failed");
        }
    }

    fn header(&self, message: &Message) -> String {
        if self.grouping.is_thinking(message) {
            format!("\n[{}] ", message.kind)
        } else {
            "\n".to_string()
        }
    }

    fn render(&mut self, message: &Message) {
        let text = &message.display_content;
        let previous = self.printed.get(&message.id).map(String::as_str);
        let continuing = self.current.as_ref() == Some(&message.id);

        let output = match previous {
            Some(prev) if text == prev => return,
            Some(prev) if text.starts_with(prev) => {
                let delta = &text[prev.len()..];
                if continuing {
                    delta.to_string()
                } else {
                    format!("{}{delta}", self.header(message))
                }
            }
            // New message, or one that was rewritten wholesale
            _ => format!("{}{text}", self.header(message)),
        };

        if !output.is_empty() {
            self.emit(&output);
        }
        self.printed.insert(message.id.clone(), text.clone());
        self.current = Some(message.id.clone());
    }
}

impl<W: Write + Send> SessionObserver for TerminalObserver<W> {
    fn on_messages_changed(&mut self, snapshot: &[Message]) {
        if snapshot.is_empty() {
            self.printed.clear();
            self.current = None;
            return;
        }
        for message in snapshot.iter().filter(|m| !m.is_user()) {
            self.render(message);
        }
    }

    fn on_session_state_changed(&mut self, state: SessionState) {
        tracing::debug!(state = %state, "Session state");
        if matches!(state, SessionState::Idle | SessionState::Interrupted | SessionState::Errored) {
            self.emit("\n");
            self.current = None;
        }
    }

    fn on_error(&mut self, kind: ErrorKind, detail: &str) {
        eprintln!("[{}] {detail}", kind.as_str());
    }
}

/// Render a finished conversation as plain text, one turn at a time.
pub fn transcript(messages: &[Message], grouping: &GroupingConfig, show_thinking: bool) -> String {
    let mut out = String::new();
    for turn in group_turns(messages, grouping) {
        if let Some(user) = turn.user {
            out.push_str(&format!("> {}\n", user.display_content));
        }
        if show_thinking {
            for step in &turn.thinking {
                out.push_str(&format!("  [{}] {}\n", step.kind, step.display_content));
            }
        }
        for reply in &turn.replies {
            out.push_str(&reply.display_content);
            out.push('\n');
        }
    }
    out
}
