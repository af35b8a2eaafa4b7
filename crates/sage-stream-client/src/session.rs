//! Session controller.
//!
//! A [`SessionController`] owns one conversation: its messages, its request
//! settings, and at most one in-flight request. Sending spawns a reader task
//! that turns the response body into lines and forwards them over a channel;
//! [`SessionController::pump`] applies them one at a time. All mutation
//! happens on `&mut self`, so a message is never observed half-merged, and
//! interrupting is just aborting the reader and finalizing what arrived.

use std::sync::Arc;

use sage_stream_core::{Annotation, Message, MessageId, SessionId};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::{Agent, AgentSettings, ClientConfig, ConfigField, ConfigResolver, ResolvedConfig};
use crate::error::{ErrorKind, Result, SessionError, StreamError, TransportError};
use crate::grouping::{group_turns, Turn};
use crate::lifecycle::{self, SessionState};
use crate::merger::MessageMerger;
use crate::observer::{NoopObserver, SessionObserver};
use crate::protocol::{HistoryMessage, StreamEnd, StreamRequest};
use crate::router::{EnvelopeRouter, Routed};
use crate::transport::{spawn_reader, Transport, TransportEvent};

/// The request currently being read.
struct InFlight {
    abort: AbortHandle,
    events: mpsc::Receiver<TransportEvent>,
}

/// Drives one conversation against a [`Transport`].
pub struct SessionController<T: Transport> {
    transport: Arc<T>,
    config: ClientConfig,
    resolver: ConfigResolver,
    session_id: Option<SessionId>,
    merger: MessageMerger,
    router: EnvelopeRouter,
    state: SessionState,
    in_flight: Option<InFlight>,
    observer: Box<dyn SessionObserver>,
}

impl<T: Transport> SessionController<T> {
    /// Create a controller with no observer.
    #[must_use]
    pub fn new(transport: Arc<T>, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            resolver: ConfigResolver::new(),
            session_id: None,
            merger: MessageMerger::new(),
            router: EnvelopeRouter::new(),
            state: SessionState::Idle,
            in_flight: None,
            observer: Box::new(NoopObserver),
        }
    }

    /// Attach an observer, replacing the current one.
    #[must_use]
    pub fn with_observer(mut self, observer: impl SessionObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Session id, once one exists.
    #[must_use]
    pub const fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// All messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        self.merger.messages()
    }

    /// An owned copy of the message list.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.merger.messages().to_vec()
    }

    /// Messages grouped into turns for display.
    #[must_use]
    pub fn turns(&self) -> Vec<Turn<'_>> {
        group_turns(self.merger.messages(), &self.config.grouping)
    }

    /// Settings the next request will carry.
    #[must_use]
    pub fn resolved_config(&self) -> ResolvedConfig {
        self.resolver.resolve()
    }

    /// The selected agent.
    #[must_use]
    pub const fn agent(&self) -> Option<&Agent> {
        self.resolver.agent()
    }

    /// Client configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Returns true if a request is in flight.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        lifecycle::is_in_flight(self.state)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Select the agent for subsequent requests. User overrides are kept.
    pub fn select_agent(&mut self, agent: Agent) {
        tracing::info!(agent_id = %agent.id, name = %agent.name, "Selected agent");
        self.resolver.select_agent(agent);
    }

    /// Override every setting `partial` sets.
    pub fn update_config(&mut self, partial: AgentSettings) {
        tracing::debug!(fields = ?partial.fields_set(), "Updated config overrides");
        self.resolver.update(partial);
    }

    /// Drop one override.
    pub fn clear_override(&mut self, field: ConfigField) {
        self.resolver.clear_override(field);
    }

    /// Drop every override.
    pub fn clear_overrides(&mut self) {
        self.resolver.clear_overrides();
    }

    // =========================================================================
    // Conversation
    // =========================================================================

    /// Send a user message and start streaming the response.
    ///
    /// A request already in flight is interrupted first. Returns the id of the
    /// local user message.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::EmptyMessage` for blank text, and
    /// `SessionError::Transport` if the request could not be opened (the
    /// session is then `Errored`).
    pub async fn send(&mut self, text: &str) -> Result<MessageId> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if self.is_in_flight() {
            tracing::debug!("Send while in flight, interrupting current request");
            self.interrupt().await;
        }
        self.transition(SessionState::Sending)?;

        let user_id = self.merger.user_message(text);
        self.notify_messages();

        let session_id = self
            .session_id
            .get_or_insert_with(SessionId::generate)
            .clone();
        let request = self.build_request(session_id);
        tracing::info!(
            session_id = %request.session_id,
            agent_id = ?request.agent_id.as_ref().map(ToString::to_string),
            history = request.messages.len(),
            "Sending stream request"
        );

        match self.transport.open_stream(&request).await {
            Ok(stream) => {
                let (abort, events) = spawn_reader(stream, self.config.event_buffer);
                self.in_flight = Some(InFlight { abort, events });
                Ok(user_id)
            }
            Err(e) => {
                let detail = e.to_string();
                self.fail(&detail);
                Err(SessionError::Transport(e))
            }
        }
    }

    /// Stop the in-flight request.
    ///
    /// Messages that were still streaming are finalized and annotated, and the
    /// backend is told to stop. Failure to notify the backend is only logged.
    /// Does nothing if no request is in flight.
    pub async fn interrupt(&mut self) {
        if !self.is_in_flight() {
            tracing::debug!(state = %self.state, "Nothing to interrupt");
            return;
        }

        self.stop_reader();
        self.report_dropped_streams();
        let touched = self
            .merger
            .finalize_open(&Annotation::Interrupted, &self.config.interrupt_notice);
        if !touched.is_empty() {
            self.notify_messages();
        }
        let _ = self.transition(SessionState::Interrupted);

        if let Some(session_id) = &self.session_id {
            tracing::info!(session_id = %session_id, finalized = touched.len(), "Interrupted request");
            if let Err(e) = self
                .transport
                .interrupt(session_id, &self.config.interrupt_reason)
                .await
            {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to notify backend of interrupt");
            }
        }
    }

    /// Start a fresh conversation with a new session id on the next send.
    pub async fn new_conversation(&mut self) {
        self.interrupt().await;
        self.merger.clear();
        self.router = EnvelopeRouter::new();
        self.session_id = None;
        self.notify_messages();
        tracing::info!("Started new conversation");
    }

    /// Continue an existing backend session on the next send.
    pub async fn attach_session(&mut self, session_id: SessionId) {
        self.interrupt().await;
        tracing::info!(session_id = %session_id, "Attached to session");
        self.session_id = Some(session_id);
    }

    // =========================================================================
    // Read loop
    // =========================================================================

    /// Process the next transport event.
    ///
    /// Returns false without waiting if no request is in flight.
    pub async fn pump(&mut self) -> bool {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return false;
        };
        // A reader that vanished without a Closed event is treated the same way.
        let event = in_flight.events.recv().await.unwrap_or(TransportEvent::Closed);

        match event {
            TransportEvent::Line(line) => self.handle_line(&line),
            TransportEvent::Malformed(e) => {
                tracing::warn!(error = %e, "Skipping undecodable line");
                self.report(&e);
            }
            TransportEvent::Failed(e) => self.fail(&e.to_string()),
            TransportEvent::Closed => self.fail(&TransportError::Closed.to_string()),
        }
        true
    }

    /// Pump until the request settles; returns the final state.
    pub async fn run_until_settled(&mut self) -> SessionState {
        while self.pump().await {}
        self.state
    }

    fn handle_line(&mut self, line: &str) {
        let routed = self.router.route(line, &mut self.merger);
        if routed.is_empty() {
            return;
        }
        if self.state == SessionState::Sending {
            let _ = self.transition(SessionState::Streaming);
        }

        let mut changed = false;
        let mut end = None;
        for result in routed {
            match result {
                Routed::Merged(_) => changed = true,
                Routed::Buffered(_) => {}
                Routed::Failed(e) => self.report(&e),
                Routed::StreamEnd(marker) => end = Some(marker),
            }
        }

        match end {
            Some(marker) => self.complete(&marker, changed),
            None if changed => self.notify_messages(),
            None => {}
        }
    }

    /// Clean end of stream.
    fn complete(&mut self, marker: &StreamEnd, changed: bool) {
        self.stop_reader();
        let touched = self.merger.complete_open();
        if changed || !touched.is_empty() {
            self.notify_messages();
        }
        tracing::info!(
            session_id = ?self.session_id.as_ref().map(ToString::to_string),
            total_stream_count = ?marker.total_stream_count,
            "Stream completed"
        );
        let _ = self.transition(SessionState::Idle);
    }

    /// Transport failure: finalize what arrived and settle in `Errored`.
    fn fail(&mut self, detail: &str) {
        tracing::warn!(error = %detail, "Stream failed");
        self.stop_reader();
        self.report_dropped_streams();

        let touched = self.merger.finalize_open(
            &Annotation::Error(detail.to_string()),
            &ClientConfig::error_notice(detail),
        );
        if !touched.is_empty() {
            self.notify_messages();
        }
        self.observer.on_error(ErrorKind::Transport, detail);
        let _ = self.transition(SessionState::Errored);
    }

    fn stop_reader(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.abort.abort();
        }
    }

    fn report_dropped_streams(&mut self) {
        for dropped in self.router.drain_dropped() {
            self.report(&dropped);
        }
    }

    fn report(&mut self, error: &StreamError) {
        self.observer.on_error(error.kind(), &error.to_string());
    }

    fn notify_messages(&mut self) {
        self.observer.on_messages_changed(self.merger.messages());
    }

    fn transition(&mut self, to: SessionState) -> Result<()> {
        let from = self.state;
        match lifecycle::validate_transition(from, to) {
            Ok(state) => {
                tracing::debug!(from = %from, to = %state, "Session state changed");
                self.state = state;
                self.observer.on_session_state_changed(state);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(from = %from, to = %to, "Refused invalid session transition");
                Err(e)
            }
        }
    }

    fn build_request(&self, session_id: SessionId) -> StreamRequest {
        let resolved = self.resolver.resolve();
        StreamRequest {
            messages: self.merger.messages().iter().map(HistoryMessage::from).collect(),
            session_id,
            agent_id: self.resolver.agent().map(|agent| agent.id.clone()),
            system_context: resolved.system_context,
            available_workflows: resolved.available_workflows,
            llm_model_config: resolved.llm_model_config,
            system_prefix: resolved.system_prefix,
            available_tools: resolved.available_tools,
            deep_thinking: Some(resolved.deep_thinking),
            multi_agent: Some(resolved.multi_agent),
            max_loop_count: Some(resolved.max_loop_count),
            more_suggest: Some(resolved.more_suggest),
            available_skills: (!resolved.available_skills.is_empty())
                .then_some(resolved.available_skills),
        }
    }
}

impl<T: Transport> Drop for SessionController<T> {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::SessionEvent;
    use crate::testing::{RecordingObserver, Script, ScriptedTransport};
    use sage_stream_core::{AgentId, Role, ToolCallStatus};
    use serde_json::json;

    fn line(value: serde_json::Value) -> String {
        value.to_string()
    }

    fn stream_end() -> String {
        line(json!({"type": "stream_end", "session_id": "s", "timestamp": 1.0, "total_stream_count": 2}))
    }

    fn setup(scripts: Vec<Script>) -> (SessionController<ScriptedTransport>, Arc<ScriptedTransport>, RecordingObserver) {
        let transport = Arc::new(ScriptedTransport::new(scripts));
        let observer = RecordingObserver::new();
        let controller = SessionController::new(Arc::clone(&transport), ClientConfig::default())
            .with_observer(observer.clone());
        (controller, transport, observer)
    }

    // =========================================================================
    // Send and stream
    // =========================================================================

    #[tokio::test]
    async fn send_streams_to_idle() {
        let (mut session, transport, observer) = setup(vec![Script::body(vec![
            line(json!({"type": "normal", "message_id": "m1", "role": "assistant", "content": "Hel"})),
            line(json!({"type": "normal", "message_id": "m1", "role": "assistant", "content": "lo"})),
            stream_end(),
        ])]);

        session.send("hi").await.unwrap();
        assert_eq!(session.state(), SessionState::Sending);

        let state = session.run_until_settled().await;
        assert_eq!(state, SessionState::Idle);

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].display_content, "Hello");
        assert!(messages[1].is_final);
        assert!(messages[1].annotation.is_none());

        assert_eq!(
            observer.states(),
            vec![SessionState::Sending, SessionState::Streaming, SessionState::Idle]
        );
        assert!(observer.errors().is_empty());

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].messages[0].content, "hi");
        assert_eq!(requests[0].max_loop_count, Some(10));
        assert_eq!(session.session_id(), Some(&requests[0].session_id));
    }

    #[tokio::test]
    async fn history_and_session_carry_over() {
        let (mut session, transport, _observer) = setup(vec![
            Script::body(vec![
                line(json!({"type": "final_answer", "message_id": "a1", "content": "first"})),
                stream_end(),
            ]),
            Script::body(vec![stream_end()]),
        ]);

        session.send("one").await.unwrap();
        session.run_until_settled().await;
        session.send("two").await.unwrap();
        session.run_until_settled().await;

        let requests = transport.requests();
        assert_eq!(requests[1].session_id, requests[0].session_id);
        let history: Vec<&str> = requests[1].messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["one", "first", "two"]);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (mut session, transport, _observer) = setup(vec![]);
        assert!(matches!(session.send("  ").await, Err(SessionError::EmptyMessage)));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn malformed_line_is_reported_and_skipped() {
        let (mut session, _transport, observer) = setup(vec![Script::body(vec![
            "{oops".to_string(),
            line(json!({"message_id": "m1", "content": "still here"})),
            stream_end(),
        ])]);

        session.send("hi").await.unwrap();
        assert_eq!(session.run_until_settled().await, SessionState::Idle);

        assert_eq!(observer.errors().len(), 1);
        assert_eq!(observer.errors()[0].0, ErrorKind::LineParse);
        assert_eq!(session.messages()[1].display_content, "still here");
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let (mut session, _transport, _observer) = setup(vec![Script::body(vec![
            line(json!({
                "type": "tool_call", "message_id": "a1", "role": "assistant",
                "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "search", "arguments": "{}"}}],
            })),
            line(json!({
                "type": "tool_call_result", "message_id": "t1", "role": "tool",
                "tool_call_id": "c1", "content": "3 hits",
            })),
            line(json!({"type": "final_answer", "message_id": "f1", "content": "Done"})),
            stream_end(),
        ])]);

        session.send("search").await.unwrap();
        session.run_until_settled().await;

        let call = &session.messages()[1].tool_calls[0];
        assert_eq!(call.status, ToolCallStatus::Completed);
        assert_eq!(call.result.as_deref(), Some("3 hits"));

        let turns = session.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].thinking.len(), 2);
        assert_eq!(turns[0].replies[0].display_content, "Done");
    }

    // =========================================================================
    // Failure
    // =========================================================================

    #[tokio::test]
    async fn close_without_stream_end_errors() {
        let (mut session, _transport, observer) = setup(vec![Script::body(vec![line(
            json!({"message_id": "m1", "content": "partial"}),
        )])]);

        session.send("hi").await.unwrap();
        assert_eq!(session.run_until_settled().await, SessionState::Errored);

        let message = &session.messages()[1];
        assert!(message.is_final);
        assert_eq!(
            message.annotation,
            Some(Annotation::Error("stream closed before stream_end".into()))
        );
        assert!(message.display_content.starts_with("partial"));
        assert_eq!(observer.errors().last().unwrap().0, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn broken_body_errors() {
        let (mut session, _transport, _observer) = setup(vec![Script::broken(vec![line(
            json!({"message_id": "m1", "content": "partial"}),
        )])]);

        session.send("hi").await.unwrap();
        assert_eq!(session.run_until_settled().await, SessionState::Errored);
        assert!(matches!(session.messages()[1].annotation, Some(Annotation::Error(_))));
    }

    #[tokio::test]
    async fn rejected_request_errors() {
        let (mut session, _transport, observer) = setup(vec![Script::reject(503, "busy")]);

        let result = session.send("hi").await;
        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::Status { status: 503, .. }))
        ));
        assert_eq!(session.state(), SessionState::Errored);
        assert!(!session.pump().await);
        assert_eq!(observer.errors()[0].0, ErrorKind::Transport);

        // The user message stays in the conversation.
        assert_eq!(session.messages().len(), 1);
    }

    #[tokio::test]
    async fn dropped_chunk_stream_is_reported_at_stream_end() {
        let (mut session, _transport, observer) = setup(vec![Script::body(vec![
            line(json!({"type": "chunk_start", "message_id": "big", "total_chunks": 2})),
            line(json!({
                "type": "json_chunk", "message_id": "big", "chunk_index": 0,
                "total_chunks": 2, "chunk_data": "{\"message_id\":",
            })),
            stream_end(),
        ])]);

        session.send("hi").await.unwrap();
        assert_eq!(session.run_until_settled().await, SessionState::Idle);

        let errors = observer.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, ErrorKind::Reassembly);
        assert_eq!(session.messages().len(), 1);
    }

    // =========================================================================
    // Interrupt
    // =========================================================================

    #[tokio::test]
    async fn interrupt_finalizes_partial_messages() {
        let (mut session, transport, observer) = setup(vec![Script::open(vec![
            line(json!({"message_id": "m1", "content": "Hel"})),
            line(json!({"message_id": "m1", "content": "lo"})),
        ])]);

        session.send("hi").await.unwrap();
        assert!(session.pump().await);
        assert!(session.pump().await);
        assert_eq!(session.state(), SessionState::Streaming);

        session.interrupt().await;
        assert_eq!(session.state(), SessionState::Interrupted);
        assert!(!session.pump().await);

        let message = &session.messages()[1];
        assert!(message.is_final);
        assert_eq!(message.annotation, Some(Annotation::Interrupted));
        assert_eq!(message.display_content, "Hello\n\n[Interrupted by user]");

        let interrupts = transport.interrupts();
        assert_eq!(interrupts.len(), 1);
        assert_eq!(Some(&interrupts[0].0), session.session_id());
        assert_eq!(interrupts[0].1, "User requested interruption");
        assert!(observer.errors().is_empty());
    }

    #[tokio::test]
    async fn interrupt_when_idle_is_a_no_op() {
        let (mut session, transport, observer) = setup(vec![]);
        session.interrupt().await;
        assert_eq!(session.state(), SessionState::Idle);
        assert!(transport.interrupts().is_empty());
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn send_while_streaming_interrupts_first() {
        let (mut session, transport, observer) = setup(vec![
            Script::open(vec![line(json!({"message_id": "m1", "content": "slow"}))]),
            Script::body(vec![stream_end()]),
        ]);

        session.send("first").await.unwrap();
        session.pump().await;
        session.send("second").await.unwrap();
        assert_eq!(session.run_until_settled().await, SessionState::Idle);

        assert_eq!(transport.interrupts().len(), 1);
        assert_eq!(session.messages()[1].annotation, Some(Annotation::Interrupted));
        assert_eq!(
            observer.states(),
            vec![
                SessionState::Sending,
                SessionState::Streaming,
                SessionState::Interrupted,
                SessionState::Sending,
                SessionState::Streaming,
                SessionState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn interrupt_notification_failure_is_not_an_error() {
        let transport = Arc::new(ScriptedTransport::new(vec![Script::open(vec![])]).failing_interrupts());
        let observer = RecordingObserver::new();
        let mut session = SessionController::new(Arc::clone(&transport), ClientConfig::default())
            .with_observer(observer.clone());

        session.send("hi").await.unwrap();
        session.interrupt().await;

        assert_eq!(session.state(), SessionState::Interrupted);
        assert!(observer.errors().is_empty());
    }

    // =========================================================================
    // Configuration and conversations
    // =========================================================================

    #[tokio::test]
    async fn request_carries_resolved_config() {
        let (mut session, transport, _observer) = setup(vec![Script::body(vec![stream_end()])]);

        let agent: Agent = serde_json::from_value(json!({
            "id": "research",
            "name": "Research",
            "config": {"deepThinking": true, "availableTools": ["search"], "maxLoopCount": 20},
        }))
        .unwrap();
        session.select_agent(agent);
        session.update_config(AgentSettings {
            max_loop_count: Some(4),
            available_skills: Some(vec!["summarize".into()]),
            ..AgentSettings::default()
        });

        session.send("go").await.unwrap();
        session.run_until_settled().await;

        let request = &transport.requests()[0];
        assert_eq!(request.agent_id, Some(AgentId::new("research").unwrap()));
        assert_eq!(request.deep_thinking, Some(true));
        assert_eq!(request.max_loop_count, Some(4));
        assert_eq!(request.available_tools, vec!["search"]);
        assert_eq!(request.available_skills, Some(vec!["summarize".to_string()]));

        session.clear_override(ConfigField::MaxLoopCount);
        assert_eq!(session.resolved_config().max_loop_count, 20);
        session.clear_overrides();
        assert!(session.resolved_config().available_skills.is_empty());
    }

    #[tokio::test]
    async fn new_conversation_resets_messages_and_session() {
        let (mut session, transport, observer) = setup(vec![
            Script::body(vec![stream_end()]),
            Script::body(vec![stream_end()]),
        ]);

        session.send("one").await.unwrap();
        session.run_until_settled().await;
        let first_session = session.session_id().cloned();

        session.new_conversation().await;
        assert!(session.messages().is_empty());
        assert!(session.session_id().is_none());
        assert!(matches!(
            observer.events().last(),
            Some(SessionEvent::MessagesChanged(messages)) if messages.is_empty()
        ));

        session.send("two").await.unwrap();
        session.run_until_settled().await;

        let requests = transport.requests();
        assert_eq!(requests[1].messages.len(), 1);
        assert_ne!(Some(requests[1].session_id.clone()), first_session);
    }

    #[tokio::test]
    async fn attach_session_reuses_backend_session() {
        let (mut session, transport, _observer) = setup(vec![Script::body(vec![stream_end()])]);
        let existing = SessionId::new("resume-me").unwrap();

        session.attach_session(existing.clone()).await;
        session.send("hi").await.unwrap();
        session.run_until_settled().await;

        assert_eq!(transport.requests()[0].session_id, existing);
    }
}
