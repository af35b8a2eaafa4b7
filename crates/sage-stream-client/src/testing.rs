//! Test doubles for sessions.
//!
//! Available in unit tests and behind the `test-utils` feature.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use sage_stream_core::{Message, SessionId};

use crate::error::{ErrorKind, TransportError};
use crate::lifecycle::SessionState;
use crate::observer::{SessionEvent, SessionObserver};
use crate::protocol::StreamRequest;
use crate::transport::{ByteStream, Transport};

/// How the scripted backend answers one stream request.
#[derive(Debug, Clone)]
pub enum Script {
    /// Send the lines, then end the body.
    Body(Vec<String>),
    /// Send the lines, then keep the body open forever.
    Open(Vec<String>),
    /// Send the lines, then fail the body mid-stream.
    Broken(Vec<String>),
    /// Reject the request with a status.
    Reject {
        /// HTTP status code.
        status: u16,
        /// Error text.
        message: String,
    },
}

impl Script {
    /// Lines followed by a clean end of body.
    #[must_use]
    pub fn body(lines: Vec<String>) -> Self {
        Self::Body(lines)
    }

    /// Lines followed by a body that never ends.
    #[must_use]
    pub fn open(lines: Vec<String>) -> Self {
        Self::Open(lines)
    }

    /// Lines followed by a read error.
    #[must_use]
    pub fn broken(lines: Vec<String>) -> Self {
        Self::Broken(lines)
    }

    /// A rejected request.
    #[must_use]
    pub fn reject(status: u16, message: impl Into<String>) -> Self {
        Self::Reject {
            status,
            message: message.into(),
        }
    }
}

fn pieces(lines: Vec<String>) -> impl futures::Stream<Item = Result<Vec<u8>, TransportError>> {
    stream::iter(lines.into_iter().map(|line| Ok(format!("{line}\n").into_bytes())))
}

/// Transport that replays scripts in order and records what it was asked.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<StreamRequest>>,
    interrupts: Mutex<Vec<(SessionId, String)>>,
    fail_interrupts: bool,
}

impl ScriptedTransport {
    /// Create a transport that answers requests with `scripts`, one each.
    #[must_use]
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// Make every interrupt notification fail.
    #[must_use]
    pub fn failing_interrupts(mut self) -> Self {
        self.fail_interrupts = true;
        self
    }

    /// Queue another script.
    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Every stream request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    /// Every interrupt notification received so far.
    #[must_use]
    pub fn interrupts(&self) -> Vec<(SessionId, String)> {
        self.interrupts.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        self.requests.lock().push(request.clone());
        let script = self.scripts.lock().pop_front();

        match script {
            Some(Script::Body(lines)) => Ok(pieces(lines).boxed()),
            Some(Script::Open(lines)) => Ok(pieces(lines).chain(stream::pending()).boxed()),
            Some(Script::Broken(lines)) => Ok(pieces(lines)
                .chain(stream::once(async {
                    Err(TransportError::Other("connection reset".to_string()))
                }))
                .boxed()),
            Some(Script::Reject { status, message }) => Err(TransportError::Status { status, message }),
            None => Err(TransportError::Status {
                status: 503,
                message: "no scripted response".to_string(),
            }),
        }
    }

    async fn interrupt(&self, session_id: &SessionId, reason: &str) -> Result<(), TransportError> {
        self.interrupts
            .lock()
            .push((session_id.clone(), reason.to_string()));
        if self.fail_interrupts {
            return Err(TransportError::Other("interrupt endpoint unavailable".to_string()));
        }
        Ok(())
    }
}

/// Observer that records every notification. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingObserver {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl RecordingObserver {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event, in order.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// Every state change, in order.
    #[must_use]
    pub fn states(&self) -> Vec<SessionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Every reported error, in order.
    #[must_use]
    pub fn errors(&self) -> Vec<(ErrorKind, String)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error { kind, detail } => Some((*kind, detail.clone())),
                _ => None,
            })
            .collect()
    }

    /// The most recent message snapshot.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<Vec<Message>> {
        self.events.lock().iter().rev().find_map(|event| match event {
            SessionEvent::MessagesChanged(messages) => Some(messages.clone()),
            _ => None,
        })
    }
}

impl SessionObserver for RecordingObserver {
    fn on_messages_changed(&mut self, snapshot: &[Message]) {
        self.events
            .lock()
            .push(SessionEvent::MessagesChanged(snapshot.to_vec()));
    }

    fn on_session_state_changed(&mut self, state: SessionState) {
        self.events.lock().push(SessionEvent::StateChanged(state));
    }

    fn on_error(&mut self, kind: ErrorKind, detail: &str) {
        self.events.lock().push(SessionEvent::Error {
            kind,
            detail: detail.to_string(),
        });
    }
}
