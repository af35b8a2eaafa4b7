//! Session lifecycle state machine.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────┐  send   ┌──────────┐  first envelope  ┌───────────┐
//!     │   Idle   │────────▶│ Sending  │─────────────────▶│ Streaming │
//!     └──────────┘         └────┬─────┘                  └─────┬─────┘
//!          ▲                    │                              │
//!          │                    │ (interrupt / failure)        │
//!          │                    ▼                              │
//!          │          ┌───────────────────────┐                │
//!          │          │ Interrupted / Errored │◄───────────────┤
//!          │          └───────────┬───────────┘                │
//!          │                      │ send                       │
//!          │                      ▼                            │
//!          │                  Sending                          │
//!          │                                                   │
//!          └───────────────────── stream_end ──────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Where a session is in its request cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No request in flight.
    #[default]
    Idle,
    /// Request issued, nothing received yet.
    Sending,
    /// Envelopes are arriving.
    Streaming,
    /// The user stopped the request.
    Interrupted,
    /// The request failed.
    Errored,
}

impl SessionState {
    /// Short name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Interrupted => "interrupted",
            Self::Errored => "errored",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `SessionError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(from: SessionState, to: SessionState) -> Result<SessionState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(SessionError::InvalidTransition { from, to })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::{Errored, Idle, Interrupted, Sending, Streaming};

    matches!(
        (from, to),
        // Every settled state accepts a new request
        (Idle | Interrupted | Errored, Sending)
            | (Sending, Streaming | Idle | Interrupted | Errored)
            | (Streaming, Idle | Interrupted | Errored)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: SessionState) -> Vec<SessionState> {
    use SessionState::{Errored, Idle, Interrupted, Sending, Streaming};

    match state {
        Idle | Interrupted | Errored => vec![Sending],
        Sending => vec![Streaming, Idle, Interrupted, Errored],
        Streaming => vec![Idle, Interrupted, Errored],
    }
}

/// Returns true if a request is in flight.
#[must_use]
pub const fn is_in_flight(state: SessionState) -> bool {
    matches!(state, SessionState::Sending | SessionState::Streaming)
}

/// Returns true if the session has settled and is waiting for the next send.
#[must_use]
pub const fn is_settled(state: SessionState) -> bool {
    !is_in_flight(state)
}
