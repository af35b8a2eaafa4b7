//! Core identifier types for sage-stream.
//!
//! The backend treats every identifier as an opaque string. These newtypes keep
//! message, session and agent identities from being mixed up while still
//! serializing as plain JSON strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Defines an opaque, non-empty string identifier.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create an identifier from a string.
            ///
            /// # Errors
            ///
            /// Returns an error if the string is empty or only whitespace.
            pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(IdError::Empty);
                }
                Ok(Self(value))
            }

            /// Return the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identity of one conversation message.
    ///
    /// Assigned by the backend for streamed messages, or synthesized locally for
    /// user-authored messages and envelopes that arrive without an id.
    MessageId
}

string_id! {
    /// Identity of one conversation session.
    ///
    /// Created locally (UUID v4) before the first send unless the user attaches
    /// to an existing session.
    SessionId
}

string_id! {
    /// Identity of a configured backend agent.
    AgentId
}

impl MessageId {
    /// Generate a fresh identifier for a locally authored message.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Generate an identifier for an envelope the backend sent without one.
    ///
    /// The `local-` prefix keeps these distinguishable from server ids.
    #[must_use]
    pub fn generate_local() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    /// Returns true if this id was synthesized by the client.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }
}

impl SessionId {
    /// Generate a new random `SessionId`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string was empty.
    #[error("identifier must not be empty")]
    Empty,
}
