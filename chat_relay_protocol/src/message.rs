// Chat protocol messages exchanged between clients and the relay.
//
// A single enum, `ChatProtocol`, carries the whole vocabulary in both
// directions. It is internally tagged (`"type"` field) so the relay can
// dispatch on the discriminant without knowing anything else about the
// payload:
// - `Chat`: a line of chat. Clients leave `sender_name` empty; the relay fills
//   it in before fanning the line out to everyone else.
// - `NameChange`: a client asks to be called something else. The relay answers
//   with a `Chat` from "Server" confirming the effective name.
// - `Unknown`: any tag this build does not recognize. Decoding succeeds so the
//   relay can log and drop it instead of treating it as garbage.
//
// Missing string fields decode as empty strings, so `{"type":"name_change"}`
// is a valid (empty) name change.
//
// See also: `framing.rs` for the length prefix that wraps an encoded message
// on a stream transport.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender name the relay uses for its own replies.
pub const SERVER_SENDER_NAME: &str = "Server";

/// Top-level protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatProtocol {
    /// A chat line.
    Chat(Chat),
    /// Request to change the sender's display name.
    NameChange(NameChange),
    /// A message type this build does not understand.
    #[serde(other)]
    Unknown,
}

/// Body of a chat line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    #[serde(default)]
    pub sender_name: String,
    #[serde(default)]
    pub content: String,
}

/// Body of a name change request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameChange {
    #[serde(default)]
    pub name: String,
}

/// Why an inbound payload could not be turned into a `ChatProtocol`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

impl ChatProtocol {
    /// Build a chat line.
    pub fn chat(sender_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Chat(Chat {
            sender_name: sender_name.into(),
            content: content.into(),
        })
    }

    /// Build a name change request.
    pub fn name_change(name: impl Into<String>) -> Self {
        Self::NameChange(NameChange { name: name.into() })
    }

    /// Parse a message from its encoded form. An empty slice is rejected
    /// before parsing so callers can tell "nothing" apart from "garbage".
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::Empty);
        }
        serde_json::from_slice(bytes).map_err(ProtocolError::Malformed)
    }

    /// Encode the message for sending.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Chat(_) => "chat",
            Self::NameChange(_) => "name_change",
            Self::Unknown => "unknown",
        }
    }
}
