use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

use crate::error::RelayError;

/// Server-assigned handle for one live transport session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Spread ids over `shards` buckets using the ULID's random bits
    pub(crate) fn shard(&self, shards: usize) -> usize {
        (u128::from(self.0) % shards as u128) as usize
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A frequency name. Compared as an opaque string, never parsed as a number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Build a channel id from client input. Surrounding whitespace is dropped
    /// and a blank result is rejected.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, RelayError> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(RelayError::MalformedEvent(
                "frequency must not be empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque audio artifact carried by a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Location of a recording held elsewhere (what the mobile client sends today)
    Reference(String),
    /// Raw bytes, base64 encoded on the wire
    Inline(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Reference(r) => r.len(),
            Payload::Inline(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One fan-out unit. Shared between recipients for the duration of a route call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub channel: ChannelId,
    pub origin: ConnectionId,
    pub user_id: String,
    pub payload: Payload,
}

/// Per-connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Transport accepted, no join yet
    Connecting,
    Idle,
    /// Advisory only, has no effect on routing
    Talking,
    /// Terminal
    Disconnected,
}

impl SessionState {
    pub fn is_joined(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Talking)
    }
}
