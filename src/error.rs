use crate::types::{ChannelId, ConnectionId, SessionState};

/// Errors raised by the relay core and the gateway boundary
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    /// Connection is already gone. Callers treat this as a benign no-op.
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    #[error("signal from unregistered connection {0}")]
    UnknownOrigin(ConnectionId),

    /// Per-recipient send failure. Never escapes the router's fan-out loop.
    #[error("delivery to {recipient} failed: {reason}")]
    TransportDeliveryFailure {
        recipient: ConnectionId,
        reason: String,
    },

    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("cannot {action} while {from:?}")]
    InvalidTransition {
        from: SessionState,
        action: &'static str,
    },

    #[error("not tuned to frequency {0}")]
    NotInChannel(ChannelId),

    #[error("signal rate limit exceeded")]
    RateLimited,
}

impl RelayError {
    /// Stable code sent to clients in error frames
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::UnknownOrigin(_) => "UNKNOWN_ORIGIN",
            RelayError::TransportDeliveryFailure { .. } => "DELIVERY_FAILED",
            RelayError::MalformedEvent(_) => "MALFORMED_EVENT",
            RelayError::InvalidTransition { .. } => "INVALID_TRANSITION",
            RelayError::NotInChannel(_) => "NOT_IN_CHANNEL",
            RelayError::RateLimited => "RATE_LIMITED",
        }
    }
}

/// Failure reported by a delivery sink. The router attaches the recipient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let id = ConnectionId::new();
        assert_eq!(RelayError::NotFound(id).code(), "NOT_FOUND");
        assert_eq!(RelayError::UnknownOrigin(id).code(), "UNKNOWN_ORIGIN");
        assert_eq!(
            RelayError::MalformedEvent("x".into()).code(),
            "MALFORMED_EVENT"
        );
        assert_eq!(RelayError::RateLimited.code(), "RATE_LIMITED");
    }

    #[test]
    fn test_error_messages() {
        let err = RelayError::InvalidTransition {
            from: SessionState::Connecting,
            action: "start talking",
        };
        assert_eq!(err.to_string(), "cannot start talking while Connecting");

        let ch = ChannelId::new("20").unwrap();
        assert_eq!(
            RelayError::NotInChannel(ch).to_string(),
            "not tuned to frequency 20"
        );
    }
}
