//! WebSocket message dispatch
//!
//! Validates each client message at the boundary, then drives the session
//! manager. Returns the frame (if any) to send straight back to the client.

use std::sync::Arc;

use crate::error::RelayError;
use crate::protocol::{ClientMessage, InboundEvent, ServerMessage};
use crate::state::Relay;
use crate::types::ConnectionId;

/// Handle one client message and return an optional response
pub async fn handle_message(
    msg: ClientMessage,
    conn: ConnectionId,
    relay: &Arc<Relay>,
) -> Option<ServerMessage> {
    let event = match msg.validate(&relay.config) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!("Rejected event from {}: {}", conn, e);
            return Some(ServerMessage::error(&e));
        }
    };

    match event {
        InboundEvent::Join { channel, user_id } => {
            match relay.sessions.join(conn, channel.clone(), user_id).await {
                Ok(_) => {
                    let members = relay.directory.members_of(&channel).await.len();
                    Some(ServerMessage::Joined {
                        frequency: channel.as_str().to_string(),
                        members,
                    })
                }
                Err(e) => error_reply(conn, e),
            }
        }

        InboundEvent::Signal { channel, payload } => {
            if let Some(limiter) = &relay.signal_limiter {
                if !limiter.check(conn).await {
                    tracing::warn!("Signal rate limit hit for {}", conn);
                    return Some(ServerMessage::error(&RelayError::RateLimited));
                }
            }

            // Fire and forget: the sender never learns who heard it
            match relay.sessions.signal(conn, channel, payload).await {
                Ok(_) => None,
                Err(e) => error_reply(conn, e),
            }
        }

        InboundEvent::TalkStart => match relay.sessions.talk_start(conn).await {
            Ok(_) => None,
            Err(e) => error_reply(conn, e),
        },

        InboundEvent::TalkStop => match relay.sessions.talk_stop(conn).await {
            Ok(_) => None,
            Err(e) => error_reply(conn, e),
        },

        InboundEvent::Leave => {
            relay.sessions.disconnect(conn).await;
            None
        }
    }
}

fn error_reply(conn: ConnectionId, err: RelayError) -> Option<ServerMessage> {
    match err {
        // The connection is gone; there is nobody to answer
        RelayError::NotFound(_) | RelayError::UnknownOrigin(_) => {
            tracing::warn!("Dropping event from {}: {}", conn, err);
            None
        }
        other => {
            tracing::debug!("Event from {} refused: {}", conn, other);
            Some(ServerMessage::error(&other))
        }
    }
}
