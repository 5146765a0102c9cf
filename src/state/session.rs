//! Per-connection lifecycle
//!
//! ```text
//! Connecting --join--> Idle <--talk_start/talk_stop--> Talking
//!      \                 \                               /
//!       +-----------------+---- disconnect -------------+--> Disconnected
//! ```
//!
//! A disconnected connection is gone from the registry, so nothing can move
//! it back into another state.

use std::sync::Arc;

use super::directory::{ChannelDirectory, JoinOutcome};
use super::registry::ConnectionRegistry;
use super::router::{DeliverySink, RouteReport, SignalRouter};
use crate::error::{RelayError, Result};
use crate::types::{ChannelId, ConnectionId, Payload, SessionState};

pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<ChannelDirectory>,
    router: SignalRouter,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<ChannelDirectory>,
        router: SignalRouter,
    ) -> Self {
        Self {
            registry,
            directory,
            router,
        }
    }

    /// Accept a new transport
    pub async fn open(&self, sink: Arc<dyn DeliverySink>) -> ConnectionId {
        let id = self.registry.register(sink).await;
        tracing::info!("Connection {} opened", id);
        id
    }

    /// Tune a connection to `channel`, moving it to `Idle` on its first join
    pub async fn join(
        &self,
        id: ConnectionId,
        channel: ChannelId,
        user_id: String,
    ) -> Result<JoinOutcome> {
        // Fail fast for connections that are already gone
        self.registry.lookup(id).await?;

        let outcome = self.directory.join(&channel, id).await;

        let updated = self
            .registry
            .update(id, |conn| {
                conn.user_id = Some(user_id.clone());
                conn.channel = Some(channel.clone());
                if conn.state == SessionState::Connecting {
                    conn.state = SessionState::Idle;
                }
                Ok(())
            })
            .await;

        if let Err(e) = updated {
            // Disconnected underneath us; undo the membership
            self.directory.leave(id).await;
            return Err(e);
        }

        tracing::info!("{} ({}) tuned to {}", user_id, id, channel);
        Ok(outcome)
    }

    pub async fn talk_start(&self, id: ConnectionId) -> Result<SessionState> {
        self.registry
            .update(id, |conn| match conn.state {
                SessionState::Idle | SessionState::Talking => {
                    conn.state = SessionState::Talking;
                    Ok(conn.state)
                }
                from => Err(RelayError::InvalidTransition {
                    from,
                    action: "start talking",
                }),
            })
            .await
    }

    pub async fn talk_stop(&self, id: ConnectionId) -> Result<SessionState> {
        self.registry
            .update(id, |conn| match conn.state {
                SessionState::Idle | SessionState::Talking => {
                    conn.state = SessionState::Idle;
                    Ok(conn.state)
                }
                from => Err(RelayError::InvalidTransition {
                    from,
                    action: "stop talking",
                }),
            })
            .await
    }

    /// Route a completed transmission to the rest of the channel.
    ///
    /// The sender must currently be tuned to `channel`. A finished
    /// transmission also ends the talking state.
    pub async fn signal(
        &self,
        id: ConnectionId,
        channel: ChannelId,
        payload: Payload,
    ) -> Result<RouteReport> {
        let conn = self
            .registry
            .lookup(id)
            .await
            .map_err(|_| RelayError::UnknownOrigin(id))?;

        if conn.channel.as_ref() != Some(&channel) {
            return Err(RelayError::NotInChannel(channel));
        }

        let report = self.router.route(id, &channel, payload).await?;

        let _ = self
            .registry
            .update(id, |conn| {
                if conn.state == SessionState::Talking {
                    conn.state = SessionState::Idle;
                }
                Ok(())
            })
            .await;

        Ok(report)
    }

    /// Tear a connection down. Returns `false` if it was already gone, which
    /// makes duplicate close notifications from the transport harmless.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        match self.registry.remove(id).await {
            Ok(conn) => {
                tracing::info!(
                    "Connection {} closed (user={:?}, channel={:?})",
                    id,
                    conn.user_id,
                    conn.channel.as_ref().map(ChannelId::as_str)
                );
                true
            }
            Err(_) => {
                tracing::debug!("Duplicate disconnect for {}", id);
                false
            }
        }
    }

    pub async fn state(&self, id: ConnectionId) -> SessionState {
        self.registry
            .lookup(id)
            .await
            .map(|conn| conn.state)
            .unwrap_or(SessionState::Disconnected)
    }
}
