pub mod directory;
pub mod registry;
pub mod router;
pub mod session;

pub use directory::{ChannelDirectory, ChannelSummary, JoinOutcome};
pub use registry::{Connection, ConnectionRegistry};
pub use router::{DeliverySink, RouteReport, SignalRouter};
pub use session::SessionManager;

use std::sync::Arc;

use crate::abuse::{ConnectionLimiter, RateLimiter};
use crate::config::RelayConfig;

/// Shared relay state handed to every handler
pub struct Relay {
    pub config: RelayConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<ChannelDirectory>,
    pub sessions: SessionManager,
    /// Live WebSocket connections against `max_connections`
    pub connection_slots: ConnectionLimiter,
    /// Per-connection signal limiter (None = disabled)
    pub signal_limiter: Option<RateLimiter>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let directory = Arc::new(ChannelDirectory::new());
        let registry = Arc::new(ConnectionRegistry::new(directory.clone()));
        let router = SignalRouter::new(
            registry.clone(),
            directory.clone(),
            config.delivery_timeout,
        );
        let sessions = SessionManager::new(registry.clone(), directory.clone(), router);

        let signal_limiter = (config.signal_rate_max > 0)
            .then(|| RateLimiter::new(config.signal_rate_max, config.signal_rate_window));

        Self {
            connection_slots: ConnectionLimiter::new(config.max_connections),
            config,
            registry,
            directory,
            sessions,
            signal_limiter,
        }
    }
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
