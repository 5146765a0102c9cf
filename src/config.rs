//! Relay configuration loaded from environment variables
//!
//! Every setting has a default, so an empty environment yields a working
//! server on port 3000 (the port the mobile client dials).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Upper bound on a single recipient delivery
    pub delivery_timeout: Duration,
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    pub max_channel_len: usize,
    pub max_user_id_len: usize,
    /// Maximum decoded payload size in bytes
    pub max_payload_bytes: usize,
    /// Signals allowed per connection per window (0 = unlimited)
    pub signal_rate_max: u32,
    pub signal_rate_window: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            delivery_timeout: Duration::from_millis(2000),
            outbound_buffer: 64,
            max_connections: 0,
            max_channel_len: 64,
            max_user_id_len: 64,
            max_payload_bytes: 1024 * 1024,
            signal_rate_max: 20,
            signal_rate_window: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            bind_addr: env_or("RELAY_BIND_ADDR", defaults.bind_addr),
            delivery_timeout: Duration::from_millis(env_or(
                "RELAY_DELIVERY_TIMEOUT_MS",
                defaults.delivery_timeout.as_millis() as u64,
            )),
            outbound_buffer: env_or("RELAY_OUTBOUND_BUFFER", defaults.outbound_buffer).max(1),
            max_connections: env_or("RELAY_MAX_CONNECTIONS", defaults.max_connections),
            max_channel_len: env_or("RELAY_MAX_CHANNEL_LEN", defaults.max_channel_len),
            max_user_id_len: env_or("RELAY_MAX_USER_ID_LEN", defaults.max_user_id_len),
            max_payload_bytes: env_or("RELAY_MAX_PAYLOAD_BYTES", defaults.max_payload_bytes),
            signal_rate_max: env_or("RELAY_SIGNAL_RATE_MAX", defaults.signal_rate_max),
            signal_rate_window: Duration::from_secs(env_or(
                "RELAY_SIGNAL_RATE_WINDOW",
                defaults.signal_rate_window.as_secs(),
            )),
        };

        tracing::info!(
            bind_addr = %config.bind_addr,
            delivery_timeout_ms = config.delivery_timeout.as_millis() as u64,
            max_connections = config.max_connections,
            signal_rate_max = config.signal_rate_max,
            "Relay config loaded"
        );

        config
    }

    /// Largest WebSocket message accepted from a client: the base64 form of
    /// a maximal payload plus room for the JSON envelope.
    pub fn max_frame_bytes(&self) -> usize {
        self.max_payload_bytes
            .div_ceil(3)
            .saturating_mul(4)
            .saturating_add(FRAME_ENVELOPE_BYTES)
    }
}

const FRAME_ENVELOPE_BYTES: usize = 4096;

/// Parse an env var, falling back to `default` when unset or invalid
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
