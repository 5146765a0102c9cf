//! Abuse and resource limits
//!
//! - Connection cap: each WebSocket upgrade reserves a slot up front and
//!   holds it until the socket closes; with no slot left the upgrade is
//!   refused with 503
//! - Signal rate limiting per connection (stops one client flooding a frequency)

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response, StatusCode},
    middleware::Next,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::state::Relay;
use crate::types::ConnectionId;

/// Counts live connections against `max_connections`
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    active: Arc<AtomicUsize>,
    /// 0 = unlimited
    max: usize,
}

impl ConnectionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Reserve a slot, or `None` when the relay is full. The slot is
    /// released when the last clone of it is dropped.
    pub fn try_acquire(&self) -> Option<ConnectionSlot> {
        let max = self.max;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .ok()?;

        Some(ConnectionSlot(Arc::new(SlotGuard {
            active: self.active.clone(),
        })))
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A reserved connection slot. Passed from the middleware to the upgrade
/// handler as a request extension.
#[derive(Debug, Clone)]
pub struct ConnectionSlot(Arc<SlotGuard>);

#[derive(Debug)]
struct SlotGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Fixed-window rate limiter keyed by connection
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Map of connection to (signal count, window start)
    requests: Arc<RwLock<HashMap<ConnectionId, (u32, Instant)>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window,
        }
    }

    /// Returns true if allowed, false if rate limited
    pub async fn check(&self, key: ConnectionId) -> bool {
        let now = Instant::now();
        let mut requests = self.requests.write().await;

        match requests.get_mut(&key) {
            Some((count, window_start)) => {
                if now.duration_since(*window_start) >= self.window {
                    *count = 1;
                    *window_start = now;
                    true
                } else if *count >= self.max_requests {
                    false
                } else {
                    *count += 1;
                    true
                }
            }
            None => {
                requests.insert(key, (1, now));
                true
            }
        }
    }

    /// Drop state for a closed connection
    pub async fn forget(&self, key: ConnectionId) {
        self.requests.write().await.remove(&key);
    }

    /// Clean up stale windows (call periodically)
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, (_, window_start)| now.duration_since(*window_start) < self.window * 2);
    }

    pub async fn tracked(&self) -> usize {
        self.requests.read().await.len()
    }
}

/// Periodically prune the signal limiter
pub fn spawn_rate_limit_janitor(relay: Arc<Relay>) {
    let Some(limiter) = relay.signal_limiter.clone() else {
        return;
    };
    let period = relay.config.signal_rate_window.max(Duration::from_secs(1));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            limiter.cleanup().await;
        }
    });
}

/// Reserve a connection slot for the upgrade, or refuse it when the relay is full
pub async fn connection_limit_middleware(
    State(relay): State<Arc<Relay>>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let Some(slot) = relay.connection_slots.try_acquire() else {
        tracing::warn!(
            max_connections = relay.config.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        return Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("Relay is at capacity"))
            .unwrap_or_else(|_| Response::new(Body::empty()));
    };

    request.extensions_mut().insert(slot);
    next.run(request).await
}
