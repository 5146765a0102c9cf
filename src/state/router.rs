//! Signal fan-out
//!
//! A signal goes to every other member of the channel. Each recipient is
//! delivered to concurrently with its own timeout; one slow or dead transport
//! never holds up or fails the others. Nothing is retried or buffered.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

use super::directory::ChannelDirectory;
use super::registry::ConnectionRegistry;
use crate::error::{DeliveryError, RelayError, Result};
use crate::types::{ChannelId, ConnectionId, Payload, Signal};

/// Outbound handle for one connection, implemented by the transport
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, signal: Arc<Signal>) -> std::result::Result<(), DeliveryError>;
}

/// Counts for one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub recipients: usize,
    pub delivered: usize,
    /// Recipient disconnected between the member snapshot and delivery
    pub skipped: usize,
    pub failed: usize,
}

enum DeliveryOutcome {
    Delivered,
    Skipped,
    Failed,
}

pub struct SignalRouter {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<ChannelDirectory>,
    delivery_timeout: Duration,
}

impl SignalRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        directory: Arc<ChannelDirectory>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            directory,
            delivery_timeout,
        }
    }

    pub async fn route(
        &self,
        origin: ConnectionId,
        channel: &ChannelId,
        payload: Payload,
    ) -> Result<RouteReport> {
        let sender = self
            .registry
            .lookup(origin)
            .await
            .map_err(|_| RelayError::UnknownOrigin(origin))?;

        let recipients: Vec<ConnectionId> = self
            .directory
            .members_of(channel)
            .await
            .into_iter()
            .filter(|id| *id != origin)
            .collect();

        let mut report = RouteReport {
            recipients: recipients.len(),
            ..RouteReport::default()
        };

        if recipients.is_empty() {
            tracing::debug!("No listeners on {} for signal from {}", channel, origin);
            return Ok(report);
        }

        let signal = Arc::new(Signal {
            channel: channel.clone(),
            origin,
            user_id: sender.user_id.unwrap_or_default(),
            payload,
        });

        let deliveries = recipients
            .iter()
            .map(|recipient| self.deliver(*recipient, signal.clone()));

        for outcome in join_all(deliveries).await {
            match outcome {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Skipped => report.skipped += 1,
                DeliveryOutcome::Failed => report.failed += 1,
            }
        }

        tracing::debug!(
            channel = %channel,
            origin = %origin,
            recipients = report.recipients,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "Signal routed"
        );

        Ok(report)
    }

    async fn deliver(&self, recipient: ConnectionId, signal: Arc<Signal>) -> DeliveryOutcome {
        let sink = match self.registry.sink(recipient).await {
            Ok(sink) => sink,
            Err(_) => {
                tracing::trace!("Recipient {} already gone, skipping", recipient);
                return DeliveryOutcome::Skipped;
            }
        };

        let failure = match tokio::time::timeout(self.delivery_timeout, sink.deliver(signal)).await
        {
            Ok(Ok(())) => return DeliveryOutcome::Delivered,
            Ok(Err(e)) => RelayError::TransportDeliveryFailure {
                recipient,
                reason: e.to_string(),
            },
            Err(_) => RelayError::TransportDeliveryFailure {
                recipient,
                reason: format!("timed out after {:?}", self.delivery_timeout),
            },
        };

        tracing::debug!("{}", failure);
        DeliveryOutcome::Failed
    }
}
