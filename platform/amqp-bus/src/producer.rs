//! Event producer: one scoped channel per publish

use crate::envelope::{ExchangeSpec, MessageEnvelope, MessageHeaders};
use crate::trace_context::{self, TraceContext};
use crate::{Broker, BrokerChannel, BusError, BusResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;

/// An event that receives its timestamp when it is sent
///
/// The unstamped type is what callers build; the stamped type is what goes
/// on the wire. Callers therefore cannot choose the timestamp.
pub trait DomainEvent: Send {
    type Stamped: Serialize + Send;

    fn stamp(self, at: DateTime<Utc>) -> Self::Stamped;
}

/// Publishes domain events to a topic exchange
///
/// The connection is shared; every publish opens its own channel and
/// releases it before returning, so concurrent publishes never contend on
/// a channel. The producer never retries: failures go back to the caller.
#[derive(Debug, Clone)]
pub struct EventProducer {
    broker: Arc<dyn Broker>,
}

impl EventProducer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Stamp, serialize and publish `event`
    ///
    /// # Arguments
    /// * `event` - Unstamped domain event
    /// * `exchange` - Topic exchange name (declared durable, not auto-deleted)
    /// * `routing_key` - Routing key for the topic exchange
    /// * `active` - Trace the publish belongs to; `None` starts a new trace
    ///
    /// # Returns
    /// * `Ok(stamped)` once the broker accepted the frame
    /// * `Err(BusError)` on invalid routing, serialization or transport failure
    pub async fn publish<E: DomainEvent>(
        &self,
        event: E,
        exchange: &str,
        routing_key: &str,
        active: Option<&TraceContext>,
    ) -> BusResult<E::Stamped> {
        if exchange.trim().is_empty() {
            return Err(BusError::InvalidRouting("exchange name is empty".to_string()));
        }
        if routing_key.trim().is_empty() {
            return Err(BusError::InvalidRouting("routing key is empty".to_string()));
        }

        let channel = ScopedChannel::open(self.broker.as_ref()).await?;
        let result = self
            .publish_on(channel.get(), event, exchange, routing_key, active)
            .await;
        channel.release().await;

        result
    }

    async fn publish_on<E: DomainEvent>(
        &self,
        channel: &dyn BrokerChannel,
        event: E,
        exchange: &str,
        routing_key: &str,
        active: Option<&TraceContext>,
    ) -> BusResult<E::Stamped> {
        channel.declare_exchange(&ExchangeSpec::topic(exchange)).await?;

        let stamped = event.stamp(Utc::now());
        // serde_json leaves non-ASCII characters unescaped
        let body = serde_json::to_vec(&stamped)?;

        let span = trace_context::start_producer_span(
            "publish",
            active,
            exchange,
            routing_key,
            body.len(),
        );

        let mut headers = MessageHeaders::default();
        trace_context::inject(&mut headers, Some(span.context()));

        tracing::info!(
            parent: span.span(),
            exchange = %exchange,
            routing_key = %routing_key,
            body = %String::from_utf8_lossy(&body),
            "Publishing event"
        );

        let envelope = MessageEnvelope::new(exchange, routing_key, body).with_headers(headers);
        match channel.publish(envelope).instrument(span.span().clone()).await {
            Ok(()) => {
                span.record_success();
                Ok(stamped)
            }
            Err(e) => {
                span.record_error(&e);
                tracing::error!(
                    parent: span.span(),
                    exchange = %exchange,
                    routing_key = %routing_key,
                    error = %e,
                    "Publish failed"
                );
                Err(e)
            }
        }
    }
}

/// A channel that is closed when the publish is done
///
/// `release` closes it inline. If the publish future is dropped before
/// that, `Drop` closes the channel on a background task.
struct ScopedChannel {
    channel: Arc<dyn BrokerChannel>,
    released: bool,
}

impl ScopedChannel {
    async fn open(broker: &dyn Broker) -> BusResult<Self> {
        let channel = broker.open_channel().await?;
        Ok(Self {
            channel,
            released: false,
        })
    }

    fn get(&self) -> &dyn BrokerChannel {
        self.channel.as_ref()
    }

    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.channel.close().await {
            tracing::warn!(error = %e, "Failed to close publish channel");
        }
    }
}

impl Drop for ScopedChannel {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let channel = Arc::clone(&self.channel);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = channel.close().await {
                        tracing::warn!(error = %e, "Failed to close abandoned publish channel");
                    }
                });
            }
            Err(_) => tracing::warn!("Publish channel dropped outside a runtime; not closed"),
        }
    }
}
