//! Inbox consumer: bus deliveries → durable inbox rows

use async_trait::async_trait;
use event_bus::{BrokerEnvelope, Delivery, EventBus, Subscription, TRACEPARENT_HEADER};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use trace_context::Tracer;
use tracing::Instrument;

use crate::{InboxError, InboxStore, NewInboxEvent};

/// Receives each decoded envelope exactly once per delivery
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Returning `Ok` acks the delivery, `Err` nacks it for redelivery
    async fn handle(
        &self,
        envelope: BrokerEnvelope,
        traceparent: Option<String>,
    ) -> Result<(), InboxError>;
}

/// Subscribes to the bus and drives a [`MessageHandler`]
///
/// Deliveries are processed strictly one at a time. A body that does not
/// decode as a [`BrokerEnvelope`] is nacked without reaching the handler.
pub struct InboxConsumer {
    bus: Arc<dyn EventBus>,
    subscription: Subscription,
}

impl InboxConsumer {
    pub fn new(bus: Arc<dyn EventBus>, subscription: Subscription) -> Self {
        Self { bus, subscription }
    }

    /// Consume until `shutdown` is cancelled or the delivery stream ends
    ///
    /// Fails only when subscribing fails or the broker connection is lost.
    pub async fn consume(
        &self,
        handler: &dyn MessageHandler,
        shutdown: CancellationToken,
    ) -> Result<(), InboxError> {
        let mut deliveries = self.bus.subscribe(&self.subscription).await?;

        tracing::info!(
            queue = %self.subscription.queue,
            pattern = %self.subscription.pattern,
            "Inbox consumer started. Waiting for messages..."
        );

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process_delivery(handler, delivery).await?,
                Some(Err(e)) if e.is_connection_failure() => return Err(e.into()),
                Some(Err(e)) => tracing::error!(error = %e, "Failed to receive delivery"),
                None => {
                    tracing::info!("Delivery stream ended");
                    break;
                }
            }
        }

        tracing::info!("Inbox consumer stopped");
        Ok(())
    }

    async fn process_delivery(
        &self,
        handler: &dyn MessageHandler,
        delivery: Delivery,
    ) -> Result<(), InboxError> {
        let envelope = match BrokerEnvelope::decode(delivery.payload()) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(
                    subject = %delivery.subject(),
                    error = %e,
                    "Rejecting undecodable message"
                );
                return settle(delivery.nack().await);
            }
        };

        let traceparent = delivery
            .header(TRACEPARENT_HEADER)
            .filter(|value| !value.is_empty())
            .map(str::to_owned);

        let event_id = envelope.event_id;
        match handler.handle(envelope, traceparent).await {
            Ok(()) => settle(delivery.ack().await),
            Err(e) => {
                tracing::error!(
                    event_id,
                    subject = %delivery.subject(),
                    error = %e,
                    "Handler failed, requeueing message"
                );
                settle(delivery.nack().await)
            }
        }
    }

    /// Release the broker connection; safe to call more than once
    pub async fn close(&self) -> Result<(), InboxError> {
        self.bus.close().await?;
        Ok(())
    }
}

/// A failed ack/nack is logged; the broker redelivers unsettled messages.
/// Only a lost connection stops the consumer.
fn settle(result: event_bus::BusResult<()>) -> Result<(), InboxError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_connection_failure() => Err(e.into()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to settle delivery");
            Ok(())
        }
    }
}

/// Records received events into the inbox table
///
/// The stored trace context is the serialization of the
/// `inbox.process_event` span, so the relay continues the same trace.
pub struct InboxRecorder {
    store: Arc<dyn InboxStore>,
    tracer: Tracer,
}

impl InboxRecorder {
    pub fn new(store: Arc<dyn InboxStore>, tracer: Tracer) -> Self {
        Self { store, tracer }
    }
}

#[async_trait]
impl MessageHandler for InboxRecorder {
    async fn handle(
        &self,
        envelope: BrokerEnvelope,
        traceparent: Option<String>,
    ) -> Result<(), InboxError> {
        let parent = traceparent.as_deref().and_then(trace_context::parse);
        let mut span = self.tracer.start_span("inbox.process_event", parent.as_ref());
        span.set_attribute("event.id", envelope.event_id);
        span.set_attribute("event.type", &envelope.event_type);

        let serialized = trace_context::serialize(&span);
        let event = NewInboxEvent {
            event_id: envelope.event_id,
            aggregate_id: envelope.aggregate_id,
            event_type: envelope.event_type,
            payload: envelope.payload,
            trace_context: (!serialized.is_empty()).then_some(serialized),
        };

        tracing::info!(
            parent: span.tracing_span(),
            event_id = event.event_id,
            event_type = %event.event_type,
            "Processing event"
        );

        let recorded = self
            .store
            .record(&event)
            .instrument(span.tracing_span().clone())
            .await;

        match recorded {
            Ok(true) => tracing::info!(
                parent: span.tracing_span(),
                event_id = event.event_id,
                "Event saved to inbox table"
            ),
            Ok(false) => tracing::info!(
                parent: span.tracing_span(),
                event_id = event.event_id,
                "Duplicate event ignored (already in inbox)"
            ),
            Err(e) => {
                tracing::error!(
                    parent: span.tracing_span(),
                    event_id = event.event_id,
                    error = %e,
                    "Failed to save event to inbox"
                );
                span.record_error(&e);
                return Err(e.into());
            }
        }

        Ok(())
    }
}
