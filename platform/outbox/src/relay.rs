//! Outbox relay: drains pending outbox rows to the event bus

use event_bus::{BrokerEnvelope, BusError, BusMessage, EventBus, TRACEPARENT_HEADER};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trace_context::Tracer;
use tracing::Instrument;

use crate::{OutboxEvent, OutboxStore};

/// Rows fetched per poll cycle unless overridden
pub const DEFAULT_BATCH_LIMIT: i64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RelayError {
    /// True when the failure is about reaching the broker or the database
    /// at all, so continuing with the next row would fail the same way
    pub fn is_connection_failure(&self) -> bool {
        match self {
            RelayError::Bus(e) => e.is_connection_failure(),
            RelayError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            RelayError::Encode(_) => false,
        }
    }
}

/// Outcome of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Polls the outbox and publishes each pending row
///
/// Each row is published with routing key = `event_type` and a
/// `traceparent` header continuing the trace recorded on the row, then
/// marked published. A failure on one row is logged and the row stays
/// pending for the next cycle; the rest of the batch still goes out.
/// Connection-level failures end the cycle early.
///
/// A single relay instance per outbox table is assumed. Two instances
/// polling the same table may publish a row twice.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    tracer: Tracer,
    batch_limit: i64,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn OutboxStore>, bus: Arc<dyn EventBus>, tracer: Tracer) -> Self {
        Self {
            store,
            bus,
            tracer,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: i64) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Poll at a fixed rate until `shutdown` is cancelled
    ///
    /// Sleeps the full interval after every cycle, whether it succeeded or
    /// failed. A cycle in progress is finished before returning.
    pub async fn run(&self, poll_interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_secs = poll_interval.as_secs(),
            batch_limit = self.batch_limit,
            "Outbox relay started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(summary) if summary.fetched > 0 => {
                    tracing::info!(
                        fetched = summary.fetched,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "Outbox poll cycle complete"
                    );
                }
                Ok(_) => tracing::debug!("No pending outbox events"),
                Err(e) => tracing::error!(error = %e, "Error processing outbox"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        tracing::info!("Outbox relay stopped");
    }

    /// Run a single poll cycle
    pub async fn poll_once(&self) -> Result<PollSummary, RelayError> {
        let mut poll_span = self.tracer.start_span("outbox.poll_and_publish", None);

        let events = match self.store.fetch_pending(self.batch_limit).await {
            Ok(events) => events,
            Err(e) => {
                poll_span.record_error(&e);
                return Err(e.into());
            }
        };

        poll_span.set_attribute("events.count", events.len());
        let mut summary = PollSummary {
            fetched: events.len(),
            ..PollSummary::default()
        };

        if events.is_empty() {
            return Ok(summary);
        }

        tracing::info!(count = events.len(), "Found events to publish");

        for event in &events {
            match self.publish_event(event).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) if e.is_connection_failure() => {
                    tracing::error!(
                        event_id = event.id,
                        event_type = %event.event_type,
                        error = %e,
                        remaining = summary.fetched - summary.succeeded - summary.failed,
                        "Connection lost while publishing, aborting batch"
                    );
                    poll_span.record_error(&e);
                    return Err(e);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        event_id = event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Failed to publish event"
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn publish_event(&self, event: &OutboxEvent) -> Result<(), RelayError> {
        let parent = event
            .trace_context
            .as_deref()
            .and_then(trace_context::parse);

        let mut span = self
            .tracer
            .start_span("outbox.publish_event", parent.as_ref());
        span.set_attribute("event.id", event.id);
        span.set_attribute("event.type", &event.event_type);

        let traceparent = trace_context::serialize(&span);
        let result = self
            .publish_and_mark(event, traceparent)
            .instrument(span.tracing_span().clone())
            .await;

        if let Err(e) = &result {
            span.record_error(e);
        }
        span.end();

        result
    }

    async fn publish_and_mark(
        &self,
        event: &OutboxEvent,
        traceparent: String,
    ) -> Result<(), RelayError> {
        let envelope = BrokerEnvelope {
            event_id: event.id,
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            created_at: event.created_at,
        };
        let body = serde_json::to_vec(&envelope)?;

        let mut message = BusMessage::new(event.event_type.clone(), body);
        if !traceparent.is_empty() {
            message = message.with_header(TRACEPARENT_HEADER, traceparent);
        }

        self.bus.publish(message).await?;
        self.store.mark_published(event.id).await?;

        tracing::info!(
            event_id = event.id,
            event_type = %event.event_type,
            "Published event"
        );
        Ok(())
    }
}
