//! Inbox relay: unprocessed inbox rows → business logic

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trace_context::{SpanContext, Tracer};
use tracing::Instrument;

use crate::{Dispatch, HandlerRegistry, InboxError, InboxEvent, InboxStore};

/// Rows fetched per poll cycle unless overridden
pub const DEFAULT_BATCH_LIMIT: i64 = 100;

/// Outcome of one poll cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Polls the inbox and executes business logic for each unprocessed row
///
/// A row is marked processed only after its handler succeeded; a failing
/// row is logged, left unprocessed and retried on the next cycle without
/// holding back the rest of the batch. Event types with no registered
/// handler are logged and marked processed.
pub struct InboxRelay {
    store: Arc<dyn InboxStore>,
    registry: HandlerRegistry,
    tracer: Tracer,
    batch_limit: i64,
}

impl InboxRelay {
    pub fn new(store: Arc<dyn InboxStore>, registry: HandlerRegistry, tracer: Tracer) -> Self {
        Self {
            store,
            registry,
            tracer,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: i64) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    /// Poll at a fixed rate until `shutdown` is cancelled
    pub async fn run(&self, poll_interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            poll_interval_secs = poll_interval.as_secs(),
            batch_limit = self.batch_limit,
            handlers = ?self.registry.event_types(),
            "Inbox relay started"
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
                        "Inbox poll cycle complete"
                    );
                }
                Ok(_) => tracing::debug!("No unprocessed inbox messages"),
                Err(e) => tracing::error!(error = %e, "Error processing inbox"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        tracing::info!("Inbox relay stopped");
    }

    /// Run a single poll cycle
    pub async fn poll_once(&self) -> Result<PollSummary, InboxError> {
        let mut poll_span = self.tracer.start_span("inbox.poll_and_process", None);

        let messages = match self.store.fetch_unprocessed(self.batch_limit).await {
            Ok(messages) => messages,
            Err(e) => {
                poll_span.record_error(&e);
                return Err(e.into());
            }
        };

        poll_span.set_attribute("messages.count", messages.len());
        let mut summary = PollSummary {
            fetched: messages.len(),
            ..PollSummary::default()
        };

        if messages.is_empty() {
            return Ok(summary);
        }

        tracing::info!(count = messages.len(), "Found messages to process");

        for message in &messages {
            match self.process_message(message).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) if e.is_connection_failure() => {
                    tracing::error!(
                        message_id = message.id,
                        event_type = %message.event_type,
                        error = %e,
                        "Connection lost while processing, aborting batch"
                    );
                    poll_span.record_error(&e);
                    return Err(e);
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::error!(
                        message_id = message.id,
                        event_id = message.event_id,
                        event_type = %message.event_type,
                        error = %e,
                        "Failed to process message"
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn process_message(&self, message: &InboxEvent) -> Result<(), InboxError> {
        let parent = message
            .trace_context
            .as_deref()
            .and_then(trace_context::parse);

        let mut span = self
            .tracer
            .start_span("inbox.process_message", parent.as_ref());
        span.set_attribute("message.id", message.id);
        span.set_attribute("event.type", &message.event_type);

        let context = span.context().clone();
        let result = self
            .execute_and_mark(message, context)
            .instrument(span.tracing_span().clone())
            .await;

        if let Err(e) = &result {
            span.record_error(e);
        }
        span.end();

        result
    }

    async fn execute_and_mark(
        &self,
        message: &InboxEvent,
        parent: SpanContext,
    ) -> Result<(), InboxError> {
        let mut business_span = self.tracer.start_span("business_logic.execute", Some(&parent));
        business_span.set_attribute("event.type", &message.event_type);

        tracing::info!(event_type = %message.event_type, "Executing business logic");

        let outcome = self
            .registry
            .dispatch(message)
            .instrument(business_span.tracing_span().clone())
            .await;

        match outcome {
            Ok(Dispatch::Handled) => {}
            Ok(Dispatch::Unhandled) => {
                tracing::warn!(event_type = %message.event_type, "Unknown event type");
            }
            Err(e) => {
                business_span.record_error(&e);
                return Err(e.into());
            }
        }
        business_span.end();

        self.store.mark_processed(message.id).await?;

        tracing::info!(
            message_id = message.id,
            event_type = %message.event_type,
            "Processed message"
        );
        Ok(())
    }
}
