//! # Transactional Outbox
//!
//! Events are written to the `outbox` table inside the same database
//! transaction as the domain change they describe, then drained to the
//! event bus by the [`OutboxRelay`].
//!
//! ## Row lifecycle
//!
//! A row is inserted with `published = false` by [`enqueue_event`] and
//! flipped to `published = true` exactly once by the relay after the bus
//! accepted it. Rows are never deleted here.
//!
//! ## Delivery guarantee
//!
//! At-least-once: a crash between publish and mark-published publishes the
//! row again on the next poll. Consumers deduplicate by `event_id`.

mod relay;
mod store;

pub use relay::{OutboxRelay, PollSummary, RelayError, DEFAULT_BATCH_LIMIT};
pub use store::{InMemoryOutboxStore, OutboxStore, PgOutboxStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Postgres, Transaction};

/// A row of the outbox table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// `traceparent` of the span that produced the event, if any
    pub trace_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
}

/// Data for a new outbox row; id and timestamps are assigned by storage
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub trace_context: Option<String>,
}

impl NewOutboxEvent {
    pub fn new(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
            trace_context: None,
        }
    }

    /// Record the producing span; empty strings are stored as NULL
    pub fn with_trace_context(mut self, traceparent: impl Into<String>) -> Self {
        let traceparent = traceparent.into();
        self.trace_context = (!traceparent.is_empty()).then_some(traceparent);
        self
    }
}

/// Insert an event into the outbox as part of the caller's transaction
///
/// The caller must use the same transaction for the domain write, so that
/// the event and its cause commit or roll back together.
pub async fn enqueue_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<i64, sqlx::Error> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO outbox (aggregate_id, event_type, payload, trace_context)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(&event.aggregate_id)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(&event.trace_context)
    .fetch_one(&mut **tx)
    .await?;

    tracing::debug!(
        outbox_id = id,
        event_type = %event.event_type,
        aggregate_id = %event.aggregate_id,
        "Event enqueued to outbox"
    );

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_trace_context_is_not_stored() {
        let event = NewOutboxEvent::new("1", "order.created", json!({})).with_trace_context("");
        assert!(event.trace_context.is_none());

        let event = NewOutboxEvent::new("1", "order.created", json!({}))
            .with_trace_context("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        assert!(event.trace_context.is_some());
    }
}
