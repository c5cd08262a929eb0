//! # Idempotent Inbox
//!
//! The receiving half of the outbox/inbox pair:
//!
//! 1. [`InboxConsumer`] takes deliveries off the bus one at a time and hands
//!    each decoded envelope to a [`MessageHandler`].
//! 2. [`InboxRecorder`] is the handler that writes the event into the
//!    `inbox` table keyed by `event_id`. A redelivered event hits the unique
//!    constraint and is absorbed as a success.
//! 3. [`InboxRelay`] polls unprocessed rows, dispatches them through a
//!    [`HandlerRegistry`] and marks them processed.
//!
//! The message is acked only after the inbox insert committed, so a crash
//! anywhere before that point leads to redelivery rather than loss.

mod consumer;
mod registry;
mod relay;
mod store;

pub use consumer::{InboxConsumer, InboxRecorder, MessageHandler};
pub use registry::{Dispatch, EventHandler, HandlerError, HandlerRegistry};
pub use relay::{InboxRelay, PollSummary, DEFAULT_BATCH_LIMIT};
pub use store::{InMemoryInboxStore, InboxStore, PgInboxStore};

use chrono::{DateTime, Utc};
use event_bus::BusError;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row of the inbox table
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct InboxEvent {
    pub id: i64,
    /// Identity assigned by the producing outbox; unique
    pub event_id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub trace_context: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Data for a received event; id and timestamps are assigned by storage
#[derive(Debug, Clone, PartialEq)]
pub struct NewInboxEvent {
    pub event_id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub trace_context: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
}

impl InboxError {
    /// True when the broker or database cannot be reached at all
    pub fn is_connection_failure(&self) -> bool {
        match self {
            InboxError::Bus(e) => e.is_connection_failure(),
            InboxError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            InboxError::Handler(_) => false,
        }
    }
}
