//! # EventBus Abstraction
//!
//! The broker channel that sits between the outbox relay and the inbox
//! consumer. Producers publish with a routing key (the event type) and
//! optional headers; consumers bind a durable queue to a wildcard pattern
//! and settle every delivery with an ack or a nack.
//!
//! ## Delivery contract
//!
//! - Publishing is persistent: `publish` returns only after the broker has
//!   accepted the message.
//! - Consumption is at-least-once with a prefetch of exactly 1: the next
//!   delivery on a queue is handed out only after the current one is acked
//!   or nacked. A nack requeues the message for redelivery.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation using NATS JetStream
//! - **InMemoryBus**: Test/dev implementation using process-local queues
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BusMessage, EventBus, InMemoryBus, Subscription};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = InMemoryBus::new();
//! let subscription = Subscription::new("inbox_queue", "order.*");
//! let mut deliveries = bus.subscribe(&subscription).await?;
//!
//! bus.publish(BusMessage::new("order.created", b"{}".to_vec())).await?;
//!
//! if let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received {} bytes on {}", delivery.payload().len(), delivery.subject());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod envelope;
mod inmemory_bus;
mod nats_bus;

pub use envelope::{BrokerEnvelope, TRACEPARENT_HEADER};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// A message travelling through the broker
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Subject the message was published to (the routing key)
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Header metadata, e.g. `traceparent`
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    /// Create a new bus message without headers
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    /// Attach a header to the message
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A durable queue bound to a subject pattern
///
/// Patterns use NATS subject wildcards:
/// - `*` matches exactly one token (`order.*` matches `order.created`)
/// - `>` matches one or more trailing tokens (`order.>` matches `order.item.added`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub queue: String,
    pub pattern: String,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            pattern: pattern.into(),
        }
    }
}

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acker: Send + Sync {
    /// Confirm the delivery; the broker will not redeliver it
    async fn ack(&self) -> BusResult<()>;

    /// Reject the delivery and requeue it for redelivery
    async fn nack(&self) -> BusResult<()>;
}

/// A message handed to a consumer that must be acked or nacked
pub struct Delivery {
    message: BusMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: BusMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.message.header(name)
    }

    /// Acknowledge the delivery
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Negatively acknowledge the delivery, requeueing it
    pub async fn nack(self) -> BusResult<()> {
        self.acker.nack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries for one subscription
pub type DeliveryStream = BoxStream<'static, BusResult<Delivery>>;

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe: {0}")]
    Subscribe(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to settle delivery: {0}")]
    Ack(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("bus connection is closed")]
    Closed,
}

impl BusError {
    /// True when the failure concerns the broker connection itself rather
    /// than a single message
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Closed)
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core broker abstraction for publish and acknowledged consumption
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message persistently
    ///
    /// The message subject is the routing key. Headers travel with the
    /// message and are visible to consumers.
    async fn publish(&self, message: BusMessage) -> BusResult<()>;

    /// Bind a durable queue to a pattern and stream its deliveries
    ///
    /// At most one delivery per queue is outstanding at any time; the
    /// stream yields the next one after the previous is settled.
    async fn subscribe(&self, subscription: &Subscription) -> BusResult<DeliveryStream>;

    /// Release the broker connection
    ///
    /// Idempotent. After close, publishing fails with [`BusError::Closed`]
    /// and delivery streams end.
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

/// Check if a subject matches a subscription pattern
///
/// `*` matches exactly one token and `>` matches all remaining tokens (at
/// least one).
pub fn matches_pattern(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

/// Reject empty patterns and patterns with empty tokens or a non-terminal `>`
pub(crate) fn validate_pattern(pattern: &str) -> BusResult<()> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    if pattern.is_empty() || tokens.iter().any(|t| t.is_empty()) {
        return Err(BusError::InvalidSubject(pattern.to_string()));
    }
    if let Some(pos) = tokens.iter().position(|t| *t == ">") {
        if pos != tokens.len() - 1 {
            return Err(BusError::InvalidSubject(pattern.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("order.created", "order.created"));

        assert!(matches_pattern("order.created", "order.*"));
        assert!(matches_pattern("order.cancelled", "*.cancelled"));
        assert!(!matches_pattern("order.item.added", "order.*"));

        assert!(matches_pattern("order.item.added", "order.>"));
        assert!(matches_pattern("order.created", ">"));
        assert!(!matches_pattern("order", "order.>"));
        assert!(!matches_pattern("invoice.created", "order.*"));

        assert!(matches_pattern("single", "*"));
        assert!(!matches_pattern("one.two", "one"));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(validate_pattern("order.*").is_ok());
        assert!(validate_pattern("order.>").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("order..created").is_err());
        assert!(validate_pattern("order.>.created").is_err());
    }

    #[test]
    fn test_bus_message_headers() {
        let msg = BusMessage::new("order.created", b"{}".to_vec())
            .with_header(TRACEPARENT_HEADER, "00-abc-def-01");

        assert_eq!(msg.header("traceparent"), Some("00-abc-def-01"));
        assert_eq!(msg.header("missing"), None);
    }

    #[test]
    fn test_connection_failure_classification() {
        assert!(BusError::Closed.is_connection_failure());
        assert!(BusError::Connection("reset".into()).is_connection_failure());
        assert!(!BusError::Publish("nope".into()).is_connection_failure());
    }
}
