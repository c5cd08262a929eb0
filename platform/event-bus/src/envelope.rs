//! # Broker Envelope
//!
//! The JSON body carried by every event message between the outbox relay
//! and the inbox consumer.
//!
//! ## Envelope Fields
//!
//! - `event_id`: Identity assigned by the producing outbox row (idempotency key)
//! - `aggregate_id`: The domain entity the event describes
//! - `event_type`: String tag, also used as the routing key
//! - `payload`: Event-specific data
//! - `created_at`: When the producing transaction wrote the event
//!
//! Trace context does not live in the body; it travels in the
//! [`TRACEPARENT_HEADER`] message header.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BusError, BusResult};

/// Header carrying the W3C trace-context string
pub const TRACEPARENT_HEADER: &str = "traceparent";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    pub event_id: i64,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl BrokerEnvelope {
    /// Serialize the envelope to its JSON wire form
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Decode and validate an envelope from a message body
    ///
    /// Fails for non-JSON bodies, missing fields, and empty `event_type`
    /// or `aggregate_id`.
    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        let envelope: BrokerEnvelope =
            serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> BusResult<()> {
        if self.event_type.trim().is_empty() {
            return Err(BusError::Serialization(
                "event_type must not be empty".to_string(),
            ));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(BusError::Serialization(
                "aggregate_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
