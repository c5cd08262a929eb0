//! Event type → business handler mapping

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::InboxEvent;

/// Business logic for one event type
///
/// Handlers run at least once per event and may run again after a crash
/// between execution and mark-processed, so they must tolerate retries.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InboxEvent) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("processing failed: {0}")]
    Failed(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::InvalidPayload(e.to_string())
    }
}

/// Result of routing an event through the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    /// No handler is registered for the event type
    Unhandled,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for an event type
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> &mut Self {
        self.handlers.insert(event_type.into(), handler);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Registered event types, sorted
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub async fn dispatch(&self, event: &InboxEvent) -> Result<Dispatch, HandlerError> {
        match self.handlers.get(&event.event_type) {
            Some(handler) => {
                handler.handle(event).await?;
                Ok(Dispatch::Handled)
            }
            None => Ok(Dispatch::Unhandled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(&self, _event: &InboxEvent) -> Result<(), HandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(event_type: &str) -> InboxEvent {
        InboxEvent {
            id: 1,
            event_id: 10,
            aggregate_id: "1".to_string(),
            event_type: event_type.to_string(),
            payload: json!({}),
            trace_context: None,
            received_at: Utc::now(),
            processed: false,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_event_type() {
        let created = Arc::new(Counting(AtomicUsize::new(0)));
        let mut registry = HandlerRegistry::new();
        registry.register("order.created", created.clone());

        let outcome = registry.dispatch(&event("order.created")).await.unwrap();
        assert_eq!(outcome, Dispatch::Handled);
        assert_eq!(created.0.load(Ordering::SeqCst), 1);

        let outcome = registry.dispatch(&event("order.shipped")).await.unwrap();
        assert_eq!(outcome, Dispatch::Unhandled);
        assert_eq!(created.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_types_are_sorted() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("order.updated", Arc::new(Counting(AtomicUsize::new(0))))
            .register("order.cancelled", Arc::new(Counting(AtomicUsize::new(0))));

        assert_eq!(registry.event_types(), vec!["order.cancelled", "order.updated"]);
        assert!(registry.contains("order.updated"));
        assert!(!registry.contains("order.created"));
    }
}
