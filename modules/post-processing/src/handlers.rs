use async_trait::async_trait;
use inbox::{EventHandler, HandlerError, HandlerRegistry, InboxEvent};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::models::{
    OrderCancelledPayload, OrderCreatedPayload, OrderUpdatedPayload, ORDER_CANCELLED,
    ORDER_CREATED, ORDER_UPDATED,
};

/// Registry wiring every order event type to its handler
pub fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register(ORDER_CREATED, Arc::new(OrderCreatedHandler))
        .register(ORDER_UPDATED, Arc::new(OrderUpdatedHandler))
        .register(ORDER_CANCELLED, Arc::new(OrderCancelledHandler));
    registry
}

fn decode<T: DeserializeOwned>(event: &InboxEvent) -> Result<T, HandlerError> {
    Ok(serde_json::from_value(event.payload.clone())?)
}

/// Handle order.created event
///
/// Confirmation email, warehouse notification and analytics are mocked
/// with a log line.
pub struct OrderCreatedHandler;

#[async_trait]
impl EventHandler for OrderCreatedHandler {
    async fn handle(&self, event: &InboxEvent) -> Result<(), HandlerError> {
        let payload: OrderCreatedPayload = decode(event)?;

        tracing::info!(
            event_id = event.event_id,
            order_id = payload.order_id,
            customer = %payload.customer_name,
            total_amount = payload.total_amount,
            "Order created"
        );

        tracing::info!(
            order_id = payload.order_id,
            to = %payload.customer_email,
            "Mock: Sending order confirmation"
        );

        Ok(())
    }
}

/// Handle order.updated event
pub struct OrderUpdatedHandler;

#[async_trait]
impl EventHandler for OrderUpdatedHandler {
    async fn handle(&self, event: &InboxEvent) -> Result<(), HandlerError> {
        let payload: OrderUpdatedPayload = decode(event)?;

        tracing::info!(
            event_id = event.event_id,
            order_id = payload.order_id,
            status = payload.status.as_deref().unwrap_or("unchanged"),
            "Order updated"
        );

        Ok(())
    }
}

/// Handle order.cancelled event
///
/// Refund and inventory release are mocked with a log line.
pub struct OrderCancelledHandler;

#[async_trait]
impl EventHandler for OrderCancelledHandler {
    async fn handle(&self, event: &InboxEvent) -> Result<(), HandlerError> {
        let payload: OrderCancelledPayload = decode(event)?;

        tracing::info!(
            event_id = event.event_id,
            order_id = payload.order_id,
            reason = payload.reason.as_deref().unwrap_or("none given"),
            "Order cancelled"
        );

        tracing::info!(
            order_id = payload.order_id,
            "Mock: Processing refund and releasing inventory"
        );

        Ok(())
    }
}
