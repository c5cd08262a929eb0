//! NATS JetStream implementation of the EventBus trait

use crate::{
    validate_pattern, Acker, BusError, BusMessage, BusResult, Delivery, DeliveryStream, EventBus,
    Subscription,
};
use async_nats::connection::State;
use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::jetstream::{self, AckKind};
use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// EventBus implementation using NATS JetStream
///
/// Messages are published into a JetStream stream, so they are persisted
/// before `publish` returns. Consumers are durable pull consumers with
/// explicit acks and `max_ack_pending = 1`, which gives the prefetch-of-one
/// behaviour the inbox relies on.
///
/// `close` drains the client, which releases the connection for every
/// clone of the bus, and ends open delivery streams without waiting for
/// another message.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{BusMessage, EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::connect("nats://localhost:4222", None, "ORDERS").await?;
/// bus.ensure_stream(vec!["order.>".to_string()]).await?;
/// bus.publish(BusMessage::new("order.created", b"{}".to_vec())).await?;
/// bus.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
    stream_name: String,
    closed: Arc<watch::Sender<bool>>,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    /// * `stream_name` - JetStream stream holding the event subjects
    pub fn new(client: Client, stream_name: impl Into<String>) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            stream_name: stream_name.into(),
            closed: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Connect to a NATS server, optionally with user/password credentials
    pub async fn connect(
        url: &str,
        credentials: Option<(String, String)>,
        stream_name: impl Into<String>,
    ) -> BusResult<Self> {
        let options = match credentials {
            Some((user, password)) => ConnectOptions::with_user_and_password(user, password),
            None => ConnectOptions::new(),
        };

        let client = options
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self::new(client, stream_name))
    }

    /// Create the backing stream if it does not exist yet
    pub async fn ensure_stream(&self, subjects: Vec<String>) -> BusResult<()> {
        let config = jetstream::stream::Config {
            name: self.stream_name.clone(),
            subjects,
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| self.classify(e.to_string(), BusError::Subscribe))?;

        tracing::info!(stream = %self.stream_name, "JetStream stream ready");
        Ok(())
    }

    /// Map a client error to a connection failure when the client is not
    /// connected, otherwise to the operation-specific variant
    fn classify(&self, error: String, otherwise: fn(String) -> BusError) -> BusError {
        match self.client.connection_state() {
            State::Connected => otherwise(error),
            _ => BusError::Connection(error),
        }
    }

    fn ensure_open(&self) -> BusResult<()> {
        if *self.closed.borrow() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

fn to_bus_message(msg: &async_nats::Message) -> BusMessage {
    let mut headers = HashMap::new();
    if let Some(nats_headers) = &msg.headers {
        for (key, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
    }

    BusMessage {
        subject: msg.subject.to_string(),
        payload: msg.payload.to_vec(),
        headers,
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        self.ensure_open()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &message.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(message.subject.clone(), headers, message.payload.into())
            .await
            .map_err(|e| self.classify(e.to_string(), BusError::Publish))?;

        // Wait for the stream to persist the message
        ack.await
            .map_err(|e| self.classify(e.to_string(), BusError::Publish))?;

        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> BusResult<DeliveryStream> {
        self.ensure_open()?;
        validate_pattern(&subscription.pattern)?;

        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| self.classify(e.to_string(), BusError::Subscribe))?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &subscription.queue,
                pull::Config {
                    durable_name: Some(subscription.queue.clone()),
                    filter_subject: subscription.pattern.clone(),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: 1,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| self.classify(e.to_string(), BusError::Subscribe))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| self.classify(e.to_string(), BusError::Subscribe))?;

        let mut closed = self.closed.subscribe();
        let on_close = async move {
            let _ = closed.wait_for(|closed| *closed).await;
        };
        let deliveries = messages
            .take_until(on_close)
            .map(|result| match result {
                Ok(msg) => {
                    let bus_message = to_bus_message(&msg.message);
                    Ok(Delivery::new(bus_message, Box::new(NatsAcker { message: msg })))
                }
                Err(e) => Err(BusError::Subscribe(e.to_string())),
            });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        // Flushes pending publishes, then closes the connection
        self.client
            .drain()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        tracing::info!("NATS connection drained and closed");
        Ok(())
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }

    async fn nack(&self) -> BusResult<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| BusError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Note: These tests require a running NATS server with JetStream enabled
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_consume_ack() {
        let bus = NatsBus::connect("nats://localhost:4222", None, "EVENT_BUS_TEST")
            .await
            .expect("NATS server must be running on localhost:4222");
        bus.ensure_stream(vec!["bustest.>".to_string()]).await.unwrap();

        let mut stream = bus
            .subscribe(&Subscription::new("bustest_queue", "bustest.*"))
            .await
            .unwrap();

        bus.publish(
            BusMessage::new("bustest.created", b"test message".to_vec())
                .with_header("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
        )
        .await
        .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("delivery error");

        assert_eq!(delivery.subject(), "bustest.created");
        assert_eq!(delivery.payload(), b"test message");
        assert!(delivery.header("traceparent").is_some());
        delivery.ack().await.unwrap();

        bus.close().await.unwrap();
        bus.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_close_releases_connection_and_ends_streams() {
        let bus = NatsBus::connect("nats://localhost:4222", None, "EVENT_BUS_CLOSE_TEST")
            .await
            .expect("NATS server must be running on localhost:4222");
        bus.ensure_stream(vec!["closetest.>".to_string()]).await.unwrap();

        let mut stream = bus
            .subscribe(&Subscription::new("closetest_queue", "closetest.*"))
            .await
            .unwrap();

        // A clone shares the connection, as the consumer's handle does
        let held_elsewhere = bus.clone();
        bus.close().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream should end promptly after close");
        assert!(next.is_none());

        assert_ne!(held_elsewhere.client.connection_state(), State::Connected);
        assert!(matches!(
            held_elsewhere
                .publish(BusMessage::new("closetest.created", b"late".to_vec()))
                .await,
            Err(BusError::Closed)
        ));
    }
}
