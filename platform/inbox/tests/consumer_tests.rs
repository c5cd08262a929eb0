//! Inbox consumer delivery handling and idempotent recording

use async_trait::async_trait;
use chrono::Utc;
use event_bus::{
    Acker, BrokerEnvelope, BusMessage, BusResult, Delivery, DeliveryStream, EventBus, InMemoryBus,
    Subscription, TRACEPARENT_HEADER,
};
use futures::StreamExt;
use inbox::{InMemoryInboxStore, InboxConsumer, InboxError, InboxRecorder, InboxStore, MessageHandler};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trace_context::Tracer;

const PARENT: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

fn envelope(event_id: i64, event_type: &str) -> BrokerEnvelope {
    BrokerEnvelope {
        event_id,
        aggregate_id: "7".to_string(),
        event_type: event_type.to_string(),
        payload: json!({ "order_id": 7, "customer_name": "Ada", "total_amount": 1999 }),
        created_at: Utc::now(),
    }
}

fn message(event_id: i64, event_type: &str) -> BusMessage {
    BusMessage::new(event_type, envelope(event_id, event_type).to_bytes().unwrap())
}

/// Records what the handler saw
#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<(i64, Option<String>)>>,
    failures_left: AtomicUsize,
}

impl RecordingHandler {
    fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn calls(&self) -> Vec<(i64, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(
        &self,
        envelope: BrokerEnvelope,
        traceparent: Option<String>,
    ) -> Result<(), InboxError> {
        self.calls.lock().unwrap().push((envelope.event_id, traceparent));
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(InboxError::Database(sqlx::Error::Protocol("insert failed".into())));
        }
        Ok(())
    }
}

/// Bus that hands out a fixed list of deliveries and logs how each was settled
struct ScriptedBus {
    messages: Mutex<Vec<BusMessage>>,
    settlements: Arc<Mutex<Vec<String>>>,
}

impl ScriptedBus {
    fn new(messages: Vec<BusMessage>) -> Self {
        Self {
            messages: Mutex::new(messages),
            settlements: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn settlements(&self) -> Vec<String> {
        self.settlements.lock().unwrap().clone()
    }
}

struct RecordingAcker {
    subject: String,
    settlements: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Acker for RecordingAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settlements.lock().unwrap().push(format!("ack {}", self.subject));
        Ok(())
    }

    async fn nack(&self) -> BusResult<()> {
        self.settlements.lock().unwrap().push(format!("nack {}", self.subject));
        Ok(())
    }
}

#[async_trait]
impl EventBus for ScriptedBus {
    async fn publish(&self, _message: BusMessage) -> BusResult<()> {
        Ok(())
    }

    async fn subscribe(&self, _subscription: &Subscription) -> BusResult<DeliveryStream> {
        let messages = std::mem::take(&mut *self.messages.lock().unwrap());
        let settlements = self.settlements.clone();
        let deliveries = messages.into_iter().map(move |message| {
            let acker = RecordingAcker {
                subject: message.subject.clone(),
                settlements: settlements.clone(),
            };
            Ok(Delivery::new(message, Box::new(acker)))
        });
        Ok(futures::stream::iter(deliveries).boxed())
    }

    async fn close(&self) -> BusResult<()> {
        Ok(())
    }
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn subscription() -> Subscription {
    Subscription::new("inbox_queue", "order.*")
}

#[tokio::test]
async fn test_successful_handler_acks() {
    let bus = Arc::new(ScriptedBus::new(vec![
        message(1, "order.created").with_header(TRACEPARENT_HEADER, PARENT),
    ]));
    let handler = RecordingHandler::default();

    let consumer = InboxConsumer::new(bus.clone(), subscription());
    consumer.consume(&handler, CancellationToken::new()).await.unwrap();

    assert_eq!(handler.calls(), vec![(1, Some(PARENT.to_string()))]);
    assert_eq!(bus.settlements(), vec!["ack order.created"]);
}

#[tokio::test]
async fn test_undecodable_message_is_nacked_without_calling_handler() {
    let bus = Arc::new(ScriptedBus::new(vec![
        BusMessage::new("order.created", b"not json".to_vec()),
        BusMessage::new("order.updated", br#"{"event_id": 1}"#.to_vec()),
        message(3, "order.cancelled"),
    ]));
    let handler = RecordingHandler::default();

    let consumer = InboxConsumer::new(bus.clone(), subscription());
    consumer.consume(&handler, CancellationToken::new()).await.unwrap();

    assert_eq!(handler.calls(), vec![(3, None)]);
    assert_eq!(
        bus.settlements(),
        vec!["nack order.created", "nack order.updated", "ack order.cancelled"]
    );
}

#[tokio::test]
async fn test_handler_failure_nacks() {
    let bus = Arc::new(ScriptedBus::new(vec![message(1, "order.created")]));
    let handler = RecordingHandler::failing(1);

    let consumer = InboxConsumer::new(bus.clone(), subscription());
    consumer.consume(&handler, CancellationToken::new()).await.unwrap();

    assert_eq!(handler.calls().len(), 1);
    assert_eq!(bus.settlements(), vec!["nack order.created"]);
}

#[tokio::test]
async fn test_missing_or_empty_traceparent_is_not_an_error() {
    let bus = Arc::new(ScriptedBus::new(vec![
        message(1, "order.created"),
        message(2, "order.created").with_header(TRACEPARENT_HEADER, ""),
    ]));
    let handler = RecordingHandler::default();

    let consumer = InboxConsumer::new(bus.clone(), subscription());
    consumer.consume(&handler, CancellationToken::new()).await.unwrap();

    assert_eq!(handler.calls(), vec![(1, None), (2, None)]);
    assert_eq!(bus.settlements().len(), 2);
}

#[tokio::test]
async fn test_failed_delivery_is_redelivered_and_acked_once_recovered() {
    let bus = InMemoryBus::new();
    let handler = Arc::new(RecordingHandler::failing(2));
    let consumer = Arc::new(InboxConsumer::new(Arc::new(bus.clone()), subscription()));

    bus.declare(&subscription()).await.unwrap();
    bus.publish(message(1, "order.created")).await.unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        async move { consumer.consume(handler.as_ref(), shutdown).await }
    });

    wait_until(|| {
        let handler = handler.clone();
        async move { handler.calls().len() == 3 }
    })
    .await;
    wait_until(|| {
        let bus = bus.clone();
        async move { bus.queue_depth("inbox_queue").await == 0 }
    })
    .await;

    // Settled for good: nothing is delivered again
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.calls().len(), 3);

    shutdown.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicate_delivery_yields_one_inbox_row() {
    let bus = InMemoryBus::new();
    let store = InMemoryInboxStore::new();
    let recorder = Arc::new(CountingRecorder {
        inner: InboxRecorder::new(Arc::new(store.clone()), Tracer::new("post-processing")),
        calls: AtomicUsize::new(0),
    });
    let consumer = Arc::new(InboxConsumer::new(Arc::new(bus.clone()), subscription()));

    bus.declare(&subscription()).await.unwrap();
    // Simulated redelivery of the same broker message
    bus.publish(message(42, "order.created")).await.unwrap();
    bus.publish(message(42, "order.created")).await.unwrap();

    let shutdown = CancellationToken::new();
    let task = tokio::spawn({
        let consumer = consumer.clone();
        let recorder = recorder.clone();
        let shutdown = shutdown.clone();
        async move { consumer.consume(recorder.as_ref(), shutdown).await }
    });

    wait_until(|| {
        let recorder = recorder.clone();
        async move { recorder.calls.load(Ordering::SeqCst) == 2 }
    })
    .await;

    shutdown.cancel();
    task.await.unwrap().unwrap();

    let rows = store.all().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, 42);
    assert!(!rows[0].processed);
}

struct CountingRecorder {
    inner: InboxRecorder,
    calls: AtomicUsize,
}

#[async_trait]
impl MessageHandler for CountingRecorder {
    async fn handle(
        &self,
        envelope: BrokerEnvelope,
        traceparent: Option<String>,
    ) -> Result<(), InboxError> {
        let result = self.inner.handle(envelope, traceparent).await;
        self.calls.fetch_add(1, Ordering::SeqCst);
        result
    }
}

#[tokio::test]
async fn test_recorder_continues_incoming_trace() {
    let store = InMemoryInboxStore::new();
    let recorder = InboxRecorder::new(Arc::new(store.clone()), Tracer::new("post-processing"));

    recorder
        .handle(envelope(5, "order.created"), Some(PARENT.to_string()))
        .await
        .unwrap();

    let row = store.find_by_event_id(5).await.unwrap();
    let stored = trace_context::parse(row.trace_context.as_deref().unwrap()).unwrap();
    let parent = trace_context::parse(PARENT).unwrap();
    assert_eq!(stored.trace_id(), parent.trace_id());
    assert_ne!(stored.span_id(), parent.span_id());
    assert_eq!(row.aggregate_id, "7");
    assert_eq!(row.payload["total_amount"], 1999);
}

#[tokio::test]
async fn test_recorder_with_disabled_tracer_stores_no_trace_context() {
    let store = InMemoryInboxStore::new();
    let recorder = InboxRecorder::new(Arc::new(store.clone()), Tracer::disabled());

    recorder
        .handle(envelope(5, "order.created"), Some(PARENT.to_string()))
        .await
        .unwrap();

    assert!(store.find_by_event_id(5).await.unwrap().trace_context.is_none());
}

/// Store that refuses writes, as if the database rejected the insert
struct RejectingStore;

#[async_trait]
impl InboxStore for RejectingStore {
    async fn record(&self, _event: &inbox::NewInboxEvent) -> Result<bool, sqlx::Error> {
        Err(sqlx::Error::Protocol("insert rejected".into()))
    }

    async fn fetch_unprocessed(&self, _limit: i64) -> Result<Vec<inbox::InboxEvent>, sqlx::Error> {
        Ok(Vec::new())
    }

    async fn mark_processed(&self, _id: i64) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

#[tokio::test]
async fn test_storage_failure_nacks_for_redelivery() {
    let bus = Arc::new(ScriptedBus::new(vec![message(1, "order.created")]));
    let recorder = InboxRecorder::new(Arc::new(RejectingStore), Tracer::new("post-processing"));

    let consumer = InboxConsumer::new(bus.clone(), subscription());
    consumer.consume(&recorder, CancellationToken::new()).await.unwrap();

    assert_eq!(bus.settlements(), vec!["nack order.created"]);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let bus = InMemoryBus::new();
    let consumer = InboxConsumer::new(Arc::new(bus.clone()), subscription());

    consumer.close().await.unwrap();
    consumer.close().await.unwrap();
    assert!(bus.is_closed().await);
}

#[tokio::test]
async fn test_consume_returns_when_cancelled() {
    let bus = InMemoryBus::new();
    let consumer = InboxConsumer::new(Arc::new(bus.clone()), subscription());
    let handler = RecordingHandler::default();

    let shutdown = CancellationToken::new();
    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), consumer.consume(&handler, shutdown))
        .await
        .expect("consume did not stop")
        .unwrap();
    assert!(handler.calls().is_empty());
}
