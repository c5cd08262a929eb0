//! In-memory implementation of the EventBus trait for testing and development

use crate::{
    matches_pattern, validate_pattern, Acker, BusError, BusMessage, BusResult, Delivery,
    DeliveryStream, EventBus, Subscription,
};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// EventBus implementation using process-local durable queues
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without a broker
///
/// Each subscription declares a named queue bound to a pattern. Published
/// messages are copied into every queue whose pattern matches, and a queue
/// only hands out its next message after the previous one was settled.
/// Nacked messages go back to the front of the queue.
///
/// Messages published before a queue is declared are not delivered to it,
/// mirroring a topic exchange with no bound queue.
///
/// # Example
/// ```rust
/// use event_bus::{BusMessage, EventBus, InMemoryBus, Subscription};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe(&Subscription::new("q", "order.*")).await?;
///
/// bus.publish(BusMessage::new("order.created", b"hello".to_vec())).await?;
///
/// let delivery = stream.next().await.unwrap()?;
/// assert_eq!(delivery.subject(), "order.created");
/// delivery.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    queues: HashMap<String, QueueState>,
    published: Vec<BusMessage>,
    closed: bool,
}

struct QueueState {
    pattern: String,
    ready: VecDeque<BusMessage>,
    in_flight: bool,
    notify: Arc<Notify>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message accepted by `publish`, in order
    pub async fn published(&self) -> Vec<BusMessage> {
        self.state.lock().await.published.clone()
    }

    /// Number of messages waiting in a queue, excluding one in flight
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Whether the bus has been closed
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Declare a queue without consuming from it
    ///
    /// Declaring an existing queue with the same pattern is a no-op.
    pub async fn declare(&self, subscription: &Subscription) -> BusResult<Arc<Notify>> {
        validate_pattern(&subscription.pattern)?;

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }

        let queue = state
            .queues
            .entry(subscription.queue.clone())
            .or_insert_with(|| QueueState {
                pattern: subscription.pattern.clone(),
                ready: VecDeque::new(),
                in_flight: false,
                notify: Arc::new(Notify::new()),
            });

        if queue.pattern != subscription.pattern {
            return Err(BusError::InvalidSubject(format!(
                "queue {} is already bound to {}",
                subscription.queue, queue.pattern
            )));
        }

        Ok(queue.notify.clone())
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(BusError::Closed);
        }

        for queue in state.queues.values_mut() {
            if matches_pattern(&message.subject, &queue.pattern) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_one();
            }
        }
        state.published.push(message);

        Ok(())
    }

    async fn subscribe(&self, subscription: &Subscription) -> BusResult<DeliveryStream> {
        let notify = self.declare(subscription).await?;
        let state = self.state.clone();
        let queue_name = subscription.queue.clone();

        let stream = async_stream::stream! {
            loop {
                let next = {
                    let mut guard = state.lock().await;
                    if guard.closed {
                        break;
                    }
                    match guard.queues.get_mut(&queue_name) {
                        Some(queue) if !queue.in_flight => {
                            let message = queue.ready.pop_front();
                            if message.is_some() {
                                queue.in_flight = true;
                            }
                            message
                        }
                        Some(_) => None,
                        None => break,
                    }
                };

                match next {
                    Some(message) => {
                        let acker = InMemoryAcker {
                            state: state.clone(),
                            queue: queue_name.clone(),
                            message: message.clone(),
                        };
                        yield Ok(Delivery::new(message, Box::new(acker)));
                    }
                    // notify_one stores a permit, so a settle or publish that
                    // lands between the check above and this await is not lost
                    None => notify.notified().await,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        for queue in state.queues.values() {
            queue.notify.notify_one();
        }
        Ok(())
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<BusState>>,
    queue: String,
    message: BusMessage,
}

impl InMemoryAcker {
    async fn settle(&self, requeue: bool) -> BusResult<()> {
        let mut state = self.state.lock().await;
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::Ack(format!("queue {} no longer exists", self.queue)))?;

        if requeue {
            queue.ready.push_front(self.message.clone());
        }
        queue.in_flight = false;
        queue.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(false).await
    }

    async fn nack(&self) -> BusResult<()> {
        self.settle(true).await
    }
}
