//! In-process queue with competing consumers and redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{oneshot, Notify};

use super::{AckDecision, Delivery, MessageQueue, QueueError, Subscription};

#[derive(Debug, Clone)]
struct QueuedMessage {
    key: String,
    payload: Vec<u8>,
    attempt: u32,
}

#[derive(Default)]
struct TopicState {
    pending: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
    in_flight: AtomicUsize,
}

impl TopicState {
    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.pending.lock().unwrap_or_else(|e| {
            log::warn!("Queue topic lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

struct QueueInner {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    closed: AtomicBool,
    /// Wakes every waiting subscriber on close.
    shutdown: Notify,
}

/// Multi-producer, multi-consumer queue living inside the process.
///
/// Every subscriber of a topic competes for its messages; each message
/// goes to exactly one subscriber at a time.
#[derive(Clone)]
pub struct InProcessQueue {
    inner: Arc<QueueInner>,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                topics: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        let mut topics = self.inner.topics.lock().unwrap_or_else(|e| {
            log::warn!("Queue topic map lock was poisoned, recovering");
            e.into_inner()
        });
        Arc::clone(topics.entry(name.to_string()).or_default())
    }

    /// Messages waiting for a consumer on `topic`.
    pub fn pending_len(&self, topic: &str) -> usize {
        self.topic(topic).pending().len()
    }

    /// Messages delivered on `topic` but not yet acknowledged.
    pub fn in_flight(&self, topic: &str) -> usize {
        self.topic(topic).in_flight.load(Ordering::SeqCst)
    }

    /// Removes and returns the waiting payloads of `topic`.
    pub fn drain(&self, topic: &str) -> Vec<Vec<u8>> {
        self.topic(topic)
            .pending()
            .drain(..)
            .map(|m| m.payload)
            .collect()
    }

    /// Stops the queue. Subscribers return `None` and publishing fails.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageQueue for InProcessQueue {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let state = self.topic(topic);
        state.pending().push_back(QueuedMessage {
            key: key.to_string(),
            payload: payload.to_vec(),
            attempt: 1,
        });
        state.notify.notify_one();
        log::debug!("Published message {} to {}", key, topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        Ok(Box::new(InProcessSubscription {
            topic: topic.to_string(),
            state: self.topic(topic),
            queue: Arc::clone(&self.inner),
        }))
    }
}

struct InProcessSubscription {
    topic: String,
    state: Arc<TopicState>,
    queue: Arc<QueueInner>,
}

impl InProcessSubscription {
    fn take(&self) -> Option<Delivery> {
        let (message, more) = {
            let mut pending = self.state.pending();
            let message = pending.pop_front()?;
            (message, !pending.is_empty())
        };
        if more {
            // Hand the next message to another idle subscriber.
            self.state.notify.notify_one();
        }

        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let delivery = Delivery::new(
            &self.topic,
            &message.key,
            message.payload.clone(),
            message.attempt,
            tx,
        );

        let state = Arc::clone(&self.state);
        let topic = self.topic.clone();
        tokio::spawn(async move {
            let decision = rx.await.unwrap_or(AckDecision::Nack);
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
            if decision == AckDecision::Nack {
                log::debug!(
                    "Redelivering message {} on {} (attempt {})",
                    message.key,
                    topic,
                    message.attempt + 1
                );
                state.pending().push_front(QueuedMessage {
                    attempt: message.attempt + 1,
                    ..message
                });
                state.notify.notify_one();
            }
        });

        Some(delivery)
    }
}

#[async_trait]
impl Subscription for InProcessSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let shutdown = self.queue.shutdown.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();

            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(delivery) = self.take() {
                return Some(delivery);
            }

            tokio::select! {
                _ = self.state.notify.notified() => {}
                _ = &mut shutdown => return None,
            }
        }
    }
}
