//! Message queue abstraction.
//!
//! Deliveries carry an explicit acknowledgement. A delivery that is
//! dropped without `ack` counts as a `nack` and is redelivered.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub mod memory;

pub use memory::InProcessQueue;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), QueueError>;

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, QueueError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` once the queue is closed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// Consumer verdict on a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Nack,
}

/// One message handed to a consumer.
#[derive(Debug)]
pub struct Delivery {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    acker: Option<oneshot::Sender<AckDecision>>,
}

impl Delivery {
    pub fn new(
        topic: &str,
        key: &str,
        payload: Vec<u8>,
        attempt: u32,
        acker: oneshot::Sender<AckDecision>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            attempt,
            acker: Some(acker),
        }
    }

    /// Marks the message as fully processed.
    pub fn ack(mut self) {
        self.settle(AckDecision::Ack);
    }

    /// Returns the message to the queue for redelivery.
    pub fn nack(mut self) {
        self.settle(AckDecision::Nack);
    }

    fn settle(&mut self, decision: AckDecision) {
        if let Some(acker) = self.acker.take() {
            let _ = acker.send(decision);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(AckDecision::Nack);
    }
}
