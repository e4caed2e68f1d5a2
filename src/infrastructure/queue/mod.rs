pub mod rabbitmq;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub const SUBTITLE_JOBS: &str = "subtitle.jobs";
pub const SUBTITLE_RESULTS: &str = "subtitle.results";
pub const PIPELINE_EVENTS_DLQ: &str = "pipeline.events.dlq";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Broker error: {0}")]
    Broker(String),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Every message on the wire. `attempt` starts at 0 and grows by one each
/// time the message is sent back through a retry queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub attempt: u32,
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Queue(String),
    Exchange(String),
}

impl Destination {
    pub fn queue(name: &str) -> Self {
        Destination::Queue(name.to_string())
    }

    pub fn exchange(name: &str) -> Self {
        Destination::Exchange(name.to_string())
    }
}

/// The queues one consumer drains and settles into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: String,
    pub retry_queue: String,
    pub dead_letter_queue: String,
}

impl Route {
    pub fn for_queue(queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            retry_queue: format!("{queue}.retry"),
            dead_letter_queue: format!("{queue}.dlq"),
        }
    }

    /// Private queue of one fan-out subscriber.
    pub fn for_subscriber(exchange: &str, subscriber: &str) -> Self {
        Self::for_queue(&format!("{exchange}.{subscriber}"))
    }
}

/// What lands in a dead-letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub reason: String,
    pub attempt: u32,
    pub failed_at: String,
    pub payload: String,
}

impl DeadLetter {
    pub fn new(reason: impl Into<String>, attempt: u32, raw: &[u8]) -> Self {
        Self {
            reason: reason.into(),
            attempt,
            failed_at: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
            payload: String::from_utf8_lossy(raw).into_owned(),
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Returns once the broker confirmed the message.
    async fn publish(&self, destination: &Destination, payload: &[u8]) -> QueueResult<()>;
}

/// Typed producer for one destination.
pub struct Publisher<T> {
    bus: Arc<dyn MessageBus>,
    destination: Destination,
    _message: PhantomData<fn(&T)>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            destination: self.destination.clone(),
            _message: PhantomData,
        }
    }
}

impl<T: Serialize> Publisher<T> {
    pub fn new(bus: Arc<dyn MessageBus>, destination: Destination) -> Self {
        Self {
            bus,
            destination,
            _message: PhantomData,
        }
    }

    pub async fn publish(&self, message: &T) -> QueueResult<()> {
        let body = serde_json::to_vec(&Envelope {
            attempt: 0,
            payload: message,
        })?;
        self.bus.publish(&self.destination, &body).await
    }
}

pub async fn dead_letter(
    bus: &dyn MessageBus,
    queue: &str,
    record: &DeadLetter,
) -> QueueResult<()> {
    let body = serde_json::to_vec(record)?;
    bus.publish(&Destination::queue(queue), &body).await
}
