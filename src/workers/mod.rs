//! Queue consumers. Each worker slot drains one message at a time and
//! settles it exactly once: ack, park in the retry queue with a bumped
//! attempt counter, or divert to the dead-letter queue.

pub mod indexer;
pub mod subtitle;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions};
use lapin::types::FieldTable;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use validator::Validate;

use crate::infrastructure::queue::rabbitmq::RabbitMqService;
use crate::infrastructure::queue::{DeadLetter, Destination, Envelope, MessageBus, Route};
use crate::modules::pipeline::Outcome;
use crate::modules::pipeline::error::PipelineError;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Message: DeserializeOwned + Serialize + Validate + Send + Sync;

    fn name(&self) -> &'static str;

    /// `attempt` is 0 on first delivery.
    async fn handle(&self, message: &Self::Message, attempt: u32) -> Result<Outcome, PipelineError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Whether a message that failed on `attempt` gets another try.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[derive(Debug, PartialEq)]
pub enum Settlement {
    Ack,
    Retry(Vec<u8>),
    DeadLetter(DeadLetter),
}

/// Runs the handler for one raw delivery and decides how to settle it.
pub async fn settle<H: MessageHandler>(handler: &H, policy: RetryPolicy, body: &[u8]) -> Settlement {
    let envelope: Envelope<H::Message> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(worker = handler.name(), "Malformed message: {}", e);
            return Settlement::DeadLetter(DeadLetter::new(format!("malformed message: {e}"), 0, body));
        }
    };
    let attempt = envelope.attempt;

    if let Err(e) = envelope.payload.validate() {
        error!(worker = handler.name(), attempt, "Invalid message: {}", e);
        return Settlement::DeadLetter(DeadLetter::new(format!("invalid message: {e}"), attempt, body));
    }

    match handler.handle(&envelope.payload, attempt).await {
        Ok(Outcome::Done) => Settlement::Ack,
        Ok(Outcome::Stale(reason)) | Ok(Outcome::Ignored(reason)) => {
            info!(worker = handler.name(), attempt, reason = %reason, "Discarding stale message");
            Settlement::Ack
        }
        Err(e) if e.is_transient() && policy.allows_retry(attempt) => {
            warn!(worker = handler.name(), attempt, "Message failed, scheduling retry: {}", e);
            let retry = Envelope {
                attempt: attempt + 1,
                payload: envelope.payload,
            };
            match serde_json::to_vec(&retry) {
                Ok(bytes) => Settlement::Retry(bytes),
                Err(encode) => Settlement::DeadLetter(DeadLetter::new(
                    format!("{e}; retry encoding failed: {encode}"),
                    attempt,
                    body,
                )),
            }
        }
        Err(e) => {
            error!(worker = handler.name(), attempt, "Message failed permanently: {}", e);
            Settlement::DeadLetter(DeadLetter::new(e.to_string(), attempt, body))
        }
    }
}

/// Publishes whatever `settle` decided. The delivery may be acked only after
/// this succeeds.
pub async fn forward(bus: &dyn MessageBus, route: &Route, settlement: &Settlement) -> anyhow::Result<()> {
    match settlement {
        Settlement::Ack => {}
        Settlement::Retry(bytes) => {
            bus.publish(&Destination::queue(&route.retry_queue), bytes).await?;
        }
        Settlement::DeadLetter(record) => {
            crate::infrastructure::queue::dead_letter(bus, &route.dead_letter_queue, record).await?;
        }
    }
    Ok(())
}

/// Drains `route.queue` until `shutdown` fires.
pub async fn run_consumer<H: MessageHandler + 'static>(
    rabbit: RabbitMqService,
    route: Route,
    handler: Arc<H>,
    policy: RetryPolicy,
    consumer_tag: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let channel = rabbit.consumer_channel().await?;
    let mut consumer = channel
        .basic_consume(
            &route.queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    info!(worker = handler.name(), queue = %route.queue, tag = %consumer_tag, "Worker listening");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = consumer.next() => next,
        };
        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(worker = handler.name(), "Consumer error: {}", e);
                return Err(e.into());
            }
            None => break,
        };

        let settlement = settle(handler.as_ref(), policy, &delivery.data).await;

        if let Err(e) = forward(&rabbit, &route, &settlement).await {
            error!(worker = handler.name(), "Failed to settle message, requeueing: {}", e);
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await?;
            continue;
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(worker = handler.name(), "Failed to ack message: {}", e);
        }
    }

    info!(worker = handler.name(), tag = %consumer_tag, "Worker stopped");
    Ok(())
}
