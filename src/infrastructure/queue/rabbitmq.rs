use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Destination, MessageBus, QueueError, QueueResult, Route};

#[derive(Clone)]
pub struct RabbitMqService {
    url: String,
    conn: Arc<Mutex<Connection>>,
    channel: Arc<Mutex<Channel>>,
}

impl RabbitMqService {
    async fn connect(url: &str) -> Result<(Connection, Channel)> {
        info!("Connecting to RabbitMQ");
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create channel: {}", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        info!("Connected to RabbitMQ");
        Ok((conn, channel))
    }

    pub async fn new(url: &str) -> Result<Self> {
        let (conn, channel) = Self::connect(url).await?;

        Ok(Self {
            url: url.to_string(),
            conn: Arc::new(Mutex::new(conn)),
            channel: Arc::new(Mutex::new(channel)),
        })
    }

    async fn reconnect(&self) -> Result<()> {
        warn!("RabbitMQ connection dropped, reconnecting...");
        let (conn, channel) = Self::connect(&self.url).await?;
        *self.conn.lock().await = conn;
        *self.channel.lock().await = channel;
        Ok(())
    }

    /// Fresh channel for a consumer, so prefetch limits apply per worker slot.
    pub async fn consumer_channel(&self) -> Result<Channel> {
        let conn = self.conn.lock().await;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| anyhow!("Failed to create consumer channel: {}", e))?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set prefetch: {}", e))?;
        Ok(channel)
    }

    async fn declare_queue(channel: &Channel, name: &str, arguments: FieldTable) -> Result<()> {
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", name, e))?;
        Ok(())
    }

    /// Work queue, its delay queue and its dead-letter queue. Messages parked
    /// in the delay queue expire back into the work queue.
    pub async fn declare_route(&self, route: &Route, retry_delay: Duration) -> Result<()> {
        let channel = self.channel.lock().await;

        Self::declare_queue(&channel, &route.queue, FieldTable::default()).await?;
        Self::declare_queue(&channel, &route.dead_letter_queue, FieldTable::default()).await?;

        let mut retry_args = FieldTable::default();
        retry_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from("")),
        );
        retry_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(route.queue.as_str())),
        );
        retry_args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongUInt(retry_delay.as_millis().min(u32::MAX as u128) as u32),
        );
        Self::declare_queue(&channel, &route.retry_queue, retry_args).await?;

        info!(queue = %route.queue, "Declared queue route");
        Ok(())
    }

    pub async fn declare_fanout(&self, exchange: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange {}: {}", exchange, e))?;
        Ok(())
    }

    /// Subscribes `route` to every message published on `exchange`.
    pub async fn subscribe(&self, exchange: &str, route: &Route, retry_delay: Duration) -> Result<()> {
        self.declare_fanout(exchange).await?;
        self.declare_route(route, retry_delay).await?;

        let channel = self.channel.lock().await;
        channel
            .queue_bind(
                &route.queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to bind {} to {}: {}", route.queue, exchange, e))?;
        Ok(())
    }

    pub async fn declare_plain_queue(&self, name: &str) -> Result<()> {
        let channel = self.channel.lock().await;
        Self::declare_queue(&channel, name, FieldTable::default()).await
    }

    async fn publish_internal(&self, destination: &Destination, payload: &[u8]) -> Result<()> {
        let channel = self.channel.lock().await;

        let (exchange, routing_key) = match destination {
            Destination::Queue(queue) => ("", queue.as_str()),
            Destination::Exchange(exchange) => (exchange.as_str(), ""),
        };

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type(ShortString::from("application/json")),
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message: {}", e))?
            .await
            .map_err(|e| anyhow!("Failed to confirm publication: {}", e))?;

        if confirmation.is_nack() {
            return Err(anyhow!("Broker rejected message for {:?}", destination));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for RabbitMqService {
    async fn publish(&self, destination: &Destination, payload: &[u8]) -> QueueResult<()> {
        if let Err(e) = self.publish_internal(destination, payload).await {
            warn!("RabbitMQ publish failed: {}. Retrying after reconnect.", e);
            self.reconnect()
                .await
                .map_err(|e| QueueError::Broker(e.to_string()))?;
            self.publish_internal(destination, payload)
                .await
                .map_err(|e| QueueError::Broker(e.to_string()))?;
        }

        Ok(())
    }
}
