//! # RabbitMQ Provider
//!
//! AMQP 0.9.1 transport built on `lapin`. One `open()` yields one connection
//! with one channel; QoS is applied before the channel is handed out. All
//! publishes go through the default exchange with the queue name as the
//! routing key, so a delivery's routing key is also the queue it came from.
//!
//! Errors are classified by channel state rather than by lapin error variant:
//! once the channel reports closed, the failure is a transport failure and the
//! IoLoop reconnects; otherwise it is scoped to the operation that raised it.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SelectAll, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info, warn};

use crate::config::{mask_url_credentials, BrokerSettings};
use crate::messaging::errors::{BrokerError, BrokerResult};
use crate::messaging::transport::{
    BrokerChannel, BrokerConnector, Delivery, PublishProperties, QueueDeclaration,
};

/// Opens lapin connections from `BrokerSettings`
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    settings: BrokerSettings,
}

impl RabbitMqConnector {
    pub fn new(settings: BrokerSettings) -> Self {
        Self { settings }
    }

    /// Connection URI with the heartbeat negotiated through the query string
    fn connection_uri(&self) -> String {
        let url = &self.settings.url;
        if url.contains("heartbeat=") {
            return url.clone();
        }
        let separator = if url.contains('?') { '&' } else { '?' };
        format!(
            "{url}{separator}heartbeat={}",
            self.settings.heartbeat_seconds
        )
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn open(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let uri = self.connection_uri();
        let timeout = Duration::from_secs(self.settings.connection_timeout_seconds);

        debug!(
            url = %mask_url_credentials(&self.settings.url),
            heartbeat_seconds = self.settings.heartbeat_seconds,
            "🐰 RABBITMQ: Opening connection"
        );

        let connect = Connection::connect(
            &uri,
            ConnectionProperties::default()
                .with_connection_name(self.settings.connection_name.clone().into()),
        );
        let connection = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                BrokerError::connection(format!(
                    "RabbitMQ connection timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| BrokerError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection.create_channel().await.map_err(|e| {
            BrokerError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;

        channel
            .basic_qos(self.settings.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::protocol(format!("Failed to set QoS: {e}")))?;

        info!(
            connection_name = %self.settings.connection_name,
            prefetch_count = self.settings.prefetch_count,
            "✅ RABBITMQ: Connection and channel open"
        );

        Ok(Box::new(RabbitMqChannel {
            connection,
            channel,
            prefetch_count: self.settings.prefetch_count,
            deliveries: SelectAll::new(),
            consumer_seq: 0,
        }))
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// A lapin connection plus its single channel and active consumers
pub struct RabbitMqChannel {
    connection: Connection,
    channel: Channel,
    prefetch_count: u16,
    deliveries: SelectAll<Consumer>,
    consumer_seq: u32,
}

impl std::fmt::Debug for RabbitMqChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqChannel")
            .field("connected", &self.connection.status().connected())
            .field("consumers", &self.deliveries.len())
            .finish()
    }
}

impl RabbitMqChannel {
    /// Replace a channel the broker closed (e.g. after a failed passive
    /// declare) with a fresh one on the same connection
    async fn reopen_channel(&mut self) -> BrokerResult<()> {
        if !self.connection.status().connected() {
            return Err(BrokerError::channel_closed());
        }
        let channel = self.connection.create_channel().await.map_err(|e| {
            BrokerError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::protocol(format!("Failed to set QoS: {e}")))?;
        self.channel = channel;
        Ok(())
    }

    async fn declare_active(&mut self, declaration: &QueueDeclaration) -> BrokerResult<String> {
        let options = QueueDeclareOptions {
            durable: declaration.durable,
            exclusive: declaration.exclusive,
            auto_delete: declaration.auto_delete,
            ..Default::default()
        };

        match self
            .channel
            .queue_declare(&declaration.name, options, Self::queue_arguments(declaration))
            .await
        {
            Ok(queue) => Ok(queue.name().as_str().to_string()),
            Err(e) => Err(self.classify(BrokerError::queue_declaration(
                declaration.name.clone(),
                e.to_string(),
            ))),
        }
    }

    fn classify(&self, fallback: BrokerError) -> BrokerError {
        if self.is_open() {
            fallback
        } else {
            BrokerError::channel_closed()
        }
    }

    fn queue_arguments(declaration: &QueueDeclaration) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(ttl) = declaration.message_ttl_ms {
            args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(i64::from(ttl)));
        }
        if let Some(expires) = declaration.expires_ms {
            args.insert("x-expires".into(), AMQPValue::LongLongInt(i64::from(expires)));
        }
        args
    }

    fn amqp_properties(properties: &PublishProperties) -> BasicProperties {
        let mut amqp = BasicProperties::default();
        if properties.persistent {
            amqp = amqp.with_delivery_mode(2);
        }
        if let Some(content_type) = &properties.content_type {
            amqp = amqp.with_content_type(content_type.as_str().into());
        }
        if let Some(correlation_id) = &properties.correlation_id {
            amqp = amqp.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(reply_to) = &properties.reply_to {
            amqp = amqp.with_reply_to(reply_to.as_str().into());
        }
        amqp
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_queue(&mut self, declaration: &QueueDeclaration) -> BrokerResult<String> {
        if !declaration.passive || declaration.is_server_named() {
            return self.declare_active(declaration).await;
        }

        // A failed passive declare closes the channel, taking its consumers with it
        if !self.deliveries.is_empty() {
            return Err(BrokerError::queue_declaration(
                declaration.name.clone(),
                "passive declarations must precede consumers on this channel",
            ));
        }

        let passive = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        match self
            .channel
            .queue_declare(&declaration.name, passive, FieldTable::default())
            .await
        {
            Ok(queue) => {
                debug!(queue = %declaration.name, "🐰 RABBITMQ: Using existing queue");
                Ok(queue.name().as_str().to_string())
            }
            Err(e) => {
                debug!(
                    queue = %declaration.name,
                    error = %e,
                    "Queue not found passively, creating it"
                );
                self.reopen_channel().await?;
                self.declare_active(declaration).await
            }
        }
    }

    async fn consume(&mut self, queue_name: &str) -> BrokerResult<()> {
        self.consumer_seq += 1;
        let consumer_tag = format!("tasker-rpc-{}", self.consumer_seq);

        match self
            .channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => {
                debug!(queue = %queue_name, consumer_tag = %consumer_tag, "🐰 RABBITMQ: Consumer registered");
                self.deliveries.push(consumer);
                Ok(())
            }
            Err(e) => Err(self.classify(BrokerError::consume(queue_name, e.to_string()))),
        }
    }

    async fn publish(
        &mut self,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        let confirm = match self
            .channel
            .basic_publish(
                "", // Default exchange
                routing_key,
                BasicPublishOptions::default(),
                body,
                Self::amqp_properties(properties),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => return Err(self.classify(BrokerError::publish(routing_key, e.to_string()))),
        };

        confirm
            .await
            .map(|_| ())
            .map_err(|e| self.classify(BrokerError::publish(routing_key, e.to_string())))
    }

    async fn next_delivery(&mut self, wait: Duration) -> BrokerResult<Option<Delivery>> {
        if self.deliveries.is_empty() {
            tokio::time::sleep(wait).await;
            return if self.is_open() {
                Ok(None)
            } else {
                Err(BrokerError::channel_closed())
            };
        }

        match tokio::time::timeout(wait, self.deliveries.next()).await {
            Err(_) => Ok(None),
            // Every consumer stream ended: the channel was cancelled or closed
            Ok(None) => Err(BrokerError::channel_closed()),
            Ok(Some(Err(e))) => Err(self.classify(BrokerError::protocol(e.to_string()))),
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery {
                delivery_tag: delivery.delivery_tag,
                queue: delivery.routing_key.as_str().to_string(),
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                redelivered: delivery.redelivered,
                body: delivery.data,
            })),
        }
    }

    async fn ack(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.classify(BrokerError::acknowledgement(delivery_tag, e.to_string())))
    }

    async fn reject(&mut self, delivery_tag: u64) -> BrokerResult<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| self.classify(BrokerError::acknowledgement(delivery_tag, e.to_string())))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.deliveries = SelectAll::new();

        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "OK").await {
                debug!(error = %e, "Channel close failed");
            }
        }
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "OK").await {
                warn!(error = %e, "⚠️ RABBITMQ: Connection close failed");
            }
        }
        Ok(())
    }
}
