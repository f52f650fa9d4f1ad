//! RabbitMQ over AMQP 0.9.1, using `lapin`.
//!
//! Each session is one connection with one channel in confirm mode, so a
//! successful [`BrokerSession::publish`] means the broker has taken
//! responsibility for the message.

use super::{
    BrokerConnector, BrokerError, BrokerSession, DeliveryStream, Headers, InboundDelivery,
    OutboundMessage,
};
use async_trait::async_trait;
use csync_sdk::config::BrokerConfig;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::sync::Arc;
use tracing::debug;

/// Reply codes the broker sends for mistakes that retrying will not fix.
const PERMANENT_REPLY_MARKERS: &[&str] = &[
    "ACCESS_REFUSED",
    "PRECONDITION_FAILED",
    "NOT_ALLOWED",
    "COMMAND_INVALID",
];

fn is_permanent(e: &lapin::Error) -> bool {
    let text = e.to_string();
    PERMANENT_REPLY_MARKERS.iter().any(|m| text.contains(m))
}

fn channel_error(e: lapin::Error, context: &str) -> BrokerError {
    if is_permanent(&e) {
        BrokerError::Configuration(format!("{context}: {e}"))
    } else {
        BrokerError::Channel(format!("{context}: {e}"))
    }
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(name.clone().into(), AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> Headers {
    let mut headers = Headers::new();
    let Some(table) = table else {
        return headers;
    };
    for (name, value) in table.inner() {
        let text = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            AMQPValue::LongLongInt(n) => n.to_string(),
            AMQPValue::LongInt(n) => n.to_string(),
            AMQPValue::LongUInt(n) => n.to_string(),
            AMQPValue::ShortInt(n) => n.to_string(),
            AMQPValue::ShortUInt(n) => n.to_string(),
            _ => continue,
        };
        headers.insert(name.as_str().to_string(), text);
    }
    headers
}

pub struct AmqpConnector {
    config: BrokerConfig,
    url: String,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        config
            .validate()
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        let url = config
            .amqp_url()
            .map_err(|e| BrokerError::Configuration(e.to_string()))?;
        Ok(Self { config, url })
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<AmqpSession, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_connection_name(self.config.connection_name.clone().into());
        let connection = tokio::time::timeout(
            self.config.connect_timeout,
            Connection::connect(&self.url, properties),
        )
        .await
        .map_err(|_| {
            BrokerError::Connection(format!(
                "no answer from {} within {:?}",
                self.describe(),
                self.config.connect_timeout
            ))
        })?
        .map_err(|e| {
            if is_permanent(&e) {
                BrokerError::Configuration(format!("{}: {e}", self.describe()))
            } else {
                BrokerError::Connection(format!("{}: {e}", self.describe()))
            }
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("channel creation failed: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| channel_error(e, "enabling publisher confirms"))?;

        debug!(broker = %self.describe(), "AMQP session opened");
        Ok(AmqpSession {
            connection: Arc::new(connection),
            channel,
        })
    }

    fn describe(&self) -> String {
        self.config.redacted_url()
    }
}

pub struct AmqpSession {
    connection: Arc<Connection>,
    channel: Channel,
}

/// A session dropped without `close()` (e.g. a cancelled publish) still
/// closes its connection, in the background.
impl Drop for AmqpSession {
    fn drop(&mut self) {
        if !self.connection.status().connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = self.connection.clone();
        runtime.spawn(async move {
            if let Err(e) = connection.close(200, "session dropped").await {
                debug!(error = %e, "Failed to close dropped AMQP session");
            }
        });
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    type Deliveries = AmqpDeliveries;

    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(name, e))
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| declare_error(name, e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&format!("binding {queue} <- {exchange}"), e))
    }

    async fn publish(&self, exchange: &str, message: OutboundMessage) -> Result<(), BrokerError> {
        let publish_error = |reason: String| BrokerError::Publish {
            routing_key: message.routing_key.clone(),
            reason,
        };
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_headers(to_field_table(&message.headers));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => Err(publish_error("broker refused the message".into())),
            Ok(_) => Ok(()),
            Err(e) => Err(publish_error(format!("confirmation failed: {e}"))),
        }
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<AmqpDeliveries, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| channel_error(e, "setting prefetch"))?;
        let consumer_tag = format!("csync-{}", uuid::Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| channel_error(e, "subscribing"))?;
        debug!(queue, consumer_tag, "Subscribed");
        Ok(AmqpDeliveries { consumer })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("ack {delivery_tag}: {e}")))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| BrokerError::Channel(format!("nack {delivery_tag}: {e}")))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "closing")
                .await
                .map_err(|e| BrokerError::Channel(format!("closing channel: {e}")))?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "closing")
                .await
                .map_err(|e| BrokerError::Connection(format!("closing connection: {e}")))?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

fn declare_error(name: &str, e: lapin::Error) -> BrokerError {
    if is_permanent(&e) {
        BrokerError::Configuration(format!("declaring {name}: {e}"))
    } else {
        BrokerError::Topology {
            name: name.to_string(),
            reason: e.to_string(),
        }
    }
}

pub struct AmqpDeliveries {
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, BrokerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| InboundDelivery {
                delivery_tag: delivery.delivery_tag,
                redelivered: delivery.redelivered,
                headers: from_field_table(delivery.properties.headers().as_ref()),
                payload: delivery.data,
            })
            .map_err(|e| BrokerError::Closed(e.to_string())),
        )
    }
}
