//! AMQP broker transport adapter
//!
//! Opens a connection and channel, declares the durable queue, binds it
//! to the configured exchange, and consumes with manual
//! acknowledgments. The prefetch limit is applied with `basic_qos`
//! before the subscription starts so the broker never hands this
//! process more unacknowledged deliveries than configured.

use crate::config::ConsumerConfig;
use crate::input::transport::{DeliveryHandle, RawMessage, Subscription, Transport};
use crate::input::InputTarget;
use async_trait::async_trait;
use erl_common::{LoaderError, Result, TransportError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Consumer tag presented to the broker
const CONSUMER_TAG: &str = "erl-loader";

/// Quorum-queue header carrying the broker-side delivery count
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Map a lapin failure onto the reconnectable/fatal taxonomy.
///
/// IO and connection-state failures are worth a reconnect with backoff;
/// protocol-level refusals (bad credentials, declare mismatch) are not.
fn classify(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_) => TransportError::Reconnectable(err.to_string()),
        _ => TransportError::Fatal(err.to_string()),
    }
}

#[derive(Debug)]
pub struct AmqpTransport {
    target: InputTarget,
}

impl AmqpTransport {
    pub fn new(target: InputTarget) -> Self {
        Self { target }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn open(&self, config: &ConsumerConfig) -> Result<Box<dyn Subscription>> {
        // selection already guaranteed these are present for amqp
        let exchange = config
            .exchange
            .as_deref()
            .ok_or_else(|| LoaderError::config("the amqp transport requires --exchange"))?;
        let queue_name = config
            .queue_name
            .as_deref()
            .ok_or_else(|| LoaderError::config("the amqp transport requires --queue-name"))?;

        let connection = Connection::connect(
            self.target.connection_string(),
            ConnectionProperties::default(),
        )
        .await
        .map_err(|e| LoaderError::from(classify(e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| LoaderError::from(classify(e)))?;

        // flow control must be in place before the subscription starts
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| LoaderError::from(classify(e)))?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| LoaderError::from(classify(e)))?;

        // redeclaring an existing queue with matching parameters is a
        // no-op; a mismatch comes back as a protocol error -> fatal
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| LoaderError::from(classify(e)))?;

        channel
            .queue_bind(
                queue_name,
                exchange,
                queue_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| LoaderError::from(classify(e)))?;

        let consumer = channel
            .basic_consume(
                queue_name,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| LoaderError::from(classify(e)))?;

        info!(
            url = %self.target.redacted(),
            exchange = %exchange,
            queue = %queue_name,
            prefetch = config.prefetch_count,
            "amqp subscription open"
        );

        Ok(Box::new(AmqpSubscription {
            connection,
            channel,
            consumer: Mutex::new(consumer),
        }))
    }
}

pub struct AmqpSubscription {
    connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
}

impl AmqpSubscription {
    fn delivery_count(delivery: &lapin::message::Delivery) -> u32 {
        // quorum queues report the exact count; classic queues only flag
        // redelivery, so the best available floor is 2
        let from_header = delivery
            .properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(&ShortString::from(DELIVERY_COUNT_HEADER)))
            .and_then(|value| match value {
                AMQPValue::LongLongInt(n) => Some(*n as u32),
                AMQPValue::LongInt(n) => Some(*n as u32),
                AMQPValue::ShortInt(n) => Some(*n as u32),
                _ => None,
            })
            .map(|prior| prior + 1);

        from_header.unwrap_or(if delivery.redelivered { 2 } else { 1 })
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next(&self) -> Result<Option<RawMessage>> {
        let mut consumer = self.consumer.lock().await;
        match consumer.next().await {
            Some(Ok(delivery)) => {
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_else(|| delivery.delivery_tag.to_string());
                let delivery_count = Self::delivery_count(&delivery);
                debug!(message_id = %message_id, tag = delivery.delivery_tag, "delivery received");
                Ok(Some(RawMessage {
                    body: delivery.data,
                    handle: DeliveryHandle::AmqpTag(delivery.delivery_tag),
                    message_id,
                    delivery_count,
                }))
            },
            Some(Err(e)) => Err(classify(e).into()),
            // the broker tore the consumer down without an orderly close
            None => Err(TransportError::Reconnectable(
                "consumer stream closed by broker".to_string(),
            )
            .into()),
        }
    }

    async fn ack(&self, handle: DeliveryHandle) -> Result<()> {
        let DeliveryHandle::AmqpTag(tag) = handle else {
            return Err(TransportError::Fatal(
                "delivery handle does not belong to the amqp subscription".to_string(),
            )
            .into());
        };
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| LoaderError::from(classify(e)))
    }

    async fn reject(&self, handle: DeliveryHandle) -> Result<()> {
        let DeliveryHandle::AmqpTag(tag) = handle else {
            return Err(TransportError::Fatal(
                "delivery handle does not belong to the amqp subscription".to_string(),
            )
            .into());
        };
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| LoaderError::from(classify(e)))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "shutting down")
            .await
            .map_err(|e| LoaderError::from(classify(e)))
    }
}
