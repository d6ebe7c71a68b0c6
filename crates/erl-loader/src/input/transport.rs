//! Uniform transport contract for queue adapters
//!
//! Every queue technology plugs in behind the same two traits: a
//! [`Transport`] opens a [`Subscription`], and the subscription hands
//! out deliveries that must each be settled exactly once, by `ack` or
//! by `reject`, never both and never neither. New transports are added
//! by implementing these traits, not by duplicating the worker pool.

use crate::config::ConsumerConfig;
use async_trait::async_trait;
use erl_common::Result;

/// Opaque delivery token.
///
/// Only the subscription that produced a handle can interpret it; the
/// worker pool carries it through processing and returns it on
/// settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryHandle {
    /// AMQP delivery tag
    AmqpTag(u64),
    /// SQS receipt handle
    SqsReceipt(String),
    /// Sequence number used by in-memory transports
    Seq(u64),
}

/// One raw delivery handed to a worker.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// The message body, untouched
    pub body: Vec<u8>,
    /// Settlement token, owned by the worker until ack or reject
    pub handle: DeliveryHandle,
    /// Broker-assigned message identity, for log correlation
    pub message_id: String,
    /// How many times the broker has delivered this message (>= 1)
    pub delivery_count: u32,
}

/// A queue technology that can open consumption sessions.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Short transport name for logs ("amqp", "sqs", ...)
    fn name(&self) -> &'static str;

    /// Connect, declare the target queue, apply flow control, and
    /// subscribe. Declaring an existing queue with matching parameters
    /// is a no-op; a parameter mismatch is a fatal transport error.
    async fn open(&self, config: &ConsumerConfig) -> Result<Box<dyn Subscription>>;
}

/// An open subscription feeding one shared delivery stream.
///
/// `next` returns `Ok(None)` when the input is exhausted in an orderly
/// way; an unexpected stream teardown surfaces as a reconnectable
/// transport error instead.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Receive the next delivery, waiting if none is available
    async fn next(&self) -> Result<Option<RawMessage>>;

    /// Settle a delivery as consumed
    async fn ack(&self, handle: DeliveryHandle) -> Result<()>;

    /// Return a delivery to the broker for redelivery
    async fn reject(&self, handle: DeliveryHandle) -> Result<()>;

    /// Tear down the subscription and its connection
    async fn close(&self) -> Result<()>;
}
