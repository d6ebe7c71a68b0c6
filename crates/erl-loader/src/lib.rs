//! Entity-resolution queue loader
//!
//! Consumes entity-resolution records from a message queue and feeds
//! them, one at a time, into a downstream resolution engine. Each
//! message is acknowledged only after it has been processed or
//! terminally rejected.
//!
//! The crate is organized around four pieces:
//!
//! - [`config`] - the immutable [`config::ConsumerConfig`] built once
//!   from flags, environment, and an optional config file
//! - [`input`] - input URL parsing, transport selection, and the
//!   queue transport adapters (AMQP broker, SQS cloud queue)
//! - [`consumer`] - the bounded worker pool that validates, forwards,
//!   and acknowledges deliveries
//! - [`engine`] - the gateway interface to the resolution engine

pub mod config;
pub mod consumer;
pub mod engine;
pub mod input;

pub use config::{ConsumerConfig, EngineErrorPolicy};
pub use engine::EngineGateway;
