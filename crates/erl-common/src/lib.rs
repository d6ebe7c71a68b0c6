//! Shared foundation for the entity-resolution loader.
//!
//! This crate carries the pieces every loader component needs:
//!
//! - [`error`] - the error taxonomy (configuration, validation,
//!   transport, downstream) shared across the workspace
//! - [`logging`] - tracing subscriber setup driven by environment
//!   variables and configuration
//! - [`record`] - the minimal entity-resolution record schema and its
//!   validator

pub mod error;
pub mod logging;
pub mod record;

pub use error::{LoaderError, Result, TransportError};
pub use record::{validate, Record, ValidationResult};
