// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Topology Helper
//!
//! `AmqpError` covers every failure the helper reports after construction:
//! transport failures while establishing the topology, misuse of the public
//! operations and consumer acknowledgement failures. Configuration failures
//! live in [`crate::config::ConfigError`] because they are the only ones
//! raised synchronously.

use thiserror::Error;

/// Message a transport uses to signal that the broker connection dropped.
pub const UNEXPECTED_CLOSE: &str = "Unexpected close";

/// Error produced by a transport collaborator.
///
/// The helper never inspects it beyond its message, which is compared
/// against [`UNEXPECTED_CLOSE`] to detect a lost connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct TransportError {
    message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        TransportError {
            message: message.into(),
        }
    }

    /// The error a transport surfaces when the connection was lost.
    pub fn unexpected_close() -> Self {
        TransportError::new(UNEXPECTED_CLOSE)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_unexpected_close(&self) -> bool {
        self.message == UNEXPECTED_CLOSE
    }
}

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        TransportError::new(err.to_string())
    }
}

/// Represents errors that can occur while establishing the topology or
/// using it.
///
/// Transport failures are reported through the lifecycle event surface and
/// leave the helper usable. Misuse errors are returned to the caller and,
/// for handler registration, also reported as an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(TransportError),

    /// Error surfaced by an open connection
    #[error("connection failure: {0}")]
    ConnectionSignal(TransportError),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, TransportError),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, TransportError),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, TransportError),

    /// Error attaching the consumer to a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, TransportError),

    /// A message handler was already registered
    #[error("handler_already_set")]
    HandlerAlreadySet,

    /// Publish was attempted before the topology was ready
    #[error("rabbitmq_helper_not_ensured")]
    NotEnsured,

    /// The transport rejected a publish, carried unchanged
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error serialising a message payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(TransportError),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_close_is_recognised_by_message() {
        assert!(TransportError::unexpected_close().is_unexpected_close());
        assert!(TransportError::new("Unexpected close").is_unexpected_close());
        assert!(!TransportError::new("ECONNREFUSED").is_unexpected_close());
    }

    #[test]
    fn misuse_errors_keep_their_wire_names() {
        assert_eq!(AmqpError::HandlerAlreadySet.to_string(), "handler_already_set");
        assert_eq!(AmqpError::NotEnsured.to_string(), "rabbitmq_helper_not_ensured");
    }

    #[test]
    fn transport_errors_are_transparent() {
        let err: AmqpError = TransportError::new("channel closed").into();
        assert_eq!(err.to_string(), "channel closed");
    }
}
