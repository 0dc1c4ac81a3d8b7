// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Options
//!
//! The exchange half of the topology configuration: the exchange type and
//! the declare flags, plus their translation into `lapin` declare arguments.

use crate::transport::Headers;
use lapin::options::ExchangeDeclareOptions;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declare argument naming the routing type of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Exchange type provided by the delayed message plugin
pub const DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Plugin-provided types such as `x-delayed-message`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl From<String> for ExchangeKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            _ => ExchangeKind::Custom(value),
        }
    }
}

impl From<ExchangeKind> for String {
    fn from(kind: ExchangeKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl ExchangeKind {
    /// The broker-facing name of the exchange type.
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

/// Declare options of the exchange.
///
/// Serialised with the broker-facing key names (`type`, `autoDelete`).
/// `arguments` are passed to the broker untouched as the declare arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeOptions {
    #[serde(rename = "type")]
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Headers,
}

impl ExchangeOptions {
    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Adds a single declare argument.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Turns the exchange into a delayed exchange routing like `routing`.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Parameters
    /// * `routing` - How the exchange routes once the delay expired
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delayed(self, routing: ExchangeKind) -> Self {
        let routing = routing.as_str().to_owned();
        self.kind(ExchangeKind::Custom(DELAYED_MESSAGE_EXCHANGE.to_owned()))
            .argument(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE, routing)
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: false,
            nowait: false,
        }
    }
}
