// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options
//!
//! The queue half of the topology configuration: declare flags, the routing
//! key used both for the binding and as the default publish key, and the
//! consumer prefetch count.

use crate::transport::Headers;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declare and consume options of the queue.
///
/// `arguments` are passed to the broker untouched as the declare arguments,
/// e.g. `x-max-priority` or `x-dead-letter-exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub prefetch_count: u16,
    #[serde(default)]
    pub arguments: Headers,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            routing_key: "event-routing".to_owned(),
            durable: true,
            auto_delete: false,
            prefetch_count: 1,
            arguments: Headers::new(),
        }
    }
}

impl QueueOptions {
    /// Sets the routing key used to bind the queue.
    ///
    /// # Parameters
    /// * `key` - The routing key, also the default publish key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets the maximum number of unacknowledged messages held by the consumer.
    ///
    /// # Parameters
    /// * `count` - The prefetch count
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
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

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: false,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }

    pub(crate) fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            ack: true,
            prefetch_count: self.prefetch_count,
        }
    }
}

/// Options used when attaching a consumer to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    /// Deliveries must be acknowledged explicitly.
    pub ack: bool,
    pub prefetch_count: u16,
}

impl ListenOptions {
    pub(crate) fn consume_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: false,
            no_ack: !self.ack,
            exclusive: false,
            nowait: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_always_requires_acknowledgement() {
        let listen = QueueOptions::default().prefetch_count(10).listen_options();
        assert_eq!(
            listen,
            ListenOptions {
                ack: true,
                prefetch_count: 10
            }
        );
        assert!(!listen.consume_options().no_ack);
    }

    #[test]
    fn declare_options_follow_flags() {
        let declare = QueueOptions::default().declare_options();
        assert!(declare.durable);
        assert!(!declare.auto_delete);
        assert!(!declare.exclusive);
    }

    #[test]
    fn arguments_default_to_empty() {
        let options: QueueOptions = serde_json::from_value(serde_json::json!({
            "routingKey": "orders.*",
            "durable": true,
            "autoDelete": false,
            "prefetchCount": 5
        }))
        .unwrap();
        assert!(options.arguments.is_empty());

        let options = options.argument("x-max-priority", 10);
        assert_eq!(options.arguments.get("x-max-priority"), Some(&Value::from(10)));
    }
}
