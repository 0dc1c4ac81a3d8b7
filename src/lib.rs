// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Keeps a RabbitMQ exchange, queue and binding established for the lifetime
//! of a process, feeds the queue to one handler and guards publishing until
//! the topology is in place.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use channel::LapinTransport;
pub use config::{resolve, ConfigError, TopologyConfig, ValidationMode};
pub use consumer::{QueueHandler, QueueItem};
pub use errors::{AmqpError, TransportError};
pub use events::{EventSubscriber, LifecycleEvent};
pub use publisher::PublishOptions;
pub use topology::{Phase, RabbitMQHelper};
