// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Collaborator
//!
//! The broker client the topology helper drives. The helper only ever talks
//! to these traits: [`crate::channel::LapinTransport`] implements them on top
//! of `lapin`, and tests replace them with mocks.

use crate::{
    config::ConnectionOptions, errors::TransportError, exchange::ExchangeOptions,
    queue::{ListenOptions, QueueOptions},
};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc::UnboundedReceiver;

/// Message headers in transport-neutral form.
pub type Headers = BTreeMap<String, Value>;

/// Lifecycle signals raised by an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// A failure that does not by itself mean the connection is gone.
    Error(TransportError),
    /// A connection-level failure; [`TransportError::is_unexpected_close`]
    /// tells whether the connection was lost.
    ConnectionError(TransportError),
    /// The transport re-established a lost connection.
    Reconnected,
}

/// Delivery options handed to [`TransportExchange::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOptions {
    pub persistent: bool,
    pub mandatory: bool,
    pub content_type: String,
    pub message_id: String,
    pub kind: Option<String>,
    pub headers: Headers,
}

/// Routing information of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryFields {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Broker-native properties of a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub correlation_id: Option<String>,
    pub app_id: Option<String>,
    pub timestamp: Option<u64>,
    pub delivery_mode: Option<u8>,
}

/// Settles a single delivery with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), TransportError>;
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// A message as delivered by the transport.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub fields: DeliveryFields,
    pub properties: MessageProperties,
    pub acker: Box<dyn Acknowledge>,
}

/// Receives deliveries from a queue the transport listens on.
#[async_trait]
pub trait DeliveryListener: Send + Sync {
    async fn on_delivery(&self, delivery: Delivery);
}

/// Opens broker connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

/// An open broker connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn TransportExchange>, TransportError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Arc<dyn TransportQueue>, TransportError>;

    /// Hands out the signal stream of this connection. Only the first call
    /// returns it.
    fn take_signals(&self) -> Option<UnboundedReceiver<ConnectionSignal>>;
}

/// A declared exchange.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportExchange: Send + Sync {
    fn name(&self) -> String;

    /// Sends one message; `Ok(false)` means the broker did not take it.
    async fn send(
        &self,
        routing_key: &str,
        payload: &[u8],
        options: &DeliveryOptions,
    ) -> Result<bool, TransportError>;
}

/// A declared queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransportQueue: Send + Sync {
    fn name(&self) -> String;

    async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), TransportError>;

    async fn listen(
        &self,
        options: ListenOptions,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<(), TransportError>;
}
