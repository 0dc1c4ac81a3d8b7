// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing goes to the topology's exchange and is refused outright while
//! the topology is not connected: no I/O happens and the caller gets
//! [`AmqpError::NotEnsured`]. Once connected, the outcome of the exchange
//! send is returned unchanged. Nothing is retried here.

use crate::{
    errors::AmqpError,
    otel,
    topology::{Phase, RabbitMQHelper},
    transport::{DeliveryOptions, Headers},
};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-message publish options. Unset fields take their defaults:
/// persistent, mandatory, JSON content type, a fresh message id and the
/// configured queue routing key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub routing_key: Option<String>,
    pub persistent: Option<bool>,
    pub mandatory: Option<bool>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub headers: Headers,
}

impl PublishOptions {
    /// Overrides the routing key; an empty key keeps the configured one.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Sets whether the message survives a broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Sets whether an unroutable message is returned instead of dropped.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    /// Sets the content type property.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the message id instead of a generated one.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Sets the message type property.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Adds a single message header.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// The routing key and delivery options actually used.
    pub(crate) fn resolve(self, default_routing_key: &str) -> (String, DeliveryOptions) {
        let routing_key = self
            .routing_key
            .filter(|key| !key.is_empty())
            .unwrap_or_else(|| default_routing_key.to_owned());

        let options = DeliveryOptions {
            persistent: self.persistent.unwrap_or(true),
            mandatory: self.mandatory.unwrap_or(true),
            content_type: self
                .content_type
                .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            message_id: self
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            kind: self.kind,
            headers: self.headers,
        };

        (routing_key, options)
    }
}

impl RabbitMQHelper {
    /// Publishes a message with default options.
    ///
    /// Returns whether the broker took the message.
    pub async fn publish(&self, payload: &[u8]) -> Result<bool, AmqpError> {
        self.publish_with(payload, PublishOptions::default()).await
    }

    /// Publishes a message with the given options.
    ///
    /// # Parameters
    /// * `payload` - The message body
    /// * `options` - Delivery options, unset ones take their defaults
    ///
    /// # Returns
    /// Whether the broker took the message, or `NotEnsured` while the
    /// topology is not connected
    pub async fn publish_with(
        &self,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, AmqpError> {
        let exchange = {
            let state = self.inner.state.lock();
            match state.phase {
                Phase::Connected => state.exchange.clone(),
                _ => None,
            }
        };

        let Some(exchange) = exchange else {
            warn!("publish refused, topology not ensured");
            return Err(AmqpError::NotEnsured);
        };

        let (routing_key, mut delivery) =
            options.resolve(&self.inner.config.queue.options.routing_key);
        otel::inject(&Context::current(), &mut delivery.headers);

        debug!(
            routing_key = routing_key.as_str(),
            message_id = delivery.message_id.as_str(),
            "publishing message"
        );

        exchange
            .send(&routing_key, payload, &delivery)
            .await
            .map_err(AmqpError::Transport)
    }

    /// Serialises `message` as JSON and publishes it.
    pub async fn publish_json<T>(
        &self,
        message: &T,
        options: Option<PublishOptions>,
    ) -> Result<bool, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(|err| {
            warn!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        self.publish_with(&payload, options.unwrap_or_default()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::TransportError,
        events::LifecycleEvent,
        topology::tests::{connection_mock, exchange_mock, helper, queue_mock, transport_mock, Recorder},
        transport::{ConnectionSignal, MockTransport, TransportQueue},
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    type Sent = Arc<Mutex<Vec<(String, Vec<u8>, DeliveryOptions)>>>;

    fn recording_exchange(outcome: Result<bool, TransportError>) -> (crate::transport::MockTransportExchange, Sent) {
        let sent: Sent = Arc::new(Mutex::new(vec![]));
        let sink = sent.clone();
        let mut exchange = exchange_mock();
        exchange
            .expect_send()
            .returning(move |routing_key, payload, options| {
                sink.lock()
                    .push((routing_key.to_owned(), payload.to_vec(), options.clone()));
                outcome.clone()
            });
        (exchange, sent)
    }

    #[test]
    fn defaults_apply_to_unset_options() {
        let (routing_key, options) = PublishOptions::default().resolve("event-routing");

        assert_eq!(routing_key, "event-routing");
        assert!(options.persistent);
        assert!(options.mandatory);
        assert_eq!(options.content_type, JSON_CONTENT_TYPE);
        assert!(Uuid::parse_str(&options.message_id).is_ok());
        assert_eq!(options.kind, None);
    }

    #[test]
    fn explicit_options_override_defaults() {
        let (routing_key, options) = PublishOptions::default()
            .routing_key("audit")
            .persistent(false)
            .mandatory(false)
            .message_id("42")
            .kind("order.created")
            .header("tenant", "acme")
            .resolve("event-routing");

        assert_eq!(routing_key, "audit");
        assert!(!options.persistent);
        assert!(!options.mandatory);
        assert_eq!(options.message_id, "42");
        assert_eq!(options.kind.as_deref(), Some("order.created"));
        assert_eq!(options.headers.get("tenant"), Some(&json!("acme")));
    }

    #[test]
    fn empty_routing_key_falls_back() {
        let (routing_key, _) = PublishOptions::default().routing_key("").resolve("event-routing");
        assert_eq!(routing_key, "event-routing");
    }

    #[tokio::test]
    async fn publish_before_start_fails_fast() {
        let (subscriber, recorder) = Recorder::new();
        let helper = helper(MockTransport::new(), subscriber);

        assert_eq!(helper.publish(b"{}").await, Err(AmqpError::NotEnsured));
        assert_eq!(
            helper.publish_json(&json!({ "data": 1 }), None).await,
            Err(AmqpError::NotEnsured)
        );
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn publish_round_trips_the_transport_outcome() {
        let (subscriber, _recorder) = Recorder::new();
        let (exchange, sent) = recording_exchange(Ok(true));
        let queue: Arc<dyn TransportQueue> = Arc::new(queue_mock(1));
        let (connection, _signals) = connection_mock(Arc::new(exchange), queue, 1);
        let helper = helper(transport_mock(connection), subscriber);
        helper.start().await;

        assert_eq!(helper.publish_json(&json!({ "data": 1 }), None).await, Ok(true));

        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        let (routing_key, payload, options) = &sent[0];
        assert_eq!(routing_key, "event-routing");
        assert_eq!(payload, br#"{"data":1}"#);
        assert!(options.persistent);
        assert!(options.mandatory);
    }

    #[tokio::test]
    async fn both_overloads_share_defaults() {
        let (subscriber, _recorder) = Recorder::new();
        let (exchange, sent) = recording_exchange(Ok(true));
        let queue: Arc<dyn TransportQueue> = Arc::new(queue_mock(1));
        let (connection, _signals) = connection_mock(Arc::new(exchange), queue, 1);
        let helper = helper(transport_mock(connection), subscriber);
        helper.start().await;

        helper.publish(b"a").await.unwrap();
        helper.publish_with(b"a", PublishOptions::default()).await.unwrap();

        let sent = sent.lock();
        let strip = |(key, payload, options): &(String, Vec<u8>, DeliveryOptions)| {
            (
                key.clone(),
                payload.clone(),
                options.persistent,
                options.mandatory,
                options.content_type.clone(),
            )
        };
        assert_eq!(strip(&sent[0]), strip(&sent[1]));
    }

    #[tokio::test]
    async fn send_failures_are_returned_unchanged() {
        let (subscriber, recorder) = Recorder::new();
        let (exchange, _sent) = recording_exchange(Err(TransportError::new("NOT_FOUND")));
        let queue: Arc<dyn TransportQueue> = Arc::new(queue_mock(1));
        let (connection, _signals) = connection_mock(Arc::new(exchange), queue, 1);
        let helper = helper(transport_mock(connection), subscriber);
        helper.start().await;

        assert_eq!(
            helper.publish(b"{}").await,
            Err(AmqpError::Transport(TransportError::new("NOT_FOUND")))
        );
        assert_eq!(recorder.events(), vec![LifecycleEvent::Initialized]);
    }

    #[tokio::test]
    async fn undelivered_messages_report_false() {
        let (subscriber, _recorder) = Recorder::new();
        let (exchange, _sent) = recording_exchange(Ok(false));
        let queue: Arc<dyn TransportQueue> = Arc::new(queue_mock(1));
        let (connection, _signals) = connection_mock(Arc::new(exchange), queue, 1);
        let helper = helper(transport_mock(connection), subscriber);
        helper.start().await;

        assert_eq!(helper.publish(b"{}").await, Ok(false));
    }

    #[tokio::test]
    async fn publish_while_reconnecting_sends_nothing() {
        let (subscriber, mut recorder) = Recorder::new();
        let mut exchange = exchange_mock();
        exchange.expect_send().never();
        let queue: Arc<dyn TransportQueue> = Arc::new(queue_mock(1));
        let (connection, signals) = connection_mock(Arc::new(exchange), queue, 1);
        let helper = helper(transport_mock(connection), subscriber);
        helper.start().await;
        recorder.drain();

        signals
            .send(ConnectionSignal::ConnectionError(TransportError::unexpected_close()))
            .unwrap();
        recorder.next().await;

        assert_eq!(helper.publish(b"{}").await, Err(AmqpError::NotEnsured));
    }
}
