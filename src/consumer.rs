// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! Binds the single user handler to the queue. Every delivery is turned into
//! a [`QueueItem`] carrying the payload, headers, routing fields, raw
//! properties and the means to acknowledge it, and handed to the handler
//! exactly once. Nothing is acknowledged on the handler's behalf.

use crate::{
    errors::AmqpError,
    otel,
    transport::{Acknowledge, Delivery, DeliveryFields, DeliveryListener, Headers, MessageProperties},
};
use async_trait::async_trait;
use opentelemetry::{global, trace::Span, Context};
use serde::de::DeserializeOwned;
use std::{future::Future, sync::Arc};
use tracing::{debug, error};

/// The consumer callback registered on the helper.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, item: QueueItem);
}

#[async_trait]
impl<F, Fut> QueueHandler for F
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, item: QueueItem) {
        (self)(item).await
    }
}

/// A delivered message, valid for one handler invocation.
pub struct QueueItem {
    pub message: Vec<u8>,
    pub headers: Headers,
    pub fields: DeliveryFields,
    pub raw: MessageProperties,
    /// Trace context extracted from the headers.
    pub context: Context,
    acker: Box<dyn Acknowledge>,
}

impl QueueItem {
    /// Confirms the message was processed.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg");
            AmqpError::AckMessageError(err)
        })
    }

    /// Rejects the message, optionally putting it back on the queue.
    pub async fn reject(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            AmqpError::NackMessageError(err)
        })
    }

    /// Decodes the payload as JSON.
    pub fn message_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.message)
    }
}

/// Listener handed to the transport; forwards deliveries to the handler.
pub(crate) struct HandlerBinding {
    queue: String,
    handler: Arc<dyn QueueHandler>,
}

impl HandlerBinding {
    pub(crate) fn new(queue: &str, handler: Arc<dyn QueueHandler>) -> Self {
        HandlerBinding {
            queue: queue.to_owned(),
            handler,
        }
    }
}

#[async_trait]
impl DeliveryListener for HandlerBinding {
    async fn on_delivery(&self, delivery: Delivery) {
        let tracer = global::tracer("amqp consumer");
        let (context, mut span) = otel::new_span(&delivery.headers, &tracer, &self.queue);

        debug!(
            queue = self.queue.as_str(),
            exchange = delivery.fields.exchange.as_str(),
            routing_key = delivery.fields.routing_key.as_str(),
            "received"
        );

        let item = QueueItem {
            message: delivery.payload,
            headers: delivery.headers,
            fields: delivery.fields,
            raw: delivery.properties,
            context,
            acker: delivery.acker,
        };

        self.handler.handle(item).await;
        span.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::TransportError, transport::MockAcknowledge};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    fn delivery(acker: MockAcknowledge) -> Delivery {
        let mut headers = Headers::new();
        headers.insert("tenant".to_owned(), Value::from("acme"));

        Delivery {
            payload: br#"{"data":1}"#.to_vec(),
            headers,
            fields: DeliveryFields {
                exchange: "testing-exchange".to_owned(),
                routing_key: "event-routing".to_owned(),
                delivery_tag: 7,
                redelivered: false,
            },
            properties: MessageProperties {
                content_type: Some("application/json".to_owned()),
                ..Default::default()
            },
            acker: Box::new(acker),
        }
    }

    #[tokio::test]
    async fn deliveries_are_normalized_and_handed_over_once() {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let handler: Arc<dyn QueueHandler> = Arc::new(move |item: QueueItem| {
            let sink = sink.clone();
            async move {
                let body: Value = item.message_json().unwrap();
                sink.lock().push((body, item.headers.clone(), item.fields.clone(), item.raw.clone()));
                item.ack().await.unwrap();
            }
        });

        let mut acker = MockAcknowledge::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_reject().never();

        HandlerBinding::new("testing-queue", handler)
            .on_delivery(delivery(acker))
            .await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (body, headers, fields, raw) = &seen[0];
        assert_eq!(body, &json!({ "data": 1 }));
        assert_eq!(headers.get("tenant"), Some(&Value::from("acme")));
        assert_eq!(fields.delivery_tag, 7);
        assert_eq!(fields.routing_key, "event-routing");
        assert_eq!(raw.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn nothing_is_acknowledged_without_the_handler() {
        let handler: Arc<dyn QueueHandler> = Arc::new(|_item: QueueItem| async {});

        let mut acker = MockAcknowledge::new();
        acker.expect_ack().never();
        acker.expect_reject().never();

        HandlerBinding::new("testing-queue", handler)
            .on_delivery(delivery(acker))
            .await;
    }

    #[tokio::test]
    async fn settlement_failures_are_returned() {
        let result = Arc::new(Mutex::new(None));
        let sink = result.clone();
        let handler: Arc<dyn QueueHandler> = Arc::new(move |item: QueueItem| {
            let sink = sink.clone();
            async move {
                let outcome = item.reject(true).await;
                *sink.lock() = Some(outcome);
            }
        });

        let mut acker = MockAcknowledge::new();
        acker
            .expect_reject()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Err(TransportError::new("channel closed")));

        HandlerBinding::new("testing-queue", handler)
            .on_delivery(delivery(acker))
            .await;

        assert_eq!(
            result.lock().take(),
            Some(Err(AmqpError::NackMessageError(TransportError::new("channel closed"))))
        );
    }
}
