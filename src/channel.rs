// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport on `lapin`
//!
//! Production implementation of the transport collaborator. A connection
//! owns one channel with publisher confirms enabled; exchanges and queues
//! declared on it keep that channel until the helper re-declares them.
//!
//! Connection failures reported by `lapin` are surfaced as an
//! `"Unexpected close"` connection error. When `reconnect` is enabled the
//! connection is re-dialled on a fixed interval and `Reconnected` is raised
//! once a fresh channel is open.

use crate::{
    config::ConnectionOptions,
    errors::TransportError,
    exchange::ExchangeOptions,
    queue::{ListenOptions, QueueOptions},
    transport::{
        Acknowledge, ConnectionSignal, Delivery, DeliveryFields, DeliveryListener, DeliveryOptions,
        Headers, MessageProperties, Transport, TransportConnection, TransportExchange,
        TransportQueue,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueBindOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Number, Value};
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default interval between re-dial attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Delivery mode marking a message as persistent.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens `lapin` connections.
#[derive(Debug, Clone)]
pub struct LapinTransport {
    name: String,
    retry_interval: Duration,
}

impl Default for LapinTransport {
    fn default() -> Self {
        LapinTransport::new("rabbitmq-topology")
    }
}

impl LapinTransport {
    /// Creates a transport whose connections carry the given name.
    pub fn new(name: &str) -> Self {
        LapinTransport {
            name: name.to_owned(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Sets how long to wait between re-dial attempts.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        uri: &str,
        options: &ConnectionOptions,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let (conn, channel) = open_channel(uri, &self.name, &failures_tx).await?;

        let shared = Arc::new(LapinConnection {
            uri: uri.to_owned(),
            name: self.name.clone(),
            current: RwLock::new(Session { _conn: conn, channel }),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
            supervisor: Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(
            Arc::downgrade(&shared),
            failures_tx,
            failures_rx,
            options.reconnect,
            self.retry_interval,
        ));
        *shared.supervisor.lock() = Some(supervisor);

        let connection: Arc<dyn TransportConnection> = shared;
        Ok(connection)
    }
}

/// Creates a new AMQP connection and a confirm-enabled channel on it.
///
/// Connection failures reported by `lapin` afterwards are forwarded to
/// `failures`.
async fn open_channel(
    uri: &str,
    name: &str,
    failures: &UnboundedSender<lapin::Error>,
) -> Result<(Connection, Channel), TransportError> {
    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(TransportError::from(err))
        }
    }?;
    debug!("amqp connected");

    let failures = failures.clone();
    conn.on_error(move |err| {
        let _ = failures.send(err);
    });

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(TransportError::from(err))
        }
    }?;

    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to enable publisher confirms");
            TransportError::from(err)
        })?;
    debug!("channel created");

    Ok((conn, channel))
}

/// Watches connection failures, re-dialling when enabled.
async fn supervise(
    shared: Weak<LapinConnection>,
    failures_tx: UnboundedSender<lapin::Error>,
    mut failures_rx: UnboundedReceiver<lapin::Error>,
    reconnect: bool,
    retry_interval: Duration,
) {
    while let Some(err) = failures_rx.recv().await {
        let Some(connection) = shared.upgrade() else {
            break;
        };

        warn!(error = err.to_string(), "amqp connection lost");
        connection.signal(ConnectionSignal::ConnectionError(
            TransportError::unexpected_close(),
        ));

        if !reconnect {
            continue;
        }

        let (uri, name) = (connection.uri.clone(), connection.name.clone());
        drop(connection);

        loop {
            tokio::time::sleep(retry_interval).await;

            match open_channel(&uri, &name, &failures_tx).await {
                Ok((conn, channel)) => {
                    let Some(connection) = shared.upgrade() else {
                        return;
                    };
                    *connection.current.write() = Session { _conn: conn, channel };

                    // failures raised by the dead connection are stale now
                    while failures_rx.try_recv().is_ok() {}

                    info!("amqp connection re-established");
                    connection.signal(ConnectionSignal::Reconnected);
                    break;
                }
                Err(err) => {
                    warn!(error = err.to_string(), "failure to re-establish amqp connection");
                }
            }
        }
    }
}

struct Session {
    /// Held only to keep the connection open while its channel is in use.
    _conn: Connection,
    channel: Channel,
}

/// A `lapin` connection with its current channel.
pub struct LapinConnection {
    uri: String,
    name: String,
    current: RwLock<Session>,
    signals_tx: UnboundedSender<ConnectionSignal>,
    signals_rx: Mutex<Option<UnboundedReceiver<ConnectionSignal>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl LapinConnection {
    fn channel(&self) -> Channel {
        self.current.read().channel.clone()
    }

    fn signal(&self, signal: ConnectionSignal) {
        if self.signals_tx.send(signal).is_err() {
            debug!("connection signal dropped, nobody is listening");
        }
    }
}

impl Drop for LapinConnection {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
    }
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn declare_exchange(
        &self,
        name: &str,
        options: &ExchangeOptions,
    ) -> Result<Arc<dyn TransportExchange>, TransportError> {
        debug!("creating exchange: {}", name);
        let channel = self.channel();

        match channel
            .exchange_declare(
                name,
                (&options.kind).into(),
                options.declare_options(),
                field_table(&options.arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the exchange");
                Err(TransportError::from(err))
            }
            _ => {
                debug!("exchange: {} was created", name);
                Ok(Arc::new(LapinExchange {
                    channel,
                    name: name.to_owned(),
                }))
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<Arc<dyn TransportQueue>, TransportError> {
        debug!("creating queue: {}", name);
        let channel = self.channel();

        match channel
            .queue_declare(name, options.declare_options(), field_table(&options.arguments))
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = name, "error to declare the queue");
                Err(TransportError::from(err))
            }
            _ => {
                debug!("queue: {} was created", name);
                Ok(Arc::new(LapinQueue {
                    channel,
                    name: name.to_owned(),
                }))
            }
        }
    }

    fn take_signals(&self) -> Option<UnboundedReceiver<ConnectionSignal>> {
        self.signals_rx.lock().take()
    }
}

/// An exchange declared on a `lapin` channel.
pub struct LapinExchange {
    channel: Channel,
    name: String,
}

#[async_trait]
impl TransportExchange for LapinExchange {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn send(
        &self,
        routing_key: &str,
        payload: &[u8],
        options: &DeliveryOptions,
    ) -> Result<bool, TransportError> {
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(options.content_type.clone()))
            .with_message_id(ShortString::from(options.message_id.clone()))
            .with_headers(field_table(&options.headers));

        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        if let Some(kind) = &options.kind {
            properties = properties.with_type(ShortString::from(kind.clone()));
        }

        let confirm = self
            .channel
            .basic_publish(
                &self.name,
                routing_key,
                BasicPublishOptions {
                    mandatory: options.mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                TransportError::from(err)
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), "error awaiting publish confirmation");
            TransportError::from(err)
        })?;

        Ok(delivered(confirmation))
    }
}

fn delivered(confirmation: Confirmation) -> bool {
    match confirmation {
        Confirmation::Ack(returned) => returned.is_none(),
        Confirmation::Nack(_) => false,
        Confirmation::NotRequested => true,
    }
}

/// A queue declared on a `lapin` channel.
///
/// Consumers started by [`listen`](TransportQueue::listen) run until their
/// channel closes, independently of this handle.
pub struct LapinQueue {
    channel: Channel,
    name: String,
}

#[async_trait]
impl TransportQueue for LapinQueue {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn bind(&self, exchange: &str, routing_key: &str) -> Result<(), TransportError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.name, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                &self.name,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(TransportError::from(err))
            }
            _ => {
                debug!("queue was bounded");
                Ok(())
            }
        }
    }

    async fn listen(
        &self,
        options: ListenOptions,
        listener: Arc<dyn DeliveryListener>,
    ) -> Result<(), TransportError> {
        self.channel
            .basic_qos(options.prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                TransportError::from(err)
            })?;

        let tag = format!("{}-{}", self.name, Uuid::new_v4());
        let mut consumer = match self
            .channel
            .basic_consume(
                &self.name,
                &tag,
                options.consume_options(),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(TransportError::from(err))
            }
            Ok(c) => Ok(c),
        }?;

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => listener.on_delivery(normalize(delivery)).await,
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!("consumer stream ended");
        });

        Ok(())
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }
}

fn normalize(delivery: LapinDelivery) -> Delivery {
    let props = &delivery.properties;

    let headers = props
        .headers()
        .as_ref()
        .map(|table| headers(table.inner()))
        .unwrap_or_default();

    let properties = MessageProperties {
        content_type: props.content_type().as_ref().map(ToString::to_string),
        message_id: props.message_id().as_ref().map(ToString::to_string),
        kind: props.kind().as_ref().map(ToString::to_string),
        correlation_id: props.correlation_id().as_ref().map(ToString::to_string),
        app_id: props.app_id().as_ref().map(ToString::to_string),
        timestamp: *props.timestamp(),
        delivery_mode: *props.delivery_mode(),
    };

    Delivery {
        payload: delivery.data,
        headers,
        fields: DeliveryFields {
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
        },
        properties,
        acker: Box::new(LapinAcker(delivery.acker)),
    }
}

fn headers(table: &BTreeMap<ShortString, AMQPValue>) -> Headers {
    table
        .iter()
        .map(|(key, value)| (key.to_string(), json_value(value)))
        .collect()
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Number::from_f64(f64::from(*v)).map_or(Value::Null, Value::Number),
        AMQPValue::Double(v) => Number::from_f64(*v).map_or(Value::Null, Value::Number),
        AMQPValue::ShortString(v) => Value::String(v.to_string()),
        AMQPValue::LongString(v) => Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::FieldArray(v) => Value::Array(v.as_slice().iter().map(json_value).collect()),
        AMQPValue::FieldTable(v) => Value::Object(
            v.inner()
                .iter()
                .map(|(key, value)| (key.to_string(), json_value(value)))
                .collect::<Map<String, Value>>(),
        ),
        _ => Value::Null,
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    FieldTable::from(
        headers
            .iter()
            .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => AMQPValue::LongLongInt(v),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => AMQPValue::FieldTable(field_table(
            &map.iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect::<Headers>(),
        )),
    }
}
