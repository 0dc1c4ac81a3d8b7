// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Lifecycle
//!
//! [`RabbitMQHelper`] owns one connection, one exchange and one queue and
//! keeps them established for its whole lifetime. Setup runs as a strictly
//! ordered cascade, each step starting only once the previous one succeeded:
//!
//! 1. connect the transport
//! 2. declare the exchange
//! 3. declare the queue
//! 4. bind the queue to the exchange, after which the phase is `Connected`
//! 5. attach the registered handler, if any
//!
//! A failing step reports an error event and stops the cascade; the helper
//! stays usable. An unexpected close moves the phase to `Reconnecting`, and
//! the transport's `Reconnected` signal re-runs the cascade from step 2.
//! Without `reconnect` the lost connection is dropped instead and the next
//! `start` dials a fresh one.
//!
//! Each cascade carries a generation number so an older cascade overtaken by
//! a newer one, or by an unexpected close, stops at its next step.

use crate::{
    config::{resolve, ConfigError, TopologyConfig, ValidationMode},
    consumer::{HandlerBinding, QueueHandler},
    errors::AmqpError,
    events::{EventSubscriber, EventSurface, LifecycleEvent},
    transport::{
        ConnectionSignal, Transport, TransportConnection, TransportExchange, TransportQueue,
    },
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tracing::{debug, info, warn};

/// Lifecycle phase of the topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    /// Never established yet.
    #[default]
    Initializing,
    /// Exchange, queue and binding are in place.
    Connected,
    /// The connection was lost; waiting for the transport to recover.
    Reconnecting,
}

#[derive(Default)]
pub(crate) struct TopologyState {
    pub(crate) phase: Phase,
    connection: Option<Arc<dyn TransportConnection>>,
    pub(crate) exchange: Option<Arc<dyn TransportExchange>>,
    queue: Option<Arc<dyn TransportQueue>>,
    handler: Option<Arc<dyn QueueHandler>>,
    listening: bool,
    /// Set once the first cascade completed.
    established: bool,
    cascade: u64,
    watcher: Option<JoinHandle<()>>,
}

pub(crate) struct Topology {
    pub(crate) config: TopologyConfig,
    transport: Arc<dyn Transport>,
    pub(crate) events: EventSurface,
    pub(crate) state: Mutex<TopologyState>,
}

/// Declares an exchange and a queue, binds them, feeds the queue to a single
/// handler and exposes a guarded publish, re-establishing all of it after a
/// lost connection.
///
/// Construction only validates and stores the configuration; nothing is
/// connected until [`start`](RabbitMQHelper::start) is awaited.
#[derive(Clone)]
pub struct RabbitMQHelper {
    pub(crate) inner: Arc<Topology>,
}

impl RabbitMQHelper {
    /// Creates a helper for an already resolved configuration.
    ///
    /// # Parameters
    /// * `config` - The resolved topology configuration
    /// * `transport` - The broker client, usually a [`crate::LapinTransport`]
    /// * `subscriber` - Receives every lifecycle event, if given
    pub fn new(
        config: TopologyConfig,
        transport: Arc<dyn Transport>,
        subscriber: Option<EventSubscriber>,
    ) -> Self {
        RabbitMQHelper {
            inner: Arc::new(Topology {
                config,
                transport,
                events: EventSurface::new(subscriber),
                state: Mutex::new(TopologyState::default()),
            }),
        }
    }

    /// Resolves the user configuration document and creates a helper.
    ///
    /// Fails before anything is built when the document is invalid.
    pub fn from_value(
        value: &Value,
        mode: ValidationMode,
        transport: Arc<dyn Transport>,
        subscriber: Option<EventSubscriber>,
    ) -> Result<Self, ConfigError> {
        let config = resolve(value, mode)?;
        Ok(RabbitMQHelper::new(config, transport, subscriber))
    }

    /// Connects, unless already connected, and runs the setup cascade.
    ///
    /// Safe to call again: after a failed connect it retries the connection,
    /// once connected it re-declares and re-binds without raising events.
    pub async fn start(&self) {
        self.inner.start().await
    }

    /// The current lifecycle phase.
    ///
    /// # Returns
    /// `Connected` once exchange, queue and binding are in place
    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Whether publishing is currently allowed.
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Connected
    }

    /// The resolved configuration the helper was built with.
    pub fn config(&self) -> &TopologyConfig {
        &self.inner.config
    }

    /// Registers the queue handler.
    ///
    /// Consumption starts right away when the topology is connected and
    /// otherwise once the binding completes. Only one handler may ever be
    /// registered; a second one is rejected and reported as an error event.
    pub async fn register_handler<H>(&self, handler: H) -> Result<(), AmqpError>
    where
        H: QueueHandler + 'static,
    {
        let accepted = {
            let mut state = self.inner.state.lock();
            if state.handler.is_some() {
                false
            } else {
                state.handler = Some(Arc::new(handler));
                true
            }
        };

        if !accepted {
            warn!("a queue handler is already registered");
            self.inner.events.report(AmqpError::HandlerAlreadySet);
            return Err(AmqpError::HandlerAlreadySet);
        }

        self.inner.listen().await;
        Ok(())
    }
}

impl Drop for Topology {
    fn drop(&mut self) {
        if let Some(watcher) = self.state.get_mut().watcher.take() {
            watcher.abort();
        }
    }
}

impl Topology {
    async fn start(self: &Arc<Self>) {
        let connection = self.state.lock().connection.clone();

        let connection = match connection {
            Some(connection) => connection,
            None => match self.connect().await {
                Some(connection) => connection,
                None => return,
            },
        };

        self.ensure(connection).await
    }

    async fn connect(self: &Arc<Self>) -> Option<Arc<dyn TransportConnection>> {
        debug!(host = self.config.connection.host.as_str(), "connecting");

        let connection = match self
            .transport
            .connect(&self.config.uri(), &self.config.connection.options)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                self.events.report(AmqpError::ConnectionError(err));
                return None;
            }
        };

        let watcher = connection
            .take_signals()
            .map(|signals| tokio::spawn(watch(Arc::downgrade(self), signals)));

        let mut state = self.state.lock();
        state.connection = Some(connection.clone());
        if let Some(previous) = std::mem::replace(&mut state.watcher, watcher) {
            previous.abort();
        }

        Some(connection)
    }

    async fn on_signal(self: &Arc<Self>, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::ConnectionError(err) => {
                if err.is_unexpected_close() {
                    let mut state = self.state.lock();
                    state.phase = Phase::Reconnecting;
                    state.listening = false;
                    // a cascade still running on the lost connection must not finish
                    state.cascade += 1;
                    if self.config.connection.options.reconnect {
                        warn!("connection closed unexpectedly, waiting for reconnection");
                    } else {
                        state.connection = None;
                        warn!("connection closed unexpectedly, start again to reconnect");
                    }
                }
                self.events.report(AmqpError::ConnectionSignal(err));
            }
            ConnectionSignal::Error(err) => self.events.report(AmqpError::ConnectionSignal(err)),
            ConnectionSignal::Reconnected => {
                info!("transport reconnected, re-establishing topology");
                let connection = self.state.lock().connection.clone();
                if let Some(connection) = connection {
                    self.ensure(connection).await;
                }
            }
        }
    }

    /// Steps 2 to 5 of the cascade.
    async fn ensure(self: &Arc<Self>, connection: Arc<dyn TransportConnection>) {
        let cascade = {
            let mut state = self.state.lock();
            state.cascade += 1;
            state.cascade
        };

        let exchange_config = &self.config.exchange;
        let exchange = match connection
            .declare_exchange(&exchange_config.name, &exchange_config.options)
            .await
        {
            Ok(exchange) => exchange,
            Err(err) => {
                return self.events.report(AmqpError::DeclareExchangeError(
                    exchange_config.name.clone(),
                    err,
                ))
            }
        };
        let exchange_name = exchange.name();
        if !self.advance(cascade, |state| state.exchange = Some(exchange)) {
            return;
        }

        let queue_config = &self.config.queue;
        let queue = match connection
            .declare_queue(&queue_config.name, &queue_config.options)
            .await
        {
            Ok(queue) => queue,
            Err(err) => {
                return self
                    .events
                    .report(AmqpError::DeclareQueueError(queue_config.name.clone(), err))
            }
        };
        if !self.advance(cascade, |state| state.queue = Some(queue.clone())) {
            return;
        }

        let routing_key = &queue_config.options.routing_key;
        if let Err(err) = queue.bind(&exchange_name, routing_key).await {
            return self.events.report(AmqpError::BindingExchangeToQueueError(
                exchange_name,
                queue.name(),
                err,
            ));
        }

        let mut previous = None;
        if !self.advance(cascade, |state| {
            let phase = std::mem::replace(&mut state.phase, Phase::Connected);
            previous = Some((phase, std::mem::replace(&mut state.established, true)));
        }) {
            return;
        }

        match previous {
            Some((_, false)) => self.events.emit(LifecycleEvent::Initialized),
            Some((Phase::Reconnecting, true)) => self.events.emit(LifecycleEvent::Reconnected),
            _ => debug!("topology re-ensured"),
        }

        self.listen().await
    }

    /// Applies `step` if `cascade` is still the latest one.
    fn advance(&self, cascade: u64, step: impl FnOnce(&mut TopologyState)) -> bool {
        let mut state = self.state.lock();
        if state.cascade != cascade {
            debug!(cascade, latest = state.cascade, "superseded cascade stopped");
            return false;
        }

        step(&mut state);
        true
    }

    /// Step 5: attaches the handler once per established queue.
    async fn listen(self: &Arc<Self>) {
        let (queue, handler) = {
            let mut state = self.state.lock();
            if state.phase != Phase::Connected || state.listening {
                return;
            }
            let (Some(queue), Some(handler)) = (state.queue.clone(), state.handler.clone()) else {
                return;
            };
            state.listening = true;
            (queue, handler)
        };

        let name = queue.name();
        let binding = Arc::new(HandlerBinding::new(&name, handler));

        match queue
            .listen(self.config.queue.options.listen_options(), binding)
            .await
        {
            Ok(()) => self.events.emit(LifecycleEvent::QueueListening),
            Err(err) => {
                self.state.lock().listening = false;
                self.events.report(AmqpError::BindingConsumerError(name, err));
            }
        }
    }
}

async fn watch(topology: Weak<Topology>, mut signals: UnboundedReceiver<ConnectionSignal>) {
    while let Some(signal) = signals.recv().await {
        let Some(topology) = topology.upgrade() else {
            break;
        };
        topology.on_signal(signal).await;
    }
    debug!("connection signals closed");
}
