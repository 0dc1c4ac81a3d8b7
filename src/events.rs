// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Events
//!
//! The notification surface of the topology helper. Events go to a single
//! subscriber function, synchronously, from inside the step that raised
//! them. Nothing is buffered: events raised before a subscriber exists are
//! only logged.

use crate::errors::AmqpError;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{error, info};

/// Something that happened to the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The topology was established for the first time.
    Initialized,
    /// The topology was re-established after a lost connection.
    Reconnected,
    /// A failure was reported; the helper stays usable.
    Error { cause: AmqpError, message: String },
    /// The registered handler started consuming.
    QueueListening,
}

impl LifecycleEvent {
    pub fn error(cause: AmqpError) -> Self {
        let message = cause.to_string();
        LifecycleEvent::Error {
            message: if message.is_empty() {
                "no_message".to_owned()
            } else {
                message
            },
            cause,
        }
    }

    /// The name the event is known by, e.g. for log correlation.
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Initialized => "initialized",
            LifecycleEvent::Reconnected => "reconnected",
            LifecycleEvent::Error { .. } => "error",
            LifecycleEvent::QueueListening => "queue-listening",
        }
    }
}

/// The subscriber function receiving every lifecycle event.
pub type EventSubscriber = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// A subscriber forwarding events into a channel, for consumers that prefer
/// awaiting events over reacting to them inline.
pub fn channel() -> (EventSubscriber, UnboundedReceiver<LifecycleEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscriber: EventSubscriber = Arc::new(move |event: &LifecycleEvent| {
        let _ = tx.send(event.clone());
    });
    (subscriber, rx)
}

#[derive(Clone, Default)]
pub(crate) struct EventSurface {
    subscriber: Option<EventSubscriber>,
}

impl EventSurface {
    pub(crate) fn new(subscriber: Option<EventSubscriber>) -> Self {
        EventSurface { subscriber }
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        match &event {
            LifecycleEvent::Error { message, .. } => {
                error!(event = event.name(), error = message.as_str(), "topology error")
            }
            _ => info!(event = event.name(), "topology event"),
        }

        if let Some(subscriber) = &self.subscriber {
            subscriber(&event);
        }
    }

    pub(crate) fn report(&self, cause: AmqpError) {
        self.emit(LifecycleEvent::error(cause));
    }
}
