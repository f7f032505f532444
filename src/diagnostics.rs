// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Diagnostics Bus
//!
//! Out-of-band notifications about the broker link: errors, connection
//! closure, published and consumed messages. Every broker handle owns its own
//! bus; subscribers attach with [`DiagnosticsBus::subscribe`] and each of them
//! observes the events emitted after subscribing, in emission order.
//!
//! Synchronous operations still return their errors to the caller. The bus is
//! the only place where consume-time handler failures become visible.

use crate::{config::DEFAULT_DIAGNOSTICS_CAPACITY, errors::AmqpError, errors::ErrorKind};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// A notification emitted by the broker components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticEvent {
    Error {
        kind: ErrorKind,
        cause: String,
    },
    ConnectionClosed {
        reason: Option<String>,
    },
    /// Metadata of a sent message; the payload itself is never included.
    MessagePublished {
        destination: String,
        routing_key: Option<String>,
        payload_size: usize,
    },
    MessageConsumed {
        queue: String,
        delivery_tag: u64,
        redelivered: bool,
    },
}

/// Broadcast channel carrying [`DiagnosticEvent`]s.
#[derive(Debug, Clone)]
pub struct DiagnosticsBus {
    sender: broadcast::Sender<DiagnosticEvent>,
}

impl Default for DiagnosticsBus {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTICS_CAPACITY)
    }
}

impl DiagnosticsBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attaches a new independent subscriber.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// `RecvError::Lagged` and loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Logs the event and hands it to every current subscriber.
    pub fn emit(&self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::Error { kind, cause } => {
                error!(kind = ?kind, error = cause.as_str(), "amqp failure")
            }
            DiagnosticEvent::ConnectionClosed { reason } => {
                info!(reason = ?reason, "amqp connection closed")
            }
            DiagnosticEvent::MessagePublished {
                destination,
                routing_key,
                payload_size,
            } => debug!(
                destination = destination.as_str(),
                routing_key = ?routing_key,
                payload_size,
                "message published"
            ),
            DiagnosticEvent::MessageConsumed {
                queue,
                delivery_tag,
                redelivered,
            } => debug!(
                queue = queue.as_str(),
                delivery_tag,
                redelivered,
                "message consumed"
            ),
        }

        // No subscribers is not a failure.
        let _ = self.sender.send(event);
    }

    /// Mirrors an error onto the bus.
    pub fn error(&self, err: &AmqpError) {
        self.emit(DiagnosticEvent::Error {
            kind: err.kind(),
            cause: err.to_string(),
        });
    }

    /// Passes `result` through, emitting its error first if there is one.
    pub fn mirror<T>(&self, result: Result<T, AmqpError>) -> Result<T, AmqpError> {
        if let Err(err) = &result {
            self.error(err);
        }
        result
    }
}
