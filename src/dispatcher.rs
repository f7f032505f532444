// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module registers consumers on queues and runs one tokio task per
//! subscription that feeds deliveries to the caller's handler.
//!
//! Deliveries of one subscription are handled one at a time and in order;
//! separate subscriptions run concurrently. Once `consume` returned, handler
//! failures are only visible on the diagnostics bus.

use crate::{
    channel::ChannelSupervisor,
    consumer::{consume, ConsumeContext, HandlerKind},
    diagnostics::DiagnosticsBus,
    errors::AmqpError,
    handler::{ConsumerHandler, DelegatedConsumerHandler},
    transport::{AmqpChannel, DeliveryStream},
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
};
use opentelemetry::global;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where and how to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) prefetch: Option<u16>,
}

impl ConsumerDefinition {
    /// Consumes `queue` with explicit acknowledgments and a generated tag.
    pub fn new(queue: &str) -> Self {
        ConsumerDefinition {
            queue: queue.to_owned(),
            consumer_tag: format!("{}-{}", queue, Uuid::new_v4()),
            no_ack: false,
            exclusive: false,
            prefetch: None,
        }
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Lets the broker consider messages settled as soon as they are sent.
    pub fn no_ack(mut self, no_ack: bool) -> Self {
        self.no_ack = no_ack;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Limits the number of unacknowledged deliveries on the channel.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }
}

impl From<&str> for ConsumerDefinition {
    fn from(queue: &str) -> Self {
        ConsumerDefinition::new(queue)
    }
}

/// Registers consumers.
#[derive(Clone)]
pub struct ConsumeDispatcher {
    channels: ChannelSupervisor,
    diagnostics: DiagnosticsBus,
}

impl ConsumeDispatcher {
    pub(crate) fn new(channels: ChannelSupervisor, diagnostics: DiagnosticsBus) -> Self {
        ConsumeDispatcher {
            channels,
            diagnostics,
        }
    }

    /// Consumes with managed acknowledgment: ack on success, nack with
    /// requeue on failure.
    pub async fn consume(
        &self,
        def: &ConsumerDefinition,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let result = self.start(def, HandlerKind::Managed(handler)).await;
        self.diagnostics.mirror(result)
    }

    /// Consumes with delegated acknowledgment: the handler settles each
    /// message through its `Acknowledger`.
    pub async fn consume_delegated(
        &self,
        def: &ConsumerDefinition,
        handler: Arc<dyn DelegatedConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let result = self.start(def, HandlerKind::Delegated(handler)).await;
        self.diagnostics.mirror(result)
    }

    async fn start(
        &self,
        def: &ConsumerDefinition,
        handler: HandlerKind,
    ) -> Result<Subscription, AmqpError> {
        let channel = self.channels.ensure_channel().await?;

        if let Some(prefetch) = def.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions { global: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "failure to configure qos");
                    AmqpError::QoSDeclarationError(err.0)
                })?;
        }

        let stream = channel
            .basic_consume(
                &def.queue,
                &def.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: def.no_ack,
                    exclusive: def.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(def.queue.clone(), err.0)
            })?;

        info!(
            queue = def.queue.as_str(),
            consumer_tag = def.consumer_tag.as_str(),
            "consumer registered"
        );

        let cx = ConsumeContext {
            queue: def.queue.clone(),
            no_ack: def.no_ack,
            handler,
            channel: channel.clone(),
            diagnostics: self.diagnostics.clone(),
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(consume_loop(stream, cx, shutdown.clone()));

        Ok(Subscription {
            queue: def.queue.clone(),
            consumer_tag: def.consumer_tag.clone(),
            channel,
            shutdown,
            task,
        })
    }
}

async fn consume_loop(mut stream: DeliveryStream, cx: ConsumeContext, shutdown: CancellationToken) {
    let tracer = global::tracer("amqp consumer");

    loop {
        // Only the wait for the next delivery is raced against shutdown; a
        // handler that already started runs to completion.
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Some(delivery))) => {
                if let Err(err) = consume(&tracer, delivery, &cx).await {
                    error!(error = err.to_string(), "error consume msg");
                    cx.diagnostics.error(&err);
                }
            }
            Some(Ok(None)) => debug!(queue = cx.queue.as_str(), "ignoring empty delivery"),
            Some(Err(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                cx.diagnostics.error(&AmqpError::ConsumerError(err.0));
            }
            None => {
                debug!(queue = cx.queue.as_str(), "delivery stream ended");
                break;
            }
        }
    }

    debug!(queue = cx.queue.as_str(), "consumer stopped");
}

/// A running consumer.
///
/// Dropping the subscription detaches it: the consumer keeps running until
/// its delivery stream ends.
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    channel: Arc<dyn AmqpChannel>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// True once the consumer loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops consuming.
    ///
    /// No new delivery is taken after this call; the delivery being handled
    /// (if any) finishes, including its acknowledgment, before this returns.
    /// Deliveries the client already buffered stay unacknowledged and are
    /// redelivered by the broker.
    pub async fn cancel(self) -> Result<(), AmqpError> {
        self.shutdown.cancel();

        let cancelled = if self.channel.is_open() {
            self.channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions { nowait: false })
                .await
                .map_err(|err| {
                    warn!(error = err.to_string(), "failure to cancel the consumer");
                    AmqpError::BindingConsumerError(self.queue.clone(), err.0)
                })
        } else {
            Ok(())
        };

        self.task
            .await
            .map_err(|err| AmqpError::InternalError(err.to_string()))?;
        info!(queue = self.queue.as_str(), "consumer cancelled");

        cancelled
    }

    /// Waits until the consumer stops on its own, for instance because the
    /// broker cancelled it or the connection went away.
    pub async fn closed(self) -> Result<(), AmqpError> {
        self.task
            .await
            .map_err(|err| AmqpError::InternalError(err.to_string()))
    }
}
