// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares exchanges, queues and the bindings between them,
//! including dead-letter wiring. All declarations are idempotent: declaring
//! the same object twice with the same settings is a no-op on the broker.
//!
//! The main components are:
//! - `TopologyConfigurator`: declares single objects and dead-letter topologies
//! - `Topology`: a batch plan of exchanges, queues and bindings to install
//! - `DeclaredTopology`: what this broker handle already declared, shared with
//!   the publisher so that re-assertion uses identical arguments

use crate::{
    channel::ChannelSupervisor,
    diagnostics::DiagnosticsBus,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::AmqpChannel,
};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

/// Routing key binding every message published to a topic exchange.
pub const MATCH_ALL_ROUTING_KEY: &str = "#";

/// Optional settings of [`TopologyConfigurator::setup_dead_letter_queue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterOptions {
    pub(crate) kind: ExchangeKind,
    pub(crate) routing_key: String,
}

impl Default for DeadLetterOptions {
    fn default() -> Self {
        DeadLetterOptions {
            kind: ExchangeKind::Topic,
            routing_key: MATCH_ALL_ROUTING_KEY.to_owned(),
        }
    }
}

impl DeadLetterOptions {
    /// Sets the kind of the dead letter exchange (topic by default).
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the key binding the dead letter queue (`#` by default).
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

/// A batch of topology objects installed in one go.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }
}

#[derive(Default)]
struct Declared {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
}

/// Objects successfully declared over the current connection of one broker
/// handle. Emptied whenever that connection is replaced or closed.
#[derive(Clone, Default)]
pub(crate) struct DeclaredTopology {
    inner: Arc<Mutex<Declared>>,
}

impl DeclaredTopology {
    pub(crate) fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.inner.lock().exchanges.get(name).cloned()
    }

    pub(crate) fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.inner.lock().queues.get(name).cloned()
    }

    pub(crate) fn record_exchange(&self, def: &ExchangeDefinition) {
        self.inner
            .lock()
            .exchanges
            .insert(def.name.clone(), def.clone());
    }

    pub(crate) fn record_queue(&self, def: &QueueDefinition) {
        self.inner.lock().queues.insert(def.name.clone(), def.clone());
    }

    pub(crate) fn clear(&self) {
        let mut declared = self.inner.lock();
        declared.exchanges.clear();
        declared.queues.clear();
    }

    /// Rejects a kind change on an exchange this handle already declared.
    fn check_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match self.inner.lock().exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind => {
                error!(
                    name = def.name.as_str(),
                    declared = existing.kind.as_str(),
                    requested = def.kind.as_str(),
                    "exchange kind conflict"
                );
                Err(AmqpError::DeclareExchangeError(
                    def.name.clone(),
                    format!(
                        "already declared as `{}`, cannot redeclare as `{}`",
                        existing.kind, def.kind
                    ),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Declares exchanges, queues, bindings and dead-letter topologies.
///
/// Every failure is returned to the caller and mirrored to the diagnostics
/// bus. Nothing is retried.
#[derive(Clone)]
pub struct TopologyConfigurator {
    channels: ChannelSupervisor,
    declared: DeclaredTopology,
    diagnostics: DiagnosticsBus,
}

impl TopologyConfigurator {
    pub(crate) fn new(
        channels: ChannelSupervisor,
        declared: DeclaredTopology,
        diagnostics: DiagnosticsBus,
    ) -> Self {
        TopologyConfigurator {
            channels,
            declared,
            diagnostics,
        }
    }

    /// Declares an exchange.
    pub async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let result = self.declare_exchange(def).await;
        self.diagnostics.mirror(result)
    }

    /// Declares a queue with its arguments.
    pub async fn setup_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let result = self.declare_queue(def).await;
        self.diagnostics.mirror(result)
    }

    /// Binds a queue to an exchange.
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let result = self.declare_binding(binding).await;
        self.diagnostics.mirror(result)
    }

    /// Declares a dead letter exchange and queue and routes rejected messages
    /// of `queue` to them.
    ///
    /// The steps run in this order, stopping at the first failure:
    /// 1. declare `dlx` with the configured kind (topic by default)
    /// 2. declare `dlq`
    /// 3. bind `dlq` to `dlx` with the configured key (`#` by default)
    /// 4. declare `queue` with `x-dead-letter-exchange = dlx`
    ///
    /// The primary queue comes last: the broker accepts a dead letter exchange
    /// that does not exist yet and silently drops what is routed to it. A
    /// failure part-way leaves the earlier objects in place.
    pub async fn setup_dead_letter_queue(
        &self,
        queue: impl Into<QueueDefinition>,
        dlx: &str,
        dlq: &str,
        options: &DeadLetterOptions,
    ) -> Result<(), AmqpError> {
        let queue = queue.into().dead_letter_exchange(dlx);

        let result = self.install_dead_letter(&queue, dlx, dlq, options).await;
        if result.is_ok() {
            debug!(
                queue = queue.name.as_str(),
                dlx, dlq, "dead letter topology installed"
            );
        }

        self.diagnostics.mirror(result)
    }

    /// Installs a batch: exchanges, then queues, then bindings.
    pub async fn install(&self, topology: &Topology) -> Result<(), AmqpError> {
        let result = self.install_all(topology).await;
        self.diagnostics.mirror(result)
    }

    async fn install_dead_letter(
        &self,
        queue: &QueueDefinition,
        dlx: &str,
        dlq: &str,
        options: &DeadLetterOptions,
    ) -> Result<(), AmqpError> {
        self.declare_exchange(&ExchangeDefinition::new(dlx).kind(options.kind))
            .await?;
        self.declare_queue(&QueueDefinition::new(dlq)).await?;
        self.declare_binding(
            &QueueBinding::new(dlq)
                .exchange(dlx)
                .routing_key(&options.routing_key),
        )
        .await?;
        self.declare_queue(queue).await
    }

    async fn install_all(&self, topology: &Topology) -> Result<(), AmqpError> {
        for exch in &topology.exchanges {
            self.declare_exchange(exch).await?;
        }
        for queue in &topology.queues {
            self.declare_queue(queue).await?;
        }
        for binding in &topology.queues_binding {
            self.declare_binding(binding).await?;
        }

        debug!("topology installed");
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let channel = self.channels.ensure_channel().await?;
        assert_exchange_on(channel.as_ref(), &self.declared, def).await
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let channel = self.channels.ensure_channel().await?;
        declare_queue(channel.as_ref(), def).await?;
        self.declared.record_queue(def);
        Ok(())
    }

    async fn declare_binding(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let channel = self.channels.ensure_channel().await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err.0,
                )
            })
    }
}

/// Checks a prior declaration through `declared` and declares the exchange on
/// `channel`.
pub(crate) async fn assert_exchange_on(
    channel: &dyn AmqpChannel,
    declared: &DeclaredTopology,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    declared.check_exchange(def)?;
    declare_exchange(channel, def).await?;
    declared.record_exchange(def);
    Ok(())
}

pub(crate) async fn declare_exchange(
    channel: &dyn AmqpChannel,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);

    channel
        .exchange_declare(
            &def.name,
            def.kind,
            ExchangeDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                auto_delete: def.delete,
                internal: def.internal,
                nowait: def.no_wait,
            },
            FieldTable::from(def.params.clone()),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name.as_str(),
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name.clone(), err.0)
        })?;

    debug!("exchange: {} was created", def.name);
    Ok(())
}

pub(crate) async fn declare_queue(
    channel: &dyn AmqpChannel,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);

    channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.delete,
                nowait: def.no_wait,
            },
            def.arguments(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name.as_str(),
                "error to declare the queue"
            );
            AmqpError::DeclareQueueError(def.name.clone(), err.0)
        })?;

    debug!("queue: {} was created", def.name);
    Ok(())
}
