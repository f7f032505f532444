// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module sends messages to queues and exchanges. Each publish re-asserts
//! its destination before sending, so publishing works even if the topology
//! was never set up explicitly. Re-assertion is idempotent and uses the same
//! arguments the destination was declared with through this broker handle.
//!
//! The trace context of the caller is propagated in the message headers.

use crate::{
    channel::ChannelSupervisor,
    diagnostics::{DiagnosticEvent, DiagnosticsBus},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    otel,
    queue::QueueDefinition,
    topology::{self, DeclaredTopology},
    transport::AmqpChannel,
};
use lapin::{
    options::BasicPublishOptions,
    types::{
        AMQPValue, Boolean, Double, FieldTable, LongInt, LongLongInt, LongString, LongUInt,
        ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode asking the broker to write the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Name of the default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// A typed message header value.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Int(i32),
    LongInt(i64),
    UInt(u32),
    Float(f64),
    String(String),
}

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::Bool(v) => AMQPValue::Boolean(Boolean::from(*v)),
            HeaderValue::Int(v) => AMQPValue::LongInt(LongInt::from(*v)),
            HeaderValue::LongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::UInt(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
            HeaderValue::Float(v) => AMQPValue::Double(Double::from(*v)),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        }
    }
}

/// Per-message publish settings.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub(crate) persistent: bool,
    pub(crate) headers: HashMap<String, HeaderValue>,
    pub(crate) content_type: String,
    pub(crate) message_type: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) context: Option<Context>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            persistent: true,
            headers: HashMap::default(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_type: None,
            message_id: None,
            context: None,
        }
    }
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controls whether the broker persists the message (on by default).
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    /// Sets the AMQP `type` property.
    pub fn message_type(mut self, msg_type: &str) -> Self {
        self.message_type = Some(msg_type.to_owned());
        self
    }

    /// Overrides the generated message id.
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Propagates `ctx` instead of the current context.
    pub fn context(mut self, ctx: Context) -> Self {
        self.context = Some(ctx);
        self
    }

    pub(crate) fn properties(&self) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

        match &self.context {
            Some(ctx) => otel::inject(ctx, &mut headers),
            None => otel::inject(&Context::current(), &mut headers),
        }

        for (key, value) in &self.headers {
            headers.insert(ShortString::from(key.as_str()), AMQPValue::from(value));
        }

        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.as_str()))
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(headers));

        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        if let Some(msg_type) = &self.message_type {
            props = props.with_kind(ShortString::from(msg_type.as_str()));
        }

        props
    }
}

/// Sends messages to queues and exchanges.
#[derive(Clone)]
pub struct PublishGateway {
    channels: ChannelSupervisor,
    declared: DeclaredTopology,
    diagnostics: DiagnosticsBus,
}

impl PublishGateway {
    pub(crate) fn new(
        channels: ChannelSupervisor,
        declared: DeclaredTopology,
        diagnostics: DiagnosticsBus,
    ) -> Self {
        PublishGateway {
            channels,
            declared,
            diagnostics,
        }
    }

    /// Publishes `payload` to `queue` through the default exchange.
    ///
    /// The queue is declared durable first, or with the definition it was
    /// set up with when this handle declared it before.
    pub async fn publish(
        &self,
        queue: &str,
        payload: impl AsRef<[u8]>,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let result = self.send_to_queue(queue, payload.as_ref(), options).await;
        self.diagnostics.mirror(result)
    }

    /// Publishes `payload` to `exchange` with `routing_key`.
    ///
    /// The exchange is declared durable with `kind` first. If it already
    /// exists with another kind the call fails with a topology error and
    /// nothing is sent.
    pub async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl AsRef<[u8]>,
        kind: ExchangeKind,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let result = self
            .send_to_exchange(exchange, routing_key, payload.as_ref(), kind, options)
            .await;
        self.diagnostics.mirror(result)
    }

    /// Serializes `message` as JSON and publishes it to `queue`.
    pub async fn publish_json<T>(&self, queue: &str, message: &T) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                return self
                    .diagnostics
                    .mirror(Err(AmqpError::SerializePayloadError(err.to_string())));
            }
        };

        let options = PublishOptions::default().content_type(JSON_CONTENT_TYPE);
        self.publish(queue, payload, &options).await
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let def = self
            .declared
            .queue(queue)
            .unwrap_or_else(|| QueueDefinition::new(queue));

        let channel = self.channels.ensure_channel().await?;
        topology::declare_queue(channel.as_ref(), &def).await?;
        self.declared.record_queue(&def);

        self.send(channel.as_ref(), DEFAULT_EXCHANGE, queue, payload, options)
            .await?;

        self.diagnostics.emit(DiagnosticEvent::MessagePublished {
            destination: queue.to_owned(),
            routing_key: None,
            payload_size: payload.len(),
        });
        Ok(())
    }

    async fn send_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        kind: ExchangeKind,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let def = self
            .declared
            .exchange(exchange)
            .filter(|def| def.kind == kind)
            .unwrap_or_else(|| ExchangeDefinition::new(exchange).kind(kind));

        let channel = self.channels.ensure_channel().await?;
        topology::assert_exchange_on(channel.as_ref(), &self.declared, &def).await?;

        self.send(channel.as_ref(), exchange, routing_key, payload, options)
            .await?;

        self.diagnostics.emit(DiagnosticEvent::MessagePublished {
            destination: exchange.to_owned(),
            routing_key: Some(routing_key.to_owned()),
            payload_size: payload.len(),
        });
        Ok(())
    }

    async fn send(
        &self,
        channel: &dyn AmqpChannel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                options.properties(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                let destination = if exchange.is_empty() {
                    routing_key
                } else {
                    exchange
                };
                AmqpError::PublishingError(destination.to_owned(), err.0)
            })?;

        debug!(exchange, routing_key, "message sent");
        Ok(())
    }
}
