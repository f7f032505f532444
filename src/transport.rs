// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The supervisor never talks to the AMQP client library directly. Everything
//! it needs from the broker goes through the three traits in this module:
//! [`AmqpConnector`] opens connections, [`AmqpConnection`] derives channels and
//! reports closure, and [`AmqpChannel`] carries the declare/publish/consume/ack
//! primitives. The production implementation lives in [`crate::amqp`]; tests
//! plug in recording doubles.

use crate::exchange::ExchangeKind;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by the underlying client library.
///
/// It only carries the broker/client reason; the calling component decides
/// which [`crate::errors::AmqpError`] it turns into.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl From<lapin::Error> for TransportError {
    fn from(err: lapin::Error) -> Self {
        TransportError(err.to_string())
    }
}

/// Invoked at most once, with the reason, when the broker closes a connection.
pub type CloseObserver = Box<dyn FnOnce(String) + Send + 'static>;

/// Stream of deliveries for one consumer.
///
/// A `None` item is an empty frame (the broker cancelled the consumer) and
/// carries no message.
pub type DeliveryStream = BoxStream<'static, Result<Option<Delivery>, TransportError>>;

/// A message handed over by the broker together with its acknowledgment data.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Opens connections to a broker.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError>;
}

/// A live link to the broker.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Registers the observer fired when the broker (not the caller) closes
    /// the connection.
    fn on_close(&self, observer: CloseObserver);

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

impl std::fmt::Debug for dyn AmqpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpChannel").field("is_open", &self.is_open()).finish()
    }
}

/// A channel multiplexed over an [`AmqpConnection`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError>;

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), TransportError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError>;

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), TransportError>;

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), TransportError>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), TransportError>;

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
