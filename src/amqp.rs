// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Implements the transport seam on top of the `lapin` AMQP client. This is
//! the only module that touches `lapin::Connection` and `lapin::Channel`.

use crate::{
    exchange::ExchangeKind,
    transport::{
        AmqpChannel, AmqpConnection, AmqpConnector, CloseObserver, Delivery, DeliveryStream,
        TransportError,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections.
#[derive(Default)]
pub struct LapinConnector {
    properties: ConnectionProperties,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the given connection properties (executor, reactor, client
    /// properties) for every connection opened by this connector.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        LapinConnector { properties }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        debug!("creating amqp connection...");
        let options = self
            .properties
            .clone()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let conn = Connection::connect(uri, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            TransportError::from(err)
        })?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

/// A `lapin::Connection` behind the transport seam.
pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_close(&self, observer: CloseObserver) {
        let observer = Mutex::new(Some(observer));
        self.inner.on_error(move |err| {
            if let Some(observer) = observer.lock().take() {
                observer(err.to_string());
            }
        });
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(err.into())
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(self.inner.close(REPLY_SUCCESS, "closing").await?)
    }
}

/// A `lapin::Channel` behind the transport seam.
pub struct LapinChannel {
    inner: Channel,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        Ok(self
            .inner
            .exchange_declare(exchange, kind.into(), options, arguments)
            .await?)
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        self.inner.queue_declare(queue, options, arguments).await?;
        Ok(())
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), TransportError> {
        Ok(self
            .inner
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), TransportError> {
        // The confirm resolves immediately unless confirm mode was selected.
        self.inner
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?
            .await?;
        Ok(())
    }

    async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), TransportError> {
        Ok(self.inner.basic_qos(prefetch_count, options).await?)
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?;

        Ok(consumer
            .map(|result| {
                result
                    .map(|delivery| Some(Delivery::from(delivery)))
                    .map_err(TransportError::from)
            })
            .boxed())
    }

    async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), TransportError> {
        Ok(self.inner.basic_cancel(consumer_tag, options).await?)
    }

    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), TransportError> {
        Ok(self.inner.basic_ack(delivery_tag, options).await?)
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), TransportError> {
        Ok(self.inner.basic_nack(delivery_tag, options).await?)
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), TransportError> {
        Ok(self.inner.basic_reject(delivery_tag, options).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(self.inner.close(REPLY_SUCCESS, "closing").await?)
    }
}
