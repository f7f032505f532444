// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Supervisor
//!
//! This module provides the error type returned by every broker operation.
//! `AmqpError` covers connection establishment, channel supervision, topology
//! declaration, publishing and consuming. Variants are grouped into broader
//! categories through [`ErrorKind`], which is what callers usually branch on.

use thiserror::Error;

/// Broad category of an [`AmqpError`].
///
/// The distinction between `ChannelUnavailable` and `ConnectionClosed` matters:
/// the first means no connection was ever established (or it was closed on
/// purpose), the second means the broker dropped a live connection and the
/// caller has to `connect` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    ChannelUnavailable,
    ConnectionClosed,
    /// A channel could not be opened or closed on a live connection.
    Channel,
    Topology,
    Publish,
    Consumer,
    ConsumeHandler,
    Acknowledgement,
    Internal,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error `{0}`")]
    InternalError(String),

    /// The URL is missing or malformed, or the broker refused the handshake
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// No live connection exists to derive a channel from
    #[error("channel unavailable: not connected")]
    ChannelUnavailable,

    /// The broker closed the connection; a new `connect` is required
    #[error("connection closed by the broker")]
    ConnectionClosed,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error publishing a message after the topology was asserted
    #[error("failure to publish to `{0}`: {1}")]
    PublishingError(String, String),

    /// Error encoding a payload before publishing
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    BindingConsumerError(String, String),

    /// The delivery stream of a registered consumer reported a failure
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// The caller-supplied handler failed or panicked
    #[error("consumer handler failed `{0}`")]
    ConsumeHandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message `{0}`")]
    RejectMessageError(String),
}

impl AmqpError {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::InternalError(_) => ErrorKind::Internal,
            AmqpError::ConnectionError(_) => ErrorKind::Connection,
            AmqpError::ChannelUnavailable => ErrorKind::ChannelUnavailable,
            AmqpError::ChannelError(_) => ErrorKind::Channel,
            AmqpError::ConnectionClosed => ErrorKind::ConnectionClosed,
            AmqpError::DeclareExchangeError(..)
            | AmqpError::DeclareQueueError(..)
            | AmqpError::BindingExchangeToQueueError(..) => ErrorKind::Topology,
            AmqpError::PublishingError(..) | AmqpError::SerializePayloadError(_) => {
                ErrorKind::Publish
            }
            AmqpError::BindingConsumerError(..)
            | AmqpError::ConsumerError(_)
            | AmqpError::QoSDeclarationError(_) => ErrorKind::Consumer,
            AmqpError::ConsumeHandlerError(_) => ErrorKind::ConsumeHandler,
            AmqpError::AckMessageError(_)
            | AmqpError::NackMessageError(_)
            | AmqpError::RejectMessageError(_) => ErrorKind::Acknowledgement,
        }
    }

    /// True for errors raised by a rejected exchange, queue or binding declaration.
    pub fn is_topology(&self) -> bool {
        self.kind() == ErrorKind::Topology
    }

    /// True when the caller has to establish a new connection before retrying.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ChannelUnavailable | ErrorKind::ConnectionClosed
        )
    }
}
