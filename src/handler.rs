// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Caller-supplied message handlers and the message type they receive.
//!
//! There are two acknowledgment styles:
//! - [`ConsumerHandler`]: managed. The dispatcher acks when the handler
//!   returns `Ok` and nacks with requeue when it fails.
//! - [`DelegatedConsumerHandler`]: delegated. The handler receives an
//!   [`Acknowledger`] and settles the message itself; the dispatcher never
//!   does.

use crate::{errors::AmqpError, transport::AmqpChannel};
use async_trait::async_trait;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    types::FieldTable,
};
use opentelemetry::Context;
use std::sync::Arc;
use thiserror::Error;

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        HandlerError(reason)
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        HandlerError(reason.to_owned())
    }
}

/// A delivered message as seen by a handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub msg_type: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Times the broker dead-lettered this message, from the `x-death` header.
    pub death_count: i64,
    pub headers: FieldTable,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

/// Processes messages; the dispatcher settles them.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Processes messages and settles them through the given [`Acknowledger`].
///
/// Dropping the acknowledger without using it leaves the message unacked;
/// the broker redelivers it once the channel or connection goes away.
#[async_trait]
pub trait DelegatedConsumerHandler: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        msg: &ConsumerMessage,
        acker: Acknowledger,
    ) -> Result<(), HandlerError>;
}

/// Settles one delivery on the channel it arrived on.
///
/// Each method consumes the acknowledger, so a delivery is settled at most
/// once.
pub struct Acknowledger {
    delivery_tag: u64,
    channel: Arc<dyn AmqpChannel>,
}

impl Acknowledger {
    pub(crate) fn new(delivery_tag: u64, channel: Arc<dyn AmqpChannel>) -> Self {
        Acknowledger {
            delivery_tag,
            channel,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Removes the message from the queue.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.0))
    }

    /// Returns the message to the queue, or dead-letters it when `requeue` is
    /// false.
    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| AmqpError::NackMessageError(err.0))
    }

    pub async fn reject(self, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(self.delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.0))
    }
}
