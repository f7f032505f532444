// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use broker::AmqpBroker;
pub use errors::AmqpError;
