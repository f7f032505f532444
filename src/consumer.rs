// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Handles a single delivery: builds the handler message, runs the handler
//! inside a consumer span, and applies the acknowledgment policy.
//!
//! Managed policy: `Ok` acks, failure nacks with requeue. A message that always
//! fails is therefore redelivered forever unless the queue caps it on the
//! broker side (dead letter exchange plus TTL, or a handler checking
//! `death_count`). Delegated policy: the dispatcher never settles anything.

use crate::{
    diagnostics::{DiagnosticEvent, DiagnosticsBus},
    errors::AmqpError,
    handler::{Acknowledger, ConsumerHandler, ConsumerMessage, DelegatedConsumerHandler, HandlerError},
    otel,
    transport::{AmqpChannel, Delivery},
};
use futures_util::FutureExt;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::FieldTable,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// The handler of a subscription together with its acknowledgment policy.
#[derive(Clone)]
pub(crate) enum HandlerKind {
    Managed(Arc<dyn ConsumerHandler>),
    Delegated(Arc<dyn DelegatedConsumerHandler>),
}

/// Everything a subscription needs to process its deliveries.
#[derive(Clone)]
pub(crate) struct ConsumeContext {
    pub(crate) queue: String,
    pub(crate) no_ack: bool,
    pub(crate) handler: HandlerKind,
    /// The channel the consumer was registered on; delivery tags are scoped
    /// to it.
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) diagnostics: DiagnosticsBus,
}

/// Processes one delivery.
///
/// Handler failures are reported to the diagnostics bus and never returned;
/// the returned error only covers failing to settle the message.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    cx: &ConsumeContext,
) -> Result<(), AmqpError> {
    let (msg_type, count) = extract_header_properties(&delivery.properties);
    let span_name = msg_type.clone().unwrap_or_else(|| cx.queue.clone());
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &span_name);

    debug!(
        queue = cx.queue.as_str(),
        delivery_tag = delivery.delivery_tag,
        "received: {} - exchange: {}",
        span_name,
        delivery.exchange,
    );

    cx.diagnostics.emit(DiagnosticEvent::MessageConsumed {
        queue: cx.queue.clone(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    });

    let delivery_tag = delivery.delivery_tag;
    let msg = ConsumerMessage {
        queue: cx.queue.clone(),
        msg_type,
        exchange: delivery.exchange,
        routing_key: delivery.routing_key,
        delivery_tag,
        redelivered: delivery.redelivered,
        death_count: count,
        headers: delivery.properties.headers().clone().unwrap_or_default(),
        data: delivery.data,
    };

    match &cx.handler {
        HandlerKind::Managed(handler) => {
            let result = guarded(handler.exec(&ctx, &msg)).await;
            settle(result, delivery_tag, cx, &mut span).await
        }
        HandlerKind::Delegated(handler) => {
            let acker = Acknowledger::new(delivery_tag, cx.channel.clone());
            match guarded(handler.exec(&ctx, &msg, acker)).await {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    report_handler_failure(&err, cx, &mut span);
                    warn!(delivery_tag, "handler failed, message left unacknowledged");
                }
            }
            Ok(())
        }
    }
}

/// Applies the managed acknowledgment policy to the handler outcome.
async fn settle(
    result: Result<(), HandlerError>,
    delivery_tag: u64,
    cx: &ConsumeContext,
    span: &mut impl Span,
) -> Result<(), AmqpError> {
    if let Err(err) = &result {
        report_handler_failure(err, cx, span);
    }

    // The broker already considers no-ack deliveries settled.
    if cx.no_ack {
        return Ok(());
    }

    if result.is_ok() {
        debug!("message successfully processed");
        return match cx
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(e) => {
                error!(error = e.to_string(), "error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(AmqpError::AckMessageError(e.0))
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(())
            }
        };
    }

    warn!(delivery_tag, "error whiling handling msg, requeuing for latter");
    match cx
        .channel
        .basic_nack(
            delivery_tag,
            BasicNackOptions {
                multiple: false,
                requeue: true,
            },
        )
        .await
    {
        Err(e) => {
            error!(error = e.to_string(), "error whiling nack msg");
            span.record_error(&e);
            Err(AmqpError::NackMessageError(e.0))
        }
        _ => Ok(()),
    }
}

/// Runs a handler future, turning a panic into a handler failure.
async fn guarded<F>(handler: F) -> Result<(), HandlerError>
where
    F: Future<Output = Result<(), HandlerError>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

fn report_handler_failure(err: &HandlerError, cx: &ConsumeContext, span: &mut impl Span) {
    error!(
        error = err.to_string(),
        queue = cx.queue.as_str(),
        "consumer handler failed"
    );
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });
    cx.diagnostics
        .error(&AmqpError::ConsumeHandlerError(err.to_string()));
}

/// Extracts the message type and the dead-letter count from message properties.
fn extract_header_properties(props: &AMQPProperties) -> (Option<String>, i64) {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };

    let count = headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|value| value.as_long_long_int())
        .unwrap_or_default();

    let msg_type = props.kind().as_ref().map(|value| value.to_string());

    (msg_type, count)
}
