// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{Call, FakeBroker, URL};
use rabbitmq_supervisor::{
    diagnostics::DiagnosticEvent,
    errors::ErrorKind,
    exchange::{ExchangeDefinition, ExchangeKind},
    publisher::PublishOptions,
    queue::QueueDefinition,
    topology::DeadLetterOptions,
    AmqpBroker, AmqpError,
};
use serde::Serialize;

async fn connected() -> (FakeBroker, AmqpBroker) {
    let fake = FakeBroker::new();
    let broker = AmqpBroker::new(fake.connector());
    broker.connect(URL).await.unwrap();
    fake.clear_calls();
    (fake, broker)
}

#[tokio::test]
async fn should_declare_the_queue_before_sending() {
    let (fake, broker) = connected().await;

    broker
        .publisher()
        .publish("orders", "order #1", &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(
        fake.calls(),
        vec![
            Call::CreateChannel,
            Call::QueueDeclare {
                name: "orders".to_owned(),
                durable: true,
                dead_letter_exchange: None,
            },
            Call::Publish {
                exchange: "".to_owned(),
                routing_key: "orders".to_owned(),
                payload: b"order #1".to_vec(),
                persistent: true,
            },
        ]
    );
}

#[tokio::test]
async fn should_keep_arguments_of_a_dead_lettered_queue() {
    let (fake, broker) = connected().await;
    broker
        .topology()
        .setup_dead_letter_queue("orders", "orders.dlx", "orders.dlq", &DeadLetterOptions::default())
        .await
        .unwrap();
    fake.clear_calls();

    broker
        .publisher()
        .publish("orders", "order #1", &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(
        fake.calls()[0],
        Call::QueueDeclare {
            name: "orders".to_owned(),
            durable: true,
            dead_letter_exchange: Some("orders.dlx".to_owned()),
        }
    );
    assert_eq!(fake.count(|c| matches!(c, Call::Publish { .. })), 1);
}

#[tokio::test]
async fn should_emit_message_metadata_on_publish() {
    let (_fake, broker) = connected().await;
    let mut events = broker.subscribe_diagnostics();

    broker
        .publisher()
        .publish("orders", vec![0u8; 42], &PublishOptions::default().persistent(false))
        .await
        .unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        DiagnosticEvent::MessagePublished {
            destination: "orders".to_owned(),
            routing_key: None,
            payload_size: 42,
        }
    );
}

#[tokio::test]
async fn should_not_persist_transient_messages() {
    let (fake, broker) = connected().await;

    broker
        .publisher()
        .publish("orders", "x", &PublishOptions::default().persistent(false))
        .await
        .unwrap();

    assert!(fake
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Publish { persistent: false, .. })));
}

#[tokio::test]
async fn should_declare_the_exchange_and_route_on_publish() {
    let (fake, broker) = connected().await;
    let mut events = broker.subscribe_diagnostics();

    broker
        .publisher()
        .publish_to_exchange(
            "events",
            "user.created",
            "{}",
            ExchangeKind::Topic,
            &PublishOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(fake.exchanges().get("events"), Some(&ExchangeKind::Topic));
    assert!(fake.calls().contains(&Call::Publish {
        exchange: "events".to_owned(),
        routing_key: "user.created".to_owned(),
        payload: b"{}".to_vec(),
        persistent: true,
    }));
    assert_eq!(
        events.recv().await.unwrap(),
        DiagnosticEvent::MessagePublished {
            destination: "events".to_owned(),
            routing_key: Some("user.created".to_owned()),
            payload_size: 2,
        }
    );
}

#[tokio::test]
async fn should_send_nothing_when_the_exchange_kind_differs() {
    let (fake, broker) = connected().await;
    broker
        .topology()
        .assert_exchange(&ExchangeDefinition::new("events").fanout())
        .await
        .unwrap();

    let err = broker
        .publisher()
        .publish_to_exchange(
            "events",
            "user.created",
            "{}",
            ExchangeKind::Direct,
            &PublishOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(err.is_topology());
    assert_eq!(fake.count(|c| matches!(c, Call::Publish { .. })), 0);
}

#[tokio::test]
async fn should_reuse_a_declared_exchange_definition() {
    let (fake, broker) = connected().await;
    broker
        .topology()
        .assert_exchange(&ExchangeDefinition::new("events").topic().durable(false))
        .await
        .unwrap();
    fake.clear_calls();

    broker
        .publisher()
        .publish_to_exchange("events", "a.b", "x", ExchangeKind::Topic, &PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(
        fake.calls()[0],
        Call::ExchangeDeclare {
            name: "events".to_owned(),
            kind: ExchangeKind::Topic,
            durable: false,
        }
    );
}

#[tokio::test]
async fn should_report_a_send_failure_as_publish_error() {
    let (fake, broker) = connected().await;
    fake.fail_publishes();
    let mut events = broker.subscribe_diagnostics();

    let err = broker
        .publisher()
        .publish("orders", "x", &PublishOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AmqpError::PublishingError(..)));
    match events.recv().await.unwrap() {
        DiagnosticEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::Publish),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn should_serialize_json_messages() {
    #[derive(Serialize)]
    struct OrderPlaced {
        id: u32,
        sku: &'static str,
    }

    let (fake, broker) = connected().await;

    broker
        .publisher()
        .publish_json("orders", &OrderPlaced { id: 7, sku: "A-1" })
        .await
        .unwrap();

    assert!(fake.calls().iter().any(|c| matches!(
        c,
        Call::Publish { payload, .. } if payload.as_slice() == br#"{"id":7,"sku":"A-1"}"#
    )));
}

#[tokio::test]
async fn should_fail_on_a_queue_declared_with_other_arguments() {
    let (fake, broker) = connected().await;
    let other = AmqpBroker::new(fake.connector());
    other.connect(URL).await.unwrap();
    other
        .topology()
        .setup_queue(&QueueDefinition::new("orders").dead_letter_exchange("orders.dlx"))
        .await
        .unwrap();

    let err = broker
        .publisher()
        .publish("orders", "x", &PublishOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AmqpError::DeclareQueueError(ref name, _) if name == "orders"));
    assert_eq!(fake.count(|c| matches!(c, Call::Publish { .. })), 0);
}

#[tokio::test]
async fn should_send_nothing_when_the_broker_rejects_the_exchange_kind() {
    let (fake, broker) = connected().await;
    let other = AmqpBroker::new(fake.connector());
    other.connect(URL).await.unwrap();
    other
        .topology()
        .assert_exchange(&ExchangeDefinition::new("events").fanout())
        .await
        .unwrap();

    let err = broker
        .publisher()
        .publish_to_exchange(
            "events",
            "user.created",
            "{}",
            ExchangeKind::Direct,
            &PublishOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AmqpError::DeclareExchangeError(ref name, _) if name == "events"));
    assert!(err.is_topology());
    assert_eq!(fake.count(|c| matches!(c, Call::Publish { .. })), 0);
    assert_eq!(fake.exchanges().get("events"), Some(&ExchangeKind::Fanout));
}
