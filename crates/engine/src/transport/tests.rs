// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! In-memory transport behavior: routing, transmission modes, consumer
//! stream caching, subscriptions, channel registry lifecycle.

use std::time::Duration;

use courier_config::ChannelName;

use crate::error::StreamError;
use crate::message::Message;
use crate::transport::{
    Consumer, ConsumerOptions, InMemoryTransport, Producer, ProducerOptions, ReceiveOptions,
    Transmission, Transport,
};

fn channel(name: &str) -> ChannelName {
    ChannelName::parse(name).unwrap()
}

fn on_channel(name: &str) -> ReceiveOptions {
    ReceiveOptions {
        channel: Some(channel(name)),
        ..ReceiveOptions::default()
    }
}

#[tokio::test]
async fn sync_send_resolves_with_the_body_after_commit() {
    let transport: InMemoryTransport<String> = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions::default());
    let consumer = transport.consumer(ConsumerOptions::default());

    let receiver = tokio::spawn(async move {
        let mut message = consumer.receive(on_channel("orders")).await.unwrap();
        let body = message.value().body().clone();
        message.commit().unwrap();
        body
    });
    tokio::task::yield_now().await;

    let delivered = producer
        .send(Message::new("hello".to_owned()).on_channel(channel("orders")))
        .await
        .unwrap();
    assert_eq!(delivered, Some("hello".to_owned()));
    assert_eq!(receiver.await.unwrap(), "hello");
}

#[tokio::test]
async fn async_send_does_not_wait_for_a_consumer() {
    let transport = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions::default());
    let consumer = transport.consumer(ConsumerOptions::default());

    let sent = producer
        .send(
            Message::new("hello".to_owned())
                .on_channel(channel("orders"))
                .transmitted(Transmission::Async),
        )
        .await
        .unwrap();
    assert_eq!(sent, None);

    let mut message = consumer.receive(on_channel("orders")).await.unwrap();
    assert_eq!(message.value().body(), "hello");
    message.commit().unwrap();
}

#[tokio::test]
async fn committed_receive_blocks_until_the_next_message() {
    let transport = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions::default());
    let consumer = transport.consumer(ConsumerOptions::default());

    let _ = producer
        .send(
            Message::new(1u32)
                .on_channel(channel("orders"))
                .transmitted(Transmission::Async),
        )
        .await
        .unwrap();

    let mut message = consumer.receive(on_channel("orders")).await.unwrap();
    message.commit().unwrap();

    // Same channel and group: the next receive shares the cached stream
    // and waits for new traffic.
    let blocked =
        tokio::time::timeout(Duration::from_millis(50), consumer.receive(on_channel("orders")))
            .await;
    assert!(blocked.is_err());

    let _ = producer
        .send(
            Message::new(2u32)
                .on_channel(channel("orders"))
                .transmitted(Transmission::Async),
        )
        .await
        .unwrap();
    let mut message = consumer.receive(on_channel("orders")).await.unwrap();
    assert_eq!(*message.value().body(), 2);
    message.commit().unwrap();
}

#[tokio::test]
async fn producer_default_transmission_applies_when_unset() {
    let transport = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions {
        default_transmission: Some(Transmission::Async),
    });
    let consumer = transport.consumer(ConsumerOptions::default());

    let sent = producer
        .send(Message::new("fire-and-forget".to_owned()).on_channel(channel("logs")))
        .await
        .unwrap();
    assert_eq!(sent, None);

    let mut message = consumer.receive(on_channel("logs")).await.unwrap();
    assert_eq!(message.value().body(), "fire-and-forget");
    message.commit().unwrap();
}

#[tokio::test]
async fn unnamed_channel_and_group_use_the_defaults() {
    let transport = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions::default());
    let consumer = transport.consumer(ConsumerOptions::default());

    let sent = producer
        .send(Message::new(7u32).transmitted(Transmission::Async))
        .await
        .unwrap();
    assert_eq!(sent, None);
    assert!(transport.contains(courier_config::DEFAULT_CHANNEL));

    let mut message = consumer.receive(ReceiveOptions::default()).await.unwrap();
    assert_eq!(*message.value().body(), 7);
    message.commit().unwrap();
}

#[tokio::test]
async fn subscription_invokes_the_callback_until_cancelled() {
    let transport = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions::default());
    let consumer = transport.consumer(ConsumerOptions::default());

    let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
    let subscription = consumer
        .subscribe(
            Box::new(move |message: Message<u32>| {
                let _ = sender.send(*message.body());
            }),
            on_channel("orders"),
        )
        .unwrap();

    for n in [1u32, 2] {
        let _ = producer
            .send(
                Message::new(n)
                    .on_channel(channel("orders"))
                    .transmitted(Transmission::Async),
            )
            .await
            .unwrap();
    }
    for expected in [1u32, 2] {
        let value = tokio::time::timeout(Duration::from_secs(1), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(value, expected);
    }

    subscription.destroy().await;
    let _ = producer
        .send(
            Message::new(3u32)
                .on_channel(channel("orders"))
                .transmitted(Transmission::Async),
        )
        .await
        .unwrap();
    let silent = tokio::time::timeout(Duration::from_millis(50), received.recv()).await;
    assert!(silent.is_err());
}

#[tokio::test]
async fn channel_registry_creates_on_reference_and_removes_on_demand() {
    let transport = InMemoryTransport::<u32>::new();
    assert_eq!(transport.channel_count(), 0);
    assert!(!transport.contains("orders"));
    assert!(transport.get("orders").is_none());

    let producer = transport.producer(ProducerOptions::default());
    let _ = producer
        .send(
            Message::new(1u32)
                .on_channel(channel("orders"))
                .transmitted(Transmission::Async),
        )
        .await
        .unwrap();
    assert!(transport.contains("orders"));
    assert_eq!(transport.channel_count(), 1);
    assert!(transport.get("orders").is_some());

    assert!(transport.remove("orders").await);
    assert!(!transport.contains("orders"));
    assert!(!transport.remove("orders").await);
}

#[tokio::test]
async fn close_shuts_every_channel_down() {
    let transport = InMemoryTransport::new();
    let producer = transport.producer(ProducerOptions::default());
    let consumer = transport.consumer(ConsumerOptions::default());

    let _ = producer
        .send(
            Message::new(1u32)
                .on_channel(channel("orders"))
                .transmitted(Transmission::Async),
        )
        .await
        .unwrap();
    let mut message = consumer.receive(on_channel("orders")).await.unwrap();
    message.commit().unwrap();

    let orders = transport.get("orders").unwrap();
    transport.close().await;
    assert!(orders.is_closed());
    assert_eq!(transport.channel_count(), 0);

    let result = consumer.receive(on_channel("orders")).await;
    assert!(matches!(
        result,
        Err(StreamError::ClosedAlready | StreamError::WasClosed)
    ));
}
