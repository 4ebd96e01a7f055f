// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! The producer/consumer contract a transport implements, and the default
//! in-memory implementation.
//!
//! The broker core has no network surface of its own; it is consumed
//! through these traits. Any transport honoring them (a network queue, an
//! external pub/sub system) can stand in for [`InMemoryTransport`]; only
//! the in-memory one is provided here.

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use courier_config::{ChannelName, GroupName};

use crate::error::StreamError;
use crate::message::Message;
use crate::stream::PendingMessage;

mod memory;

#[cfg(test)]
mod tests;

pub use memory::{InMemoryConsumer, InMemoryProducer, InMemoryTransport};

/// Whether a send awaits delivery confirmation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transmission {
    /// Resolve only once the message is committed by a consumer.
    #[default]
    Sync,
    /// Resolve as soon as the message is enqueued.
    Async,
}

/// Options for creating a producer.
#[derive(Debug, Default, Clone)]
pub struct ProducerOptions {
    /// Transmission used when a message names none.
    pub default_transmission: Option<Transmission>,
}

/// Options for creating a consumer.
#[derive(Debug, Default, Clone)]
pub struct ConsumerOptions {
    /// Channel used when a receive names none.
    pub default_channel: Option<ChannelName>,
    /// Group used when a receive names none.
    pub default_group: Option<GroupName>,
}

/// Per-call routing for [`Consumer::receive`] and [`Consumer::subscribe`].
#[derive(Debug, Default, Clone)]
pub struct ReceiveOptions {
    /// Channel to consume from.
    pub channel: Option<ChannelName>,
    /// Consumer group to consume as.
    pub group: Option<GroupName>,
}

/// Sends envelopes into the transport.
#[async_trait]
pub trait Producer<T: Clone + Send + 'static>: Send + Sync {
    /// Sends one envelope. `Sync` transmission resolves with the body once
    /// a consumer commits it; `Async` resolves with `None` immediately
    /// after enqueueing.
    async fn send(&self, message: Message<T>) -> Result<Option<T>, StreamError>;
}

/// Callback invoked per message by a subscription.
pub type SubscribeCallback<T> = Box<dyn Fn(Message<T>) + Send + Sync>;

/// Receives envelopes from the transport.
#[async_trait]
pub trait Consumer<T: Clone + Send + 'static>: Send + Sync {
    /// Pulls one transactional message from the per-(channel, group)
    /// stream. The caller must commit or roll back.
    async fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Result<PendingMessage<Message<T>>, StreamError>;

    /// Starts a continuous, auto-committing pull loop invoking `callback`
    /// per message. The returned guard tears the loop down.
    fn subscribe(
        &self,
        callback: SubscribeCallback<T>,
        options: ReceiveOptions,
    ) -> Result<Subscription, StreamError>;
}

/// Hands out producers and consumers over one message fabric.
pub trait Transport<T: Clone + Send + 'static>: Send + Sync {
    /// The producer type of this transport.
    type Producer: Producer<T>;
    /// The consumer type of this transport.
    type Consumer: Consumer<T>;

    /// Creates a producer.
    fn producer(&self, options: ProducerOptions) -> Self::Producer;

    /// Creates a consumer.
    fn consumer(&self, options: ConsumerOptions) -> Self::Consumer;
}

/// Handle on one running subscription loop.
pub struct Subscription {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { token, join }
    }

    /// Signals the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Signals the loop to stop and waits until it has observed the
    /// cancellation.
    pub async fn destroy(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}
