// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! The in-memory transport: a channel-name -> topic registry.
//!
//! Channels are created on first reference, from either side. Consumers
//! cache their per-(channel, group) stream so repeated receives pull from
//! the same group membership instead of registering a new member per call.
//! Everything lives in process memory and is lost on exit; durability is a
//! property a different transport would add behind the same traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use courier_config::{ChannelName, GroupName};

use crate::error::StreamError;
use crate::message::Message;
use crate::stream::{PendingMessage, PullOptions, Stream};
use crate::topic::{Topic, TopicConsumeOptions, TopicPushOptions};
use crate::transport::{
    Consumer, ConsumerOptions, Producer, ProducerOptions, ReceiveOptions, SubscribeCallback,
    Subscription, Transmission, Transport,
};

struct TransportInner<T: Clone + Send + 'static> {
    channels: Mutex<HashMap<ChannelName, Topic<Message<T>>>>,
}

/// In-memory [`Transport`] implementation.
pub struct InMemoryTransport<T: Clone + Send + 'static> {
    inner: Arc<TransportInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for InMemoryTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for InMemoryTransport<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> InMemoryTransport<T> {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportInner {
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn channel(&self, name: &ChannelName) -> Topic<Message<T>> {
        let mut channels = self.inner.channels.lock();
        channels
            .entry(name.clone())
            .or_insert_with(|| {
                debug!(channel = %name, "creating channel topic");
                Topic::new()
            })
            .clone()
    }

    /// Looks a channel's topic up without creating it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Topic<Message<T>>> {
        self.inner.channels.lock().get(name).cloned()
    }

    /// Whether a channel exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.channels.lock().contains_key(name)
    }

    /// Closes and removes a channel. Returns whether it existed.
    pub async fn remove(&self, name: &str) -> bool {
        let topic = self.inner.channels.lock().remove(name);
        match topic {
            Some(topic) => {
                topic.close().await;
                true
            }
            None => false,
        }
    }

    /// Snapshot of all channel names.
    #[must_use]
    pub fn channel_names(&self) -> Vec<ChannelName> {
        self.inner.channels.lock().keys().cloned().collect()
    }

    /// Number of channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Closes every channel and clears the registry.
    pub async fn close(&self) {
        let channels: Vec<Topic<Message<T>>> = {
            let mut channels = self.inner.channels.lock();
            channels.drain().map(|(_, topic)| topic).collect()
        };
        debug!(channels = channels.len(), "closing transport");
        for topic in channels {
            topic.close().await;
        }
    }
}

impl<T: Clone + Send + 'static> Transport<T> for InMemoryTransport<T> {
    type Producer = InMemoryProducer<T>;
    type Consumer = InMemoryConsumer<T>;

    fn producer(&self, options: ProducerOptions) -> InMemoryProducer<T> {
        InMemoryProducer {
            transport: self.clone(),
            options,
        }
    }

    fn consumer(&self, options: ConsumerOptions) -> InMemoryConsumer<T> {
        InMemoryConsumer {
            transport: self.clone(),
            options,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Producer over an [`InMemoryTransport`].
pub struct InMemoryProducer<T: Clone + Send + 'static> {
    transport: InMemoryTransport<T>,
    options: ProducerOptions,
}

#[async_trait]
impl<T: Clone + Send + 'static> Producer<T> for InMemoryProducer<T> {
    async fn send(&self, message: Message<T>) -> Result<Option<T>, StreamError> {
        let headers = message.headers();
        let transmission = headers
            .transmission
            .or(self.options.default_transmission)
            .unwrap_or_default();
        let channel = headers.channel.clone().unwrap_or_default();
        let partition = headers.partition;

        let topic = self.transport.channel(&channel);
        let receipt = topic.push_with(message, TopicPushOptions { partition })?;
        match transmission {
            Transmission::Async => Ok(None),
            Transmission::Sync => {
                let delivered = receipt.await?;
                Ok(Some(delivered.into_body()))
            }
        }
    }
}

/// Consumer over an [`InMemoryTransport`], caching one stream per
/// (channel, group) pair.
pub struct InMemoryConsumer<T: Clone + Send + 'static> {
    transport: InMemoryTransport<T>,
    options: ConsumerOptions,
    streams: Arc<Mutex<HashMap<(ChannelName, GroupName), Stream<Message<T>>>>>,
}

impl<T: Clone + Send + 'static> InMemoryConsumer<T> {
    fn consume_from(&self, options: &ReceiveOptions) -> Result<Stream<Message<T>>, StreamError> {
        let channel = options
            .channel
            .clone()
            .or_else(|| self.options.default_channel.clone())
            .unwrap_or_default();
        let group = options
            .group
            .clone()
            .or_else(|| self.options.default_group.clone())
            .unwrap_or_default();

        let key = (channel.clone(), group.clone());
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(&key) {
            return Ok(stream.clone());
        }
        let stream = self
            .transport
            .channel(&channel)
            .consume(TopicConsumeOptions { group: Some(group) })?;
        let _ = streams.insert(key, stream.clone());
        Ok(stream)
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> Consumer<T> for InMemoryConsumer<T> {
    async fn receive(
        &self,
        options: ReceiveOptions,
    ) -> Result<PendingMessage<Message<T>>, StreamError> {
        self.consume_from(&options)?.pull().await
    }

    fn subscribe(
        &self,
        callback: SubscribeCallback<T>,
        options: ReceiveOptions,
    ) -> Result<Subscription, StreamError> {
        let stream = self.consume_from(&options)?;
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let join = tokio::spawn(async move {
            loop {
                let mut message = match stream
                    .pull_with(PullOptions::token(loop_token.clone()))
                    .await
                {
                    Ok(message) => message,
                    Err(_) => break,
                };
                if message.commit().is_err() {
                    break;
                }
                callback(message.value().clone());
            }
        });
        Ok(Subscription::new(token, join))
    }
}
