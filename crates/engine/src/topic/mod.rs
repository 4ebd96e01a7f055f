// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Topics: partitioned streams with consumer-group fan-out.
//!
//! A topic owns one stream per referenced partition number, created lazily
//! on first push and never removed for the topic's lifetime. Pushes route to
//! the partition named in the options (default [`DEFAULT_PARTITION`]);
//! consumption registers a fresh stream as the next member of the named (or
//! a fresh anonymous) consumer group. The [`Partitioner`] wires every
//! partition to exactly one member per group.
//!
//! Note the two numbering spaces: the partition number in push options is a
//! routing key; the ordinal fed to the assignment formula is the partition
//! stream's registration order. Pushing to partitions 5 and 2 (in that
//! order) yields ordinals 1 and 2.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use courier_config::{GroupName, DEFAULT_PARTITION};

use crate::deferred::PushReceipt;
use crate::error::StreamError;
use crate::stream::{Stream, StreamProducer};

mod partitioner;

#[cfg(test)]
mod tests;

pub use partitioner::{calculate_partition_consumer, Partitioner};

/// Options for pushing to a topic.
#[derive(Debug, Default, Clone)]
pub struct TopicPushOptions {
    /// Partition routing key; [`DEFAULT_PARTITION`] when absent.
    pub partition: Option<u32>,
}

/// Options for consuming from a topic.
#[derive(Debug, Default, Clone)]
pub struct TopicConsumeOptions {
    /// Consumer group to join; a fresh anonymous group when absent.
    pub group: Option<GroupName>,
}

struct TopicInner<T: Clone + Send + 'static> {
    partitioner: Partitioner<T>,
    partitions: Mutex<BTreeMap<u32, Stream<T>>>,
    closed: AtomicBool,
}

/// A partitioned, group-consumed stream of values.
pub struct Topic<T: Clone + Send + 'static> {
    inner: Arc<TopicInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Topic<T> {
    /// Creates an empty topic.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TopicInner {
                partitioner: Partitioner::new(),
                partitions: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pushes to the default partition. The receipt resolves when some
    /// group member commits the value.
    pub fn push(&self, value: T) -> Result<PushReceipt<T>, StreamError> {
        self.push_with(value, TopicPushOptions::default())
    }

    /// Pushes to the partition named in the options, creating its stream on
    /// first reference.
    pub fn push_with(
        &self,
        value: T,
        options: TopicPushOptions,
    ) -> Result<PushReceipt<T>, StreamError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StreamError::ClosedAlready);
        }
        self.partition(options.partition.unwrap_or(DEFAULT_PARTITION))
            .push(value)
    }

    /// Registers a new consumer stream under the given (or a fresh
    /// anonymous) group and returns it for pulling. Consuming twice with
    /// the same group id adds another load-sharing member, not a second
    /// handle to the same stream.
    pub fn consume(&self, options: TopicConsumeOptions) -> Result<Stream<T>, StreamError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StreamError::ClosedAlready);
        }
        let consumer = Stream::new();
        self.inner
            .partitioner
            .add_target(consumer.clone(), options.group);
        Ok(consumer)
    }

    /// Closes the topic: every partition stream closes (pending pushes are
    /// rejected), and the partitioner cascades shutdown to the group
    /// consumer streams so pullers observe [`StreamError::WasClosed`]
    /// instead of hanging.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let partitions: Vec<Stream<T>> = {
            let mut partitions = self.inner.partitions.lock();
            std::mem::take(&mut *partitions).into_values().collect()
        };
        debug!(partitions = partitions.len(), "closing topic");
        for partition in &partitions {
            partition.close();
        }
        self.inner.partitioner.shutdown().await;
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of partitions referenced so far.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.inner.partitions.lock().len()
    }

    fn partition(&self, number: u32) -> Stream<T> {
        let mut partitions = self.inner.partitions.lock();
        partitions
            .entry(number)
            .or_insert_with(|| {
                let stream = Stream::new();
                self.inner.partitioner.add_source(stream.clone());
                stream
            })
            .clone()
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamProducer<T> for Topic<T> {
    async fn push(&self, value: T) -> Result<T, StreamError> {
        Topic::push(self, value)?.await
    }
}
