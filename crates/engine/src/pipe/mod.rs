// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Generic plumbing between consumers and producers.
//!
//! # The driver loop
//!
//! [`pipe`] spawns a task that repeatedly pulls from the source, pushes the
//! value into the target, and settles the claim: commit once the target
//! confirms delivery, reject with the failure otherwise. Rejection settles
//! the original pusher's receipt, which is how failures propagate backward
//! through a chain of piped streams without a separate error channel.
//!
//! The loop holds a [`CancellationToken`] observed at every checkpoint: a
//! pull in flight is aborted (and nothing is lost -- the waiter withdraws
//! itself), a claim observed after cancellation is rolled back, and a
//! delivery already pushed when cancellation arrives is left to settle in a
//! detached task so the source message is neither duplicated nor dropped.
//!
//! # Chaining
//!
//! [`Pipe`] tracks all loops driven from one logical source, supports
//! `pipe_through` (into a stage that is both producer and consumer, yielding
//! the next `Pipe` link) and `pipe_to` (into a terminal producer, yielding a
//! [`Flow`]), and `destroy` cascades teardown through upstream links.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StreamError;
use crate::stream::{PullOptions, Stream, StreamConsumer, StreamProducer};


/// Registry key for a pipe target: the identity of its allocation.
pub(crate) fn target_key<T: Clone + Send + 'static>(
    target: &Arc<dyn StreamProducer<T>>,
) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// Handle on one running pipe loop.
pub struct PipeHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl PipeHandle {
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

/// Spawns a loop pulling from `source` and pushing into `target` until the
/// source closes or the returned handle is destroyed.
pub fn pipe<T: Clone + Send + 'static>(
    source: Arc<dyn StreamConsumer<T>>,
    target: Arc<dyn StreamProducer<T>>,
) -> PipeHandle {
    let token = CancellationToken::new();
    let loop_token = token.clone();
    let join = tokio::spawn(async move {
        debug!("pipe loop started");
        while !source.is_closed() && !loop_token.is_cancelled() {
            let message = match source
                .pull_with(PullOptions::token(loop_token.clone()))
                .await
            {
                Ok(message) => message,
                Err(StreamError::PullCancelled) => break,
                Err(_) => break,
            };
            if loop_token.is_cancelled() {
                // Claimed but not yet pushed: give the message back.
                let mut message = message;
                let _ = message.rollback();
                break;
            }

            let value = message.value().clone();
            let target = Arc::clone(&target);
            let mut delivery = Box::pin(async move { target.push(value).await });
            tokio::select! {
                biased;
                confirmed = &mut delivery => {
                    let mut message = message;
                    match confirmed {
                        Ok(_) => {
                            let _ = message.commit();
                        }
                        Err(reason) => {
                            let _ = message.reject(reason.to_string());
                        }
                    }
                }
                () = loop_token.cancelled() => {
                    // Already pushed: let the delivery settle in the
                    // background so the claim is neither duplicated by a
                    // rollback nor dropped unconfirmed.
                    let _ = tokio::spawn(async move {
                        let mut message = message;
                        match delivery.await {
                            Ok(_) => {
                                let _ = message.commit();
                            }
                            Err(reason) => {
                                let _ = message.reject(reason.to_string());
                            }
                        }
                    });
                    break;
                }
            }
        }
        debug!("pipe loop stopped");
    });
    PipeHandle { token, join }
}

/// Teardown surface shared by every `Pipe<T>` regardless of its value type,
/// so a chain link can cascade destruction upstream.
#[async_trait]
trait Teardown: Send + Sync {
    async fn unpipe_key(&self, key: usize) -> bool;
    async fn teardown(&self);
}

enum Source<T: Clone + Send + 'static> {
    Fixed(Arc<dyn StreamConsumer<T>>),
    /// Invoked once per pipe target; every target gets its own consumer
    /// (used to give each target a full broadcast feed).
    Factory(Box<dyn Fn() -> Arc<dyn StreamConsumer<T>> + Send + Sync>),
}

impl<T: Clone + Send + 'static> Source<T> {
    fn consumer(&self) -> Arc<dyn StreamConsumer<T>> {
        match self {
            Source::Fixed(consumer) => Arc::clone(consumer),
            Source::Factory(factory) => factory(),
        }
    }
}

struct PipeInner<T: Clone + Send + 'static> {
    source: Source<T>,
    targets: Mutex<HashMap<usize, PipeHandle>>,
    previous: Option<Arc<dyn Teardown>>,
}

#[async_trait]
impl<T: Clone + Send + 'static> Teardown for PipeInner<T> {
    async fn unpipe_key(&self, key: usize) -> bool {
        let handle = self.targets.lock().remove(&key);
        match handle {
            Some(handle) => {
                handle.destroy().await;
                true
            }
            None => false,
        }
    }

    async fn teardown(&self) {
        let handles: Vec<_> = self
            .targets
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.destroy().await;
        }
        if let Some(previous) = &self.previous {
            previous.teardown().await;
        }
    }
}

/// One link in a chain of piped stages, tracking every target driven from
/// its source.
pub struct Pipe<T: Clone + Send + 'static> {
    inner: Arc<PipeInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Pipe<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Pipe<T> {
    fn new(source: Source<T>, previous: Option<Arc<dyn Teardown>>) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                source,
                targets: Mutex::new(HashMap::new()),
                previous,
            }),
        }
    }

    /// Chain root over any consumer.
    #[must_use]
    pub fn from_consumer(consumer: Arc<dyn StreamConsumer<T>>) -> Self {
        Self::new(Source::Fixed(consumer), None)
    }

    /// Chain root over a stream.
    #[must_use]
    pub fn from_stream(stream: &Stream<T>) -> Self {
        Self::from_consumer(Arc::new(stream.clone()))
    }

    /// Chain root over a consumer factory: every target piped from this
    /// link gets its own consumer.
    #[must_use]
    pub fn from_factory(
        factory: impl Fn() -> Arc<dyn StreamConsumer<T>> + Send + Sync + 'static,
    ) -> Self {
        Self::new(Source::Factory(Box::new(factory)), None)
    }

    /// Chain root over a broadcast stream: every target piped from this
    /// link gets its own broadcast consumer, and so the full feed.
    #[must_use]
    pub fn from_broadcast(stream: &crate::broadcast::BroadcastStream<T>) -> Self {
        let stream = stream.clone();
        Self::from_factory(move || Arc::new(stream.consume()) as Arc<dyn StreamConsumer<T>>)
    }

    /// Pipes into a stage that is itself consumable, returning the next
    /// chain link reading from that stage.
    pub fn pipe_through<O, S>(&self, stage: Arc<S>) -> Pipe<O>
    where
        O: Clone + Send + 'static,
        S: StreamProducer<T> + StreamConsumer<O> + 'static,
    {
        let producer: Arc<dyn StreamProducer<T>> = stage.clone();
        let handle = pipe(self.inner.source.consumer(), Arc::clone(&producer));
        if let Some(previous) = self
            .inner
            .targets
            .lock()
            .insert(target_key(&producer), handle)
        {
            previous.cancel();
        }
        Pipe::new(
            Source::Fixed(stage as Arc<dyn StreamConsumer<O>>),
            Some(Arc::clone(&self.inner) as Arc<dyn Teardown>),
        )
    }

    /// Pipes into a terminal producer, returning the flow handle that stops
    /// this one connection.
    pub fn pipe_to(&self, target: Arc<dyn StreamProducer<T>>) -> Flow {
        let key = target_key(&target);
        let handle = pipe(self.inner.source.consumer(), target);
        if let Some(previous) = self.inner.targets.lock().insert(key, handle) {
            previous.cancel();
        }
        Flow {
            owner: Arc::clone(&self.inner) as Arc<dyn Teardown>,
            key,
        }
    }

    /// Stops the connection to `target`. Returns whether one existed.
    pub async fn unpipe(&self, target: &Arc<dyn StreamProducer<T>>) -> bool {
        self.inner.unpipe_key(target_key(target)).await
    }

    /// Stops every connection driven from this link.
    pub async fn unpipe_all(&self) {
        let handles: Vec<_> = self
            .inner
            .targets
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.destroy().await;
        }
    }

    /// Whether a connection to `target` exists.
    #[must_use]
    pub fn is_piped(&self, target: &Arc<dyn StreamProducer<T>>) -> bool {
        self.inner.targets.lock().contains_key(&target_key(target))
    }

    /// Number of connections driven from this link.
    #[must_use]
    pub fn total_pipes(&self) -> usize {
        self.inner.targets.lock().len()
    }

    /// A consumer over this link's source.
    #[must_use]
    pub fn consumer(&self) -> Arc<dyn StreamConsumer<T>> {
        self.inner.source.consumer()
    }

    /// Stops every connection of this link and cascades upstream through
    /// the links it was chained from.
    pub async fn destroy(&self) {
        self.unpipe_all().await;
        if let Some(previous) = &self.inner.previous {
            previous.teardown().await;
        }
    }
}

/// Handle on one terminal pipe connection.
pub struct Flow {
    owner: Arc<dyn Teardown>,
    key: usize,
}

impl Flow {
    /// Stops the connection.
    pub async fn destroy(self) {
        let _ = self.owner.unpipe_key(self.key).await;
    }
}
