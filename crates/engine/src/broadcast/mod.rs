// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Backpressure-free fan-out: every consumer sees every value.
//!
//! Values pushed while no consumer is registered are buffered behind a
//! per-value deferred -- the pusher's receipt resolves only once the first
//! consumer actually commits the value, matching the stream's
//! confirmed-delivery semantics. Once at least one consumer exists, a push
//! enqueues into every consumer stream eagerly and the receipt resolves
//! when all of them confirm.
//!
//! History retention is opt-in: with it enabled, a consumer may ask for
//! `from_beginning` and gets every previously delivered value replayed
//! before live traffic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::deferred::{Deferred, PushReceipt};
use crate::error::StreamError;
use crate::pipe;
use crate::stream::{Stream, StreamProducer};


/// Options for creating a broadcast stream.
#[derive(Debug, Default, Clone)]
pub struct BroadcastOptions {
    /// Retain every delivered value for `from_beginning` replay.
    pub retain_history: bool,
}

/// Options for attaching a broadcast consumer.
#[derive(Debug, Default, Clone)]
pub struct BroadcastConsumeOptions {
    /// Replay retained history before live values. Requires the stream to
    /// have been created with `retain_history`.
    pub from_beginning: bool,
}

/// Buffered-value and consumer counts, as reported by
/// [`BroadcastStream::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Values waiting for the first consumer.
    pub buffer: usize,
    /// Registered consumer streams.
    pub consumers: usize,
}

struct Buffered<T> {
    value: T,
    defer: Deferred<T>,
}

struct BroadcastState<T: Clone + Send + 'static> {
    closed: bool,
    retain: bool,
    buffer: Vec<Buffered<T>>,
    history: Vec<T>,
    consumers: Vec<Stream<T>>,
}

struct BroadcastInner<T: Clone + Send + 'static> {
    state: Mutex<BroadcastState<T>>,
    pipes: Mutex<HashMap<usize, Stream<T>>>,
}

/// Fan-out channel delivering every pushed value to every consumer.
pub struct BroadcastStream<T: Clone + Send + 'static> {
    inner: Arc<BroadcastInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for BroadcastStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for BroadcastStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> BroadcastStream<T> {
    /// Creates a broadcast stream without history retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(BroadcastOptions::default())
    }

    /// Creates a broadcast stream with the given options.
    #[must_use]
    pub fn with_options(options: BroadcastOptions) -> Self {
        Self {
            inner: Arc::new(BroadcastInner {
                state: Mutex::new(BroadcastState {
                    closed: false,
                    retain: options.retain_history,
                    buffer: Vec::new(),
                    history: Vec::new(),
                    consumers: Vec::new(),
                }),
                pipes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Pushes a value to every registered consumer, or buffers it for the
    /// first consumer to come. The receipt resolves once every recipient
    /// has committed the value.
    pub fn push(&self, value: T) -> Result<PushReceipt<T>, StreamError> {
        let (defer, awaiting) = Deferred::new();
        let receipt = PushReceipt::new(awaiting);

        let (value, enqueued) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(StreamError::ClosedAlready);
            }
            if state.consumers.is_empty() {
                state.buffer.push(Buffered { value, defer });
                return Ok(receipt);
            }
            if state.retain {
                state.history.push(value.clone());
            }
            let enqueued: Vec<Result<PushReceipt<T>, StreamError>> = state
                .consumers
                .iter()
                .map(|consumer| consumer.push(value.clone()))
                .collect();
            (value, enqueued)
        };

        let _ = tokio::spawn(settle_when_confirmed(defer, value, enqueued));
        Ok(receipt)
    }

    /// Attaches a consumer seeing everything pushed from now on. The first
    /// consumer also absorbs the buffered backlog, in arrival order.
    pub fn consume(&self) -> Stream<T> {
        self.consume_with(BroadcastConsumeOptions::default())
    }

    /// Attaches a consumer with the given options.
    pub fn consume_with(&self, options: BroadcastConsumeOptions) -> Stream<T> {
        let consumer = Stream::new();
        let mut state = self.inner.state.lock();
        if state.closed {
            consumer.close();
            return consumer;
        }

        if options.from_beginning && state.retain {
            for value in &state.history {
                // Replayed values were already confirmed to their pushers.
                let _ = consumer.push(value.clone());
            }
        }

        if state.consumers.is_empty() && !state.buffer.is_empty() {
            let backlog: Vec<Buffered<T>> = state.buffer.drain(..).collect();
            debug!(backlog = backlog.len(), "draining broadcast backlog");
            for Buffered { value, defer } in backlog {
                if state.retain {
                    state.history.push(value.clone());
                }
                match consumer.push(value) {
                    Ok(receipt) => {
                        let _ = tokio::spawn(async move {
                            match receipt.await {
                                Ok(value) => {
                                    let _ = defer.resolve(value);
                                }
                                Err(reason) => {
                                    let _ = defer.reject(reason);
                                }
                            }
                        });
                    }
                    Err(reason) => {
                        let _ = defer.reject(reason);
                    }
                }
            }
        }

        state.consumers.push(consumer.clone());
        consumer
    }

    /// Pipes every value into `target` through a dedicated consumer, so
    /// each pipe target receives the full feed.
    pub fn pipe(&self, target: Arc<dyn StreamProducer<T>>) {
        let consumer = self.consume();
        consumer.pipe(Arc::clone(&target));
        let _ = self
            .inner
            .pipes
            .lock()
            .insert(pipe::target_key(&target), consumer);
    }

    /// Stops the pipe to `target` and deregisters its consumer. Returns
    /// whether one existed.
    pub async fn unpipe(&self, target: &Arc<dyn StreamProducer<T>>) -> bool {
        let consumer = self.inner.pipes.lock().remove(&pipe::target_key(target));
        let Some(consumer) = consumer else {
            return false;
        };
        let _ = consumer.unpipe(target).await;
        let mut state = self.inner.state.lock();
        state
            .consumers
            .retain(|registered| registered.id() != consumer.id());
        true
    }

    /// Stops every pipe from this broadcast.
    pub async fn unpipe_all(&self) {
        let targets: Vec<(usize, Stream<T>)> =
            self.inner.pipes.lock().drain().collect();
        for (_, consumer) in targets {
            consumer.unpipe_all().await;
            let mut state = self.inner.state.lock();
            state
                .consumers
                .retain(|registered| registered.id() != consumer.id());
        }
    }

    /// Closes the broadcast: buffered receipts are rejected with
    /// [`StreamError::WasClosed`], every consumer stream closes, history is
    /// dropped.
    pub fn close(&self) {
        let (buffer, consumers) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.history.clear();
            (
                std::mem::take(&mut state.buffer),
                std::mem::take(&mut state.consumers),
            )
        };
        debug!(
            buffered = buffer.len(),
            consumers = consumers.len(),
            "closing broadcast stream"
        );
        for buffered in buffer {
            let _ = buffered.defer.reject(StreamError::WasClosed);
        }
        for consumer in consumers {
            consumer.close();
        }
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Buffered-value and consumer counts.
    #[must_use]
    pub fn inspect(&self) -> BroadcastStats {
        let state = self.inner.state.lock();
        BroadcastStats {
            buffer: state.buffer.len(),
            consumers: state.consumers.len(),
        }
    }
}

/// Resolves the pusher's receipt once every recipient confirmed, or rejects
/// it with the first failure.
async fn settle_when_confirmed<T: Clone + Send + 'static>(
    defer: Deferred<T>,
    value: T,
    enqueued: Vec<Result<PushReceipt<T>, StreamError>>,
) {
    let mut confirmations = Vec::with_capacity(enqueued.len());
    for receipt in enqueued {
        match receipt {
            Ok(receipt) => confirmations.push(receipt),
            Err(reason) => {
                let _ = defer.reject(reason);
                return;
            }
        }
    }
    match futures::future::try_join_all(confirmations).await {
        Ok(_) => {
            let _ = defer.resolve(value);
        }
        Err(reason) => {
            let _ = defer.reject(reason);
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamProducer<T> for BroadcastStream<T> {
    async fn push(&self, value: T) -> Result<T, StreamError> {
        BroadcastStream::push(self, value)?.await
    }
}
