// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Small composable stages and drain helpers built on the stream traits.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;
use crate::pipe::{self, PipeHandle};
use crate::stream::{PendingMessage, PullOptions, Stream, StreamConsumer, StreamProducer};

/// Mapping stage: pushes are transformed and forwarded into an internal
/// stream, which the consumer side drains. Pushing resolves with the
/// original input once the mapped value is committed downstream.
pub struct Transform<T, O: Clone + Send + 'static> {
    stream: Stream<O>,
    mapper: Box<dyn Fn(T) -> O + Send + Sync>,
}

impl<T, O: Clone + Send + 'static> Transform<T, O> {
    /// Creates a stage applying `mapper` to every pushed value.
    pub fn new(mapper: impl Fn(T) -> O + Send + Sync + 'static) -> Self {
        Self {
            stream: Stream::new(),
            mapper: Box::new(mapper),
        }
    }

    /// Closes the internal stream.
    pub fn close(&self) {
        self.stream.close();
    }
}

#[async_trait]
impl<T, O> StreamProducer<T> for Transform<T, O>
where
    T: Clone + Send + 'static,
    O: Clone + Send + 'static,
{
    async fn push(&self, value: T) -> Result<T, StreamError> {
        let mapped = (self.mapper)(value.clone());
        let _ = self.stream.push(mapped)?.await?;
        Ok(value)
    }
}

#[async_trait]
impl<T, O> StreamConsumer<O> for Transform<T, O>
where
    T: Send + 'static,
    O: Clone + Send + 'static,
{
    async fn pull_with(&self, options: PullOptions) -> Result<PendingMessage<O>, StreamError> {
        self.stream.pull_with(options).await
    }

    fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

/// Terminal producer invoking a callback for every pushed value.
pub struct Callback<T> {
    callback: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> Callback<T> {
    /// Creates a terminal stage around `callback`.
    pub fn new(callback: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamProducer<T> for Callback<T> {
    async fn push(&self, value: T) -> Result<T, StreamError> {
        (self.callback)(value.clone());
        Ok(value)
    }
}

/// Forwarding stage: every push goes to the wrapped producer and into an
/// internal stream, and both must confirm; the consumer side drains the
/// internal copy.
pub struct Tee<T: Clone + Send + 'static> {
    producer: Arc<dyn StreamProducer<T>>,
    stream: Stream<T>,
}

impl<T: Clone + Send + 'static> Tee<T> {
    /// Creates a tee in front of `producer`.
    pub fn new(producer: Arc<dyn StreamProducer<T>>) -> Self {
        Self {
            producer,
            stream: Stream::new(),
        }
    }

    /// Closes the internal stream.
    pub fn close(&self) {
        self.stream.close();
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamProducer<T> for Tee<T> {
    async fn push(&self, value: T) -> Result<T, StreamError> {
        let receipt = self.stream.push(value.clone())?;
        let forward = self.producer.push(value.clone());
        let _ = futures::future::try_join(forward, receipt).await?;
        Ok(value)
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamConsumer<T> for Tee<T> {
    async fn pull_with(&self, options: PullOptions) -> Result<PendingMessage<T>, StreamError> {
        self.stream.pull_with(options).await
    }

    fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }
}

/// Handle stopping every pipe created by [`sink`].
pub struct SinkHandle {
    handles: Vec<PipeHandle>,
}

impl SinkHandle {
    /// Stops all pipes, waiting for each loop to observe the cancellation.
    pub async fn destroy(self) {
        for handle in self.handles {
            handle.destroy().await;
        }
    }
}

/// Pipes every source into one shared target. The returned handle tears all
/// of them down at once.
pub fn sink<T: Clone + Send + 'static>(
    sources: Vec<Arc<dyn StreamConsumer<T>>>,
    target: Arc<dyn StreamProducer<T>>,
) -> SinkHandle {
    let handles = sources
        .into_iter()
        .map(|source| pipe::pipe(source, Arc::clone(&target)))
        .collect();
    SinkHandle { handles }
}

/// Drains `source` into all `targets` until the source closes or the token
/// cancels: each pulled value is pushed to every target, committed when all
/// confirm and rejected with the failure otherwise. A claim observed after
/// cancellation is rolled back. The source is closed once the drain ends.
pub async fn flush<T: Clone + Send + 'static>(
    source: &Stream<T>,
    targets: &[Arc<dyn StreamProducer<T>>],
    token: Option<CancellationToken>,
) -> Result<(), StreamError> {
    let token = token.unwrap_or_default();
    if source.is_closed() || token.is_cancelled() {
        return Ok(());
    }

    while !source.is_closed() && !token.is_cancelled() {
        let mut message = match source.pull_with(PullOptions::token(token.clone())).await {
            Ok(message) => message,
            Err(StreamError::PullCancelled) => return Ok(()),
            Err(StreamError::ClosedAlready | StreamError::WasClosed) => break,
            Err(other) => return Err(other),
        };
        if token.is_cancelled() {
            let _ = message.rollback();
            return Ok(());
        }
        let deliveries = targets
            .iter()
            .map(|target| target.push(message.value().clone()));
        match futures::future::try_join_all(deliveries).await {
            Ok(_) => {
                let _ = message.commit();
            }
            Err(reason) => {
                let _ = message.reject(reason.to_string());
            }
        }
    }

    source.close();
    Ok(())
}

/// Awaits a pull and commits it immediately, returning the value.
pub async fn auto_commit<T, F>(pull: F) -> Result<T, StreamError>
where
    T: Clone + Send + 'static,
    F: Future<Output = Result<PendingMessage<T>, StreamError>>,
{
    let mut message = pull.await?;
    message.commit()?;
    Ok(message.value().clone())
}
