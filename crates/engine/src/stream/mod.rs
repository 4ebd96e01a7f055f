// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! The rendezvous channel at the heart of the broker.
//!
//! # Shape
//!
//! `Stream<T>` wraps shared state (`Arc`) so handles are cheap to clone into
//! spawned tasks. The state is one [`LockedList`] of pushed-but-uncommitted
//! messages plus a FIFO queue of waiting pullers, guarded by a single short
//! mutex that is never held across an `.await`.
//!
//! # Push / pull rendezvous
//!
//! `push()` is eager: the message is enqueued (or handed to the oldest
//! waiting puller) before the call returns, and the returned [`PushReceipt`]
//! resolves only when the message is eventually committed. Awaiting the
//! receipt gives confirmed-delivery semantics; dropping it gives
//! fire-and-forget. A push that no consumer ever commits stays unconfirmed
//! forever -- that is backpressure, not a defect.
//!
//! `pull()` claims synchronously when a committable message is buffered,
//! otherwise it enqueues a waiter, optionally bounded by a timeout or a
//! cancellation token. An expired or cancelled waiter withdraws itself from
//! the queue, so a later push can never be swallowed by a dead entry; a
//! delivery that races the expiry is rolled back and re-offered.
//!
//! # Transactional claims
//!
//! A pull yields a [`PendingMessage`]: exactly one of `commit`, `rollback`,
//! or `reject` may be called, and the losing duplicates report
//! [`StreamError::CommittedAlready`] / [`StreamError::RolledBackAlready`].
//! Rollback re-offers the message at its original arrival position --
//! directly to the oldest live waiting puller when one exists. Dropping a
//! handle that is still pending rolls it back, so an aborted pull future
//! cannot strand a claimed message.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::deferred::{Deferred, PushReceipt};
use crate::error::StreamError;
use crate::list::{LockedList, Seq};
use crate::pipe::{self, PipeHandle};


static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Options for a bounded or cancellable pull.
#[derive(Default, Clone)]
pub struct PullOptions {
    /// Deadline after which the pull fails with
    /// [`StreamError::PullTimeout`].
    pub timeout: Option<Duration>,
    /// Cancellation token aborting the pull with
    /// [`StreamError::PullCancelled`].
    pub token: Option<CancellationToken>,
}

impl PullOptions {
    /// Options bounded by a deadline.
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    /// Options bound to a cancellation token.
    #[must_use]
    pub fn token(token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            ..Self::default()
        }
    }
}

/// Buffered-push and waiting-pull counts, as reported by
/// [`Stream::inspect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Messages pushed and not yet committed (claimed ones included).
    pub buffered: usize,
    /// Pullers waiting for a message.
    pub waiting: usize,
}

/// A value waiting to be claimed, paired with the cell that settles the
/// original pusher's receipt once the message is committed.
struct PushedMessage<T> {
    value: T,
    defer: Deferred<T>,
}

struct Waiter<T: Clone + Send + 'static> {
    id: u64,
    defer: Deferred<PendingMessage<T>>,
}

struct State<T: Clone + Send + 'static> {
    closed: bool,
    buffer: LockedList<PushedMessage<T>>,
    pullers: VecDeque<Waiter<T>>,
    next_waiter: u64,
}

pub(crate) struct Shared<T: Clone + Send + 'static> {
    id: u64,
    state: Mutex<State<T>>,
    pipes: Mutex<HashMap<usize, PipeHandle>>,
}

/// Asynchronous push/pull rendezvous channel with transactional pulls.
pub struct Stream<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Stream<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Stream<T> {
    /// Creates an open, empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(State {
                    closed: false,
                    buffer: LockedList::new(),
                    pullers: VecDeque::new(),
                    next_waiter: 0,
                }),
                pipes: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Process-unique identity of this stream (shared by clones). Used to
    /// key registries without comparing allocations.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Pushes a value.
    ///
    /// The message is enqueued before this returns; the receipt resolves
    /// with the value once a consumer commits it. Await the receipt for
    /// sync transmission, drop it for async transmission.
    pub fn push(&self, value: T) -> Result<PushReceipt<T>, StreamError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(StreamError::ClosedAlready);
        }

        let (defer, awaiting) = Deferred::new();
        let receipt = PushReceipt::new(awaiting);

        if state.pullers.is_empty() {
            let _ = state.buffer.append(PushedMessage { value, defer });
            return Ok(receipt);
        }

        // A puller is waiting: append locked so a rollback keeps the
        // message's arrival position, then hand the claim to the oldest
        // puller that is still listening.
        let seq = state.buffer.append_locked(PushedMessage {
            value: value.clone(),
            defer,
        });
        let mut message = PendingMessage::new(value, seq, Arc::clone(&self.shared));
        loop {
            match state.pullers.pop_front() {
                None => {
                    // Every waiter withdrew in the meantime; leave the
                    // message claimable.
                    message.defuse();
                    let _ = state.buffer.unlock(seq);
                    break;
                }
                Some(waiter) => match waiter.defer.resolve(message) {
                    Ok(()) => break,
                    Err(back) => message = back,
                },
            }
        }
        Ok(receipt)
    }

    /// Pulls the next message, suspending until one is available.
    pub async fn pull(&self) -> Result<PendingMessage<T>, StreamError> {
        self.pull_with(PullOptions::default()).await
    }

    /// Pulls the next message, optionally bounded by a timeout or a
    /// cancellation token.
    pub async fn pull_with(
        &self,
        options: PullOptions,
    ) -> Result<PendingMessage<T>, StreamError> {
        let (waiter_id, awaiting) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(StreamError::ClosedAlready);
            }
            if let Some(seq) = state.buffer.shift_with_lock() {
                let value = match state.buffer.get(seq) {
                    Some(pushed) => pushed.value.clone(),
                    None => return Err(StreamError::WasClosed),
                };
                return Ok(PendingMessage::new(value, seq, Arc::clone(&self.shared)));
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (defer, awaiting) = match options.token.clone() {
                Some(token) => Deferred::bound(token),
                None => Deferred::new(),
            };
            state.pullers.push_back(Waiter { id, defer });
            (id, awaiting)
        };

        let outcome = match options.timeout {
            None => awaiting.wait().await,
            Some(timeout) => match tokio::time::timeout(timeout, awaiting.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StreamError::PullTimeout { timeout }),
            },
        };

        match outcome {
            Ok(message) => Ok(message),
            Err(reason) => {
                if matches!(
                    reason,
                    StreamError::PullTimeout { .. } | StreamError::PullCancelled
                ) {
                    // Withdraw the waiter so a later push is not swallowed
                    // by a dead entry. A delivery racing the expiry lands in
                    // the dropped receiver and rolls itself back.
                    let mut state = self.shared.state.lock();
                    state.pullers.retain(|waiter| waiter.id != waiter_id);
                }
                Err(reason)
            }
        }
    }

    /// Closes the stream.
    ///
    /// All queued pullers and buffered pushes are rejected with
    /// [`StreamError::WasClosed`]; subsequent operations fail with
    /// [`StreamError::ClosedAlready`]. Closing is terminal and idempotent.
    pub fn close(&self) {
        let (pushes, pullers) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (state.buffer.drain(), std::mem::take(&mut state.pullers))
        };
        debug!(
            stream = self.shared.id,
            pushes = pushes.len(),
            pullers = pullers.len(),
            "closing stream"
        );
        // Settle every waiter independently; a failed settle (listener
        // already gone) must not keep the rest from being rejected.
        for pushed in pushes {
            let _ = pushed.defer.reject(StreamError::WasClosed);
        }
        for waiter in pullers {
            let _ = waiter.defer.reject(StreamError::WasClosed);
        }
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Buffered-push and waiting-pull counts.
    #[must_use]
    pub fn inspect(&self) -> StreamStats {
        let state = self.shared.state.lock();
        StreamStats {
            buffered: state.buffer.len(),
            waiting: state.pullers.len(),
        }
    }

    /// Spawns a self-driving loop pulling from this stream into `target`.
    ///
    /// Several pipes from one stream are legal and compete for messages;
    /// this is how partition-to-consumer assignment is realized. The pipe
    /// runs until this stream closes or [`unpipe`](Self::unpipe) is called.
    /// Piping again to the same target replaces (and cancels) the previous
    /// loop.
    pub fn pipe(&self, target: Arc<dyn StreamProducer<T>>) {
        let key = pipe::target_key(&target);
        let handle = pipe::pipe(Arc::new(self.clone()) as Arc<dyn StreamConsumer<T>>, target);
        if let Some(previous) = self.shared.pipes.lock().insert(key, handle) {
            previous.cancel();
        }
    }

    /// Cancels the pipe to `target`, rolling back its in-flight claim if
    /// the loop observes the cancellation before pushing. Returns whether a
    /// pipe to that target existed.
    pub async fn unpipe(&self, target: &Arc<dyn StreamProducer<T>>) -> bool {
        let handle = self.shared.pipes.lock().remove(&pipe::target_key(target));
        match handle {
            Some(handle) => {
                handle.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Cancels every pipe from this stream.
    pub async fn unpipe_all(&self) {
        let handles: Vec<_> = self
            .shared
            .pipes
            .lock()
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.destroy().await;
        }
    }
}

/// Anything that accepts pushed values and confirms their delivery.
#[async_trait]
pub trait StreamProducer<T: Clone + Send + 'static>: Send + Sync {
    /// Pushes a value and awaits its delivery confirmation.
    async fn push(&self, value: T) -> Result<T, StreamError>;
}

/// Anything that yields transactional messages.
#[async_trait]
pub trait StreamConsumer<T: Clone + Send + 'static>: Send + Sync {
    /// Pulls the next message, honoring the given bounds.
    async fn pull_with(&self, options: PullOptions)
        -> Result<PendingMessage<T>, StreamError>;

    /// Whether the underlying channel is closed.
    fn is_closed(&self) -> bool;

    /// Pulls the next message, suspending until one is available.
    async fn pull(&self) -> Result<PendingMessage<T>, StreamError> {
        self.pull_with(PullOptions::default()).await
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamProducer<T> for Stream<T> {
    async fn push(&self, value: T) -> Result<T, StreamError> {
        Stream::push(self, value)?.await
    }
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamConsumer<T> for Stream<T> {
    async fn pull_with(
        &self,
        options: PullOptions,
    ) -> Result<PendingMessage<T>, StreamError> {
        Stream::pull_with(self, options).await
    }

    fn is_closed(&self) -> bool {
        Stream::is_closed(self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Pending,
    Committed,
    RolledBack,
}

/// Transactional handle on one claimed message.
///
/// Exactly one of [`commit`](Self::commit), [`rollback`](Self::rollback),
/// or [`reject`](Self::reject) may be called. Dropping a handle that is
/// still pending rolls the message back.
pub struct PendingMessage<T: Clone + Send + 'static> {
    value: T,
    seq: Seq,
    shared: Arc<Shared<T>>,
    outcome: Outcome,
}

impl<T: Clone + Send + 'static> PendingMessage<T> {
    fn new(value: T, seq: Seq, shared: Arc<Shared<T>>) -> Self {
        Self {
            value,
            seq,
            shared,
            outcome: Outcome::Pending,
        }
    }

    /// The claimed value.
    #[must_use]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Permanently removes the message and resolves the pusher's receipt
    /// with the value.
    pub fn commit(&mut self) -> Result<(), StreamError> {
        self.guard()?;
        self.outcome = Outcome::Committed;
        let entry = {
            let mut state = self.shared.state.lock();
            if state.closed {
                // The buffer was erased and the pusher already rejected.
                return Ok(());
            }
            state.buffer.commit(self.seq)
        };
        if let Some(PushedMessage { value, defer }) = entry {
            let _ = defer.resolve(value);
        }
        Ok(())
    }

    /// Makes the message claimable again at its original position. When a
    /// puller is already waiting, the claim is handed to it directly.
    pub fn rollback(&mut self) -> Result<(), StreamError> {
        self.guard()?;
        self.outcome = Outcome::RolledBack;
        let mut state = self.shared.state.lock();
        if state.closed {
            return Ok(());
        }
        let value = match state.buffer.get(self.seq) {
            Some(pushed) => pushed.value.clone(),
            None => return Ok(()),
        };
        let mut message = PendingMessage::new(value, self.seq, Arc::clone(&self.shared));
        loop {
            match state.pullers.pop_front() {
                None => {
                    message.defuse();
                    let _ = state.buffer.unlock(self.seq);
                    return Ok(());
                }
                Some(waiter) => match waiter.defer.resolve(message) {
                    Ok(()) => return Ok(()),
                    Err(back) => message = back,
                },
            }
        }
    }

    /// Removes the message and rejects the pusher's receipt with the given
    /// reason. Counts as a commit for the single-use contract.
    pub fn reject(&mut self, reason: impl Into<Arc<str>>) -> Result<(), StreamError> {
        self.guard()?;
        self.outcome = Outcome::Committed;
        let entry = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.buffer.commit(self.seq)
        };
        if let Some(PushedMessage { defer, .. }) = entry {
            let _ = defer.reject(StreamError::rejected(reason));
        }
        Ok(())
    }

    fn guard(&self) -> Result<(), StreamError> {
        match self.outcome {
            Outcome::Pending => Ok(()),
            Outcome::Committed => Err(StreamError::CommittedAlready),
            Outcome::RolledBack => Err(StreamError::RolledBackAlready),
        }
    }

    /// Marks the handle settled without touching the buffer. Used when the
    /// underlying entry was already handled under the state lock.
    fn defuse(&mut self) {
        self.outcome = Outcome::RolledBack;
    }
}

impl<T: Clone + Send + 'static> Drop for PendingMessage<T> {
    fn drop(&mut self) {
        if self.outcome == Outcome::Pending {
            let _ = self.rollback();
        }
    }
}

impl<T: Clone + Send + std::fmt::Debug + 'static> std::fmt::Debug for PendingMessage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}
