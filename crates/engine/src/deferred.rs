// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Settle-once result cells -- the foundation of every asynchronous
//! rendezvous in the crate.
//!
//! A [`Deferred`] is split at construction into a settling half and an
//! awaiting half. The settling half can be resolved or rejected exactly once;
//! extra settles are reported back to the caller instead of panicking, and a
//! failed handoff returns the value so it can be re-offered to the next
//! waiter. The awaiting half can be pre-bound to a
//! [`CancellationToken`](tokio_util::sync::CancellationToken): a token that
//! is already cancelled rejects immediately, a later cancellation races
//! normal settlement, and the first settlement wins (delivery is polled
//! before cancellation, so a value that already arrived is never dropped in
//! favor of the abort).

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::StreamError;

type Settlement<T> = Result<T, StreamError>;

/// The settling half of a settle-once cell.
pub struct Deferred<T> {
    tx: Mutex<Option<oneshot::Sender<Settlement<T>>>>,
}

impl<T> Deferred<T> {
    /// Creates a settle/await pair.
    #[must_use]
    pub fn new() -> (Self, Awaiting<T>) {
        Self::with_token(None)
    }

    /// Creates a settle/await pair whose awaiting half is bound to a
    /// cancellation token.
    #[must_use]
    pub fn bound(token: CancellationToken) -> (Self, Awaiting<T>) {
        Self::with_token(Some(token))
    }

    fn with_token(token: Option<CancellationToken>) -> (Self, Awaiting<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            Awaiting { rx, token },
        )
    }

    /// Settles with a value.
    ///
    /// Returns the value back when the cell was already settled or the
    /// awaiting half is gone, so the caller can offer it elsewhere.
    pub fn resolve(&self, value: T) -> Result<(), T> {
        let Some(tx) = self.tx.lock().take() else {
            return Err(value);
        };
        match tx.send(Ok(value)) {
            Ok(()) => Ok(()),
            Err(Ok(value)) => Err(value),
            Err(Err(_)) => unreachable!("resolve only sends Ok"),
        }
    }

    /// Settles with a failure. Returns `false` when the cell was already
    /// settled or nobody is listening.
    pub fn reject(&self, reason: StreamError) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        tx.send(Err(reason)).is_ok()
    }

    /// Whether `resolve` or `reject` already consumed this cell.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Whether the awaiting half has been dropped.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

/// The awaiting half of a settle-once cell.
pub struct Awaiting<T> {
    rx: oneshot::Receiver<Settlement<T>>,
    token: Option<CancellationToken>,
}

impl<T> Awaiting<T> {
    /// Waits for settlement.
    ///
    /// Resolves with [`StreamError::WasClosed`] when the settling half is
    /// dropped unsettled, and [`StreamError::PullCancelled`] when a bound
    /// token fires before a settlement arrives.
    pub async fn wait(mut self) -> Result<T, StreamError> {
        match self.token.take() {
            None => recv(self.rx).await,
            Some(token) => {
                tokio::select! {
                    // Delivery is polled first: first settlement wins even
                    // when the token fired in the same instant.
                    biased;
                    settled = &mut self.rx => flatten(settled),
                    () = token.cancelled() => Err(StreamError::PullCancelled),
                }
            }
        }
    }
}

async fn recv<T>(rx: oneshot::Receiver<Settlement<T>>) -> Result<T, StreamError> {
    flatten(rx.await)
}

fn flatten<T>(
    settled: Result<Settlement<T>, oneshot::error::RecvError>,
) -> Result<T, StreamError> {
    match settled {
        Ok(result) => result,
        Err(_) => Err(StreamError::WasClosed),
    }
}

/// Confirmation-of-delivery future returned by a push.
///
/// Resolves with the pushed value once the message is committed by a
/// consumer, or with the rejection reason. Dropping the receipt detaches the
/// pusher from the confirmation without withdrawing the message -- this is
/// how fire-and-forget (async) transmission is expressed.
pub struct PushReceipt<T> {
    rx: oneshot::Receiver<Settlement<T>>,
}

impl<T> PushReceipt<T> {
    pub(crate) fn new(awaiting: Awaiting<T>) -> Self {
        Self { rx: awaiting.rx }
    }
}

impl<T> Future for PushReceipt<T> {
    type Output = Result<T, StreamError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(flatten)
    }
}

impl<T> std::fmt::Debug for PushReceipt<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushReceipt").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_the_value() {
        let (deferred, awaiting) = Deferred::new();
        assert!(deferred.resolve(7).is_ok());
        assert_eq!(awaiting.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn second_settlement_is_reported_back() {
        let (deferred, awaiting) = Deferred::new();
        assert!(deferred.resolve(1).is_ok());
        assert_eq!(deferred.resolve(2), Err(2));
        assert!(!deferred.reject(StreamError::WasClosed));
        assert_eq!(awaiting.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn reject_surfaces_the_reason() {
        let (deferred, awaiting) = Deferred::<u32>::new();
        assert!(deferred.reject(StreamError::WasClosed));
        assert_eq!(awaiting.wait().await, Err(StreamError::WasClosed));
    }

    #[tokio::test]
    async fn dropped_settling_half_reads_as_closed() {
        let (deferred, awaiting) = Deferred::<u32>::new();
        drop(deferred);
        assert_eq!(awaiting.wait().await, Err(StreamError::WasClosed));
    }

    #[tokio::test]
    async fn abandoned_listener_returns_the_value() {
        let (deferred, awaiting) = Deferred::new();
        drop(awaiting);
        assert!(deferred.is_abandoned());
        assert_eq!(deferred.resolve(3), Err(3));
    }

    #[tokio::test]
    async fn pre_cancelled_token_rejects_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let (_deferred, awaiting) = Deferred::<u32>::bound(token);
        assert_eq!(awaiting.wait().await, Err(StreamError::PullCancelled));
    }

    #[tokio::test]
    async fn settlement_wins_over_simultaneous_cancellation() {
        let token = CancellationToken::new();
        let (deferred, awaiting) = Deferred::bound(token.clone());
        assert!(deferred.resolve(9).is_ok());
        token.cancel();
        assert_eq!(awaiting.wait().await, Ok(9));
    }
}
