// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

/// Errors produced by stream, topic, and transport operations.
///
/// Clonable so a single failure can be fanned out to every waiter rejected by
/// the same event (close drains both the push buffer and the puller queue).
/// None of these are retried by the core; retry, if desired, belongs to the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// An operation was attempted on a channel after `close()`.
    #[error("channel closed already")]
    ClosedAlready,
    /// A pending operation was rejected because the channel closed while it
    /// was in flight.
    #[error("channel was closed")]
    WasClosed,
    /// A bounded pull exceeded its deadline. Carries the bound that was used.
    #[error("pulling timed out after {timeout:?}")]
    PullTimeout {
        /// The deadline the caller supplied.
        timeout: Duration,
    },
    /// A pull was aborted through its cancellation token.
    #[error("pulling was cancelled")]
    PullCancelled,
    /// A `PendingMessage` was used again after `commit()` (or `reject()`).
    #[error("committed already")]
    CommittedAlready,
    /// A `PendingMessage` was used again after `rollback()`.
    #[error("rolled back already")]
    RolledBackAlready,
    /// A delivery was rejected by its consumer or by a downstream pipe
    /// target; surfaces on the original pusher's receipt.
    #[error("delivery rejected: {reason}")]
    Rejected {
        /// Rendering of the downstream failure.
        reason: Arc<str>,
    },
}

impl StreamError {
    /// Builds a [`StreamError::Rejected`] from any displayable reason.
    pub fn rejected(reason: impl Into<Arc<str>>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}
