// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Partition-to-consumer assignment and per-group fan-out.
//!
//! Every registered source (partition stream) is piped into its own
//! [`Distributor`], a producer whose push delivers one copy of the value per
//! consumer group. The assignment is recomputed per push from the current
//! membership: partition ordinal = the source's registration position,
//! member ordinal = the member's position within its group, and the
//! receiving member is `((partition - 1) % members) + 1`. Removing a source
//! or member compacts the ordinals, so assignments are contiguous but not
//! sticky across membership changes.
//!
//! A push with no groups at all, or a delivery to a group that currently
//! has no members, waits on the membership `Notify` until someone registers
//! (or the partitioner shuts down). An anonymous group that loses its only
//! member is dropped entirely -- nothing can ever rejoin it, and a
//! permanent wait would wedge every later push.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use courier_config::{GroupName, DEFAULT_PARTITION};

use crate::error::StreamError;
use crate::pipe::{self, PipeHandle};
use crate::stream::{Stream, StreamConsumer, StreamProducer};

/// Which consumer ordinal a partition is assigned to within one group.
///
/// `partition` is 1-based; the result is 1-based, or 0 when the group has no
/// consumers (nobody to deliver to).
#[must_use]
pub fn calculate_partition_consumer(partition: u32, total_consumers: u32) -> u32 {
    if total_consumers == 0 {
        return 0;
    }
    (partition.saturating_sub(1) % total_consumers) + 1
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum GroupKey {
    Named(GroupName),
    Anonymous(u64),
}

struct SourceEntry<T: Clone + Send + 'static> {
    stream: Stream<T>,
    handle: PipeHandle,
}

struct GroupEntry<T: Clone + Send + 'static> {
    key: GroupKey,
    members: Vec<Stream<T>>,
}

struct PartitionerState<T: Clone + Send + 'static> {
    closed: bool,
    sources: Vec<SourceEntry<T>>,
    groups: Vec<GroupEntry<T>>,
    next_anonymous: u64,
}

struct PartitionerInner<T: Clone + Send + 'static> {
    state: Mutex<PartitionerState<T>>,
    membership: Notify,
}

/// Maps partition sources to group members and keeps the assignment
/// consistent as both sides change.
pub struct Partitioner<T: Clone + Send + 'static> {
    inner: Arc<PartitionerInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Partitioner<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Partitioner<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Partitioner<T> {
    /// Creates an empty partitioner.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PartitionerInner {
                state: Mutex::new(PartitionerState {
                    closed: false,
                    sources: Vec::new(),
                    groups: Vec::new(),
                    next_anonymous: 0,
                }),
                membership: Notify::new(),
            }),
        }
    }

    /// Registers a partition source: assigns it the next partition ordinal
    /// and starts distributing everything it emits.
    pub fn add_source(&self, source: Stream<T>) {
        let distributor: Arc<dyn StreamProducer<T>> = Arc::new(Distributor {
            partitioner: Arc::clone(&self.inner),
            source_id: source.id(),
        });
        let consumer: Arc<dyn StreamConsumer<T>> = Arc::new(source.clone());
        let handle = pipe::pipe(consumer, distributor);

        let mut state = self.inner.state.lock();
        if state.closed {
            handle.cancel();
            return;
        }
        debug!(
            source = source.id(),
            ordinal = state.sources.len() + 1,
            "registering partition source"
        );
        state.sources.push(SourceEntry {
            stream: source,
            handle,
        });
    }

    /// Unregisters a partition source, stopping its distribution loop and
    /// compacting the remaining ordinals. Returns whether it was known.
    pub async fn remove_source(&self, source: &Stream<T>) -> bool {
        let handle = {
            let mut state = self.inner.state.lock();
            let position = state
                .sources
                .iter()
                .position(|entry| entry.stream.id() == source.id());
            position.map(|position| state.sources.remove(position).handle)
        };
        match handle {
            Some(handle) => {
                handle.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Registers a consumer. With a group name it becomes the group's next
    /// member (load-shared); without one it forms a fresh anonymous group
    /// of size one and independently sees every partition.
    pub fn add_target(&self, target: Stream<T>, group: Option<GroupName>) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            let key = match group {
                Some(name) => GroupKey::Named(name),
                None => {
                    state.next_anonymous += 1;
                    GroupKey::Anonymous(state.next_anonymous)
                }
            };
            debug!(member = target.id(), group = ?key, "registering group member");
            match state.groups.iter_mut().find(|entry| entry.key == key) {
                Some(entry) => entry.members.push(target),
                None => state.groups.push(GroupEntry {
                    key,
                    members: vec![target],
                }),
            }
        }
        self.inner.membership.notify_waiters();
    }

    /// Unregisters a consumer from whichever group holds it, compacting the
    /// remaining member ordinals. Returns whether it was known.
    pub fn remove_target(&self, target: &Stream<T>) -> bool {
        let mut state = self.inner.state.lock();
        for index in 0..state.groups.len() {
            let position = state.groups[index]
                .members
                .iter()
                .position(|member| member.id() == target.id());
            if let Some(position) = position {
                let _ = state.groups[index].members.remove(position);
                let emptied_anonymous = state.groups[index].members.is_empty()
                    && matches!(state.groups[index].key, GroupKey::Anonymous(_));
                if emptied_anonymous {
                    let _ = state.groups.remove(index);
                }
                return true;
            }
        }
        false
    }

    /// Number of registered partition sources.
    #[must_use]
    pub fn total_sources(&self) -> usize {
        self.inner.state.lock().sources.len()
    }

    /// Number of consumer groups (anonymous ones included).
    #[must_use]
    pub fn total_groups(&self) -> usize {
        self.inner.state.lock().groups.len()
    }

    /// Shuts the partitioner down: wakes every waiting distribution (which
    /// fails with [`StreamError::WasClosed`]), stops the source pipes, and
    /// closes all member streams.
    pub async fn shutdown(&self) {
        let (handles, members) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let handles: Vec<PipeHandle> = state
                .sources
                .drain(..)
                .map(|entry| entry.handle)
                .collect();
            let members: Vec<Stream<T>> = state
                .groups
                .drain(..)
                .flat_map(|entry| entry.members)
                .collect();
            (handles, members)
        };
        debug!(
            sources = handles.len(),
            members = members.len(),
            "shutting down partitioner"
        );
        self.inner.membership.notify_waiters();
        for member in &members {
            member.close();
        }
        for handle in handles {
            handle.destroy().await;
        }
    }
}

/// Per-source fan-out: pushes one copy of each value to every consumer
/// group, to the member selected by [`calculate_partition_consumer`].
struct Distributor<T: Clone + Send + 'static> {
    partitioner: Arc<PartitionerInner<T>>,
    source_id: u64,
}

#[async_trait]
impl<T: Clone + Send + 'static> StreamProducer<T> for Distributor<T> {
    async fn push(&self, value: T) -> Result<T, StreamError> {
        let groups = self.group_keys().await?;
        let deliveries = groups
            .into_iter()
            .map(|key| self.deliver(key, value.clone()));
        let _ = futures::future::try_join_all(deliveries).await?;
        Ok(value)
    }
}

impl<T: Clone + Send + 'static> Distributor<T> {
    /// Snapshot of the group keys, waiting until at least one group exists.
    async fn group_keys(&self) -> Result<Vec<GroupKey>, StreamError> {
        loop {
            let mut notified = std::pin::pin!(self.partitioner.membership.notified());
            notified.as_mut().enable();
            {
                let state = self.partitioner.state.lock();
                if state.closed {
                    return Err(StreamError::WasClosed);
                }
                if !state.groups.is_empty() {
                    return Ok(state.groups.iter().map(|entry| entry.key.clone()).collect());
                }
            }
            notified.await;
        }
    }

    /// Delivers one copy to the given group, waiting while it has no
    /// members, and awaits the member's delivery confirmation.
    async fn deliver(&self, key: GroupKey, value: T) -> Result<(), StreamError> {
        let member = loop {
            let mut notified = std::pin::pin!(self.partitioner.membership.notified());
            notified.as_mut().enable();
            {
                let state = self.partitioner.state.lock();
                if state.closed {
                    return Err(StreamError::WasClosed);
                }
                let Some(group) = state.groups.iter().find(|entry| entry.key == key) else {
                    // The group was removed while this delivery was in
                    // flight; nobody is left to deliver to.
                    return Ok(());
                };
                let total = group.members.len() as u32;
                if total > 0 {
                    let partition = state
                        .sources
                        .iter()
                        .position(|entry| entry.stream.id() == self.source_id)
                        .map_or(DEFAULT_PARTITION, |index| index as u32 + 1);
                    let consumer = calculate_partition_consumer(partition, total);
                    match group.members.get((consumer - 1) as usize) {
                        Some(member) => break member.clone(),
                        None => return Ok(()),
                    }
                }
            }
            notified.await;
        };
        let _ = member.push(value)?.await?;
        Ok(())
    }
}
