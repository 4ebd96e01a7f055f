// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! In-process message broker core.
//!
//! The building blocks of a Kafka-like messaging abstraction, entirely in
//! memory: rendezvous streams with transactional (commit/rollback)
//! consumption, topics with partitioned consumer-group fan-out, broadcast
//! multicast, and composable pipes connecting any consumer to any producer.
//!
//! # Layers
//!
//! - [`deferred`]: settle-once result cells and delivery receipts.
//! - [`list`]: the locking ordered buffer with commit/rollback of claims.
//! - [`stream`]: the rendezvous channel ([`Stream`]) and the
//!   producer/consumer traits every other component speaks.
//! - [`pipe`]: self-driving pull-push loops, chaining, teardown.
//! - [`topic`]: partitioned streams load-shared across consumer groups.
//! - [`broadcast`]: fan-out to every consumer, with backlog buffering.
//! - [`stage`]: mapping/callback/tee stages and drain helpers.
//! - [`message`] / [`transport`]: the envelope model, the transport
//!   contract, and the in-memory transport.
//!
//! # Delivery semantics
//!
//! A push is eager and returns a receipt that resolves only when the
//! message is committed; awaiting the receipt is sync transmission,
//! dropping it is async transmission. A pull returns a single-use
//! transactional handle: commit removes the message permanently, rollback
//! re-offers it at its original position, reject fails the original
//! pusher. Nothing is retried anywhere in the core.

pub mod broadcast;
pub mod deferred;
pub mod error;
pub mod list;
pub mod message;
pub mod pipe;
pub mod stage;
pub mod stream;
pub mod topic;
pub mod transport;

pub use broadcast::{BroadcastConsumeOptions, BroadcastOptions, BroadcastStream};
pub use deferred::{Awaiting, Deferred, PushReceipt};
pub use error::StreamError;
pub use message::{Headers, Message};
pub use pipe::{pipe, Flow, Pipe, PipeHandle};
pub use stage::{auto_commit, flush, sink, Callback, SinkHandle, Tee, Transform};
pub use stream::{
    PendingMessage, PullOptions, Stream, StreamConsumer, StreamProducer, StreamStats,
};
pub use topic::{
    calculate_partition_consumer, Partitioner, Topic, TopicConsumeOptions, TopicPushOptions,
};
pub use transport::{
    Consumer, ConsumerOptions, InMemoryConsumer, InMemoryProducer, InMemoryTransport, Producer,
    ProducerOptions, ReceiveOptions, SubscribeCallback, Subscription, Transmission, Transport,
};
