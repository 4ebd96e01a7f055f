// Copyright The Courier Authors
// SPDX-License-Identifier: Apache-2.0

//! Topic and partitioner behavior: assignment formula, group isolation,
//! load sharing, membership changes, lifecycle.

use std::time::Duration;

use courier_config::GroupName;

use crate::error::StreamError;
use crate::stage::auto_commit;
use crate::stream::{PullOptions, Stream};
use crate::topic::{
    calculate_partition_consumer, Partitioner, Topic, TopicConsumeOptions, TopicPushOptions,
};

fn group(name: &str) -> Option<GroupName> {
    Some(GroupName::parse(name).unwrap())
}

fn consume_as(topic: &Topic<&'static str>, name: &str) -> Stream<&'static str> {
    topic
        .consume(TopicConsumeOptions { group: group(name) })
        .unwrap()
}

fn push_to(topic: &Topic<&'static str>, value: &'static str, partition: u32) {
    let _ = topic
        .push_with(
            value,
            TopicPushOptions {
                partition: Some(partition),
            },
        )
        .unwrap();
}

async fn recv(stream: &Stream<&'static str>) -> &'static str {
    tokio::time::timeout(Duration::from_secs(1), auto_commit(stream.pull()))
        .await
        .expect("timed out waiting for a delivery")
        .expect("pull failed")
}

async fn assert_starved(stream: &Stream<&'static str>) {
    let outcome = stream
        .pull_with(PullOptions::timeout(Duration::from_millis(50)))
        .await;
    assert!(matches!(outcome, Err(StreamError::PullTimeout { .. })));
}

// =========================================================================
// Assignment formula
// =========================================================================

#[test]
fn partition_consumer_assignment_table() {
    let table = [
        ((1, 1), 1),
        ((1, 2), 1),
        ((2, 2), 2),
        ((3, 2), 1),
        ((4, 2), 2),
        ((5, 2), 1),
        ((6, 2), 2),
        ((7, 0), 0),
    ];
    for ((partition, consumers), expected) in table {
        assert_eq!(
            calculate_partition_consumer(partition, consumers),
            expected,
            "partition {partition} with {consumers} consumers"
        );
    }
}

// =========================================================================
// Delivery
// =========================================================================

#[tokio::test]
async fn pushes_reach_an_existing_consumer_in_order() {
    let topic = Topic::new();
    let consumer = topic.consume(TopicConsumeOptions::default()).unwrap();

    for value in ["A", "B", "C", "D"] {
        let _ = topic.push(value).unwrap();
    }
    for expected in ["A", "B", "C", "D"] {
        assert_eq!(recv(&consumer).await, expected);
    }
}

#[tokio::test]
async fn pushes_before_any_consumer_are_held_for_the_first_one() {
    let topic = Topic::new();
    for value in ["A", "B", "C", "D"] {
        let _ = topic.push(value).unwrap();
    }

    let consumer = topic.consume(TopicConsumeOptions::default()).unwrap();
    for expected in ["A", "B", "C", "D"] {
        assert_eq!(recv(&consumer).await, expected);
    }
}

#[tokio::test]
async fn single_partition_feeds_only_one_group_member() {
    let topic = Topic::new();
    let first = consume_as(&topic, "g1");
    let second = consume_as(&topic, "g1");

    for value in ["A", "B", "C", "D"] {
        let _ = topic.push(value).unwrap();
    }
    for expected in ["A", "B", "C", "D"] {
        assert_eq!(recv(&first).await, expected);
    }
    assert_starved(&second).await;
}

#[tokio::test]
async fn partitions_are_load_shared_across_group_members() {
    let topic = Topic::new();
    let first = consume_as(&topic, "g1");
    let second = consume_as(&topic, "g1");

    push_to(&topic, "A", 1);
    push_to(&topic, "B", 2);
    push_to(&topic, "C", 1);
    push_to(&topic, "D", 2);

    assert_eq!(recv(&first).await, "A");
    assert_eq!(recv(&first).await, "C");
    assert_eq!(recv(&second).await, "B");
    assert_eq!(recv(&second).await, "D");
}

#[tokio::test]
async fn multiple_partitions_converge_on_a_single_member() {
    let topic = Topic::new();
    let consumer = topic.consume(TopicConsumeOptions::default()).unwrap();

    push_to(&topic, "A", 1);
    push_to(&topic, "B", 2);

    let mut received = [recv(&consumer).await, recv(&consumer).await];
    received.sort_unstable();
    assert_eq!(received, ["A", "B"]);
}

// =========================================================================
// Group isolation
// =========================================================================

#[tokio::test]
async fn each_group_receives_a_full_copy() {
    let topic = Topic::new();
    let left = consume_as(&topic, "A");
    let right = consume_as(&topic, "B");

    for value in ["A", "B", "C", "D"] {
        let _ = topic.push(value).unwrap();
        assert_eq!(recv(&left).await, value);
        assert_eq!(recv(&right).await, value);
    }
}

#[tokio::test]
async fn groups_split_partitions_independently() {
    let topic = Topic::new();
    let first_a = consume_as(&topic, "A");
    let second_a = consume_as(&topic, "A");
    let first_b = consume_as(&topic, "B");
    let second_b = consume_as(&topic, "B");

    push_to(&topic, "A", 1);
    push_to(&topic, "B", 2);
    push_to(&topic, "C", 1);
    push_to(&topic, "D", 2);

    assert_eq!(recv(&first_a).await, "A");
    assert_eq!(recv(&first_a).await, "C");
    assert_eq!(recv(&second_a).await, "B");
    assert_eq!(recv(&second_a).await, "D");
    assert_eq!(recv(&first_b).await, "A");
    assert_eq!(recv(&first_b).await, "C");
    assert_eq!(recv(&second_b).await, "B");
    assert_eq!(recv(&second_b).await, "D");
}

#[tokio::test]
async fn anonymous_consumers_each_see_everything() {
    let topic = Topic::new();
    let first = topic.consume(TopicConsumeOptions::default()).unwrap();
    let second = topic.consume(TopicConsumeOptions::default()).unwrap();

    for value in ["A", "B"] {
        let _ = topic.push(value).unwrap();
        assert_eq!(recv(&first).await, value);
        assert_eq!(recv(&second).await, value);
    }
}

#[tokio::test]
async fn consuming_the_same_group_adds_a_member_not_a_handle() {
    let topic = Topic::<&'static str>::new();
    let first = consume_as(&topic, "g1");
    let second = consume_as(&topic, "g1");
    assert_ne!(first.id(), second.id());
}

// =========================================================================
// Membership changes
// =========================================================================

#[tokio::test]
async fn removing_a_member_reassigns_its_partitions() {
    let partitioner = Partitioner::new();
    let source = Stream::new();
    partitioner.add_source(source.clone());

    let first = Stream::new();
    let second = Stream::new();
    partitioner.add_target(first.clone(), group("g1"));
    partitioner.add_target(second.clone(), group("g1"));

    let _ = source.push("A").unwrap();
    assert_eq!(recv(&first).await, "A");

    assert!(partitioner.remove_target(&first));
    let _ = source.push("B").unwrap();
    assert_eq!(recv(&second).await, "B");
}

#[tokio::test]
async fn emptied_named_group_waits_for_a_new_member() {
    let partitioner = Partitioner::new();
    let source = Stream::new();
    partitioner.add_source(source.clone());

    let first = Stream::new();
    partitioner.add_target(first.clone(), group("g1"));
    assert!(partitioner.remove_target(&first));
    assert_eq!(partitioner.total_groups(), 1);

    // Distribution has nobody to deliver to; the value waits.
    let _ = source.push("A").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = Stream::new();
    partitioner.add_target(second.clone(), group("g1"));
    assert_eq!(recv(&second).await, "A");
}

#[tokio::test]
async fn emptied_anonymous_group_is_dropped() {
    let partitioner = Partitioner::<&'static str>::new();
    let member = Stream::new();
    partitioner.add_target(member.clone(), None);
    assert_eq!(partitioner.total_groups(), 1);

    assert!(partitioner.remove_target(&member));
    assert_eq!(partitioner.total_groups(), 0);
}

#[tokio::test]
async fn removing_a_source_stops_its_distribution() {
    let partitioner = Partitioner::new();
    let source = Stream::new();
    partitioner.add_source(source.clone());
    assert_eq!(partitioner.total_sources(), 1);

    let member = Stream::new();
    partitioner.add_target(member.clone(), group("g1"));

    assert!(partitioner.remove_source(&source).await);
    assert_eq!(partitioner.total_sources(), 0);

    let _ = source.push("A").unwrap();
    assert_starved(&member).await;
}

// =========================================================================
// Lifecycle
// =========================================================================

#[tokio::test]
async fn close_rejects_pending_pushes_and_cascades_to_consumers() {
    let topic = Topic::new();
    let consumer = consume_as(&topic, "g1");

    let receipt = topic.push("A").unwrap();
    topic.close().await;

    assert_eq!(receipt.await, Err(StreamError::WasClosed));
    assert!(consumer.is_closed());
    assert!(matches!(
        consumer.pull().await,
        Err(StreamError::ClosedAlready | StreamError::WasClosed)
    ));
}

#[tokio::test]
async fn closed_topic_refuses_push_and_consume() {
    let topic = Topic::<&'static str>::new();
    topic.close().await;

    assert_eq!(topic.push("A").unwrap_err(), StreamError::ClosedAlready);
    assert_eq!(
        topic
            .consume(TopicConsumeOptions::default())
            .err()
            .unwrap(),
        StreamError::ClosedAlready
    );
}

#[tokio::test]
async fn partitions_grow_lazily_and_never_shrink() {
    let topic = Topic::new();
    let consumer = topic.consume(TopicConsumeOptions::default()).unwrap();
    assert_eq!(topic.partition_count(), 0);

    push_to(&topic, "A", 5);
    assert_eq!(topic.partition_count(), 1);
    push_to(&topic, "B", 2);
    assert_eq!(topic.partition_count(), 2);
    push_to(&topic, "C", 5);
    assert_eq!(topic.partition_count(), 2);

    for _ in 0..3 {
        let _ = recv(&consumer).await;
    }
}
