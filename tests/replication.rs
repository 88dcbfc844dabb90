// Leader/follower replication over the in-process bus: convergence,
// last-writer-wins and catch-up from the earliest offset.

use meshkv::infrastructure::bus::{MemoryBus, MessageBus};
use meshkv::models::{Operation, ReplicationMessage};
use meshkv::services::StorageService;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "replication-g1";

fn node(is_leader: bool, bus: Arc<dyn MessageBus>) -> Arc<StorageService> {
    Arc::new(
        StorageService::new(
            "http://coordinator:8000".to_string(),
            "http://shard:8001".to_string(),
            "g1".to_string(),
            is_leader,
            TOPIC.to_string(),
            bus,
        )
        .unwrap(),
    )
}

async fn wait_until<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn followers_converge_on_leader_writes() {
    let bus = Arc::new(MemoryBus::new());
    let leader = node(true, bus.clone());
    let follower_a = node(false, bus.clone());
    let follower_b = node(false, bus);

    follower_a.start().await.unwrap();
    follower_b.start().await.unwrap();

    let value = json!({"id": "42", "title": "A"});
    leader
        .create_record("movies", "42", value.clone())
        .await
        .unwrap();

    // Every follower has its own subscription group, so both receive the
    // full stream independently.
    for follower in [&follower_a, &follower_b] {
        let follower = Arc::clone(follower);
        let expected = value.clone();
        wait_until(
            move || {
                let follower = Arc::clone(&follower);
                let expected = expected.clone();
                async move {
                    follower.read_record("movies", "42").await.ok() == Some(expected)
                }
            },
            "follower to apply the create",
        )
        .await;
    }

    leader.delete_record("movies", "42").await.unwrap();
    for follower in [&follower_a, &follower_b] {
        let follower = Arc::clone(follower);
        wait_until(
            move || {
                let follower = Arc::clone(&follower);
                async move { !follower.exists_record("movies", "42").await }
            },
            "follower to apply the delete",
        )
        .await;
    }

    follower_a.stop().await;
    follower_b.stop().await;
}

#[tokio::test]
async fn late_joining_followers_catch_up_from_earliest() {
    let bus = Arc::new(MemoryBus::new());
    let leader = node(true, bus.clone());

    leader
        .create_record("movies", "1", json!({"title": "first"}))
        .await
        .unwrap();
    leader
        .create_record("movies", "2", json!({"title": "second"}))
        .await
        .unwrap();

    // The follower subscribes only now; the earliest-offset subscription
    // replays the full log.
    let follower = node(false, bus);
    follower.start().await.unwrap();

    let probe = Arc::clone(&follower);
    wait_until(
        move || {
            let follower = Arc::clone(&probe);
            async move {
                follower.exists_record("movies", "1").await
                    && follower.exists_record("movies", "2").await
            }
        },
        "late follower to replay the log",
    )
    .await;

    follower.stop().await;
}

#[tokio::test]
async fn replicated_writes_lose_against_newer_local_state() {
    let bus = Arc::new(MemoryBus::new());
    let follower = node(false, bus.clone());

    // A record from the future already sits on the follower.
    follower
        .apply_update(ReplicationMessage {
            operation: Operation::Create,
            table_name: "movies".to_string(),
            primary_key: "42".to_string(),
            value: Some(json!({"id": "42", "title": "OLD"})),
            timestamp: i64::MAX - 1,
        })
        .await;

    follower.start().await.unwrap();

    // An older create arrives over the bus.
    let stale = ReplicationMessage {
        operation: Operation::Create,
        table_name: "movies".to_string(),
        primary_key: "42".to_string(),
        value: Some(json!({"id": "42", "title": "NEW"})),
        timestamp: 1_000,
    };
    bus.publish(TOPIC, serde_json::to_vec(&stale).unwrap())
        .await
        .unwrap();

    // Give the replication loop a chance to (not) apply it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        follower.read_record("movies", "42").await.unwrap(),
        json!({"id": "42", "title": "OLD"})
    );

    follower.stop().await;
}

#[tokio::test]
async fn follower_timestamps_match_the_leader_at_quiescence() {
    let bus = Arc::new(MemoryBus::new());
    let leader = node(true, bus.clone());
    let follower = node(false, bus);
    follower.start().await.unwrap();

    for i in 0..5 {
        leader
            .create_record("movies", "42", json!({"rev": i}))
            .await
            .unwrap();
    }

    let expected = json!({"rev": 4});
    let probe = Arc::clone(&follower);
    wait_until(
        move || {
            let follower = Arc::clone(&probe);
            let expected = expected.clone();
            async move { follower.read_record("movies", "42").await.ok() == Some(expected) }
        },
        "follower to converge on the last write",
    )
    .await;

    let follower_record = follower.stored_record("movies", "42").await.unwrap();
    let leader_record = leader.stored_record("movies", "42").await.unwrap();
    assert_eq!(follower_record.timestamp, leader_record.timestamp);
    assert_eq!(follower_record.value, leader_record.value);

    follower.stop().await;
}
