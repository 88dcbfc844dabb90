// The collections <-> filter saga over the in-process bus: outbox relay,
// downstream recording, and compensation on a rejected tag.

use meshkv::infrastructure::bus::{MemoryBus, MessageBus};
use meshkv::services::{CollectionsService, FilterService};
use std::sync::Arc;
use std::time::Duration;

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

async fn saga_pair() -> (Arc<CollectionsService>, Arc<FilterService>) {
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());

    let collections = Arc::new(
        CollectionsService::new(bus.clone(), None)
            .unwrap()
            .with_relay_period(Duration::from_millis(50)),
    );
    let filter = Arc::new(FilterService::new(bus));

    collections.start().await.unwrap();
    filter.start().await.unwrap();

    (collections, filter)
}

#[tokio::test]
async fn happy_path_drains_the_outbox_and_records_the_update() {
    let (collections, filter) = saga_pair().await;

    collections.add_tag("456", "classic").await.unwrap();

    // The relay drains the outbox and the filter records the update.
    {
        let collections = Arc::clone(&collections);
        wait_until(
            move || {
                let collections = Arc::clone(&collections);
                async move { collections.outbox_snapshot().await.is_empty() }
            },
            "the outbox to drain",
        )
        .await;
    }
    {
        let filter = Arc::clone(&filter);
        wait_until(
            move || {
                let filter = Arc::clone(&filter);
                async move { filter.get_updates("456").await.is_ok() }
            },
            "the filter to record the update",
        )
        .await;
    }

    let updates = filter.get_updates("456").await.unwrap();
    assert!(updates
        .iter()
        .any(|u| u.action == "tag_added" && u.details["tag"] == "classic"));

    // No compensation fired: the tag is still on the item.
    assert_eq!(
        collections.get_item_tags("456").await.unwrap(),
        vec!["classic".to_string()]
    );

    collections.stop().await;
    filter.stop().await;
}

#[tokio::test]
async fn rejected_tag_is_compensated_away() {
    let (collections, filter) = saga_pair().await;

    collections.add_tag("456", "error").await.unwrap();
    // Mutation applied locally first; the saga unwinds it asynchronously.

    {
        let collections = Arc::clone(&collections);
        wait_until(
            move || {
                let collections = Arc::clone(&collections);
                async move {
                    !collections
                        .get_item_tags("456")
                        .await
                        .unwrap_or_default()
                        .iter()
                        .any(|t| t == "error")
                }
            },
            "the compensation to remove the tag",
        )
        .await;
    }

    // The rejected update never entered the filter's history.
    assert!(filter.get_updates("456").await.is_err());

    collections.stop().await;
    filter.stop().await;
}

#[tokio::test]
async fn compensation_leaves_other_tags_alone() {
    let (collections, filter) = saga_pair().await;

    collections.add_tag("456", "classic").await.unwrap();
    collections.add_tag("456", "error").await.unwrap();

    {
        let collections = Arc::clone(&collections);
        wait_until(
            move || {
                let collections = Arc::clone(&collections);
                async move {
                    let tags = collections.get_item_tags("456").await.unwrap_or_default();
                    !tags.iter().any(|t| t == "error") && tags.iter().any(|t| t == "classic")
                }
            },
            "only the rejected tag to be rolled back",
        )
        .await;
    }

    collections.stop().await;
    filter.stop().await;
}
