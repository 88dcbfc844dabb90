// Collections service: item/tag mutations paired with a transactional
// outbox. A relay loop drains pending outbox entries to the bus
// (at-least-once), and a compensation listener rolls local state back when
// a downstream consumer rejects an update.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::CollectionsConfig;
use crate::error::{AppError, AppResult};
use crate::infrastructure::bus::{BusSubscriber, MessageBus};
use crate::infrastructure::middleware::with_trace_header;
use crate::models::{
    CollectionUpdate, OutboxEntry, OutboxStatus, COLLECTION_COMPENSATIONS_TOPIC,
    COLLECTION_UPDATES_TOPIC, TAG_ADDED, TAG_ADD_FAILED,
};

const SAGA_GROUP: &str = "collections_saga_group";
const DEFAULT_RELAY_PERIOD: Duration = Duration::from_secs(2);
const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Item {
    pub name: String,
    pub tags: Vec<String>,
}

pub struct CollectionsService {
    items: RwLock<HashMap<String, Item>>,
    outbox: Mutex<Vec<OutboxEntry>>,
    bus: Arc<dyn MessageBus>,
    /// When unset, tag validation is skipped.
    tags_service_url: Option<String>,
    relay_period: Duration,
    http: reqwest::Client,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CollectionsService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        tags_service_url: Option<String>,
    ) -> anyhow::Result<Self> {
        let mut items = HashMap::new();
        items.insert(
            "123".to_string(),
            Item {
                name: "My First Movie".to_string(),
                tags: vec!["classic".to_string(), "drama".to_string()],
            },
        );
        items.insert(
            "456".to_string(),
            Item {
                name: "Another Movie".to_string(),
                tags: Vec::new(),
            },
        );

        Ok(Self {
            items: RwLock::new(items),
            outbox: Mutex::new(Vec::new()),
            bus,
            tags_service_url,
            relay_period: DEFAULT_RELAY_PERIOD,
            http: reqwest::Client::builder().timeout(TAGS_TIMEOUT).build()?,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn from_config(config: &CollectionsConfig, bus: Arc<dyn MessageBus>) -> anyhow::Result<Self> {
        Self::new(bus, config.tags_service_url.clone())
    }

    /// Shorten the relay period (tests drive the relay faster than the
    /// production 2 s cycle).
    pub fn with_relay_period(mut self, period: Duration) -> Self {
        self.relay_period = period;
        self
    }

    /// Spawn the outbox relay and the compensation listener.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let subscriber = self
            .bus
            .subscribe(COLLECTION_COMPENSATIONS_TOPIC, SAGA_GROUP)
            .await?;

        let mut tasks = self.tasks.lock().await;

        let relay = Arc::clone(self);
        let relay_token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            relay.run_outbox_relay(relay_token).await;
        }));

        let listener = Arc::clone(self);
        let listener_token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            listener
                .run_compensation_listener(subscriber, listener_token)
                .await;
        }));

        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        for handle in self.tasks.lock().await.drain(..) {
            if let Err(err) = handle.await {
                error!("Collections background task ended abnormally: {}", err);
            }
        }
    }

    pub async fn get_item_tags(&self, item_id: &str) -> AppResult<Vec<String>> {
        self.items
            .read()
            .await
            .get(item_id)
            .map(|item| item.tags.clone())
            .ok_or_else(|| AppError::NotFound("Item not found".to_string()))
    }

    /// Add a tag to an item. The outbox entry is appended while the items
    /// lock is still held, so there is never a mutation without its
    /// PENDING entry.
    pub async fn add_tag(&self, item_id: &str, tag: &str) -> AppResult<String> {
        {
            let items = self.items.read().await;
            let item = items
                .get(item_id)
                .ok_or_else(|| AppError::NotFound("Item not found".to_string()))?;
            if item.tags.iter().any(|t| t == tag) {
                return Err(duplicate_tag(tag, item_id));
            }
        }

        self.validate_tag(tag).await?;

        let mut items = self.items.write().await;
        let item = items
            .get_mut(item_id)
            .ok_or_else(|| AppError::NotFound("Item not found".to_string()))?;
        if item.tags.iter().any(|t| t == tag) {
            return Err(duplicate_tag(tag, item_id));
        }
        item.tags.push(tag.to_string());

        let entry = OutboxEntry {
            item_id: item_id.to_string(),
            action: TAG_ADDED.to_string(),
            tag: tag.to_string(),
            status: OutboxStatus::Pending,
        };
        self.outbox.lock().await.push(entry.clone());
        info!("Added message to outbox: {:?}", entry);

        Ok(tag.to_string())
    }

    async fn validate_tag(&self, tag: &str) -> AppResult<()> {
        let Some(base) = &self.tags_service_url else {
            return Ok(());
        };

        let url = if base.ends_with('/') {
            base.clone()
        } else {
            format!("{}/", base)
        };
        let request = with_trace_header(self.http.post(&url)).json(&json!({"tag_name": tag}));

        let response = request.send().await.map_err(|err| {
            error!("Cannot reach tags service: {}", err);
            AppError::ServiceUnavailable("The Tags Service is currently unavailable.".to_string())
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response
            .text()
            .await
            .ok()
            .and_then(|text| {
                serde_json::from_str::<Value>(&text)
                    .ok()
                    .and_then(|body| {
                        body.get("detail")
                            .or_else(|| body.get("error"))
                            .and_then(Value::as_str)
                            .map(str::to_owned)
                    })
                    .or(Some(text).filter(|t| !t.is_empty()))
            })
            .unwrap_or_else(|| "Bad Request".to_string());

        Err(AppError::Upstream {
            status,
            detail: format!("Tag validation failed: {}", detail),
        })
    }

    async fn run_outbox_relay(&self, token: CancellationToken) {
        info!("Starting outbox relay");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.relay_period) => {}
            }
            // Cancellation is only observed between cycles: an in-flight
            // drain always runs to completion.
            self.drain_outbox().await;
        }
        info!("Outbox relay stopped");
    }

    /// Publish every PENDING outbox entry. Entries are removed only after
    /// the broker acknowledged the publish; a failed send stays in the
    /// outbox for the next cycle, so consumers must tolerate duplicates.
    pub async fn drain_outbox(&self) {
        let pending: Vec<OutboxEntry> = self
            .outbox
            .lock()
            .await
            .iter()
            .filter(|entry| entry.status == OutboxStatus::Pending)
            .cloned()
            .collect();

        for entry in pending {
            let update = CollectionUpdate {
                item_id: entry.item_id.clone(),
                action: entry.action.clone(),
                tag: entry.tag.clone(),
            };
            let payload = match serde_json::to_vec(&update) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("Failed to encode outbox message: {}", err);
                    continue;
                }
            };

            match self.bus.publish(COLLECTION_UPDATES_TOPIC, payload).await {
                Ok(()) => {
                    let mut outbox = self.outbox.lock().await;
                    if let Some(position) = outbox.iter().position(|e| {
                        e.status == OutboxStatus::Pending
                            && e.item_id == entry.item_id
                            && e.action == entry.action
                            && e.tag == entry.tag
                    }) {
                        outbox.remove(position);
                    }
                    info!("Outbox relay sent: {:?}", update);
                }
                Err(err) => error!("Failed to send outbox message: {}", err),
            }
        }
    }

    async fn run_compensation_listener(
        &self,
        mut subscriber: Box<dyn BusSubscriber>,
        token: CancellationToken,
    ) {
        info!("Starting compensation listener");
        loop {
            let payload = tokio::select! {
                _ = token.cancelled() => break,
                received = subscriber.next_message() => match received {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(err) => {
                        error!("Compensation consumer error: {}", err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };
            self.handle_compensation(&payload).await;
        }
        info!("Compensation listener stopped");
    }

    /// Process one compensation message. Failures are logged and never
    /// terminate consumption of subsequent messages.
    pub async fn handle_compensation(&self, payload: &[u8]) {
        let data: Value = match serde_json::from_slice(payload) {
            Ok(data) => data,
            Err(err) => {
                error!("Error processing compensation message: {}", err);
                return;
            }
        };
        info!("Received compensation request: {}", data);

        if data.get("action").and_then(Value::as_str) == Some(TAG_ADD_FAILED) {
            self.compensate_add_tag(&data).await;
        }
    }

    async fn compensate_add_tag(&self, data: &Value) {
        let (Some(item_id), Some(tag)) = (
            data.get("item_id").and_then(Value::as_str),
            data.get("tag").and_then(Value::as_str),
        ) else {
            return;
        };

        let mut items = self.items.write().await;
        match items.get_mut(item_id) {
            Some(item) if item.tags.iter().any(|t| t == tag) => {
                item.tags.retain(|t| t != tag);
                warn!(
                    "[SAGA] Compensating transaction executed: removed tag '{}' from item {}",
                    tag, item_id
                );
            }
            _ => info!(
                "[SAGA] Tag '{}' not found on item {}, skipping rollback",
                tag, item_id
            ),
        }
    }

    /// Snapshot of the outbox, PENDING entries included.
    pub async fn outbox_snapshot(&self) -> Vec<OutboxEntry> {
        self.outbox.lock().await.clone()
    }
}

fn duplicate_tag(tag: &str, item_id: &str) -> AppError {
    AppError::Conflict(format!(
        "Tag '{}' already exists on item {}.",
        tag, item_id
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::MemoryBus;
    use async_trait::async_trait;

    /// Bus whose publishes always fail; subscriptions delegate to an
    /// inner memory bus.
    struct BrokenBus {
        inner: MemoryBus,
    }

    #[async_trait]
    impl MessageBus for BrokenBus {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> AppResult<()> {
            Err(AppError::BusError("broker unavailable".to_string()))
        }

        async fn subscribe(&self, topic: &str, group: &str) -> AppResult<Box<dyn BusSubscriber>> {
            self.inner.subscribe(topic, group).await
        }
    }

    fn service(bus: Arc<dyn MessageBus>) -> Arc<CollectionsService> {
        Arc::new(CollectionsService::new(bus, None).unwrap())
    }

    #[tokio::test]
    async fn add_tag_appends_a_pending_outbox_entry() {
        let collections = service(Arc::new(MemoryBus::new()));
        collections.add_tag("456", "classic").await.unwrap();

        assert_eq!(
            collections.get_item_tags("456").await.unwrap(),
            vec!["classic".to_string()]
        );
        let outbox = collections.outbox_snapshot().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].item_id, "456");
        assert_eq!(outbox[0].action, TAG_ADDED);
        assert_eq!(outbox[0].tag, "classic");
        assert_eq!(outbox[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_tags_conflict() {
        let collections = service(Arc::new(MemoryBus::new()));
        assert!(matches!(
            collections.add_tag("123", "classic").await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn unknown_items_are_not_found() {
        let collections = service(Arc::new(MemoryBus::new()));
        assert!(matches!(
            collections.add_tag("999", "classic").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            collections.get_item_tags("999").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn drained_entries_are_published_exactly_once() {
        let bus = Arc::new(MemoryBus::new());
        let mut probe = bus
            .subscribe(COLLECTION_UPDATES_TOPIC, "probe")
            .await
            .unwrap();
        let collections = service(bus);

        collections.add_tag("456", "classic").await.unwrap();
        collections.drain_outbox().await;
        collections.drain_outbox().await;

        assert!(collections.outbox_snapshot().await.is_empty());

        let payload = probe.next_message().await.unwrap().unwrap();
        let update: CollectionUpdate = serde_json::from_slice(&payload).unwrap();
        assert_eq!(update.item_id, "456");
        assert_eq!(update.tag, "classic");

        // The second drain had nothing left to send.
        let extra =
            tokio::time::timeout(Duration::from_millis(100), probe.next_message()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn failed_publishes_stay_pending() {
        let collections = service(Arc::new(BrokenBus {
            inner: MemoryBus::new(),
        }));

        collections.add_tag("456", "classic").await.unwrap();
        collections.drain_outbox().await;

        let outbox = collections.outbox_snapshot().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].status, OutboxStatus::Pending);
    }

    #[tokio::test]
    async fn compensation_removes_the_tag() {
        let collections = service(Arc::new(MemoryBus::new()));
        collections.add_tag("456", "classic").await.unwrap();

        let payload = serde_json::to_vec(&json!({
            "item_id": "456",
            "tag": "classic",
            "action": TAG_ADD_FAILED,
            "reason": "rejected downstream",
        }))
        .unwrap();
        collections.handle_compensation(&payload).await;

        assert!(collections.get_item_tags("456").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compensation_for_an_absent_tag_is_a_no_op() {
        let collections = service(Arc::new(MemoryBus::new()));
        let payload = serde_json::to_vec(&json!({
            "item_id": "456",
            "tag": "ghost",
            "action": TAG_ADD_FAILED,
            "reason": "rejected downstream",
        }))
        .unwrap();
        collections.handle_compensation(&payload).await;

        assert!(collections.get_item_tags("456").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrelated_actions_and_bad_payloads_are_ignored() {
        let collections = service(Arc::new(MemoryBus::new()));
        collections.handle_compensation(b"not json").await;
        collections
            .handle_compensation(
                &serde_json::to_vec(&json!({"action": "SOMETHING_ELSE", "item_id": "123", "tag": "classic"}))
                    .unwrap(),
            )
            .await;

        // Local state untouched.
        assert_eq!(
            collections.get_item_tags("123").await.unwrap(),
            vec!["classic".to_string(), "drama".to_string()]
        );
    }
}
