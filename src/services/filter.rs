// Filter service: the downstream consumer that closes the saga loop. It
// records collection updates per item and emits a compensation event when
// an update violates the tag business rule.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::infrastructure::bus::{BusSubscriber, MessageBus};
use crate::models::{
    CompensationEvent, UpdateRecord, COLLECTION_COMPENSATIONS_TOPIC, COLLECTION_UPDATES_TOPIC,
    TAG_ADD_FAILED,
};

const FILTER_GROUP: &str = "filter_group";

/// Tag value the business rule rejects.
const DISALLOWED_TAG: &str = "error";

pub struct FilterService {
    updates: RwLock<HashMap<String, Vec<Value>>>,
    bus: Arc<dyn MessageBus>,
    shutdown: CancellationToken,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl FilterService {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            updates: RwLock::new(HashMap::new()),
            bus,
            shutdown: CancellationToken::new(),
            consumer_task: Mutex::new(None),
        }
    }

    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let subscriber = self
            .bus
            .subscribe(COLLECTION_UPDATES_TOPIC, FILTER_GROUP)
            .await?;

        let service = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            service.consume_updates(subscriber, token).await;
        });
        *self.consumer_task.lock().await = Some(handle);

        info!("Filter consumer started");
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.consumer_task.lock().await.take() {
            if let Err(err) = handle.await {
                error!("Filter consumer ended abnormally: {}", err);
            }
        }
    }

    pub async fn get_updates(&self, item_id: &str) -> AppResult<Vec<UpdateRecord>> {
        let updates = self.updates.read().await;
        let records = updates.get(item_id).ok_or_else(|| {
            AppError::NotFound(format!("No updates found for item {}", item_id))
        })?;

        Ok(records
            .iter()
            .map(|record| UpdateRecord {
                action: record
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                details: record.clone(),
            })
            .collect())
    }

    async fn consume_updates(&self, mut subscriber: Box<dyn BusSubscriber>, token: CancellationToken) {
        loop {
            let payload = tokio::select! {
                _ = token.cancelled() => break,
                received = subscriber.next_message() => match received {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(err) => {
                        error!("Filter consumer error: {}", err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };
            self.handle_update(&payload).await;
        }
        info!("Filter consumer stopped");
    }

    /// Process one collection update. A rejected update produces a
    /// compensation event instead of a history entry; any failure is
    /// logged and the consumer keeps going.
    pub async fn handle_update(&self, payload: &[u8]) {
        let data: Value = match serde_json::from_slice(payload) {
            Ok(data) => data,
            Err(err) => {
                error!("Failed to decode collection update: {}", err);
                return;
            }
        };

        if data.get("tag").and_then(Value::as_str) == Some(DISALLOWED_TAG) {
            let reason = format!("Disallowed tag '{}'", DISALLOWED_TAG);
            error!("Business rule violation: {}", reason);
            self.send_compensation(&data, &reason).await;
            return;
        }

        let Some(item_id) = data.get("item_id").and_then(Value::as_str) else {
            return;
        };
        info!("Received update for item {}: {}", item_id, data);
        self.updates
            .write()
            .await
            .entry(item_id.to_string())
            .or_default()
            .push(data);
    }

    async fn send_compensation(&self, original: &Value, reason: &str) {
        let event = CompensationEvent {
            item_id: original
                .get("item_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tag: original
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            action: TAG_ADD_FAILED.to_string(),
            reason: reason.to_string(),
        };

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(err) => {
                error!("Failed to encode compensation event: {}", err);
                return;
            }
        };

        match self
            .bus
            .publish(COLLECTION_COMPENSATIONS_TOPIC, payload)
            .await
        {
            Ok(()) => info!("Sent compensation event: {:?}", event),
            Err(err) => error!("Failed to send compensation event: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bus::MemoryBus;
    use serde_json::json;

    fn service(bus: Arc<dyn MessageBus>) -> Arc<FilterService> {
        Arc::new(FilterService::new(bus))
    }

    #[tokio::test]
    async fn updates_are_recorded_per_item() {
        let filter = service(Arc::new(MemoryBus::new()));
        let payload =
            serde_json::to_vec(&json!({"item_id": "456", "action": "tag_added", "tag": "classic"}))
                .unwrap();
        filter.handle_update(&payload).await;

        let updates = filter.get_updates("456").await.unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].action, "tag_added");
        assert_eq!(updates[0].details["tag"], "classic");
    }

    #[tokio::test]
    async fn unknown_items_have_no_updates() {
        let filter = service(Arc::new(MemoryBus::new()));
        assert!(matches!(
            filter.get_updates("999").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn disallowed_tag_emits_a_compensation() {
        let bus = Arc::new(MemoryBus::new());
        let mut probe = bus
            .subscribe(COLLECTION_COMPENSATIONS_TOPIC, "probe")
            .await
            .unwrap();
        let filter = service(bus);

        let payload =
            serde_json::to_vec(&json!({"item_id": "456", "action": "tag_added", "tag": "error"}))
                .unwrap();
        filter.handle_update(&payload).await;

        let event: CompensationEvent =
            serde_json::from_slice(&probe.next_message().await.unwrap().unwrap()).unwrap();
        assert_eq!(event.item_id, "456");
        assert_eq!(event.tag, "error");
        assert_eq!(event.action, TAG_ADD_FAILED);
        assert!(!event.reason.is_empty());

        // The rejected update is not recorded.
        assert!(filter.get_updates("456").await.is_err());
    }

    #[tokio::test]
    async fn malformed_updates_are_skipped() {
        let filter = service(Arc::new(MemoryBus::new()));
        filter.handle_update(b"not json").await;
        filter
            .handle_update(&serde_json::to_vec(&json!({"tag": "fine"})).unwrap())
            .await;
        // Nothing recorded, nothing panicked.
        assert!(filter.get_updates("456").await.is_err());
    }
}
