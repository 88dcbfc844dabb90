// Shard storage node: one group's replica of the data. The leader applies
// writes locally and publishes them to the group topic; followers consume
// the topic and converge under last-writer-wins.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::ShardConfig;
use crate::error::{AppError, AppResult};
use crate::infrastructure::bus::{BusSubscriber, MessageBus};
use crate::infrastructure::middleware::with_trace_header;
use crate::models::{Operation, ReplicationMessage, ShardRegistration, StoredRecord};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

type DataStore = HashMap<String, HashMap<String, StoredRecord>>;

pub struct StorageService {
    coordinator_url: String,
    advertised_url: String,
    group_id: String,
    is_leader: bool,
    topic: String,
    bus: Arc<dyn MessageBus>,
    store: RwLock<DataStore>,
    /// Last timestamp handed out by this leader; keeps LWW timestamps
    /// monotone even if the wall clock steps backward.
    write_clock: AtomicI64,
    http: reqwest::Client,
    shutdown: CancellationToken,
    replication_task: Mutex<Option<JoinHandle<()>>>,
}

impl StorageService {
    pub fn new(
        coordinator_url: String,
        advertised_url: String,
        group_id: String,
        is_leader: bool,
        topic: String,
        bus: Arc<dyn MessageBus>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            coordinator_url,
            advertised_url,
            group_id,
            is_leader,
            topic,
            bus,
            store: RwLock::new(HashMap::new()),
            write_clock: AtomicI64::new(0),
            http: reqwest::Client::builder().timeout(REGISTER_TIMEOUT).build()?,
            shutdown: CancellationToken::new(),
            replication_task: Mutex::new(None),
        })
    }

    pub fn from_config(config: &ShardConfig, bus: Arc<dyn MessageBus>) -> anyhow::Result<Self> {
        Self::new(
            config.coordinator_url.clone(),
            config.advertised_url.clone(),
            config.group_id.clone(),
            config.is_leader,
            config.kafka_topic.clone(),
            bus,
        )
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    /// Start the node. Followers subscribe to the group topic under a
    /// subscription group unique to this process, so every follower
    /// receives the full stream (a shared group would load-balance the
    /// log across followers and break replication), reading from the
    /// earliest offset so late joiners catch up.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        if self.is_leader {
            info!("Leader started. Writing to topic: {}", self.topic);
            return Ok(());
        }

        let unique_group = format!("shard-{}-{}", self.group_id, Uuid::new_v4());
        let subscriber = self.bus.subscribe(&self.topic, &unique_group).await?;

        let service = Arc::clone(self);
        let token = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            service.replication_loop(subscriber, token).await;
        });
        *self.replication_task.lock().await = Some(handle);

        info!("Follower started. Listening on topic: {}", self.topic);
        Ok(())
    }

    /// Announce this node to the coordinator. Failure is tolerated: the
    /// node keeps serving what it has and stays unreachable for routing
    /// until a later registration succeeds.
    pub async fn register_self(&self) {
        let payload = ShardRegistration {
            shard_url: self.advertised_url.clone(),
            group_id: self.group_id.clone(),
            is_leader: self.is_leader,
        };
        let url = format!(
            "{}/_internal/register_shard",
            self.coordinator_url.trim_end_matches('/')
        );

        let request = with_trace_header(self.http.post(&url)).json(&payload);
        match request.send().await {
            Ok(response) if response.status().is_success() => info!(
                "Successfully registered at coordinator {} as {}",
                self.coordinator_url,
                if self.is_leader { "Leader" } else { "Follower" }
            ),
            Ok(response) => error!(
                "Coordinator rejected registration: {}",
                response.status()
            ),
            Err(err) => error!("Could not register at coordinator: {}", err),
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.replication_task.lock().await.take() {
            if let Err(err) = handle.await {
                error!("Replication task ended abnormally: {}", err);
            }
        }
    }

    /// Create (or upsert) a record. Leader only: assign a timestamp,
    /// apply locally, then publish the replication message and await the
    /// broker's acknowledgment. A failed publish propagates to the
    /// caller — local state has already advanced at that point and the
    /// writer must know the write is not replicated.
    pub async fn create_record(
        &self,
        table_name: &str,
        primary_key: &str,
        value: Value,
    ) -> AppResult<Value> {
        self.require_leader()?;

        let timestamp = self.next_timestamp();
        {
            let mut store = self.store.write().await;
            store.entry(table_name.to_string()).or_default().insert(
                primary_key.to_string(),
                StoredRecord {
                    value: value.clone(),
                    timestamp,
                },
            );
        }

        self.publish(&ReplicationMessage {
            operation: Operation::Create,
            table_name: table_name.to_string(),
            primary_key: primary_key.to_string(),
            value: Some(value.clone()),
            timestamp,
        })
        .await?;

        info!("Created record '{}' in table '{}'", primary_key, table_name);
        Ok(value)
    }

    pub async fn delete_record(&self, table_name: &str, primary_key: &str) -> AppResult<()> {
        self.require_leader()?;

        let timestamp = self.next_timestamp();
        {
            let mut store = self.store.write().await;
            let removed = store
                .get_mut(table_name)
                .and_then(|table| table.remove(primary_key));
            if removed.is_none() {
                return Err(record_not_found(table_name, primary_key));
            }
        }

        self.publish(&ReplicationMessage {
            operation: Operation::Delete,
            table_name: table_name.to_string(),
            primary_key: primary_key.to_string(),
            value: None,
            timestamp,
        })
        .await?;

        info!(
            "Deleted record '{}' from table '{}'",
            primary_key, table_name
        );
        Ok(())
    }

    /// Local read; never blocks on replication.
    pub async fn read_record(&self, table_name: &str, primary_key: &str) -> AppResult<Value> {
        self.store
            .read()
            .await
            .get(table_name)
            .and_then(|table| table.get(primary_key))
            .map(|record| record.value.clone())
            .ok_or_else(|| record_not_found(table_name, primary_key))
    }

    pub async fn exists_record(&self, table_name: &str, primary_key: &str) -> bool {
        self.store
            .read()
            .await
            .get(table_name)
            .is_some_and(|table| table.contains_key(primary_key))
    }

    async fn replication_loop(&self, mut subscriber: Box<dyn BusSubscriber>, token: CancellationToken) {
        loop {
            let payload = tokio::select! {
                _ = token.cancelled() => break,
                received = subscriber.next_message() => match received {
                    Ok(Some(payload)) => payload,
                    Ok(None) => break,
                    Err(err) => {
                        error!("Replication consumer error: {}", err);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            // One bad message must not take the loop down.
            match serde_json::from_slice::<ReplicationMessage>(&payload) {
                Ok(message) => self.apply_update(message).await,
                Err(err) => error!("Failed to process replication message: {}", err),
            }
        }
        info!("Replication loop stopped");
    }

    /// Apply one replicated write under last-writer-wins: the strictly
    /// greater timestamp wins, ties favor the incumbent.
    pub async fn apply_update(&self, msg: ReplicationMessage) {
        let mut store = self.store.write().await;
        let table = store.entry(msg.table_name.clone()).or_default();

        if let Some(existing) = table.get(&msg.primary_key) {
            if msg.timestamp <= existing.timestamp {
                info!(
                    "[LWW] Ignoring stale update for {}/{}",
                    msg.table_name, msg.primary_key
                );
                return;
            }
        }

        match msg.operation {
            Operation::Create => {
                table.insert(
                    msg.primary_key.clone(),
                    StoredRecord {
                        value: msg.value.unwrap_or(Value::Null),
                        timestamp: msg.timestamp,
                    },
                );
                info!(
                    "[REPLICA] Applied CREATE {}/{}",
                    msg.table_name, msg.primary_key
                );
            }
            Operation::Delete => {
                // No tombstone is kept, so an older create delivered after
                // this delete resurrects the record.
                if table.remove(&msg.primary_key).is_some() {
                    info!(
                        "[REPLICA] Applied DELETE {}/{}",
                        msg.table_name, msg.primary_key
                    );
                }
            }
        }

        let lag_seconds = (now_ns() - msg.timestamp) as f64 / 1e9;
        debug!("Replication lag: {:.3}s", lag_seconds);
    }

    async fn publish(&self, message: &ReplicationMessage) -> AppResult<()> {
        let payload = serde_json::to_vec(message)?;
        self.bus.publish(&self.topic, payload).await
    }

    fn require_leader(&self) -> AppResult<()> {
        if self.is_leader {
            Ok(())
        } else {
            Err(AppError::BadRequest(
                "Write operations allowed only on Leader".to_string(),
            ))
        }
    }

    fn next_timestamp(&self) -> i64 {
        let mut last = self.write_clock.load(Ordering::Relaxed);
        loop {
            let candidate = now_ns().max(last + 1);
            match self.write_clock.compare_exchange(
                last,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Snapshot of a stored record including its LWW timestamp.
    pub async fn stored_record(
        &self,
        table_name: &str,
        primary_key: &str,
    ) -> Option<StoredRecord> {
        self.store
            .read()
            .await
            .get(table_name)
            .and_then(|table| table.get(primary_key))
            .cloned()
    }
}

fn record_not_found(table_name: &str, primary_key: &str) -> AppError {
    AppError::NotFound(format!(
        "Record '{}' not found in table '{}'",
        primary_key, table_name
    ))
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
