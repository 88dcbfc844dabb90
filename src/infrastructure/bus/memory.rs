// In-process message bus used by tests. Keeps every topic as an append-only
// log so late subscriptions replay from the earliest offset, the same
// contract the Kafka implementation provides.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use super::{BusSubscriber, MessageBus};
use crate::error::AppResult;

#[derive(Default)]
struct Topic {
    log: Mutex<Vec<Arc<Vec<u8>>>>,
    notify: Notify,
    /// Consumer-group cursors into the log. Members of one group share a
    /// cursor (messages are load-balanced between them); each new group
    /// starts at offset zero and sees the full stream.
    cursors: Mutex<HashMap<String, Arc<Mutex<usize>>>>,
}

#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().await;
        topics.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> AppResult<()> {
        let topic = self.topic(topic).await;
        topic.log.lock().await.push(Arc::new(payload));
        topic.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> AppResult<Box<dyn BusSubscriber>> {
        let topic = self.topic(topic).await;
        let cursor = {
            let mut cursors = topic.cursors.lock().await;
            cursors.entry(group.to_string()).or_default().clone()
        };
        Ok(Box::new(MemorySubscriber { topic, cursor }))
    }
}

struct MemorySubscriber {
    topic: Arc<Topic>,
    cursor: Arc<Mutex<usize>>,
}

#[async_trait]
impl BusSubscriber for MemorySubscriber {
    async fn next_message(&mut self) -> AppResult<Option<Vec<u8>>> {
        loop {
            // Register for wakeups before checking the log so a publish
            // between the check and the await is not missed.
            let notified = self.topic.notify.notified();
            {
                let mut cursor = self.cursor.lock().await;
                let log = self.topic.log.lock().await;
                if *cursor < log.len() {
                    let payload = log[*cursor].as_ref().clone();
                    *cursor += 1;
                    return Ok(Some(payload));
                }
            }
            notified.await;
        }
    }
}
