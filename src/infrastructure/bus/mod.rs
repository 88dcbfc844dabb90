// Message bus seam: a Kafka-backed implementation for deployment and an
// in-process implementation for tests.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;

use crate::error::AppResult;

pub use kafka::KafkaBus;
pub use memory::MemoryBus;

/// A durable publish/subscribe log.
///
/// `publish` is send-and-wait: it resolves only once the broker has
/// acknowledged the message, so a leader knows whether its write reached
/// the replication log. Subscriptions are named by a consumer group and
/// always start from the earliest offset; members of the same group share
/// the stream, while distinct groups each receive every message.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> AppResult<()>;

    async fn subscribe(&self, topic: &str, group: &str) -> AppResult<Box<dyn BusSubscriber>>;
}

#[async_trait]
pub trait BusSubscriber: Send {
    /// Await the next message on the subscription. `Ok(None)` means the
    /// stream has ended (the bus was shut down); errors are transient and
    /// the caller decides whether to keep consuming.
    async fn next_message(&mut self) -> AppResult<Option<Vec<u8>>>;
}
