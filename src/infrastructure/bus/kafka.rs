// Kafka-backed message bus.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use std::time::Duration;
use tracing::info;

use super::{BusSubscriber, MessageBus};
use crate::error::{AppError, AppResult};

/// Message bus over a Kafka broker. One producer per process; a dedicated
/// consumer per subscription so each consumer group keeps its own offsets.
pub struct KafkaBus {
    brokers: String,
    producer: FutureProducer,
}

impl KafkaBus {
    pub fn connect(brokers: &str) -> AppResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| AppError::BusError(format!("failed to create Kafka producer: {}", e)))?;

        info!("Connected Kafka producer to {}", brokers);
        Ok(Self {
            brokers: brokers.to_string(),
            producer,
        })
    }
}

#[async_trait]
impl MessageBus for KafkaBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> AppResult<()> {
        let record = FutureRecord::<(), _>::to(topic).payload(&payload);
        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map(|_| ())
            .map_err(|(err, _)| {
                AppError::BusError(format!("publish to topic '{}' failed: {}", topic, err))
            })
    }

    async fn subscribe(&self, topic: &str, group: &str) -> AppResult<Box<dyn BusSubscriber>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| AppError::BusError(format!("failed to create Kafka consumer: {}", e)))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| AppError::BusError(format!("subscribe to '{}' failed: {}", topic, e)))?;

        info!("Subscribed to topic '{}' as group '{}'", topic, group);
        Ok(Box::new(KafkaSubscriber { consumer }))
    }
}

struct KafkaSubscriber {
    consumer: StreamConsumer,
}

#[async_trait]
impl BusSubscriber for KafkaSubscriber {
    async fn next_message(&mut self) -> AppResult<Option<Vec<u8>>> {
        match self.consumer.recv().await {
            Ok(message) => Ok(Some(
                message.payload().map(|p| p.to_vec()).unwrap_or_default(),
            )),
            Err(err) => Err(AppError::BusError(format!(
                "consumer receive failed: {}",
                err
            ))),
        }
    }
}
