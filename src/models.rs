// Wire types shared between the coordinator, shard, collections and filter
// services. All payloads are JSON; record values are schemaless trees.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A table definition registered at the coordinator. The shard itself is
/// schemaless; definitions exist only to name the primary-key field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDefinition {
    pub table_name: String,
    pub primary_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub table_name: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResponse {
    pub table_name: String,
    pub primary_key: String,
    pub value: Value,
}

/// Body of `POST /records/{table}/{pk}` on a shard node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordData {
    pub value: Value,
}

/// Self-registration payload a shard node sends to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardRegistration {
    pub shard_url: String,
    pub group_id: String,
    #[serde(default)]
    pub is_leader: bool,
}

/// One replica set in the coordinator's topology. Exactly one leader at a
/// time by declaration; followers are deduplicated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardGroup {
    pub leader: Option<String>,
    pub followers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Delete,
}

/// Replication log entry published by a group leader and consumed by every
/// follower in the group. Must round-trip through JSON without loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationMessage {
    pub operation: Operation,
    pub table_name: String,
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Leader wall-clock nanoseconds at write time; the LWW tiebreaker.
    pub timestamp: i64,
}

/// A record as held by a shard node's in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub value: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

/// A pending event appended alongside the local mutation it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub item_id: String,
    pub action: String,
    pub tag: String,
    pub status: OutboxStatus,
}

/// Payload relayed to `collection-updates`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionUpdate {
    pub item_id: String,
    pub action: String,
    pub tag: String,
}

/// Payload on `collection-compensations`, emitted by the filter service
/// when a business rule rejects an update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEvent {
    pub item_id: String,
    pub tag: String,
    pub action: String,
    pub reason: String,
}

pub const TAG_ADD_FAILED: &str = "TAG_ADD_FAILED";
pub const TAG_ADDED: &str = "tag_added";

pub const COLLECTION_UPDATES_TOPIC: &str = "collection-updates";
pub const COLLECTION_COMPENSATIONS_TOPIC: &str = "collection-compensations";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddTagRequest {
    pub tag_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResponse {
    pub item_id: String,
    pub validated_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTagsResponse {
    pub item_id: String,
    pub tags: Vec<String>,
}

/// One recorded update in the filter service's per-item history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub action: String,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemUpdatesResponse {
    pub item_id: String,
    pub updates: Vec<UpdateRecord>,
}
