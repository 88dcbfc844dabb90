// Per-service state and behavior
pub mod collections; // Items, outbox relay, compensation listener
pub mod coordinator; // Topology registry and request routing
pub mod filter; // Downstream update consumer
pub mod storage; // Shard node data store and replication

pub use collections::CollectionsService;
pub use coordinator::CoordinatorService;
pub use filter::FilterService;
pub use storage::StorageService;
