// Per-service HTTP routers and handlers
pub mod collections;
pub mod coordinator;
pub mod filter;
pub mod shard;

pub use collections::create_collections_router;
pub use coordinator::create_coordinator_router;
pub use filter::create_filter_router;
pub use shard::create_shard_router;
