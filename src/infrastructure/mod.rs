// Core infrastructure modules
pub mod bus; // Message bus seam (Kafka + in-memory)
pub mod hash_ring; // Consistent hashing
pub mod middleware; // Trace-id propagation

// Re-export core infrastructure components
pub use bus::{BusSubscriber, KafkaBus, MemoryBus, MessageBus};
pub use hash_ring::ConsistentHashRing;
