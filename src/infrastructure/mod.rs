pub mod memory_store;
pub mod order_cache;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod stats;

pub use memory_store::InMemoryQueueStore;
pub use order_cache::{LookupError, OrderCache};
#[cfg(feature = "redis")]
pub use redis_store::RedisQueueStore;
pub use stats::{PayType, StatsError, StatsKind, StatsRecord, StatsRecorder};
