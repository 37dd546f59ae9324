//! Connection pooling, command batching and session caching.

mod batcher;
mod cache;
mod pool;

pub use batcher::{BatcherEvent, BatcherMetrics, CommandBatcher};
pub use cache::{CacheStats, SessionCache};
pub use pool::{ConnectionPool, PoolMetrics, PooledConnection};
