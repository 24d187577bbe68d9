//! Redis connectivity for the pub/sub fanout transport.

pub mod pool;

pub use pool::{PoolError, RedisPool};
