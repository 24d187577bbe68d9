//! PostgreSQL connection pooling for the durable backends.

pub mod pool;

pub use pool::{PostgresPool, PostgresPoolError};
