//! Infrastructure layer modules
//!
//! Shared components used by the backends and the HTTP surface:
//! - `backoff`: reconnect delay policy for fanout listeners
//! - `config`: Application configuration and settings
//! - `error`: Service-level error type
//! - `metrics`: Prometheus metrics helpers
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool

pub mod backoff;
pub mod config;
pub mod error;
pub mod metrics;
pub mod postgres;
pub mod redis;
