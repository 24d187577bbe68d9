// Infrastructure layer (shared components)
pub mod infrastructure;

pub use infrastructure::backoff;
pub use infrastructure::config;
pub use infrastructure::error;
pub use infrastructure::metrics;
pub use infrastructure::postgres;
pub use infrastructure::redis;

// Domain layer
pub mod backend;
pub mod notification;

// Application layer
pub mod api;
pub mod server;
pub mod sse;

pub use backend::{create_backend, BackendError, BackendKind, NotificationBackend};
pub use error::NotifyError;
pub use notification::{Notification, NotificationMode, NotificationService, SendOutcome};
