//! API layer - HTTP endpoint handlers.

mod handlers;
mod health;
mod metrics;
mod routes;

pub use handlers::{
    dismiss, list_notifications, notify, subscribe, unsubscribe, DismissRequest,
    NotificationsQuery, SubscriptionRequest,
};
pub use health::health;
pub use metrics::prometheus_metrics;
pub use routes::{api_routes, public_routes};
