//! Notification model, source graph, hooks and the service that ties them
//! to a backend.

pub mod hooks;
pub mod listener;
pub mod registry;
pub mod request;
pub mod service;
pub mod types;
pub mod wire;

pub use hooks::{HookEvent, HookRegistry, NotificationAction, SendFilter};
pub use listener::{ListenerId, ListenerQueue, ListenerSink, QueueEvent};
pub use registry::SourceRegistry;
pub use request::{NotifyBody, NotifyRequest};
pub use service::{NotificationService, SendOutcome};
pub use types::{
    join_source_key, session_key, split_source_key, user_key, Notification, NotificationBuilder,
    NotificationMode, Payload, WireError, DISMISSED_TYPE, GLOBAL_KEY,
};
pub use wire::{FanoutAction, FanoutMessage};
