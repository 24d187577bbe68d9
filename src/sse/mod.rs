//! Server-Sent Events delivery.
//!
//! # Endpoint
//!
//! `GET /sse?session_id=<id>&user_id=<id>`
//!
//! # Handshake
//!
//! 1. every stored QUEUED notification relevant to the session, as
//!    `notification` events, oldest first
//! 2. one `sync` event
//! 3. live `notification` events, including `dismissed` sentinels
//!
//! A `keepalive` event is emitted after `notifications.stream_keepalive_seconds`
//! without traffic. The listener is unregistered when the client goes away.

mod handler;

pub use handler::{sse_handler, SseQuery};
