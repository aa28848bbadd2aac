//! # Realtime Layer
//!
//! - **`connection`**: the [`ConnectionManager`] owning the WebSocket, its
//!   reconnect loop and listener fan-out.
//! - **`backoff`**: the reconnect delay schedule.
//! - **`message`**: inbound/outbound frames and the normalized event enums.
//! - **`router`**: applies events to the cache and the notification center.

pub mod backoff;
pub mod connection;
pub mod message;
pub mod router;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionManager, DEFAULT_TOPICS};
pub use message::{InboundMessage, MessageError, OutboundMessage, RealtimeEvent, SyncEvent};
pub use router::{guardrails_key, system_health_key, system_stats_key, MessageRouter, RouteOutcome};
