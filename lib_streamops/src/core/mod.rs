//! # Core Module
//!
//! Building blocks shared by the realtime layer:
//!
//! - **`dispatcher`**: fan-out of events to any number of listeners, either
//!   channel-backed subscriptions or callbacks. Each event is wrapped in an
//!   `Arc` once and shared by every listener. Handles unregister on drop.
//!
//! - **`registry`**: reference-counted realtime topics. The first acquirer of
//!   a topic triggers a `subscribe` frame, the last releaser an `unsubscribe`.
//!
//! - **`connection_state`**: the connection lifecycle state machine.

#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Event fan-out with RAII listener handles.
pub mod dispatcher;
/// Reference-counted topic subscriptions.
pub mod registry;
/// Connection lifecycle states.
pub mod connection_state;

pub use connection_state::ConnectionState;
pub use dispatcher::{Dispatcher, ListenerGuard, Subscription};
pub use registry::TopicRegistry;
