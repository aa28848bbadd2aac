//! # lib_streamops
//!
//! Client-side synchronization layer for the StreamOps operations dashboard.
//!
//! The backend owns all job, asset, drive and rule logic. This crate keeps a
//! local, consistent view of that state: a single WebSocket connection feeds
//! realtime events through a router into a query cache, REST mutations
//! invalidate the cache after they succeed, and user-facing feedback flows
//! through a bounded notification center.
//!
//! Modules are gated behind cargo features in the same way as the rest of the
//! workspace; `full` (the default) enables everything.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Layered client configuration (defaults, JSON file, environment, CLI).
#[cfg(feature = "configs")]
pub mod configs;

/// `tracing` subscriber setup with optional file output.
#[cfg(feature = "loggers")]
pub mod loggers;

/// HTTP client with retries and the typed StreamOps REST surface.
#[cfg(feature = "retrieve")]
pub mod retrieve;

/// Listener fan-out, topic registry and connection lifecycle states.
#[cfg(feature = "realtime")]
pub mod core;

/// Key-addressed query cache with stale-while-revalidate and polling.
#[cfg(feature = "realtime")]
pub mod cache;

/// Bounded notification center for user-visible toasts.
#[cfg(feature = "realtime")]
pub mod notifications;

/// WebSocket connection manager, message model and router.
#[cfg(feature = "realtime")]
pub mod realtime;

/// The context object tying connection, cache, notifications and REST together.
#[cfg(feature = "realtime")]
pub mod sync_client;

#[cfg(feature = "realtime")]
pub use sync_client::{SyncClient, SyncError};
