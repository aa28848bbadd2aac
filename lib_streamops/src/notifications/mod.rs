//! # Notification Surface
//!
//! Ephemeral, user-visible toasts raised by the router and by failed REST
//! calls.

pub mod center;

pub use center::{Level, Notification, NotificationCenter, NotificationEvent, DEFAULT_CAPACITY};
