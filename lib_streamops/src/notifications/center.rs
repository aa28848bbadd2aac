//! # Notification Center
//!
//! In-memory ring of user-visible notifications. The oldest entry is dropped
//! once capacity is reached. Nothing is persisted.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Success => "success",
            Level::Warning => "warning",
            Level::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Level::Info),
            "success" => Ok(Level::Success),
            "warning" | "warn" => Ok(Level::Warning),
            "error" | "critical" => Ok(Level::Error),
            other => Err(format!("unknown notification level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub level: Level,
    pub title: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    /// Sticky notifications are meant to stay on screen until dismissed.
    pub sticky: bool,
}

impl Notification {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            title: None,
            message: message.into(),
            timestamp: Utc::now(),
            read: false,
            sticky: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn sticky(mut self) -> Self {
        self.sticky = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    Pushed(Notification),
    Dismissed(Uuid),
    Cleared,
    Read(Uuid),
}

struct Inner {
    capacity: usize,
    items: Mutex<VecDeque<Notification>>,
    events: broadcast::Sender<NotificationEvent>,
}

/// Shared handle; clones see the same notifications.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<Inner>,
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl fmt::Debug for NotificationCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationCenter")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.items().len())
            .finish()
    }
}

impl NotificationCenter {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (events, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Arc::new(Inner {
                capacity,
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                events,
            }),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.inner.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: NotificationEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Adds a notification and returns its id.
    pub fn push(&self, notification: Notification) -> Uuid {
        let id = notification.id;
        match notification.level {
            Level::Error => tracing::error!("Notification: {}", notification.message),
            Level::Warning => tracing::warn!("Notification: {}", notification.message),
            _ => tracing::info!("Notification: {}", notification.message),
        }
        {
            let mut items = self.items();
            // Sticky entries outlive the FIFO unless nothing else is left.
            while items.len() >= self.inner.capacity {
                match items.iter().position(|n| !n.sticky) {
                    Some(oldest) => items.remove(oldest),
                    None => items.pop_front(),
                };
            }
            items.push_back(notification.clone());
        }
        self.emit(NotificationEvent::Pushed(notification));
        id
    }

    /// Shorthand for `push(Notification::new(level, message))`.
    pub fn notify(&self, level: Level, message: impl Into<String>) -> Uuid {
        self.push(Notification::new(level, message))
    }

    pub fn dismiss(&self, id: Uuid) -> bool {
        let removed = {
            let mut items = self.items();
            let before = items.len();
            items.retain(|n| n.id != id);
            items.len() != before
        };
        if removed {
            self.emit(NotificationEvent::Dismissed(id));
        }
        removed
    }

    pub fn dismiss_all(&self) {
        self.items().clear();
        self.emit(NotificationEvent::Cleared);
    }

    pub fn mark_read(&self, id: Uuid) -> bool {
        let changed = {
            let mut items = self.items();
            match items.iter_mut().find(|n| n.id == id) {
                Some(n) if !n.read => {
                    n.read = true;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(NotificationEvent::Read(id));
        }
        changed
    }

    pub fn unread_count(&self) -> usize {
        self.items().iter().filter(|n| !n.read).count()
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<Notification> {
        self.items().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.inner.events.subscribe()
    }
}
