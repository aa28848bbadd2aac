//! # Message Router
//!
//! Maps each realtime event to exactly one cache effect and at most one
//! notification. Runs as a callback listener on the connection task, so
//! events are applied strictly in arrival order.

use serde_json::{Map, Value};
use uuid::Uuid;

use super::connection::ConnectionManager;
use super::message::{RealtimeEvent, SyncEvent};
use crate::cache::{CacheKey, EntityKind, KeyFilter, QueryCache};
use crate::core::ListenerGuard;
use crate::notifications::{Level, Notification, NotificationCenter};

pub fn guardrails_key() -> CacheKey {
    CacheKey::singleton(EntityKind::System, "guardrails")
}

pub fn system_health_key() -> CacheKey {
    CacheKey::singleton(EntityKind::System, "health")
}

pub fn system_stats_key() -> CacheKey {
    CacheKey::singleton(EntityKind::System, "stats")
}

/// What a routed event did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOutcome {
    pub updated: Option<CacheKey>,
    pub removed: Option<CacheKey>,
    /// Number of cache entries marked stale.
    pub invalidated: usize,
    pub notification: Option<Uuid>,
}

impl RouteOutcome {
    pub fn is_noop(&self) -> bool {
        *self == RouteOutcome::default()
    }
}

#[derive(Debug, Clone)]
pub struct MessageRouter {
    cache: QueryCache,
    notifications: NotificationCenter,
}

impl MessageRouter {
    pub fn new(cache: QueryCache, notifications: NotificationCenter) -> Self {
        Self {
            cache,
            notifications,
        }
    }

    /// Registers the router as a callback on `manager`. Routing stops when the
    /// guard is dropped.
    pub fn attach(&self, manager: &ConnectionManager) -> ListenerGuard<SyncEvent> {
        let router = self.clone();
        manager.add_callback(move |event| {
            router.handle(event);
        })
    }

    pub fn handle(&self, event: &SyncEvent) -> RouteOutcome {
        match event {
            SyncEvent::Message(message) => self.route(RealtimeEvent::classify(message)),
            SyncEvent::Connected => RouteOutcome {
                // Events may have been missed while offline.
                invalidated: self.cache.invalidate_matching(&KeyFilter::AllCollections),
                ..RouteOutcome::default()
            },
            SyncEvent::ReconnectExhausted { attempts } => {
                let notification = Notification::new(
                    Level::Error,
                    format!(
                        "Realtime updates stopped after {} reconnect attempts. Reload required.",
                        attempts
                    ),
                )
                .with_title("Connection lost")
                .sticky();
                RouteOutcome {
                    notification: Some(self.notifications.push(notification)),
                    ..RouteOutcome::default()
                }
            }
            SyncEvent::Disconnected { .. } | SyncEvent::ReconnectScheduled { .. } => {
                RouteOutcome::default()
            }
        }
    }

    pub fn route(&self, event: RealtimeEvent) -> RouteOutcome {
        match event {
            RealtimeEvent::Entity {
                kind,
                action,
                id,
                data,
            } => self.apply_entity(kind, &action, id, data),
            RealtimeEvent::Guardrails { active, payload } => self.apply_guardrails(active, payload),
            RealtimeEvent::SystemHealth { status, payload } => {
                self.apply_system_health(status, payload)
            }
            RealtimeEvent::SystemStats(stats) => {
                let key = system_stats_key();
                self.cache.set(key.clone(), stats);
                RouteOutcome {
                    updated: Some(key),
                    ..RouteOutcome::default()
                }
            }
            RealtimeEvent::Notification {
                level,
                title,
                message,
            } => {
                let mut notification = Notification::new(level, message);
                notification.title = title;
                RouteOutcome {
                    notification: Some(self.notifications.push(notification)),
                    ..RouteOutcome::default()
                }
            }
            RealtimeEvent::Unknown(kind) => {
                tracing::debug!("Ignoring realtime message of unknown type '{}'", kind);
                RouteOutcome::default()
            }
        }
    }

    fn apply_entity(
        &self,
        kind: EntityKind,
        action: &str,
        id: Option<String>,
        data: Value,
    ) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        match &id {
            Some(id) if matches!(action, "deleted" | "removed") => {
                let key = CacheKey::entity(kind, id.as_str());
                if self.cache.remove(&key) {
                    outcome.removed = Some(key);
                }
            }
            Some(id) => {
                let key = CacheKey::entity(kind, id.as_str());
                self.cache.merge(key.clone(), data.clone());
                outcome.updated = Some(key);
            }
            None => tracing::warn!("{}.{} event carries no entity id", kind, action),
        }

        outcome.invalidated = self.cache.invalidate_matching(&KeyFilter::Collections(kind));

        if kind == EntityKind::Jobs && action == "failed" {
            let detail = data
                .get("error")
                .or_else(|| data.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = match (&id, detail) {
                (Some(id), Some(detail)) => format!("Job {} failed: {}", id, detail),
                (Some(id), None) => format!("Job {} failed", id),
                (None, Some(detail)) => format!("Job failed: {}", detail),
                (None, None) => "A job failed".to_string(),
            };
            let notification = Notification::new(Level::Error, message).with_title("Job failed");
            outcome.notification = Some(self.notifications.push(notification));
        }

        outcome
    }

    fn apply_guardrails(&self, active: bool, payload: Value) -> RouteOutcome {
        let key = guardrails_key();
        let was_active = self
            .cache
            .get(&key)
            .and_then(|c| c.value.get("active").and_then(Value::as_bool))
            .unwrap_or(false);

        let mut status = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        status.insert("active".to_string(), Value::Bool(active));
        let reason = status
            .get("reason")
            .or_else(|| status.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string);
        self.cache.set(key.clone(), Value::Object(status));

        let mut outcome = RouteOutcome {
            updated: Some(key),
            ..RouteOutcome::default()
        };
        if active && !was_active {
            let message = match reason {
                Some(reason) => format!("Guardrails activated: {}", reason),
                None => "Guardrails activated. Some operations are paused.".to_string(),
            };
            let notification =
                Notification::new(Level::Warning, message).with_title("Guardrails active");
            outcome.notification = Some(self.notifications.push(notification));
        }
        outcome
    }

    fn apply_system_health(&self, status: String, payload: Value) -> RouteOutcome {
        let key = system_health_key();
        let previous = self
            .cache
            .get(&key)
            .and_then(|c| c.value.get("status").and_then(Value::as_str).map(str::to_ascii_lowercase));

        let mut health = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        health.insert("status".to_string(), Value::String(status.clone()));
        let detail = health
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.cache.set(key.clone(), Value::Object(health));

        let mut outcome = RouteOutcome {
            updated: Some(key),
            ..RouteOutcome::default()
        };
        if previous.as_deref() == Some(status.as_str()) {
            return outcome;
        }

        let level = match status.as_str() {
            "degraded" => Level::Warning,
            "critical" => Level::Error,
            _ => return outcome,
        };
        let message = match detail {
            Some(detail) => format!("System health is {}: {}", status, detail),
            None => format!("System health is {}", status),
        };
        let notification = Notification::new(level, message).with_title("System health");
        outcome.notification = Some(self.notifications.push(notification));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryParams;
    use crate::realtime::message::InboundMessage;
    use serde_json::json;
    use std::time::Duration;

    fn router() -> (MessageRouter, QueryCache, NotificationCenter) {
        let cache = QueryCache::new();
        let notifications = NotificationCenter::new(10);
        (
            MessageRouter::new(cache.clone(), notifications.clone()),
            cache,
            notifications,
        )
    }

    fn message(kind: &str, payload: Value) -> SyncEvent {
        SyncEvent::Message(InboundMessage::new(kind, payload))
    }

    #[test]
    fn test_job_updated_merges_and_invalidates_lists() {
        let (router, cache, notifications) = router();
        let list = CacheKey::collection(EntityKind::Jobs, QueryParams::new());
        cache.set(list.clone(), json!([{"id": "j1", "status": "queued"}]));
        cache.set(CacheKey::entity(EntityKind::Jobs, "j1"), json!({"id": "j1", "status": "queued", "name": "ingest"}));

        let outcome = router.handle(&message("job.updated", json!({"id": "j1", "status": "running"})));

        assert_eq!(outcome.updated, Some(CacheKey::entity(EntityKind::Jobs, "j1")));
        assert_eq!(outcome.invalidated, 1);
        let job = cache.get(&CacheKey::entity(EntityKind::Jobs, "j1")).unwrap();
        assert_eq!(*job.value, json!({"id": "j1", "status": "running", "name": "ingest"}));
        assert!(cache.get(&list).unwrap().stale);
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_deleted_removes_entity() {
        let (router, cache, _) = router();
        cache.set(CacheKey::entity(EntityKind::Assets, "a1"), json!({"id": "a1"}));
        let outcome = router.handle(&message("asset_deleted", json!({"asset_id": "a1"})));
        assert_eq!(outcome.removed, Some(CacheKey::entity(EntityKind::Assets, "a1")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_job_failed_notifies() {
        let (router, _, notifications) = router();
        let outcome = router.handle(&message("job.failed", json!({"id": "j2", "error": "ffmpeg exited 1"})));
        assert!(outcome.notification.is_some());
        let list = notifications.list();
        assert_eq!(list[0].level, Level::Error);
        assert_eq!(list[0].message, "Job j2 failed: ffmpeg exited 1");
    }

    #[test]
    fn test_guardrails_transition_notifies_once() {
        let (router, cache, notifications) = router();
        router.handle(&message("guardrails.activated", json!({"reason": "disk nearly full"})));
        router.handle(&message("guardrails.activated", json!({"reason": "disk nearly full"})));
        assert_eq!(notifications.len(), 1);
        assert_eq!(
            *cache.get(&guardrails_key()).unwrap().value,
            json!({"active": true, "reason": "disk nearly full"})
        );

        router.handle(&message("guardrails.deactivated", json!({})));
        assert_eq!(notifications.len(), 1);
        assert_eq!(cache.get(&guardrails_key()).unwrap().value["active"], false);
    }

    #[test]
    fn test_system_health_levels() {
        let (router, _, notifications) = router();
        router.handle(&message("system.health", json!({"status": "healthy"})));
        assert!(notifications.is_empty());

        router.handle(&message("system.health", json!({"status": "degraded"})));
        router.handle(&message("system.health", json!({"status": "degraded"})));
        router.handle(&message("system.health", json!({"status": "critical", "message": "db down"})));

        let levels: Vec<Level> = notifications.list().iter().map(|n| n.level).collect();
        assert_eq!(levels, vec![Level::Warning, Level::Error]);
        assert_eq!(notifications.list()[1].message, "System health is critical: db down");
    }

    #[test]
    fn test_notification_passthrough_and_unknown() {
        let (router, cache, notifications) = router();
        router.handle(&message("notification", json!({"level": "success", "message": "Rule saved"})));
        assert_eq!(notifications.list()[0].level, Level::Success);

        let outcome = router.handle(&message("widget.spun", json!({"id": 1})));
        assert!(outcome.is_noop());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lifecycle_events() {
        let (router, cache, notifications) = router();
        let list = CacheKey::collection(EntityKind::Drives, QueryParams::new());
        cache.set(list.clone(), json!([]));

        assert_eq!(router.handle(&SyncEvent::Connected).invalidated, 1);
        assert!(cache.get(&list).unwrap().stale);

        router.handle(&SyncEvent::ReconnectExhausted { attempts: 10 });
        let list = notifications.list();
        let sticky = &list[0];
        assert!(sticky.sticky);
        assert_eq!(sticky.level, Level::Error);
    }

    fn sequence() -> Vec<SyncEvent> {
        vec![
            message("job.created", json!({"id": "j1", "status": "queued"})),
            message("job.updated", json!({"id": "j1", "status": "running", "progress": 10})),
            message("job_progress", json!({"job_id": "j1", "progress": 55})),
            message("asset.updated", json!({"asset": {"id": "a1", "name": "clip.mov"}})),
            message("system.stats", json!({"cpu": 12.5})),
        ]
    }

    fn snapshot(cache: &QueryCache) -> Vec<(String, Value, bool)> {
        cache
            .keys()
            .into_iter()
            .filter_map(|k| cache.get(&k).map(|c| (k.to_string(), Value::clone(&c.value), c.stale)))
            .collect()
    }

    #[test]
    fn test_same_sequence_same_state() {
        let events = sequence();
        let run = || {
            let (router, cache, _) = router();
            for event in &events {
                router.handle(event);
            }
            snapshot(&cache)
        };

        let first = run();
        assert_eq!(first, run());
        assert!(first.contains(&(
            "jobs/j1".to_string(),
            json!({"id": "j1", "status": "running", "progress": 55}),
            true
        )));
    }

    #[tokio::test]
    async fn test_state_independent_of_delays_between_messages() {
        let events = sequence();

        let (router, cache, _) = router();
        for event in &events {
            router.handle(event);
        }
        let immediate = snapshot(&cache);

        let (router, cache, _) = self::router();
        for (i, event) in events.iter().enumerate() {
            tokio::time::sleep(Duration::from_millis(5 * (i as u64 % 3))).await;
            tokio::task::yield_now().await;
            router.handle(event);
        }
        assert_eq!(snapshot(&cache), immediate);
    }
}
