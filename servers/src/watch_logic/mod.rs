//! One-line renderings of sync events, notifications and job pages for the
//! terminal monitor.

use chrono::Local;
use lib_streamops::notifications::{Level, Notification};
use lib_streamops::realtime::{RealtimeEvent, SyncEvent};
use lib_streamops::retrieve::models::{Job, Page};

pub fn describe_event(event: &SyncEvent) -> String {
    match event {
        SyncEvent::Connected => "connected".to_string(),
        SyncEvent::Disconnected { code: Some(code), reason } => format!("disconnected ({}): {}", code, reason),
        SyncEvent::Disconnected { code: None, reason } => format!("disconnected: {}", reason),
        SyncEvent::ReconnectScheduled { attempt, delay } => {
            format!("reconnect #{} in {} ms", attempt, delay.as_millis())
        }
        SyncEvent::ReconnectExhausted { attempts } => {
            format!("gave up after {} reconnect attempts", attempts)
        }
        SyncEvent::Message(message) => match RealtimeEvent::classify(message) {
            RealtimeEvent::Entity { kind, action, id, .. } => {
                format!("{} {} {}", kind, id.as_deref().unwrap_or("-"), action)
            }
            RealtimeEvent::Guardrails { active, .. } => {
                format!("guardrails {}", if active { "active" } else { "cleared" })
            }
            RealtimeEvent::SystemHealth { status, .. } => format!("system health {}", status),
            RealtimeEvent::SystemStats(_) => "system stats".to_string(),
            RealtimeEvent::Notification { level, message, .. } => format!("server {}: {}", level, message),
            RealtimeEvent::Unknown(kind) => format!("unhandled {}", kind),
        },
    }
}

/// Stats arrive every few seconds and would drown everything else.
pub fn is_noisy(event: &SyncEvent) -> bool {
    matches!(event, SyncEvent::Message(m) if matches!(RealtimeEvent::classify(m), RealtimeEvent::SystemStats(_)))
}

pub fn describe_notification(notification: &Notification) -> String {
    let marker = match notification.level {
        Level::Info => "i",
        Level::Success => "+",
        Level::Warning => "!",
        Level::Error => "x",
    };
    let time = notification.timestamp.with_timezone(&Local).format("%H:%M:%S");
    match &notification.title {
        Some(title) => format!("[{}] {} {}: {}", marker, time, title, notification.message),
        None => format!("[{}] {} {}", marker, time, notification.message),
    }
}

pub fn describe_jobs(page: &Page<Job>) -> String {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for job in &page.items {
        let status = format!("{:?}", job.status).to_lowercase();
        match counts.iter_mut().find(|(s, _)| *s == status) {
            Some((_, n)) => *n += 1,
            None => counts.push((status, 1)),
        }
    }
    let summary: Vec<String> = counts.iter().map(|(s, n)| format!("{} {}", n, s)).collect();
    if summary.is_empty() {
        "jobs: none".to_string()
    } else {
        format!("jobs: {}", summary.join(", "))
    }
}
