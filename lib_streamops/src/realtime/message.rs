//! # Realtime Wire Types
//!
//! Inbound frames arrive either enveloped, `{ "type": "job.updated",
//! "payload": { ... } }`, or in the legacy flattened form where the fields sit
//! next to `type`. Both normalize to [`InboundMessage`], which the router then
//! classifies into a [`RealtimeEvent`].

use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::cache::EntityKind;
use crate::notifications::Level;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame has no 'type' field")]
    MissingType,
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub kind: String,
    pub payload: Value,
}

impl InboundMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(MessageError::NotAnObject);
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) if !kind.trim().is_empty() => kind,
            _ => return Err(MessageError::MissingType),
        };
        let payload = match fields.remove("payload") {
            Some(payload) => payload,
            None => Value::Object(fields),
        };
        Ok(Self { kind, payload })
    }
}

/// Frames sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    /// Any other message; `fields` are placed next to `type`.
    Custom { kind: String, fields: Map<String, Value> },
}

impl OutboundMessage {
    pub fn to_value(&self) -> Value {
        match self {
            OutboundMessage::Subscribe(topics) => json!({ "type": "subscribe", "topics": topics }),
            OutboundMessage::Unsubscribe(topics) => {
                json!({ "type": "unsubscribe", "topics": topics })
            }
            OutboundMessage::Custom { kind, fields } => {
                let mut object = fields.clone();
                object.insert("type".to_string(), Value::String(kind.clone()));
                Value::Object(object)
            }
        }
    }

    pub fn to_text(&self) -> String {
        self.to_value().to_string()
    }
}

/// Everything a connection listener can observe: inbound messages plus the
/// synthetic lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected {
        code: Option<u16>,
        reason: String,
    },
    ReconnectScheduled {
        /// 1-based number of the upcoming attempt.
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
    Message(InboundMessage),
}

/// Normalized form of an inbound message, as consumed by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Entity {
        kind: EntityKind,
        action: String,
        id: Option<String>,
        data: Value,
    },
    Guardrails {
        active: bool,
        payload: Value,
    },
    SystemHealth {
        status: String,
        payload: Value,
    },
    SystemStats(Value),
    Notification {
        level: Level,
        title: Option<String>,
        message: String,
    },
    Unknown(String),
}

impl RealtimeEvent {
    pub fn classify(message: &InboundMessage) -> Self {
        let (prefix, action) = split_type(&message.kind);
        let payload = &message.payload;

        match (prefix, action) {
            ("guardrails", "activated") => RealtimeEvent::Guardrails {
                active: true,
                payload: payload.clone(),
            },
            ("guardrails", "deactivated") => RealtimeEvent::Guardrails {
                active: false,
                payload: payload.clone(),
            },
            ("system", "health") => RealtimeEvent::SystemHealth {
                status: str_field(payload, "status")
                    .unwrap_or("unknown")
                    .to_ascii_lowercase(),
                payload: payload.clone(),
            },
            ("system", "stats") => RealtimeEvent::SystemStats(payload.clone()),
            ("notification" | "notifications", _) => RealtimeEvent::Notification {
                level: str_field(payload, "level")
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(Level::Info),
                title: str_field(payload, "title").map(str::to_string),
                message: str_field(payload, "message")
                    .or_else(|| str_field(payload, "text"))
                    .unwrap_or_default()
                    .to_string(),
            },
            (entity, action) if !action.is_empty() => match routed_kind(entity) {
                Some((kind, singular)) => {
                    let (id, data) = entity_data(payload, singular);
                    RealtimeEvent::Entity {
                        kind,
                        action: action.to_string(),
                        id,
                        data,
                    }
                }
                None => RealtimeEvent::Unknown(message.kind.clone()),
            },
            _ => RealtimeEvent::Unknown(message.kind.clone()),
        }
    }
}

/// `job.updated` and `job_updated` both give `("job", "updated")`.
fn split_type(kind: &str) -> (&str, &str) {
    if let Some((prefix, action)) = kind.split_once('.') {
        return (prefix, action);
    }
    match kind.rsplit_once('_') {
        Some((prefix, action)) => (prefix, action),
        None => (kind, ""),
    }
}

/// Entity kinds whose events update the cache, with their singular name.
fn routed_kind(prefix: &str) -> Option<(EntityKind, &'static str)> {
    match prefix {
        "job" | "jobs" => Some((EntityKind::Jobs, "job")),
        "asset" | "assets" => Some((EntityKind::Assets, "asset")),
        "drive" | "drives" => Some((EntityKind::Drives, "drive")),
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn id_field(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Finds the entity id (`id`, `<kind>_id`, or the nested `<kind>` object) and
/// the entity body. When an id was found the body carries it as `id`.
fn entity_data(payload: &Value, singular: &str) -> (Option<String>, Value) {
    let nested = payload.get(singular).filter(|v| v.is_object());
    let body = nested.unwrap_or(payload);

    let id = id_field(body, "id")
        .or_else(|| id_field(payload, "id"))
        .or_else(|| id_field(payload, &format!("{}_id", singular)));

    let mut data = body.clone();
    if let (Some(id), Value::Object(map)) = (&id, &mut data) {
        map.remove(&format!("{}_id", singular));
        map.entry("id").or_insert_with(|| Value::String(id.clone()));
    }
    (id, data)
}
