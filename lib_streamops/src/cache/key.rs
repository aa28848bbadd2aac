//! Cache addressing: entity kinds, keys and invalidation filters.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Server resource families the cache knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Jobs,
    Assets,
    Drives,
    Rules,
    ObsConnections,
    NotificationTemplates,
    NotificationAudit,
    System,
    Logs,
    Settings,
}

impl EntityKind {
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Jobs,
        EntityKind::Assets,
        EntityKind::Drives,
        EntityKind::Rules,
        EntityKind::ObsConnections,
        EntityKind::NotificationTemplates,
        EntityKind::NotificationAudit,
        EntityKind::System,
        EntityKind::Logs,
        EntityKind::Settings,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Jobs => "jobs",
            EntityKind::Assets => "assets",
            EntityKind::Drives => "drives",
            EntityKind::Rules => "rules",
            EntityKind::ObsConnections => "obs_connections",
            EntityKind::NotificationTemplates => "notification_templates",
            EntityKind::NotificationAudit => "notification_audit",
            EntityKind::System => "system",
            EntityKind::Logs => "logs",
            EntityKind::Settings => "settings",
        }
    }

    /// How long a fetched value counts as fresh before a read triggers a
    /// background refetch.
    pub fn max_age(self) -> Duration {
        match self {
            EntityKind::Jobs | EntityKind::System => Duration::from_secs(5),
            EntityKind::Logs | EntityKind::NotificationAudit => Duration::from_secs(10),
            EntityKind::Assets | EntityKind::Drives | EntityKind::ObsConnections => {
                Duration::from_secs(30)
            }
            EntityKind::Rules | EntityKind::NotificationTemplates | EntityKind::Settings => {
                Duration::from_secs(60)
            }
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    /// Accepts the plural cache name as well as the singular form used in
    /// realtime message types (`job`, `asset`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "jobs" | "job" => EntityKind::Jobs,
            "assets" | "asset" => EntityKind::Assets,
            "drives" | "drive" => EntityKind::Drives,
            "rules" | "rule" => EntityKind::Rules,
            "obs_connections" | "obs_connection" => EntityKind::ObsConnections,
            "notification_templates" | "notification_template" => {
                EntityKind::NotificationTemplates
            }
            "notification_audit" => EntityKind::NotificationAudit,
            "system" => EntityKind::System,
            "logs" | "log" => EntityKind::Logs,
            "settings" => EntityKind::Settings,
            other => return Err(format!("unknown entity kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// Canonical query parameters of a collection read. Sorted so that the same
/// filter always maps to the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryParams(BTreeMap<String, String>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert. Empty values are skipped.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        let value = value.to_string();
        if !value.is_empty() {
            self.0.insert(key.into(), value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for QueryParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str("&")?;
            }
            write!(f, "{}={}", k, v)?;
            first = false;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for QueryParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = QueryParams::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyScope {
    /// One entity by id.
    Entity(String),
    /// A list read with its filter.
    Collection(QueryParams),
    /// A named value of which only one exists (`system/health`, ...).
    Singleton(String),
}

/// Address of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub scope: KeyScope,
}

impl CacheKey {
    pub fn entity(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            scope: KeyScope::Entity(id.into()),
        }
    }

    pub fn collection(kind: EntityKind, params: QueryParams) -> Self {
        Self {
            kind,
            scope: KeyScope::Collection(params),
        }
    }

    pub fn singleton(kind: EntityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            scope: KeyScope::Singleton(name.into()),
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.scope, KeyScope::Collection(_))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            KeyScope::Entity(id) => write!(f, "{}/{}", self.kind, id),
            KeyScope::Singleton(name) => write!(f, "{}/{}", self.kind, name),
            KeyScope::Collection(params) if params.is_empty() => write!(f, "{}[]", self.kind),
            KeyScope::Collection(params) => write!(f, "{}[{}]", self.kind, params),
        }
    }
}

/// Selects entries for [`QueryCache::invalidate_matching`](super::QueryCache::invalidate_matching).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    Exact(CacheKey),
    /// Every entry of a kind.
    Kind(EntityKind),
    /// Every collection entry of a kind, whatever its params.
    Collections(EntityKind),
    AllCollections,
}

impl KeyFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            KeyFilter::Exact(k) => k == key,
            KeyFilter::Kind(kind) => key.kind == *kind,
            KeyFilter::Collections(kind) => key.kind == *kind && key.is_collection(),
            KeyFilter::AllCollections => key.is_collection(),
        }
    }
}
