//! # Sync Client
//!
//! Context object wiring the realtime connection, the message router, the
//! query cache, the notification center and the REST API together.
//!
//! - Queries read through the cache (stale-while-revalidate). A failed fetch
//!   raises an error notification.
//! - Mutations call the API and invalidate the affected cache entries only
//!   once the server has accepted them. A failed mutation raises an error
//!   notification carrying the server message and leaves the cache as it was.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::{CacheKey, EntityKind, KeyFilter, PollHandle, QueryCache, QueryParams};
use crate::configs::{ClientSettings, ConfigError};
use crate::core::{ConnectionState, ListenerGuard};
use crate::notifications::{Level, Notification, NotificationCenter};
use crate::realtime::{
    guardrails_key, system_health_key, system_stats_key, ConnectionManager, MessageRouter,
    SyncEvent,
};
use crate::retrieve::models::{
    Asset, Drive, GuardrailStatus, Job, NotificationTemplate, ObsConnection, Page, Rule, Settings,
    SystemHealth, SystemStats, SystemSummary,
};
use crate::retrieve::{ApiError, StreamOpsApi};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Unexpected data shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Api(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

type Fetched = BoxFuture<'static, Result<Value, SyncError>>;

#[derive(Clone)]
pub struct SyncClient {
    api: StreamOpsApi,
    connection: ConnectionManager,
    cache: QueryCache,
    notifications: NotificationCenter,
    router: MessageRouter,
    _routing: Arc<ListenerGuard<SyncEvent>>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("api", &self.api)
            .field("connection", &self.connection)
            .field("cache", &self.cache)
            .field("notifications", &self.notifications)
            .finish()
    }
}

impl SyncClient {
    /// Builds every component from resolved settings. Does not connect.
    pub fn new(settings: &ClientSettings) -> Result<Self, SyncError> {
        let api = StreamOpsApi::from_settings(settings)?;
        Ok(Self::from_parts(
            api,
            ConnectionManager::from_settings(settings),
            QueryCache::new(),
            NotificationCenter::new(settings.notification_capacity),
        ))
    }

    /// Wires pre-built components; the router is attached to `connection`.
    pub fn from_parts(
        api: StreamOpsApi,
        connection: ConnectionManager,
        cache: QueryCache,
        notifications: NotificationCenter,
    ) -> Self {
        let router = MessageRouter::new(cache.clone(), notifications.clone());
        let routing = router.attach(&connection);
        Self {
            api,
            connection,
            cache,
            notifications,
            router,
            _routing: Arc::new(routing),
        }
    }

    pub fn api(&self) -> &StreamOpsApi {
        &self.api
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    // queries

    pub async fn jobs(&self, params: &QueryParams) -> Result<Page<Job>, SyncError> {
        let key = CacheKey::collection(EntityKind::Jobs, params.clone());
        self.query(key, "jobs", list_with(params, |api, q| async move { api.list_jobs(&q.pairs()).await }))
            .await
    }

    pub async fn job(&self, id: &str) -> Result<Job, SyncError> {
        let id = id.to_string();
        self.query(CacheKey::entity(EntityKind::Jobs, id.as_str()), "job", move |api| {
            let id = id.clone();
            async move { api.get_job(&id).await }
        })
        .await
    }

    pub async fn assets(&self, params: &QueryParams) -> Result<Page<Asset>, SyncError> {
        let key = CacheKey::collection(EntityKind::Assets, params.clone());
        self.query(key, "assets", list_with(params, |api, q| async move { api.list_assets(&q.pairs()).await }))
            .await
    }

    pub async fn asset(&self, id: &str) -> Result<Asset, SyncError> {
        let id = id.to_string();
        self.query(CacheKey::entity(EntityKind::Assets, id.as_str()), "asset", move |api| {
            let id = id.clone();
            async move { api.get_asset(&id).await }
        })
        .await
    }

    pub async fn drives(&self) -> Result<Page<Drive>, SyncError> {
        let key = CacheKey::collection(EntityKind::Drives, QueryParams::new());
        self.query(key, "drives", |api| async move { api.list_drives().await })
            .await
    }

    pub async fn drive(&self, id: &str) -> Result<Drive, SyncError> {
        let id = id.to_string();
        self.query(CacheKey::entity(EntityKind::Drives, id.as_str()), "drive", move |api| {
            let id = id.clone();
            async move { api.get_drive(&id).await }
        })
        .await
    }

    pub async fn rules(&self) -> Result<Page<Rule>, SyncError> {
        let key = CacheKey::collection(EntityKind::Rules, QueryParams::new());
        self.query(key, "rules", |api| async move { api.list_rules().await })
            .await
    }

    pub async fn system_stats(&self) -> Result<SystemStats, SyncError> {
        self.query(system_stats_key(), "system stats", |api| async move {
            api.system_stats().await
        })
        .await
    }

    pub async fn system_summary(&self) -> Result<SystemSummary, SyncError> {
        let key = CacheKey::singleton(EntityKind::System, "summary");
        self.query(key, "system summary", |api| async move {
            api.system_summary().await
        })
        .await
    }

    pub async fn settings(&self) -> Result<Settings, SyncError> {
        let key = CacheKey::singleton(EntityKind::Settings, "current");
        self.query(key, "settings", |api| async move { api.get_settings().await })
            .await
    }

    /// Last guardrail state pushed by the server, if any.
    pub fn guardrails(&self) -> Option<GuardrailStatus> {
        self.cache.get_as(&guardrails_key())
    }

    /// Last health report pushed by the server, if any.
    pub fn system_health(&self) -> Option<SystemHealth> {
        self.cache.get_as(&system_health_key())
    }

    /// Refreshes the jobs list for `params` every `interval` until the handle
    /// is dropped.
    pub fn poll_jobs(&self, params: &QueryParams, interval: Duration) -> PollHandle {
        let key = CacheKey::collection(EntityKind::Jobs, params.clone());
        let fetch = list_with(params, |api, q| async move { api.list_jobs(&q.pairs()).await });
        self.cache.poll(key, interval, self.fetcher("jobs", fetch))
    }

    // mutations

    pub async fn cancel_job(&self, id: &str) -> Result<Value, SyncError> {
        self.mutate("Cancel job", self.api.cancel_job(id), job_filters(id))
            .await
    }

    pub async fn retry_job(&self, id: &str) -> Result<Value, SyncError> {
        self.mutate("Retry job", self.api.retry_job(id), job_filters(id))
            .await
    }

    pub async fn update_asset(&self, id: &str, patch: &Value) -> Result<Asset, SyncError> {
        self.mutate(
            "Update asset",
            self.api.update_asset(id, patch),
            entity_filters(EntityKind::Assets, id),
        )
        .await
    }

    pub async fn delete_asset(&self, id: &str) -> Result<(), SyncError> {
        self.mutate(
            "Delete asset",
            self.api.delete_asset(id),
            entity_filters(EntityKind::Assets, id),
        )
        .await
    }

    pub async fn update_rule(&self, id: &str, patch: &Value) -> Result<Rule, SyncError> {
        self.mutate(
            "Update rule",
            self.api.update_rule(id, patch),
            entity_filters(EntityKind::Rules, id),
        )
        .await
    }

    pub async fn delete_rule(&self, id: &str) -> Result<(), SyncError> {
        self.mutate(
            "Delete rule",
            self.api.delete_rule(id),
            entity_filters(EntityKind::Rules, id),
        )
        .await
    }

    pub async fn update_obs_connection(&self, id: &str, patch: &Value) -> Result<ObsConnection, SyncError> {
        self.mutate(
            "Update OBS connection",
            self.api.update_obs_connection(id, patch),
            vec![KeyFilter::Kind(EntityKind::ObsConnections)],
        )
        .await
    }

    pub async fn delete_obs_connection(&self, id: &str) -> Result<(), SyncError> {
        self.mutate(
            "Delete OBS connection",
            self.api.delete_obs_connection(id),
            vec![KeyFilter::Kind(EntityKind::ObsConnections)],
        )
        .await
    }

    pub async fn update_notification_template(
        &self,
        id: &str,
        patch: &Value,
    ) -> Result<NotificationTemplate, SyncError> {
        self.mutate(
            "Update notification template",
            self.api.update_notification_template(id, patch),
            vec![KeyFilter::Kind(EntityKind::NotificationTemplates)],
        )
        .await
    }

    pub async fn update_settings(&self, patch: &Value) -> Result<Settings, SyncError> {
        self.mutate(
            "Update settings",
            self.api.update_settings(patch),
            vec![KeyFilter::Kind(EntityKind::Settings)],
        )
        .await
    }

    async fn query<T, F, Fut, R>(&self, key: CacheKey, what: &'static str, fetch: F) -> Result<T, SyncError>
    where
        T: DeserializeOwned,
        F: Fn(StreamOpsApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let value = self.cache.fetch(key, self.fetcher(what, fetch)).await?;
        Ok(<T as Deserialize<'_>>::deserialize(&*value)?)
    }

    /// Wraps an API call into a cache fetcher that stores JSON and notifies
    /// on failure.
    fn fetcher<F, Fut, R>(&self, what: &'static str, fetch: F) -> impl Fn() -> Fetched + Send + Sync + 'static
    where
        F: Fn(StreamOpsApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ApiError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let api = self.api.clone();
        let notifications = self.notifications.clone();
        move || {
            let request = fetch(api.clone());
            let notifications = notifications.clone();
            async move {
                match request.await {
                    Ok(data) => serde_json::to_value(data).map_err(SyncError::from),
                    Err(e) => {
                        notifications.push(
                            Notification::new(
                                Level::Error,
                                format!("Could not load {}: {}", what, e.user_message()),
                            )
                            .with_title("Load failed"),
                        );
                        Err(SyncError::Api(e))
                    }
                }
            }
            .boxed()
        }
    }

    async fn mutate<R, Fut>(&self, what: &str, request: Fut, invalidate: Vec<KeyFilter>) -> Result<R, SyncError>
    where
        Fut: Future<Output = Result<R, ApiError>>,
    {
        match request.await {
            Ok(result) => {
                let count: usize = invalidate
                    .iter()
                    .map(|filter| self.cache.invalidate_matching(filter))
                    .sum();
                tracing::debug!("{} succeeded; {} cache entries invalidated", what, count);
                Ok(result)
            }
            Err(e) => {
                self.notifications.push(
                    Notification::new(Level::Error, format!("{} failed: {}", what, e.user_message()))
                        .with_title(what),
                );
                Err(SyncError::Api(e))
            }
        }
    }
}

fn entity_filters(kind: EntityKind, id: &str) -> Vec<KeyFilter> {
    vec![
        KeyFilter::Exact(CacheKey::entity(kind, id)),
        KeyFilter::Collections(kind),
    ]
}

fn job_filters(id: &str) -> Vec<KeyFilter> {
    let mut filters = entity_filters(EntityKind::Jobs, id);
    filters.push(KeyFilter::Exact(CacheKey::singleton(EntityKind::System, "summary")));
    filters
}

/// Owned query pairs that can move into a fetch future.
#[derive(Debug, Clone, Default)]
struct OwnedQuery(Vec<(String, String)>);

impl OwnedQuery {
    fn pairs(&self) -> Vec<(&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

/// Adapts a list call taking query pairs into a cache fetch closure.
fn list_with<F, Fut, R>(params: &QueryParams, call: F) -> impl Fn(StreamOpsApi) -> Fut + Send + Sync + 'static
where
    F: Fn(StreamOpsApi, OwnedQuery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, ApiError>>,
{
    let query = OwnedQuery(
        params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    move |api| call(api, query.clone())
}
