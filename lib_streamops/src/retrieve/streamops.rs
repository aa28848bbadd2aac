//! # StreamOps REST Surface
//!
//! Typed wrappers over [`ApiClient`] for the endpoints the dashboard uses.
//! Paths are relative to the API base URL; ids are escaped as single path
//! segments.

use std::sync::Arc;

use reqwest::Method;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use serde_json::Value;

use super::ky_http::{ApiClient, ApiError};
use super::models::{
    Asset, AuditEntry, Drive, Job, ListBody, LogEntry, NotificationTemplate, ObsConnection, Page,
    Rule, Settings, SystemInfo, SystemStats, SystemSummary,
};

/// Query string pairs of a list request.
pub type Query<'a> = &'a [(&'a str, &'a str)];

#[derive(Debug, Clone)]
pub struct StreamOpsApi {
    client: Arc<ApiClient>,
}

impl StreamOpsApi {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    #[cfg(feature = "configs")]
    pub fn from_settings(settings: &crate::configs::ClientSettings) -> Result<Self, ApiError> {
        let client = ApiClient::new(
            settings.api_url.clone(),
            settings.api_token.clone(),
            settings.request_timeout,
        )?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Untyped passthrough used by tool proxies.
    pub async fn call(
        &self,
        method: Method,
        segments: &[&str],
        query: Query<'_>,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let response = self.client.request(method, segments, query, None, body).await?;
        Ok(response.data)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], query: Query<'_>) -> Result<T, ApiError> {
        let response = self
            .client
            .request(Method::GET, segments, query, None, None::<&Value>)
            .await?;
        Ok(response.data)
    }

    async fn list<T: DeserializeOwned>(&self, segments: &[&str], query: Query<'_>) -> Result<Page<T>, ApiError> {
        let body: ListBody<T> = self.get(segments, query).await?;
        Ok(body.into())
    }

    async fn send<T, B>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.client.request(method, segments, &[], None, body).await?;
        Ok(response.data)
    }

    async fn delete(&self, segments: &[&str]) -> Result<(), ApiError> {
        let _: IgnoredAny = self.send(Method::DELETE, segments, None::<&Value>).await?;
        Ok(())
    }

    // jobs

    pub async fn list_jobs(&self, query: Query<'_>) -> Result<Page<Job>, ApiError> {
        self.list(&["jobs"], query).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, ApiError> {
        self.get(&["jobs", id], &[]).await
    }

    pub async fn cancel_job(&self, id: &str) -> Result<Value, ApiError> {
        self.send(Method::POST, &["jobs", id, "cancel"], None::<&Value>).await
    }

    pub async fn retry_job(&self, id: &str) -> Result<Value, ApiError> {
        self.send(Method::POST, &["jobs", id, "retry"], None::<&Value>).await
    }

    // assets

    pub async fn list_assets(&self, query: Query<'_>) -> Result<Page<Asset>, ApiError> {
        self.list(&["assets"], query).await
    }

    pub async fn get_asset(&self, id: &str) -> Result<Asset, ApiError> {
        self.get(&["assets", id], &[]).await
    }

    pub async fn update_asset(&self, id: &str, patch: &Value) -> Result<Asset, ApiError> {
        self.send(Method::PATCH, &["assets", id], Some(patch)).await
    }

    pub async fn delete_asset(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&["assets", id]).await
    }

    // drives

    pub async fn list_drives(&self) -> Result<Page<Drive>, ApiError> {
        self.list(&["drives"], &[]).await
    }

    pub async fn get_drive(&self, id: &str) -> Result<Drive, ApiError> {
        self.get(&["drives", id], &[]).await
    }

    // rules

    pub async fn list_rules(&self) -> Result<Page<Rule>, ApiError> {
        self.list(&["rules"], &[]).await
    }

    pub async fn get_rule(&self, id: &str) -> Result<Rule, ApiError> {
        self.get(&["rules", id], &[]).await
    }

    pub async fn update_rule(&self, id: &str, patch: &Value) -> Result<Rule, ApiError> {
        self.send(Method::PATCH, &["rules", id], Some(patch)).await
    }

    pub async fn delete_rule(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&["rules", id]).await
    }

    // OBS connections

    pub async fn list_obs_connections(&self) -> Result<Page<ObsConnection>, ApiError> {
        self.list(&["obs", "connections"], &[]).await
    }

    pub async fn update_obs_connection(&self, id: &str, patch: &Value) -> Result<ObsConnection, ApiError> {
        self.send(Method::PATCH, &["obs", "connections", id], Some(patch)).await
    }

    pub async fn delete_obs_connection(&self, id: &str) -> Result<(), ApiError> {
        self.delete(&["obs", "connections", id]).await
    }

    // notification templates and audit log

    pub async fn list_notification_templates(&self) -> Result<Page<NotificationTemplate>, ApiError> {
        self.list(&["notifications", "templates"], &[]).await
    }

    pub async fn update_notification_template(
        &self,
        id: &str,
        patch: &Value,
    ) -> Result<NotificationTemplate, ApiError> {
        self.send(Method::PATCH, &["notifications", "templates", id], Some(patch))
            .await
    }

    pub async fn list_notification_audit(&self, query: Query<'_>) -> Result<Page<AuditEntry>, ApiError> {
        self.list(&["notifications", "audit"], query).await
    }

    // system

    pub async fn system_info(&self) -> Result<SystemInfo, ApiError> {
        self.get(&["system", "info"], &[]).await
    }

    pub async fn system_stats(&self) -> Result<SystemStats, ApiError> {
        self.get(&["system", "stats"], &[]).await
    }

    pub async fn system_summary(&self) -> Result<SystemSummary, ApiError> {
        self.get(&["system", "summary"], &[]).await
    }

    // logs

    pub async fn list_logs(&self, query: Query<'_>) -> Result<Page<LogEntry>, ApiError> {
        self.list(&["logs"], query).await
    }

    // settings

    pub async fn get_settings(&self) -> Result<Settings, ApiError> {
        self.get(&["settings"], &[]).await
    }

    pub async fn update_settings(&self, patch: &Value) -> Result<Settings, ApiError> {
        self.send(Method::PATCH, &["settings"], Some(patch)).await
    }
}
