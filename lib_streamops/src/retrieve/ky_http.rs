//! # HTTP Retrieval Utilities
//!
//! Asynchronous API client wrapper around `reqwest`, with exponential backoff
//! retries of transient failures, an application-level timeout and JSON
//! request/response handling.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Retries of transient failures (connect errors, 5xx, 408, 429). Only
/// idempotent methods are retried; a POST or PATCH is sent once.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request failed: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Text suitable for a notification.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Status { message, .. } => message.clone(),
            ApiError::Timeout(_) => "The server did not respond in time".to_string(),
            ApiError::Request(_) | ApiError::Middleware(_) => {
                "Could not reach the StreamOps server".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// A decoded response with its transport metadata.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub data: T,
    pub status: u16,
    pub headers: HeaderMap,
}

/// Base URL, bearer token and retry policy shared by every request.
#[derive(Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    /// Same connection pool without the retry layer.
    single_shot: ClientWithMiddleware,
    base_url: Url,
    auth_token: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.auth_token.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApiClient {
    /// Creates a client with [`DEFAULT_MAX_RETRIES`].
    ///
    /// `base_url` must be absolute and able to carry path segments.
    pub fn new(base_url: Url, auth_token: Option<String>, timeout: Duration) -> Result<Self, ApiError> {
        Self::with_max_retries(base_url, auth_token, timeout, DEFAULT_MAX_RETRIES)
    }

    pub fn with_max_retries(
        base_url: Url,
        auth_token: Option<String>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, ApiError> {
        if base_url.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let http = reqwest::Client::builder().build()?;
        let client = ClientBuilder::new(http.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: client,
            single_shot: ClientBuilder::new(http).build(),
            base_url,
            auth_token: auth_token.filter(|t| !t.is_empty()),
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Joins `segments` onto the base path, escaping each one, and appends
    /// `query`.
    pub fn url_for(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base_url.to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Performs a request and decodes the JSON response into `T`.
    ///
    /// Non-2xx statuses become [`ApiError::Status`] carrying the server's
    /// `detail`, `message` or `error` field when present. An empty body
    /// decodes as JSON `null`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        headers: Option<HeaderMap>,
        body: Option<&B>,
    ) -> Result<ApiResponse<T>, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.url_for(segments, query)?;
        tracing::debug!("{} {}", method, url);
        let client = if method.is_idempotent() {
            &self.inner
        } else {
            &self.single_shot
        };
        let mut req = client.request(method, url);

        if let Some(h) = headers {
            req = req.headers(h);
        }

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        if let Some(b) = body {
            let json_body = serde_json::to_string(b)?;
            req = req.header(CONTENT_TYPE, "application/json").body(json_body);
        }

        let exchange = async {
            let response = req.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.bytes().await?;
            Ok::<_, ApiError>((status, headers, bytes))
        };
        let (status, headers, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))??;

        if !status.is_success() {
            let message = error_message(status, &bytes);
            tracing::warn!("Request failed with HTTP {}: {}", status.as_u16(), message);
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let data = if bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::from_slice(b"null")?
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok(ApiResponse {
            data,
            status: status.as_u16(),
            headers,
        })
    }
}

/// Best human-readable message of an error body.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        for field in ["detail", "message", "error"] {
            match value.get(field) {
                Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(Value::String(_)) | Some(Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if !text.is_empty() && text.len() <= 200 {
        return text.to_string();
    }
    status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// One-shot HTTP server answering with `status` and `body`; returns the
    /// base URL and a handle yielding the raw request.
    fn mock_server(status: &str, body: &str) -> (Url, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (Url::parse(&format!("http://{}/api/", addr)).unwrap(), handle)
    }

    fn client(base: Url) -> ApiClient {
        ApiClient::with_max_retries(base, Some("secret".into()), Duration::from_secs(5), 0).unwrap()
    }

    #[test]
    fn test_url_for_escapes_segments() {
        let api = client(Url::parse("http://localhost:8000/api/").unwrap());
        let url = api
            .url_for(&["assets", "clip 1/a"], &[("status", "ready"), ("q", "a&b")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/assets/clip%201%2Fa?status=ready&q=a%26b"
        );
    }

    #[tokio::test]
    async fn test_request_sends_token_and_decodes() {
        let (base, server) = mock_server("200 OK", r#"{"id":"j1","status":"running"}"#);
        let api = client(base);

        let response: ApiResponse<Value> = api
            .request(Method::GET, &["jobs", "j1"], &[], None, None::<&Value>)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data["status"], "running");

        let raw = server.join().unwrap();
        assert!(raw.starts_with("GET /api/jobs/j1 HTTP/1.1"));
        assert!(raw.to_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_error_status_uses_server_detail() {
        let (base, server) = mock_server("409 Conflict", r#"{"detail":"Job already finished"}"#);
        let api = client(base);

        let err = api
            .request::<Value, Value>(Method::POST, &["jobs", "j1", "cancel"], &[], None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(409));
        assert_eq!(err.user_message(), "Job already finished");
        server.join().unwrap();
    }

    #[tokio::test]
    async fn test_empty_body_decodes_as_null() {
        let (base, server) = mock_server("200 OK", "");
        let api = client(base);
        let response: ApiResponse<Option<Value>> = api
            .request(Method::DELETE, &["rules", "r1"], &[], None, None::<&Value>)
            .await
            .unwrap();
        assert!(response.data.is_none());
        server.join().unwrap();
    }

    /// Answers every connection with 503 and counts them.
    fn unavailable_server() -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            let body = r#"{"detail":"busy"}"#;
            let response = format!(
                "HTTP/1.1 503 Service Unavailable\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (Url::parse(&format!("http://{}/api/", addr)).unwrap(), hits)
    }

    #[tokio::test]
    async fn test_post_is_not_retried() {
        let (base, hits) = unavailable_server();
        let api = ApiClient::with_max_retries(base, None, Duration::from_secs(5), 2).unwrap();

        let err = api
            .request::<Value, Value>(Method::POST, &["jobs", "j1", "retry"], &[], None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_is_retried() {
        let (base, hits) = unavailable_server();
        let api = ApiClient::with_max_retries(base, None, Duration::from_secs(10), 1).unwrap();

        let err = api
            .request::<Value, Value>(Method::GET, &["jobs"], &[], None, None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_message_fallbacks() {
        assert_eq!(error_message(StatusCode::BAD_REQUEST, br#"{"message":"bad"}"#), "bad");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, b""), "Bad Gateway");
        assert_eq!(error_message(StatusCode::NOT_FOUND, b"no such job"), "no such job");
    }
}
