use clap::Args;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_CONFIG_FILE: &str = "streamops.conf";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// One configuration layer. Every field is optional so layers can be merged;
/// [`ClientConfig::resolve`] turns the merged result into [`ClientSettings`].
#[derive(Args, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[arg(long, env = "STREAMOPS_API_URL", help = "Base URL of the StreamOps REST API.")]
    pub api_url: Option<String>,

    #[arg(long, env = "STREAMOPS_WS_URL", help = "URL of the StreamOps realtime WebSocket endpoint.")]
    pub ws_url: Option<String>,

    #[arg(long, env = "STREAMOPS_API_TOKEN", help = "Bearer token sent with REST requests.")]
    pub api_token: Option<String>,

    #[arg(long, env = "STREAMOPS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "STREAMOPS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "STREAMOPS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "STREAMOPS_RECONNECT_BASE_DELAY_MS", help = "Delay in milliseconds before the first reconnect attempt.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[arg(long, env = "STREAMOPS_RECONNECT_GROWTH_FACTOR", help = "Multiplier applied to the reconnect delay after each failed attempt.")]
    pub reconnect_growth_factor: Option<f64>,

    #[arg(long, env = "STREAMOPS_RECONNECT_MAX_DELAY_MS", help = "Upper bound in milliseconds for the reconnect delay.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "STREAMOPS_MAX_RECONNECT_ATTEMPTS", help = "Consecutive reconnect attempts before giving up.")]
    pub max_reconnect_attempts: Option<u32>,

    #[arg(long, env = "STREAMOPS_REQUEST_TIMEOUT_MS", help = "Timeout in milliseconds for REST requests.")]
    pub request_timeout_ms: Option<u64>,

    #[arg(long, env = "STREAMOPS_NOTIFICATION_CAPACITY", help = "Maximum number of retained notifications.")]
    pub notification_capacity: Option<usize>,

    #[arg(long, env = "STREAMOPS_TOPICS", value_delimiter = ',', help = "Realtime topics subscribed on connect (comma separated).")]
    pub topics: Option<Vec<String>>,
}

impl ClientConfig {
    /// Built-in defaults, the lowest layer.
    pub fn defaults() -> Self {
        Self {
            api_url: Some("http://127.0.0.1:8000/api/".to_string()),
            ws_url: Some("ws://127.0.0.1:8000/ws".to_string()),
            api_token: None,
            config_path: None,
            log_dir: None,
            log_level: Some("info".to_string()),
            reconnect_base_delay_ms: Some(1000),
            reconnect_growth_factor: Some(1.5),
            reconnect_max_delay_ms: Some(30_000),
            max_reconnect_attempts: Some(10),
            request_timeout_ms: Some(15_000),
            notification_capacity: Some(100),
            topics: Some(
                ["jobs", "assets", "system", "drives"]
                    .iter()
                    .map(|t| t.to_string())
                    .collect(),
            ),
        }
    }

    // 'other' overrides 'self' for Some values
    pub fn merge(self, other: ClientConfig) -> ClientConfig {
        ClientConfig {
            api_url: other.api_url.or(self.api_url),
            ws_url: other.ws_url.or(self.ws_url),
            api_token: other.api_token.or(self.api_token),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_growth_factor: other.reconnect_growth_factor.or(self.reconnect_growth_factor),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            request_timeout_ms: other.request_timeout_ms.or(self.request_timeout_ms),
            notification_capacity: other.notification_capacity.or(self.notification_capacity),
            topics: other.topics.or(self.topics),
        }
    }

    /// Validates the merged layers. Missing values fall back to [`ClientConfig::defaults`].
    pub fn resolve(self) -> Result<ClientSettings, ConfigError> {
        let merged = ClientConfig::defaults().merge(self);

        let api_url = parse_url(
            "apiUrl",
            merged.api_url.as_deref().unwrap_or_default(),
            &["http", "https"],
        )?;
        let ws_url = parse_url(
            "wsUrl",
            merged.ws_url.as_deref().unwrap_or_default(),
            &["ws", "wss"],
        )?;

        let growth = merged.reconnect_growth_factor.unwrap_or(1.5);
        if !growth.is_finite() || growth < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnectGrowthFactor",
                reason: format!("must be a finite number >= 1.0, got {}", growth),
            });
        }

        let capacity = merged.notification_capacity.unwrap_or(100);
        if capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notificationCapacity",
                reason: "must be greater than zero".to_string(),
            });
        }

        let timeout_ms = merged.request_timeout_ms.unwrap_or(15_000);
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "requestTimeoutMs",
                reason: "must be greater than zero".to_string(),
            });
        }

        let topics: Vec<String> = merged
            .topics
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(ClientSettings {
            api_url,
            ws_url,
            api_token: merged.api_token.filter(|t| !t.trim().is_empty()),
            log_dir: merged.log_dir,
            log_level: merged.log_level.unwrap_or_else(|| "info".to_string()),
            reconnect_base_delay: Duration::from_millis(merged.reconnect_base_delay_ms.unwrap_or(1000)),
            reconnect_growth_factor: growth,
            reconnect_max_delay: Duration::from_millis(merged.reconnect_max_delay_ms.unwrap_or(30_000)),
            max_reconnect_attempts: merged.max_reconnect_attempts.unwrap_or(10),
            request_timeout: Duration::from_millis(timeout_ms),
            notification_capacity: capacity,
            topics,
        })
    }
}

/// Validated configuration consumed by the rest of the crate.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub api_url: Url,
    pub ws_url: Url,
    pub api_token: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub reconnect_base_delay: Duration,
    pub reconnect_growth_factor: f64,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub request_timeout: Duration,
    pub notification_capacity: usize,
    pub topics: Vec<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        // The built-in defaults always validate.
        match ClientConfig::defaults().resolve() {
            Ok(settings) => settings,
            Err(e) => unreachable!("built-in defaults are invalid: {}", e),
        }
    }
}

fn parse_url(field: &'static str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
        field,
        reason: format!("{} ({})", e, raw),
    })?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: format!("scheme must be one of {:?}, got '{}'", schemes, url.scheme()),
        });
    }

    // Relative joins against the API base need a trailing slash.
    if field == "apiUrl" && !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    Ok(url)
}

/// Loads the layered configuration.
///
/// Order, lowest to highest priority:
/// 1. built-in defaults
/// 2. the JSON config file (`--config-path`, or `streamops.conf` when present)
/// 3. environment variables and CLI flags, already parsed into `cli`
///
/// A `.env` file is loaded into the environment first, so callers that parse
/// `cli` after calling [`load_dotenv`] see its values.
pub fn load_config(cli: ClientConfig) -> Result<ClientSettings, ConfigError> {
    let mut current = ClientConfig::defaults();

    let explicit_path = cli.config_path.clone();
    let config_file_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        let raw = fs::read_to_string(&config_file_path).map_err(|source| ConfigError::Io {
            path: config_file_path.clone(),
            source,
        })?;
        let file_config: ClientConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: config_file_path.clone(),
                source,
            })?;
        current = current.merge(file_config);
    } else if explicit_path.is_some() {
        return Err(ConfigError::Io {
            path: config_file_path,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        });
    } else {
        tracing::debug!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current.merge(cli).resolve()
}

/// Loads `.env` from the working directory if one exists.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("Failed to load .env file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_merge_prefers_override_values() {
        let base = ClientConfig::defaults();
        let over = ClientConfig {
            ws_url: Some("wss://ops.example.com/ws".into()),
            max_reconnect_attempts: Some(3),
            ..Default::default()
        };

        let merged = base.merge(over);
        assert_eq!(merged.ws_url.as_deref(), Some("wss://ops.example.com/ws"));
        assert_eq!(merged.max_reconnect_attempts, Some(3));
        assert_eq!(merged.reconnect_base_delay_ms, Some(1000));
    }

    #[test]
    fn test_resolve_defaults() {
        let settings = ClientConfig::default().resolve().unwrap();
        assert_eq!(settings.api_url.as_str(), "http://127.0.0.1:8000/api/");
        assert_eq!(settings.ws_url.as_str(), "ws://127.0.0.1:8000/ws");
        assert_eq!(settings.reconnect_base_delay, Duration::from_millis(1000));
        assert_eq!(settings.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(settings.notification_capacity, 100);
        assert_eq!(settings.topics, vec!["jobs", "assets", "system", "drives"]);
    }

    #[test]
    fn test_resolve_appends_trailing_slash_to_api_url() {
        let settings = ClientConfig {
            api_url: Some("https://ops.example.com/api/v1".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(settings.api_url.as_str(), "https://ops.example.com/api/v1/");
    }

    #[test]
    fn test_resolve_rejects_wrong_scheme() {
        let err = ClientConfig {
            ws_url: Some("http://127.0.0.1:8000/ws".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { field: "wsUrl", .. }));
    }

    #[test]
    fn test_resolve_rejects_shrinking_backoff() {
        let err = ClientConfig {
            reconnect_growth_factor: Some(0.5),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "reconnectGrowthFactor", .. }));
    }

    #[test]
    fn test_load_config_layers_file_below_cli() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"wsUrl": "ws://file-host:9000/ws", "maxReconnectAttempts": 4, "topics": ["jobs"]}}"#
        )
        .unwrap();

        let cli = ClientConfig {
            config_path: Some(file.path().to_path_buf()),
            max_reconnect_attempts: Some(7),
            ..Default::default()
        };

        let settings = load_config(cli).unwrap();
        assert_eq!(settings.ws_url.as_str(), "ws://file-host:9000/ws");
        assert_eq!(settings.max_reconnect_attempts, 7);
        assert_eq!(settings.topics, vec!["jobs"]);
    }

    #[test]
    fn test_load_config_missing_explicit_file_is_an_error() {
        let cli = ClientConfig {
            config_path: Some(PathBuf::from("/definitely/not/here/streamops.conf")),
            ..Default::default()
        };
        assert!(matches!(load_config(cli), Err(ConfigError::Io { .. })));
    }
}
