use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default User-Agent string for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!("apikit-http/", env!("CARGO_PKG_VERSION"));

/// Prefix for environment variable overrides picked up by [`NetworkConfig::load`]
pub const ENV_PREFIX: &str = "APIKIT_";

/// Default maximum response body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Construction-time configuration failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },

    #[error("invalid default header '{name}': {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("duplicate default header '{0}' (header names are case-insensitive)")]
    DuplicateHeader(String),

    #[error("status code {0} cannot be retried: {1}")]
    InvalidRetryStatus(u16, &'static str),

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("TLS initialization failed: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Conditions that trigger a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RetryTrigger {
    /// TCP/TLS connect did not finish within `connect_timeout`
    ConnectTimeout,
    /// No response within `receive_timeout`
    ReceiveTimeout,
    /// Transport-level errors (connection refused, DNS failure, reset, etc.)
    ConnectionError,
    /// Specific HTTP status code
    Status(u16),
    /// Error that is never retryable
    NonRetryable,
}

/// Exponential backoff configuration for retries
///
/// Computes delay as: `min(base_delay * multiplier^attempt, max_delay)` with optional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExponentialBackoff {
    /// Delay before the first retry (default: 1s)
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for a single delay (default: 30s)
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor between attempts (default: 2.0)
    pub multiplier: f64,

    /// Add 0-25% random delay to each backoff (default: false)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ExponentialBackoff {
    /// Create backoff with custom base and max durations
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Default::default()
        }
    }

    /// Create fast backoff for testing (1ms base, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Retry policy configuration
///
/// Connect timeouts, receive timeouts and connection errors are always
/// eligible; HTTP responses are eligible only when their status code is in
/// `status_codes`. Total attempts = 1 (initial) + `max_retries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt (0 = no retries, default: 3)
    pub max_retries: usize,

    /// Status codes that trigger a retry (default: 500, 502, 503, 504)
    pub status_codes: BTreeSet<u16>,

    /// Backoff strategy
    pub backoff: ExponentialBackoff,

    /// Maximum bytes drained from a retried response body so the connection
    /// can be reused. Default: 64 KiB.
    pub drain_limit: usize,
}

/// Default drain limit for response bodies before retry (64 KiB)
pub const DEFAULT_RETRY_DRAIN_LIMIT: usize = 64 * 1024;

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            status_codes: BTreeSet::from([500, 502, 503, 504]),
            backoff: ExponentialBackoff::default(),
            drain_limit: DEFAULT_RETRY_DRAIN_LIMIT,
        }
    }
}

impl RetryConfig {
    /// Create config with no retries
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Check if the given trigger should cause a retry
    #[must_use]
    pub fn should_retry(&self, trigger: RetryTrigger) -> bool {
        match trigger {
            RetryTrigger::ConnectTimeout
            | RetryTrigger::ReceiveTimeout
            | RetryTrigger::ConnectionError => true,
            RetryTrigger::Status(code) => self.status_codes.contains(&code),
            RetryTrigger::NonRetryable => false,
        }
    }
}

/// Client configuration
///
/// Constructed once and handed to [`ApiClient`](crate::ApiClient). Replacing
/// it goes through [`ApiClient::reconfigure`](crate::ApiClient::reconfigure);
/// requests already in flight keep the snapshot they started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Base URL that relative request paths are resolved against
    pub base_url: String,

    /// TCP/TLS connect timeout, per attempt (default: 30s)
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Time allowed for the response head after the request is sent, per attempt (default: 30s)
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,

    /// Headers sent on every request unless overridden per request
    pub default_headers: BTreeMap<String, String>,

    /// Emit request/response records (debug builds only, default: on in debug builds)
    pub enable_logging: bool,

    /// Header names masked in log records (case-insensitive)
    pub redacted_headers: BTreeSet<String>,

    /// Retry policy
    pub retry: RetryConfig,

    /// User-Agent header value
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10 MiB)
    pub max_body_size: usize,

    /// Maximum number of redirects followed (default: 10, 0 disables)
    pub max_redirects: usize,

    /// Capacity of the request buffer in front of the layer stack (default: 1024)
    pub buffer_capacity: usize,

    /// Path (relative to `base_url`) of the token refresh endpoint; enables
    /// refresh-on-401 when set
    pub token_refresh_path: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            connect_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(30),
            default_headers: BTreeMap::from([
                ("Content-Type".to_owned(), "application/json".to_owned()),
                ("Accept".to_owned(), "application/json".to_owned()),
            ]),
            enable_logging: cfg!(debug_assertions),
            redacted_headers: [
                "authorization",
                "proxy-authorization",
                "cookie",
                "set-cookie",
                "x-api-key",
            ]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect(),
            retry: RetryConfig::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            max_redirects: 10,
            buffer_capacity: 1024,
            token_refresh_path: None,
        }
    }
}

impl NetworkConfig {
    /// Create a config for the given base URL with all other settings at their defaults
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Extract a config from a prepared figment
    ///
    /// # Errors
    /// Returns [`ConfigError::Load`] if extraction fails, or any validation error.
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a YAML file with `APIKIT_`-prefixed environment overrides
    ///
    /// Nested keys use a double underscore: `APIKIT_RETRY__MAX_RETRIES=5`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Load`] if the file cannot be parsed, or any validation error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    /// Check invariants that serde cannot express
    ///
    /// # Errors
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = url::Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "only http:// and https:// schemes are supported".to_owned(),
            });
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                field: "connect_timeout",
            });
        }
        if self.receive_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout {
                field: "receive_timeout",
            });
        }

        self.header_map()?;

        for &code in &self.retry.status_codes {
            match code {
                401 => {
                    return Err(ConfigError::InvalidRetryStatus(
                        code,
                        "401 is handled by token refresh",
                    ));
                }
                422 => {
                    return Err(ConfigError::InvalidRetryStatus(
                        code,
                        "validation failures are final",
                    ));
                }
                100..=599 => {}
                _ => {
                    return Err(ConfigError::InvalidRetryStatus(
                        code,
                        "not a valid HTTP status code",
                    ));
                }
            }
        }

        Ok(())
    }

    /// Parse `default_headers` into a `HeaderMap`
    ///
    /// # Errors
    /// Returns an error for invalid names/values or names that collide case-insensitively.
    pub fn header_map(&self) -> Result<HeaderMap, ConfigError> {
        let mut map = HeaderMap::with_capacity(self.default_headers.len());
        for (name, value) in &self.default_headers {
            let header_name =
                HeaderName::try_from(name.as_str()).map_err(|e| ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value =
                HeaderValue::try_from(value.as_str()).map_err(|e| ConfigError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            if map.insert(header_name, header_value).is_some() {
                return Err(ConfigError::DuplicateHeader(name.clone()));
            }
        }
        Ok(map)
    }
}

/// Serde adapter for `Duration` fields using humantime strings (`"30s"`, `"250ms"`)
pub mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    /// Serializes a `Duration` as a humantime string.
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    /// Deserializes a `Duration` from a humantime string.
    ///
    /// # Errors
    /// Fails if the input is not a valid humantime duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}
