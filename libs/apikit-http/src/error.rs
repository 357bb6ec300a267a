use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Field name -> list of messages, as reported by a 422 response
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Errors produced inside the layer stack
///
/// These never reach callers of [`ApiClient`](crate::ApiClient) directly;
/// the facade translates them into [`ApiError`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Connection could not be established within the connect timeout
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Single attempt did not receive a response within the receive timeout
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// Connection could not be established (refused, DNS failure, TLS handshake)
    #[error("Connection failed: {0}")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Transport error on an established connection
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// JSON encoding or decoding error
    #[error("JSON processing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Query string encoding error
    #[error("Query encoding failed: {0}")]
    QueryEncode(#[from] serde_urlencoded::ser::Error),

    /// Invalid request URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Local file access during upload/download
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Token refresh endpoint rejected the refresh or returned garbage
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// Internal service failure (buffer worker died, channel closed)
    #[error("Service unavailable: internal failure")]
    ServiceClosed,
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

/// Closed set of failure classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Connection,
    Client,
    Unauthorized,
    Validation,
    Server,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Client => "client",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Validation => "validation",
            ErrorKind::Server => "server",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error returned by every [`ApiClient`](crate::ApiClient) call
///
/// Serializes with an internal `kind` tag so it can cross process or FFI
/// boundaries and be reconstructed unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ApiError {
    #[error("{message}")]
    Timeout {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    #[error("{message}")]
    Connection {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    #[error("{message}")]
    Client {
        message: String,
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    #[error("{message}")]
    Unauthorized {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    #[error("{message}")]
    Validation {
        message: String,
        field_errors: FieldErrors,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    #[error("{message}")]
    Server {
        message: String,
        status: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    #[error("{message}")]
    Cancelled { message: String },

    #[error("{message}")]
    Unknown {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ApiError {
    pub fn connection(message: impl Into<String>) -> Self {
        ApiError::Connection {
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        ApiError::Cancelled {
            message: "Request was cancelled".to_owned(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        ApiError::Unknown {
            message: message.into(),
            status: None,
            details: None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::Connection { .. } => ErrorKind::Connection,
            ApiError::Client { .. } => ErrorKind::Client,
            ApiError::Unauthorized { .. } => ErrorKind::Unauthorized,
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Cancelled { .. } => ErrorKind::Cancelled,
            ApiError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    /// Human-readable message
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            ApiError::Timeout { message, .. }
            | ApiError::Connection { message, .. }
            | ApiError::Client { message, .. }
            | ApiError::Unauthorized { message, .. }
            | ApiError::Validation { message, .. }
            | ApiError::Server { message, .. }
            | ApiError::Cancelled { message }
            | ApiError::Unknown { message, .. } => message,
        }
    }

    /// HTTP status carried by the error, if it came from a response
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Client { status, .. } | ApiError::Server { status, .. } => Some(*status),
            ApiError::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED.as_u16()),
            ApiError::Validation { .. } => Some(StatusCode::UNPROCESSABLE_ENTITY.as_u16()),
            ApiError::Unknown { status, .. } => *status,
            ApiError::Timeout { .. } | ApiError::Connection { .. } | ApiError::Cancelled { .. } => {
                None
            }
        }
    }

    #[must_use]
    pub fn details(&self) -> Option<&str> {
        match self {
            ApiError::Timeout { details, .. }
            | ApiError::Connection { details, .. }
            | ApiError::Client { details, .. }
            | ApiError::Unauthorized { details, .. }
            | ApiError::Validation { details, .. }
            | ApiError::Server { details, .. }
            | ApiError::Unknown { details, .. } => details.as_deref(),
            ApiError::Cancelled { .. } => None,
        }
    }

    /// Field errors of a validation failure
    #[must_use]
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            ApiError::Validation { field_errors, .. } => Some(field_errors),
            _ => None,
        }
    }

    /// Classify a non-success HTTP response
    ///
    /// `body` is the (possibly truncated) response body; a JSON `message`
    /// field is used as the error message when present, and 422 bodies are
    /// parsed into field errors.
    #[must_use]
    pub fn from_status(status: StatusCode, body: &[u8]) -> Self {
        let json: Option<serde_json::Value> = serde_json::from_slice(body).ok();
        let server_message = json
            .as_ref()
            .and_then(|v| v.get("message").or_else(|| v.get("error")))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);
        let details = if body.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(body).into_owned())
        };
        let code = status.as_u16();
        let message =
            server_message.unwrap_or_else(|| default_status_message(status).to_owned());

        match status {
            StatusCode::UNAUTHORIZED => ApiError::Unauthorized { message, details },
            StatusCode::UNPROCESSABLE_ENTITY => ApiError::Validation {
                message,
                field_errors: json.as_ref().map(parse_field_errors).unwrap_or_default(),
                details,
            },
            s if s.is_client_error() => ApiError::Client {
                message,
                status: code,
                details,
            },
            s if s.is_server_error() => ApiError::Server {
                message,
                status: code,
                details,
            },
            _ => ApiError::Unknown {
                message: format!("Unexpected HTTP status {code}"),
                status: Some(code),
                details,
            },
        }
    }
}

fn default_status_message(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Bad request",
        StatusCode::UNAUTHORIZED => "Unauthorized",
        StatusCode::FORBIDDEN => "Access forbidden",
        StatusCode::NOT_FOUND => "Resource not found",
        StatusCode::UNPROCESSABLE_ENTITY => "Validation failed",
        StatusCode::INTERNAL_SERVER_ERROR => "Internal server error",
        StatusCode::BAD_GATEWAY => "Bad gateway",
        StatusCode::SERVICE_UNAVAILABLE => "Service unavailable",
        StatusCode::GATEWAY_TIMEOUT => "Gateway timeout",
        s if s.is_client_error() => "Request rejected by server",
        s if s.is_server_error() => "Server error",
        _ => "Unexpected response",
    }
}

/// Extract field errors from a validation body
///
/// Accepts `{"errors": {field: [msg, ..] | msg}}`, the list form
/// `{"errors": [{"field": .., "message": ..}, ..]}`, or the bare mapping at
/// the top level when there is no `errors` key. Non-string entries are skipped.
fn parse_field_errors(body: &serde_json::Value) -> FieldErrors {
    match body.get("errors") {
        Some(serde_json::Value::Object(errors)) => collect_field_map(errors, |_| true),
        Some(serde_json::Value::Array(items)) => collect_field_list(items),
        Some(_) => FieldErrors::new(),
        None => body.as_object().map_or_else(FieldErrors::new, |top| {
            collect_field_map(top, |field| field != "message")
        }),
    }
}

fn collect_field_map(
    map: &serde_json::Map<String, serde_json::Value>,
    keep: impl Fn(&str) -> bool,
) -> FieldErrors {
    map.iter()
        .filter(|(field, _)| keep(field))
        .filter_map(|(field, value)| Some((field.clone(), messages_of(value)?)))
        .collect()
}

fn collect_field_list(items: &[serde_json::Value]) -> FieldErrors {
    let mut fields = FieldErrors::new();
    for item in items {
        let Some(field) = item.get("field").and_then(serde_json::Value::as_str) else {
            continue;
        };
        let Some(messages) = item
            .get("message")
            .or_else(|| item.get("messages"))
            .and_then(messages_of)
        else {
            continue;
        };
        fields.entry(field.to_owned()).or_default().extend(messages);
    }
    fields
}

fn messages_of(value: &serde_json::Value) -> Option<Vec<String>> {
    match value {
        serde_json::Value::String(s) => Some(vec![s.clone()]),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(ToOwned::to_owned)
                .collect(),
        ),
        _ => None,
    }
}

impl From<HttpError> for ApiError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::ConnectTimeout(_) => ApiError::Timeout {
                message: "Connection timeout".to_owned(),
                details: Some(err.to_string()),
            },
            HttpError::Timeout(_) => ApiError::Timeout {
                message: "Receive timeout".to_owned(),
                details: Some(err.to_string()),
            },
            HttpError::Connect(_) | HttpError::Transport(_) => ApiError::Connection {
                message: "Unable to reach the server".to_owned(),
                details: Some(err.to_string()),
            },
            HttpError::RequestBuild(_)
            | HttpError::InvalidHeaderName(_)
            | HttpError::InvalidHeaderValue(_)
            | HttpError::BodyTooLarge { .. }
            | HttpError::Json(_)
            | HttpError::QueryEncode(_)
            | HttpError::InvalidUrl { .. }
            | HttpError::Io(_)
            | HttpError::TokenRefresh(_)
            | HttpError::ServiceClosed => ApiError::Unknown {
                message: err.to_string(),
                status: None,
                details: None,
            },
        }
    }
}
