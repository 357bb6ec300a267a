#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! HTTP API client facade
//!
//! This crate provides a hyper-based client for JSON APIs with:
//! - Base URL resolution and default headers
//! - Bearer token injection with single-flight refresh on 401
//! - Automatic retries with exponential backoff
//! - Request/response logging with header redaction (debug builds)
//! - A connectivity pre-check before every call
//! - A closed error taxonomy ([`ApiError`]) and a success/error envelope ([`ApiResponse`])
//! - Multipart uploads and streamed downloads with progress callbacks
//! - Transparent response decompression (gzip, brotli, deflate)
//!
//! # Layer stack
//!
//! ```text
//! Buffer → Logging → Auth → Retry → Timeout → User-Agent → Decompression → FollowRedirect → hyper
//! ```
//!
//! # Example
//!
//! ```ignore
//! use apikit_http::{ApiClient, NetworkConfig};
//!
//! let client = ApiClient::new(NetworkConfig::new("https://api.example.com/v1"))?;
//! client.set_tokens(access, refresh);
//!
//! let user: User = client
//!     .get("/users/42")
//!     .send_json()
//!     .await?;
//! ```

mod body;
mod builder;
mod client;
mod config;
mod connectivity;
mod envelope;
mod error;
mod layers;
mod multipart;
mod request;
mod response;
mod service;
mod transport;

pub use body::{BODY_CHUNK_SIZE, ProgressCallback, RequestBody};
pub use builder::ApiClientBuilder;
pub use client::{ApiClient, BufferedService, ServiceFuture};
pub use config::{
    ConfigError, DEFAULT_MAX_BODY_SIZE, DEFAULT_RETRY_DRAIN_LIMIT, DEFAULT_USER_AGENT,
    ENV_PREFIX, ExponentialBackoff, NetworkConfig, RetryConfig, RetryTrigger, humantime_serde,
};
pub use connectivity::{AssumeOnline, Connectivity, ConnectivityCheck, Offline, TcpProbe};
pub use envelope::{ApiResponse, ErrorDetail, Metadata};
pub use error::{ApiError, ErrorKind, FieldErrors, HttpError};
pub use layers::{
    AuthLayer, AuthService, Credentials, HttpTokenRefresher, LoggingLayer, LoggingService,
    RETRY_ATTEMPT_HEADER, RedactedHeaders, RetryAttempts, RetryLayer, RetryService, SecretString,
    TokenPair, TokenRefresher, TokenStore, WIRE_TARGET, calculate_backoff,
};
pub use multipart::{FilePart, MultipartForm};
pub use request::{RequestBuilder, RequestContext};
pub use response::{ERROR_BODY_LIMIT, HttpResponse, LimitedBody, ResponseBody};
pub use service::{BaseApiService, execute_request};
pub use transport::{RedirectPolicy, TransportService, build_transport};
