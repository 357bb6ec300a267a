//! Tower layers for the client middleware stack
//!
//! ## Available Layers
//!
//! - [`LoggingLayer`] - Request/response/error records with header redaction
//! - [`AuthLayer`] - Bearer token injection and refresh-on-401
//! - [`RetryLayer`] - Retry with exponential backoff and jitter

mod auth;
mod logging;
mod retry;

pub use auth::{
    AuthLayer, AuthService, Credentials, HttpTokenRefresher, SecretString, TokenPair,
    TokenRefresher, TokenStore,
};
pub use logging::{LoggingLayer, LoggingService, RedactedHeaders, WIRE_TARGET};
pub use retry::{
    RETRY_ATTEMPT_HEADER, RetryAttempts, RetryLayer, RetryService, calculate_backoff,
};
