use crate::body::RequestBody;
use crate::config::{ExponentialBackoff, RetryConfig, RetryTrigger};
use crate::error::HttpError;
use crate::response::ResponseBody;
use http::{HeaderValue, Request, Response};
use http_body_util::BodyExt;
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service, ServiceExt};

/// Header name for retry attempt number (1-indexed).
/// Added to retried requests to indicate which retry attempt this is.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Retry counter of one logical request
///
/// Placed in the request extensions by the caller; [`RetryService`] adds one
/// per retry it performs. Clones share the counter, so a request replayed
/// after a token refresh keeps counting from where the first pass stopped.
#[derive(Clone, Debug, Default)]
pub struct RetryAttempts(Arc<AtomicUsize>);

impl RetryAttempts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries performed so far (0 while the first attempt is in flight)
    #[must_use]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn record_retry(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Tower layer that implements retry with exponential backoff
///
/// Retries transport failures, timeouts, and responses whose status code is
/// in the configured set. 401 and other 4xx responses pass straight through.
#[derive(Clone, Debug)]
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service that implements retry logic with exponential backoff
///
/// Each attempt is a fresh call into the inner service with a copy of the
/// original request. When retries are exhausted the last response or error
/// is returned unchanged: `Ok(Response)` for HTTP statuses, `Err` for
/// transport and timeout failures.
#[derive(Clone, Debug)]
pub struct RetryService<S> {
    inner: S,
    config: RetryConfig,
}

impl<S> Service<Request<RequestBody>> for RetryService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = S::Response;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        let (parts, body) = req.into_parts();
        let attempts = parts.extensions.get::<RetryAttempts>().cloned();
        let parts = Arc::new(parts);

        Box::pin(async move {
            let method = parts.method.clone();
            let url_host = parts
                .uri
                .authority()
                .map_or_else(|| "unknown".to_owned(), ToString::to_string);

            let mut attempt = 0usize;
            loop {
                let mut req = Request::from_parts((*parts).clone(), body.clone());
                if attempt > 0 {
                    if let Ok(value) = HeaderValue::try_from(attempt.to_string()) {
                        req.headers_mut().insert(RETRY_ATTEMPT_HEADER, value);
                    }
                    if let Some(attempts) = &attempts {
                        attempts.record_retry();
                    }
                }

                let mut svc = inner.clone();
                svc.ready().await?;

                let exhausted = attempt >= config.max_retries;
                match svc.call(req).await {
                    Ok(resp) => {
                        let status_code = resp.status().as_u16();
                        let trigger = RetryTrigger::Status(status_code);
                        if exhausted || !config.should_retry(trigger) {
                            return Ok(resp);
                        }

                        let backoff = calculate_backoff(&config.backoff, attempt);
                        drain_before_retry(resp, config.drain_limit).await;

                        tracing::debug!(
                            retry = attempt + 1,
                            max_retries = config.max_retries,
                            status = status_code,
                            method = %method,
                            host = %url_host,
                            backoff_ms = backoff.as_millis(),
                            "Retrying request after status code"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Err(err) => {
                        let trigger = get_retry_trigger(&err);
                        if exhausted || !config.should_retry(trigger) {
                            return Err(err);
                        }

                        let backoff = calculate_backoff(&config.backoff, attempt);
                        tracing::debug!(
                            retry = attempt + 1,
                            max_retries = config.max_retries,
                            error = %err,
                            trigger = ?trigger,
                            method = %method,
                            host = %url_host,
                            backoff_ms = backoff.as_millis(),
                            "Retrying request after error"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
                attempt += 1;
            }
        })
    }
}

/// Drain a discarded response body so the connection can be reused
///
/// Skipped when `Content-Length` already exceeds the limit; stops early once
/// `limit` decompressed bytes were read.
async fn drain_before_retry(response: Response<ResponseBody>, limit: usize) {
    let declared = response
        .headers()
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        tracing::trace!(content_length = ?declared, limit, "Skipping drain: body exceeds limit");
        return;
    }

    let mut body = std::pin::pin!(response.into_body());
    let mut drained = 0usize;
    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Some(chunk) = frame.data_ref() {
                    drained += chunk.len();
                    if drained >= limit {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    error = %e,
                    "Failed to drain response body before retry; connection may not be reused"
                );
                break;
            }
        }
    }
}

/// Extract retry trigger from an error
fn get_retry_trigger(err: &HttpError) -> RetryTrigger {
    match err {
        HttpError::ConnectTimeout(_) => RetryTrigger::ConnectTimeout,
        HttpError::Timeout(_) => RetryTrigger::ReceiveTimeout,
        HttpError::Connect(_) | HttpError::Transport(_) => RetryTrigger::ConnectionError,
        _ => RetryTrigger::NonRetryable,
    }
}

/// Calculate backoff duration for a given attempt (0-indexed)
///
/// `base_delay * multiplier^attempt`, capped at `max_delay`. Non-finite or
/// negative inputs are sanitized instead of panicking.
#[must_use]
pub fn calculate_backoff(backoff: &ExponentialBackoff, attempt: usize) -> Duration {
    // Anything beyond a day is not a meaningful retry delay
    const MAX_BACKOFF_SECS: f64 = 86400.0;

    let attempt_i32 = i32::try_from(attempt).unwrap_or(i32::MAX);

    let multiplier = if backoff.multiplier.is_finite() && backoff.multiplier >= 0.0 {
        backoff.multiplier
    } else {
        1.0
    };

    let base_secs = backoff.base_delay.as_secs_f64();
    let max_secs = backoff.max_delay.as_secs_f64().min(MAX_BACKOFF_SECS);

    let raw = base_secs * multiplier.powi(attempt_i32);
    let clamped = if raw.is_finite() {
        raw.min(max_secs).max(0.0)
    } else {
        max_secs
    };
    let duration = Duration::from_secs_f64(clamped);

    let duration = if backoff.jitter {
        let jitter_factor = rand::rng().random_range(0.0..=0.25);
        duration + duration.mul_f64(jitter_factor)
    } else {
        duration
    };

    duration.min(Duration::from_secs_f64(max_secs))
}
