use http::header::{HeaderMap, HeaderName};
use http::{Request, Response};
use http_body::Body;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tracing target for request/response records
pub const WIRE_TARGET: &str = "apikit_http::wire";

const REDACTED: &str = "[REDACTED]";

/// Tower layer that records every request, response and error at `debug`
///
/// Read-only: the request and response pass through untouched. Header names
/// in the redaction set are masked case-insensitively.
#[derive(Clone, Debug)]
pub struct LoggingLayer {
    redacted: Arc<[HeaderName]>,
}

impl LoggingLayer {
    /// Create a layer masking the given header names
    ///
    /// Names that are not valid header names are ignored.
    pub fn new<I, N>(redacted: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        let redacted = redacted
            .into_iter()
            .filter_map(|name| HeaderName::try_from(name.as_ref().to_ascii_lowercase()).ok())
            .collect();
        Self { redacted }
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService {
            inner,
            redacted: self.redacted.clone(),
        }
    }
}

/// Service created by [`LoggingLayer`]
#[derive(Clone, Debug)]
pub struct LoggingService<S> {
    inner: S,
    redacted: Arc<[HeaderName]>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for LoggingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: fmt::Display,
    ReqBody: Body + Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let method = req.method().clone();
        let uri = req.uri().clone();

        tracing::debug!(
            target: WIRE_TARGET,
            method = %method,
            url = %uri,
            headers = ?RedactedHeaders::new(req.headers(), &self.redacted),
            body_len = ?req.body().size_hint().exact(),
            "request"
        );

        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let redacted = self.redacted.clone();
        let started = tokio::time::Instant::now();

        Box::pin(async move {
            let result = inner.call(req).await;
            let elapsed_ms = started.elapsed().as_millis();
            match &result {
                Ok(resp) => tracing::debug!(
                    target: WIRE_TARGET,
                    method = %method,
                    url = %uri,
                    status = resp.status().as_u16(),
                    elapsed_ms,
                    headers = ?RedactedHeaders::new(resp.headers(), &redacted),
                    "response"
                ),
                Err(err) => tracing::debug!(
                    target: WIRE_TARGET,
                    method = %method,
                    url = %uri,
                    elapsed_ms,
                    error = %err,
                    "request failed"
                ),
            }
            result
        })
    }
}

/// Debug view of a header map with sensitive values masked
pub struct RedactedHeaders<'a> {
    headers: &'a HeaderMap,
    redacted: &'a [HeaderName],
}

impl<'a> RedactedHeaders<'a> {
    #[must_use]
    pub fn new(headers: &'a HeaderMap, redacted: &'a [HeaderName]) -> Self {
        Self { headers, redacted }
    }
}

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.headers {
            // HeaderName is always stored lowercase
            if self.redacted.contains(name) || value.is_sensitive() {
                map.entry(&name.as_str(), &REDACTED);
            } else {
                map.entry(&name.as_str(), &String::from_utf8_lossy(value.as_bytes()));
            }
        }
        map.finish()
    }
}
