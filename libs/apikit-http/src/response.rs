use crate::error::{ApiError, HttpError};
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body::Frame;
use http_body_util::BodyExt;
use pin_project_lite::pin_project;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Maximum number of error-body bytes read to extract a message or field errors
pub const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// Type alias for the boxed response body that supports decompression.
///
/// This type can hold either a raw body or a decompressed body (gzip/br/deflate).
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

pin_project! {
    /// Body wrapper that enforces size limits during streaming.
    ///
    /// Tracks bytes read and returns [`HttpError::BodyTooLarge`] once the
    /// limit is exceeded.
    pub struct LimitedBody {
        #[pin]
        inner: ResponseBody,
        limit: usize,
        read: usize,
    }
}

impl LimitedBody {
    #[must_use]
    pub fn new(inner: ResponseBody, limit: usize) -> Self {
        Self {
            inner,
            limit,
            read: 0,
        }
    }

    /// Returns the number of bytes read so far.
    #[must_use]
    pub fn bytes_read(&self) -> usize {
        self.read
    }
}

impl http_body::Body for LimitedBody {
    type Data = Bytes;
    type Error = HttpError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();

        match this.inner.poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    *this.read += data.len();
                    if *this.read > *this.limit {
                        return Poll::Ready(Some(Err(HttpError::BodyTooLarge {
                            limit: *this.limit,
                            actual: *this.read,
                        })));
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(HttpError::Transport(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Successful (2xx/3xx) HTTP response with body-reading helpers
///
/// All body reads enforce the configured `max_body_size` limit on
/// decompressed bytes.
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) max_body_size: usize,
}

impl HttpResponse {
    pub(crate) fn new(inner: Response<ResponseBody>, max_body_size: usize) -> Self {
        Self {
            inner,
            max_body_size,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Value of `Content-Length`, if present and valid
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.inner
            .headers()
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    /// Read the body as bytes
    ///
    /// # Errors
    /// Returns an `Unknown` error if the body exceeds `max_body_size`, or a
    /// `Connection` error if the transport fails mid-body.
    pub async fn bytes(self) -> Result<Bytes, ApiError> {
        Ok(read_body_limited(self.inner, self.max_body_size).await?)
    }

    /// Decode the body as JSON
    ///
    /// An empty body decodes as JSON `null`, so `()` and `Option<T>` work for
    /// `204 No Content`.
    ///
    /// # Errors
    /// Returns an `Unknown` error if the body cannot be decoded.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let body = read_body_limited(self.inner, self.max_body_size).await?;
        decode_json(&body)
    }

    /// Read the body as UTF-8 text (lossy)
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes).
    pub async fn text(self) -> Result<String, ApiError> {
        let body = read_body_limited(self.inner, self.max_body_size).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Returns the body as a size-limited stream.
    #[must_use]
    pub fn into_limited_body(self) -> LimitedBody {
        LimitedBody::new(self.inner.into_body(), self.max_body_size)
    }

    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }
}

pub(crate) fn decode_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::from(HttpError::Json(e)))
}

/// Turn a raw response into an [`HttpResponse`] or a classified [`ApiError`]
///
/// 2xx and 3xx pass through. For anything else up to [`ERROR_BODY_LIMIT`]
/// bytes of the body are read to extract the server message and validation
/// field errors.
pub(crate) async fn classify(
    response: Response<ResponseBody>,
    max_body_size: usize,
) -> Result<HttpResponse, ApiError> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        return Ok(HttpResponse::new(response, max_body_size));
    }

    let body = match read_body_limited(response, max_body_size.min(ERROR_BODY_LIMIT)).await {
        Ok(bytes) => bytes,
        Err(HttpError::BodyTooLarge { .. }) => Bytes::new(),
        Err(e) => {
            tracing::debug!(status = status.as_u16(), error = %e, "failed to read error body");
            Bytes::new()
        }
    };

    Err(ApiError::from_status(status, &body))
}

/// Read the (decompressed) body, failing once more than `limit` bytes arrive
pub(crate) async fn read_body_limited(
    response: Response<ResponseBody>,
    limit: usize,
) -> Result<Bytes, HttpError> {
    let (_parts, body) = response.into_parts();

    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(HttpError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}
