use crate::body::{ProgressCallback, RequestBody};
use crate::client::ApiClient;
use crate::error::{ApiError, HttpError};
use crate::layers::RetryAttempts;
use crate::multipart::MultipartForm;
use crate::response::HttpResponse;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;
use http_body_util::BodyExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Everything needed to issue one logical request
///
/// The retry counter is shared with the layer stack while the request runs,
/// so `attempts.get()` reports how many retries were made once it completes.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Path relative to the base URL, or an absolute `http(s)://` URL
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Per-request overrides; replace default headers with the same name
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub cancel_token: Option<CancellationToken>,
    pub attempts: RetryAttempts,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::empty(),
            cancel_token: None,
            attempts: RetryAttempts::new(),
        }
    }

    /// Resolve `path` and `query` against `base`
    ///
    /// # Errors
    /// Returns [`HttpError::InvalidUrl`] if the result is not a valid URL.
    pub fn resolve_url(&self, base: &Url) -> Result<Url, HttpError> {
        let joined = if self.path.starts_with("http://") || self.path.starts_with("https://") {
            self.path.clone()
        } else {
            format!(
                "{}/{}",
                base.as_str().trim_end_matches('/'),
                self.path.trim_start_matches('/')
            )
        };
        let mut url = Url::parse(&joined).map_err(|e| HttpError::InvalidUrl {
            url: joined.clone(),
            reason: e.to_string(),
        })?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }
        Ok(url)
    }
}

/// Fluent request builder
///
/// Created by [`ApiClient::get`], [`ApiClient::post`], etc. Errors from
/// header or body encoding are deferred and reported when the request is
/// sent.
#[must_use = "RequestBuilder does nothing until it is sent"]
pub struct RequestBuilder {
    client: ApiClient,
    context: RequestContext,
    error: Option<HttpError>,
}

impl RequestBuilder {
    pub(crate) fn new(client: ApiClient, method: Method, path: &str) -> Self {
        Self {
            client,
            context: RequestContext::new(method, path),
            error: None,
        }
    }

    /// Append query parameters from any `Serialize` value (struct, map, pairs)
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_urlencoded::to_string(query) {
            Ok(encoded) => {
                self.context.query.extend(
                    url::form_urlencoded::parse(encoded.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned())),
                );
            }
            Err(e) => self.error = Some(HttpError::QueryEncode(e)),
        }
        self
    }

    /// Add a header, replacing any default header with the same name
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.context.headers.append(name, value);
            }
            (Err(e), _) => self.error = Some(HttpError::InvalidHeaderName(e)),
            (_, Err(e)) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Add several headers
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// Serialize `body` as the JSON payload
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        if self.error.is_some() {
            return self;
        }
        match serde_json::to_vec(body) {
            Ok(bytes) => {
                self.context.body = RequestBody::new(bytes);
                self.context.headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
            }
            Err(e) => self.error = Some(HttpError::Json(e)),
        }
        self
    }

    /// Raw body with an explicit content type
    pub fn body(mut self, body: impl Into<Bytes>, content_type: &str) -> Self {
        self.context.body = RequestBody::new(body.into());
        match HeaderValue::try_from(content_type) {
            Ok(value) => {
                self.context.headers.insert(CONTENT_TYPE, value);
            }
            Err(e) => self.error = Some(HttpError::InvalidHeaderValue(e)),
        }
        self
    }

    /// Encoded `multipart/form-data` body
    pub fn multipart(self, form: &MultipartForm) -> Self {
        let content_type = form.content_type();
        self.body(form.encode(), &content_type)
    }

    /// Report request body progress as `(bytes_sent, total_bytes)`
    pub fn on_upload_progress(mut self, progress: ProgressCallback) -> Self {
        self.context.body = std::mem::take(&mut self.context.body).with_progress(progress);
        self
    }

    /// Abort the request (including retry backoff) when `token` is cancelled
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.context.cancel_token = Some(token);
        self
    }

    /// Finish building without sending
    ///
    /// # Errors
    /// Returns the first deferred header or body encoding error.
    pub fn build(self) -> Result<RequestContext, ApiError> {
        match self.error {
            Some(e) => Err(e.into()),
            None => Ok(self.context),
        }
    }

    /// Send the request
    ///
    /// # Errors
    /// Returns a classified [`ApiError`] for non-2xx/3xx statuses, transport
    /// failures, failed connectivity checks and cancellation.
    pub async fn send(self) -> Result<HttpResponse, ApiError> {
        let client = self.client.clone();
        let context = self.build()?;
        client.execute(&context).await
    }

    /// Send the request and decode the JSON response body
    ///
    /// # Errors
    /// Same as [`send`](Self::send), plus `Unknown` for undecodable bodies.
    pub async fn send_json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let cancel = self.context.cancel_token.clone();
        with_cancel(cancel.as_ref(), async move { self.send().await?.json().await }).await
    }

    /// Send the request and return the response body as text
    ///
    /// # Errors
    /// Same as [`send`](Self::send).
    pub async fn send_text(self) -> Result<String, ApiError> {
        let cancel = self.context.cancel_token.clone();
        with_cancel(cancel.as_ref(), async move { self.send().await?.text().await }).await
    }

    /// Stream the response body into `destination`
    ///
    /// Data is written to `<destination>.part` and renamed once complete, so
    /// a failed or cancelled download never leaves a truncated file behind.
    ///
    /// # Errors
    /// Same as [`send`](Self::send), plus `Unknown` for local I/O failures.
    pub async fn download_to(
        self,
        destination: impl AsRef<Path>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), ApiError> {
        let destination = destination.as_ref().to_path_buf();
        let partial = partial_path(&destination);
        let cancel = self.context.cancel_token.clone();

        let result = with_cancel(cancel.as_ref(), async {
            let resp = self.send().await?;
            let total = resp.content_length();

            let mut file = tokio::fs::File::create(&partial)
                .await
                .map_err(HttpError::Io)?;
            let mut body = std::pin::pin!(resp.into_inner().into_body());
            let mut received = 0u64;

            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(HttpError::Transport)?;
                if let Ok(chunk) = frame.into_data() {
                    file.write_all(&chunk).await.map_err(HttpError::Io)?;
                    received += chunk.len() as u64;
                    if let Some(progress) = &on_progress {
                        progress(received, total);
                    }
                }
            }
            file.flush().await.map_err(HttpError::Io)?;
            drop(file);

            tokio::fs::rename(&partial, &destination)
                .await
                .map_err(HttpError::Io)?;
            Ok(())
        })
        .await;

        if result.is_err() {
            // Nothing to clean up if the request failed before the file was created
            let _ = tokio::fs::remove_file(&partial).await;
        }
        result
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Run `fut`, resolving to `Cancelled` as soon as `token` fires
pub(crate) async fn with_cancel<T, F>(
    token: Option<&CancellationToken>,
    fut: F,
) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    match token {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                () = token.cancelled() => Err(ApiError::cancelled()),
                result = fut => result,
            }
        }
    }
}
