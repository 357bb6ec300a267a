use crate::body::{ProgressCallback, RequestBody};
use crate::builder::{ApiClientBuilder, build_state};
use crate::config::{ConfigError, NetworkConfig};
use crate::connectivity::{Connectivity, ConnectivityCheck};
use crate::error::{ApiError, HttpError};
use crate::layers::{SecretString, TokenRefresher, TokenStore};
use crate::multipart::{FilePart, MultipartForm};
use crate::request::{RequestBuilder, RequestContext, with_cancel};
use crate::response::{HttpResponse, ResponseBody, classify};
use arc_swap::ArcSwap;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tower::buffer::Buffer;
use tower::{Service, ServiceExt};
use url::Url;

/// Type alias for the future type of the inner service
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

/// Type alias for the buffered service
/// Buffer<Req, F> in tower 0.5 where Req is the request type and F is the service future type
pub type BufferedService = Buffer<Request<RequestBody>, ServiceFuture>;

/// Config snapshot, default headers and the layer stack built from the config
///
/// Swapped as a whole on [`ApiClient::reconfigure`] and on default header
/// changes; in-flight requests keep the snapshot they started with.
#[derive(Clone)]
pub(crate) struct ClientState {
    pub(crate) config: Arc<NetworkConfig>,
    pub(crate) base_url: Url,
    pub(crate) default_headers: Arc<HeaderMap>,
    pub(crate) service: BufferedService,
}

impl ClientState {
    fn with_default_headers(&self, headers: HeaderMap) -> Self {
        Self {
            default_headers: Arc::new(headers),
            ..self.clone()
        }
    }
}

struct Shared {
    state: ArcSwap<ClientState>,
    tokens: Arc<TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    connectivity: Arc<dyn ConnectivityCheck>,
}

/// HTTP API client facade
///
/// Resolves paths against the configured base URL, merges default headers,
/// injects the bearer token, retries transient failures and classifies every
/// failure into an [`ApiError`].
///
/// # Thread Safety
///
/// `ApiClient` is `Clone + Send + Sync`. Clones share the layer stack, the
/// token store and the default headers.
///
/// # Example
///
/// ```ignore
/// let client = ApiClient::builder(NetworkConfig::new("https://api.example.com/v1"))
///     .build()?;
/// client.set_auth_token("eyJhbGciOi...");
///
/// let users: Vec<User> = client
///     .get("/users")
///     .query(&[("page", "2")])
///     .send_json()
///     .await?;
/// ```
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.inner.state.load().base_url.as_str())
            .field("tokens", &self.inner.tokens)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a client with default settings for `config`
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the config is invalid or TLS initialization fails
    pub fn new(config: NetworkConfig) -> Result<Self, ConfigError> {
        ApiClientBuilder::new(config).build()
    }

    #[must_use]
    pub fn builder(config: NetworkConfig) -> ApiClientBuilder {
        ApiClientBuilder::new(config)
    }

    pub(crate) fn from_parts(
        state: ClientState,
        tokens: Arc<TokenStore>,
        refresher: Option<Arc<dyn TokenRefresher>>,
        connectivity: Arc<dyn ConnectivityCheck>,
    ) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: ArcSwap::from_pointee(state),
                tokens,
                refresher,
                connectivity,
            }),
        }
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Request builder for any method
    ///
    /// `path` is resolved against the base URL unless it is an absolute
    /// `http://` or `https://` URL.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, path)
    }

    /// Send a prepared request
    ///
    /// The connectivity check runs first; an offline result fails with
    /// `Connection` without touching the transport. Non-2xx/3xx responses
    /// are classified into the matching [`ApiError`] variant.
    ///
    /// # Errors
    /// See [`ApiError`] for the classification.
    pub async fn execute(&self, context: &RequestContext) -> Result<HttpResponse, ApiError> {
        with_cancel(context.cancel_token.as_ref(), self.dispatch(context)).await
    }

    async fn dispatch(&self, context: &RequestContext) -> Result<HttpResponse, ApiError> {
        let state = self.inner.state.load_full();
        let url = context.resolve_url(&state.base_url)?;

        if self.inner.connectivity.check(&url).await == Connectivity::Offline {
            tracing::debug!(url = %url, "target unreachable; request not sent");
            return Err(ApiError::connection("No internet connection"));
        }

        let uri: http::Uri = url.as_str().parse().map_err(|e: http::uri::InvalidUri| {
            HttpError::InvalidUrl {
                url: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut headers = HeaderMap::clone(&state.default_headers);
        headers.extend(context.headers.clone());

        let mut request = Request::builder()
            .method(context.method.clone())
            .uri(uri)
            .body(context.body.clone())
            .map_err(HttpError::from)?;
        *request.headers_mut() = headers;
        request.extensions_mut().insert(context.attempts.clone());

        let mut service = state.service.clone();
        let response = service
            .ready()
            .await
            .map_err(map_buffer_error)?
            .call(request)
            .await
            .map_err(map_buffer_error)?;

        classify(response, state.config.max_body_size).await
    }

    /// Upload a file as `multipart/form-data` with optional text fields
    ///
    /// Returns the server's confirmation message: the `message` field of a
    /// JSON reply when present, the raw reply text otherwise. Use
    /// [`RequestBuilder::multipart`] for cancellation or custom headers.
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute).
    pub async fn upload_file(
        &self,
        path: &str,
        file: FilePart,
        fields: &[(&str, &str)],
        on_progress: Option<ProgressCallback>,
    ) -> Result<String, ApiError> {
        let form = fields
            .iter()
            .fold(MultipartForm::new(), |form, (name, value)| {
                form.text(*name, *value)
            })
            .file(file);

        let mut request = self.post(path).multipart(&form);
        if let Some(progress) = on_progress {
            request = request.on_upload_progress(progress);
        }
        let body = request.send().await?.bytes().await?;
        Ok(confirmation_message(&body))
    }

    /// Download `url` into `destination`, streaming the body to disk
    ///
    /// Progress is reported as `(bytes_received, content_length)`. Use
    /// [`RequestBuilder::download_to`] for cancellation or custom headers.
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute), plus `Unknown` for local I/O failures.
    pub async fn download_file(
        &self,
        url: &str,
        destination: impl AsRef<Path>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), ApiError> {
        self.get(url).download_to(destination, on_progress).await
    }

    /// Store an access token; it is sent as `Authorization: Bearer <token>`
    pub fn set_auth_token(&self, token: impl Into<String>) {
        self.inner.tokens.set_token(SecretString::new(token));
    }

    /// Store an access token together with the refresh token used on 401
    pub fn set_tokens(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        self.inner.tokens.set_tokens(
            SecretString::new(access_token),
            Some(SecretString::new(refresh_token)),
        );
    }

    pub fn clear_auth_token(&self) {
        self.inner.tokens.clear();
    }

    #[must_use]
    pub fn has_auth_token(&self) -> bool {
        self.inner.tokens.has_token()
    }

    #[must_use]
    pub fn token_store(&self) -> &Arc<TokenStore> {
        &self.inner.tokens
    }

    /// Add or replace a header sent on every request
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidHeader`] for an invalid name or value.
    pub fn set_default_header(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidHeader {
            name: name.to_owned(),
            reason,
        };
        let header_name = HeaderName::try_from(name).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::try_from(value).map_err(|e| invalid(e.to_string()))?;

        self.inner.state.rcu(|current| {
            let mut next = HeaderMap::clone(&current.default_headers);
            next.insert(header_name.clone(), header_value.clone());
            current.with_default_headers(next)
        });
        Ok(())
    }

    /// Stop sending a default header; unknown names are ignored
    pub fn remove_default_header(&self, name: &str) {
        let Ok(header_name) = HeaderName::try_from(name) else {
            return;
        };
        self.inner.state.rcu(|current| {
            let mut next = HeaderMap::clone(&current.default_headers);
            next.remove(&header_name);
            current.with_default_headers(next)
        });
    }

    #[must_use]
    pub fn default_headers(&self) -> HeaderMap {
        HeaderMap::clone(&self.inner.state.load().default_headers)
    }

    /// Current config snapshot
    #[must_use]
    pub fn config(&self) -> Arc<NetworkConfig> {
        self.inner.state.load().config.clone()
    }

    /// Rebuild the layer stack from a new config
    ///
    /// Requests already in flight finish on the old stack. Default headers
    /// are reset to the ones in `config`; stored tokens are kept. When called
    /// concurrently the last call wins.
    ///
    /// # Errors
    /// Returns an error if the config is invalid; the current config stays active.
    pub fn reconfigure(&self, config: NetworkConfig) -> Result<(), ConfigError> {
        let state = build_state(config, &self.inner.tokens, self.inner.refresher.clone())?;

        tracing::info!(base_url = %state.base_url, "api client reconfigured");
        self.inner.state.store(Arc::new(state));
        Ok(())
    }
}

/// `message` field of a JSON reply (top level or under `data`), else the text
fn confirmation_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("data").and_then(|d| d.get("message")))
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned)
        })
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_owned())
}

/// Map buffer errors to `HttpError`
///
/// Buffer hands back the inner service error boxed, or its own error if the
/// worker has shut down.
pub(crate) fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            HttpError::ServiceClosed
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::connectivity::{AssumeOnline, Offline};
    use crate::error::ErrorKind;
    use httpmock::prelude::*;
    use serde_json::json;

    fn test_client(server: &MockServer) -> ApiClient {
        let mut config = NetworkConfig::new(server.base_url());
        config.retry = RetryConfig::disabled();
        ApiClient::builder(config)
            .connectivity(Arc::new(AssumeOnline))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_resolves_path_against_base_url() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/users").query_param("page", "2");
            then.status(200).json_body(json!([{"id": 1}, {"id": 2}]));
        });

        let client = test_client(&server);
        let users: Vec<serde_json::Value> = client
            .get("users")
            .query(&[("page", "2")])
            .send_json()
            .await
            .unwrap();

        assert_eq!(users.len(), 2);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_post_json_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/items")
                .header("content-type", "application/json")
                .json_body(json!({"name": "widget"}));
            then.status(201).json_body(json!({"id": 7}));
        });

        let client = test_client(&server);
        let created: serde_json::Value = client
            .post("/items")
            .json(&json!({"name": "widget"}))
            .send_json()
            .await
            .unwrap();

        assert_eq!(created["id"], 7);
        mock.assert();
    }

    #[tokio::test]
    async fn test_default_headers_sent_and_overridable() {
        let server = MockServer::start();
        let default_mock = server.mock(|when, then| {
            when.path("/default")
                .header("accept", "application/json")
                .header("x-client", "mobile");
            then.status(200);
        });
        let override_mock = server.mock(|when, then| {
            when.path("/override").header("accept", "text/csv");
            then.status(200);
        });

        let client = test_client(&server);
        client.set_default_header("X-Client", "mobile").unwrap();

        client.get("/default").send().await.unwrap();
        client
            .get("/override")
            .header("Accept", "text/csv")
            .send()
            .await
            .unwrap();

        assert_eq!(default_mock.calls(), 1);
        assert_eq!(override_mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_remove_default_header() {
        let server = MockServer::start();
        let client = test_client(&server);

        client.set_default_header("X-Tenant", "acme").unwrap();
        assert!(client.default_headers().contains_key("x-tenant"));

        client.remove_default_header("X-Tenant");
        assert!(!client.default_headers().contains_key("x-tenant"));
    }

    #[tokio::test]
    async fn test_set_default_header_rejects_invalid_name() {
        let server = MockServer::start();
        let client = test_client(&server);

        let err = client.set_default_header("bad header", "x").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidHeader { .. }));
    }

    #[tokio::test]
    async fn test_auth_token_injected() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/me").header("authorization", "Bearer abc123");
            then.status(200).json_body(json!({"id": 1}));
        });

        let client = test_client(&server);
        client.set_auth_token("abc123");
        assert!(client.has_auth_token());

        client.get("/me").send().await.unwrap();
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_client_error() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/missing");
            then.status(404).json_body(json!({"message": "No such item"}));
        });

        let client = test_client(&server);
        let err = client.get("/missing").send().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Client);
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.message(), "No such item");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_redirect_status_is_success() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.path("/not-modified");
            then.status(304);
        });

        let client = test_client(&server);
        let resp = client.get("/not-modified").send().await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn test_offline_check_skips_transport() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/ping");
            then.status(200);
        });

        let client = ApiClient::builder(NetworkConfig::new(server.base_url()))
            .connectivity(Arc::new(Offline))
            .build()
            .unwrap();
        let err = client.get("/ping").send().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_reconfigure_switches_base_url() {
        let first = MockServer::start();
        let second = MockServer::start();
        let first_mock = first.mock(|when, then| {
            when.path("/status");
            then.status(200);
        });
        let second_mock = second.mock(|when, then| {
            when.path("/status");
            then.status(200);
        });

        let client = test_client(&first);
        client.get("/status").send().await.unwrap();

        client
            .reconfigure(NetworkConfig::new(second.base_url()))
            .unwrap();
        client.get("/status").send().await.unwrap();

        assert_eq!(first_mock.calls(), 1);
        assert_eq!(second_mock.calls(), 1);
        assert_eq!(client.config().base_url, second.base_url());
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_config() {
        let server = MockServer::start();
        let client = test_client(&server);

        let err = client
            .reconfigure(NetworkConfig::new("not a url"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBaseUrl { .. }));
        assert_eq!(client.config().base_url, server.base_url());
    }

    #[tokio::test]
    async fn test_reconfigure_swaps_base_url_and_default_headers_together() {
        let blue = MockServer::start();
        let green = MockServer::start();
        let blue_ok = blue.mock(|when, then| {
            when.path("/ping").header("x-env", "blue");
            then.status(200);
        });
        let blue_mixed = blue.mock(|when, then| {
            when.path("/ping").header("x-env", "green");
            then.status(500);
        });
        let green_ok = green.mock(|when, then| {
            when.path("/ping").header("x-env", "green");
            then.status(200);
        });
        let green_mixed = green.mock(|when, then| {
            when.path("/ping").header("x-env", "blue");
            then.status(500);
        });

        let config_for = |server: &MockServer, env: &str| {
            let mut config = NetworkConfig::new(server.base_url());
            config.retry = RetryConfig::disabled();
            config
                .default_headers
                .insert("x-env".to_owned(), env.to_owned());
            config
        };
        let client = ApiClient::builder(config_for(&blue, "blue"))
            .connectivity(Arc::new(AssumeOnline))
            .build()
            .unwrap();

        let switcher = {
            let client = client.clone();
            let configs = [config_for(&green, "green"), config_for(&blue, "blue")];
            tokio::spawn(async move {
                for i in 0..40 {
                    client.reconfigure(configs[i % 2].clone()).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let requests: Vec<_> = (0..40)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.get("/ping").send().await })
            })
            .collect();
        for request in requests {
            request.await.unwrap().unwrap();
        }
        switcher.await.unwrap();

        assert_eq!(blue_mixed.calls(), 0);
        assert_eq!(green_mixed.calls(), 0);
        assert_eq!(blue_ok.calls() + green_ok.calls(), 40);
    }

    #[tokio::test]
    async fn test_default_header_change_keeps_current_config() {
        let server = MockServer::start();
        let client = test_client(&server);
        let before = client.config();

        client.set_default_header("X-Tenant", "acme").unwrap();

        assert!(Arc::ptr_eq(&before, &client.config()));
        assert_eq!(client.default_headers().get("x-tenant").unwrap(), "acme");
    }

    #[tokio::test]
    async fn test_execute_reports_retry_count() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/flaky");
            then.status(503);
        });

        let mut config = NetworkConfig::new(server.base_url());
        config.retry = RetryConfig {
            max_retries: 2,
            backoff: crate::config::ExponentialBackoff::fast(),
            ..RetryConfig::default()
        };
        let client = ApiClient::builder(config)
            .connectivity(Arc::new(AssumeOnline))
            .build()
            .unwrap();

        let context = client.get("/flaky").build().unwrap();
        let err = client.execute(&context).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Server);
        assert_eq!(context.attempts.get(), 2);
        assert_eq!(mock.calls(), 3);
    }

    #[tokio::test]
    async fn test_upload_file_returns_confirmation() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/upload")
                .header_exists("content-type")
                .body_includes("name=\"caption\"")
                .body_includes("filename=\"notes.txt\"");
            then.status(200)
                .json_body(json!({"message": "Upload complete"}));
        });

        let client = test_client(&server);
        let progress = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = progress.clone();

        let message = client
            .upload_file(
                "/upload",
                FilePart::new("file", "notes.txt", "hello world"),
                &[("caption", "my notes")],
                Some(Arc::new(move |sent, total| {
                    sink.lock().unwrap().push((sent, total));
                })),
            )
            .await
            .unwrap();

        assert_eq!(message, "Upload complete");
        assert_eq!(mock.calls(), 1);
        let progress = progress.lock().unwrap();
        let (sent, total) = *progress.last().unwrap();
        assert_eq!(Some(sent), total);
    }

    #[tokio::test]
    async fn test_download_file_writes_destination() {
        let server = MockServer::start();
        let payload = vec![7u8; 200_000];
        let _m = server.mock(|when, then| {
            when.path("/files/blob.bin");
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(payload.clone());
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob.bin");
        let client = test_client(&server);
        let last = Arc::new(std::sync::Mutex::new((0u64, None)));
        let sink = last.clone();

        client
            .download_file(
                &server.url("/files/blob.bin"),
                &dest,
                Some(Arc::new(move |received, total| {
                    *sink.lock().unwrap() = (received, total);
                })),
            )
            .await
            .unwrap();

        let written = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(written, payload);
        assert_eq!(*last.lock().unwrap(), (200_000, Some(200_000)));
        assert!(!dir.path().join("blob.bin.part").exists());
    }

    #[tokio::test]
    async fn test_failed_download_leaves_no_file() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.path("/files/gone");
            then.status(404);
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("gone.bin");
        let client = test_client(&server);

        let err = client
            .download_file("/files/gone", &dest, None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Client);
        assert!(!dest.exists());
        assert!(!dir.path().join("gone.bin.part").exists());
    }

    #[test]
    fn test_confirmation_message_sources() {
        assert_eq!(confirmation_message(br#"{"message":"ok"}"#), "ok");
        assert_eq!(confirmation_message(br#"{"data":{"message":"stored"}}"#), "stored");
        assert_eq!(confirmation_message(b"Saved\n"), "Saved");
    }

    #[test]
    fn test_api_client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ApiClient>();
    }

    #[test]
    fn test_map_buffer_error_passes_through_http_error() {
        let http_err = HttpError::Timeout(std::time::Duration::from_secs(10));
        let boxed: tower::BoxError = Box::new(http_err);
        let result = map_buffer_error(boxed);

        assert!(
            matches!(result, HttpError::Timeout(_)),
            "Should pass through HttpError::Timeout, got: {result:?}"
        );
    }

    #[test]
    fn test_map_buffer_error_returns_service_closed_for_unknown_error() {
        let other_err: tower::BoxError = Box::new(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "simulated buffer closed",
        ));
        let result = map_buffer_error(other_err);

        assert!(matches!(result, HttpError::ServiceClosed));
    }
}
