use crate::body::RequestBody;
use crate::error::HttpError;
use crate::response::{ERROR_BODY_LIMIT, ResponseBody, read_body_limited};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Opaque wrapper around a secret string value.
///
/// `Debug` and `Display` both print `[REDACTED]`. The backing buffer is
/// zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read-only access to the secret. Do not log or persist the result.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Clone for SecretString {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Access token plus optional refresh token
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
}

/// Snapshot of the stored credentials
///
/// `generation` changes on every store, which lets a request that got a 401
/// tell whether someone else already refreshed the token it used.
#[derive(Debug)]
pub struct Credentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    generation: u64,
}

impl Credentials {
    fn bearer(&self) -> Result<HeaderValue, HttpError> {
        let raw = zeroize::Zeroizing::new(format!("Bearer {}", self.access_token.expose()));
        let mut value = HeaderValue::from_str(&raw)?;
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Shared, lock-free holder of the current auth tokens
///
/// Reads never block. Refreshes are serialized so concurrent 401s trigger a
/// single refresh.
#[derive(Default)]
pub struct TokenStore {
    current: ArcSwapOption<Credentials>,
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("has_token", &self.has_token())
            .field("has_refresh_token", &self.has_refresh_token())
            .finish()
    }
}

impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the access token, keeping no refresh token
    pub fn set_token(&self, access_token: SecretString) {
        self.store(access_token, None);
    }

    /// Replace both tokens
    pub fn set_tokens(&self, access_token: SecretString, refresh_token: Option<SecretString>) {
        self.store(access_token, refresh_token);
    }

    pub fn clear(&self) {
        self.current.store(None);
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Credentials>> {
        self.current.load_full()
    }

    #[must_use]
    pub fn has_token(&self) -> bool {
        self.current.load().is_some()
    }

    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        self.current
            .load()
            .as_ref()
            .is_some_and(|c| c.refresh_token.is_some())
    }

    fn store(
        &self,
        access_token: SecretString,
        refresh_token: Option<SecretString>,
    ) -> Arc<Credentials> {
        let credentials = Arc::new(Credentials {
            access_token,
            refresh_token,
            generation: self.generation.fetch_add(1, Ordering::Relaxed) + 1,
        });
        self.current.store(Some(credentials.clone()));
        credentials
    }

    /// Obtain credentials to replay a request that was rejected with 401
    ///
    /// `used` is the generation the rejected request was sent with. If the
    /// store has moved on since, the current credentials are returned without
    /// refreshing. Otherwise the refresh token is exchanged once; on failure
    /// all tokens are cleared and `None` is returned.
    pub async fn refresh_after_unauthorized(
        &self,
        used: u64,
        refresher: &dyn TokenRefresher,
    ) -> Option<Arc<Credentials>> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current.load_full()?;
        if current.generation != used {
            return Some(current);
        }
        let refresh_token = current.refresh_token.as_ref()?;

        match refresher.refresh(refresh_token).await {
            Ok(pair) => {
                let refresh_token = pair.refresh_token.or_else(|| current.refresh_token.clone());
                tracing::debug!("access token refreshed");
                Some(self.store(pair.access_token, refresh_token))
            }
            Err(err) => {
                tracing::warn!(error = %err, "token refresh failed; clearing stored tokens");
                self.clear();
                None
            }
        }
    }
}

/// Exchanges a refresh token for a new token pair
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// # Errors
    /// Any error makes the store drop its tokens and surface the original 401.
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenPair, HttpError>;
}

/// Tower layer that injects `Authorization: Bearer <token>` and handles 401
///
/// When a response is 401 and both a refresh token and a [`TokenRefresher`]
/// are available, the request is replayed once with refreshed credentials.
/// Requests that already carry an `Authorization` header are left alone.
#[derive(Clone)]
pub struct AuthLayer {
    store: Arc<TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(store: Arc<TokenStore>, refresher: Option<Arc<dyn TokenRefresher>>) -> Self {
        Self { store, refresher }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            store: self.store.clone(),
            refresher: self.refresher.clone(),
        }
    }
}

/// Service created by [`AuthLayer`]
#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    store: Arc<TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
}

impl<S> Service<Request<RequestBody>> for AuthService<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = HttpError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<RequestBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if req.headers().contains_key(AUTHORIZATION) {
            return Box::pin(inner.call(req));
        }

        let credentials = self.store.current();
        let (parts, body) = req.into_parts();

        // Keep a copy only when a replay can actually happen
        let replay = match (&credentials, &self.refresher) {
            (Some(creds), Some(refresher)) if creds.refresh_token.is_some() => Some((
                parts.clone(),
                body.clone(),
                creds.generation,
                refresher.clone(),
            )),
            _ => None,
        };

        let mut req = Request::from_parts(parts, body);
        if let Some(creds) = &credentials {
            match creds.bearer() {
                Ok(value) => {
                    req.headers_mut().insert(AUTHORIZATION, value);
                }
                Err(e) => return Box::pin(async move { Err(e) }),
            }
        }
        let store = self.store.clone();

        Box::pin(async move {
            let resp = inner.call(req).await?;
            if resp.status() != StatusCode::UNAUTHORIZED {
                return Ok(resp);
            }
            let Some((parts, body, used, refresher)) = replay else {
                return Ok(resp);
            };
            let Some(fresh) = store
                .refresh_after_unauthorized(used, refresher.as_ref())
                .await
            else {
                return Ok(resp);
            };
            drop(resp);

            let mut retry = Request::from_parts(parts, body);
            retry.headers_mut().insert(AUTHORIZATION, fresh.bearer()?);
            inner.ready().await?.call(retry).await
        })
    }
}

/// Token refresher that POSTs the refresh token to an endpoint
///
/// Request body: `{"refresh_token": "<token>"}`. The reply must carry
/// `access_token` (or `accessToken`), optionally `refresh_token` (or
/// `refreshToken`), either at the top level or under `data`.
///
/// The service handed in must sit below the auth stage so a refresh call can
/// never trigger another refresh.
pub struct HttpTokenRefresher<S> {
    service: S,
    url: http::Uri,
}

impl<S> HttpTokenRefresher<S> {
    pub fn new(service: S, url: http::Uri) -> Self {
        Self { service, url }
    }
}

#[derive(Deserialize)]
struct RefreshReply {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(default, alias = "refreshToken")]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshEnvelope {
    Flat(RefreshReply),
    Wrapped { data: RefreshReply },
}

#[async_trait]
impl<S> TokenRefresher for HttpTokenRefresher<S>
where
    S: Service<Request<RequestBody>, Response = Response<ResponseBody>, Error = HttpError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenPair, HttpError> {
        let payload = zeroize::Zeroizing::new(serde_json::to_vec(&serde_json::json!({
            "refresh_token": refresh_token.expose(),
        }))?);
        let req = Request::builder()
            .method(Method::POST)
            .uri(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .body(RequestBody::new(payload.to_vec()))?;

        let resp = self.service.clone().oneshot(req).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(HttpError::TokenRefresh(format!(
                "refresh endpoint returned {status}"
            )));
        }

        let body = read_body_limited(resp, ERROR_BODY_LIMIT).await?;
        let reply = match serde_json::from_slice::<RefreshEnvelope>(&body) {
            Ok(RefreshEnvelope::Flat(reply) | RefreshEnvelope::Wrapped { data: reply }) => reply,
            Err(_) => {
                return Err(HttpError::TokenRefresh(
                    "refresh reply does not contain an access token".to_owned(),
                ));
            }
        };

        Ok(TokenPair {
            access_token: SecretString::new(reply.access_token),
            refresh_token: reply.refresh_token.map(SecretString::new),
        })
    }
}
