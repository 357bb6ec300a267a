use crate::client::{ApiClient, BufferedService, ClientState, map_buffer_error};
use crate::config::{ConfigError, NetworkConfig, RetryConfig};
use crate::connectivity::{ConnectivityCheck, TcpProbe};
use crate::layers::{
    AuthLayer, HttpTokenRefresher, LoggingLayer, RetryLayer, TokenRefresher, TokenStore,
};
use crate::request::RequestContext;
use crate::transport::{TransportService, build_transport};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::Buffer;
use tower::{ServiceBuilder, ServiceExt};
use url::Url;

/// Builder for constructing an [`ApiClient`] with a layered tower middleware stack.
pub struct ApiClientBuilder {
    config: NetworkConfig,
    connectivity: Option<Arc<dyn ConnectivityCheck>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    tokens: Option<Arc<TokenStore>>,
}

impl ApiClientBuilder {
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            connectivity: None,
            refresher: None,
            tokens: None,
        }
    }

    /// Set the TCP/TLS connect timeout (per attempt)
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the time allowed for the response head (per attempt)
    #[must_use]
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a header sent on every request
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into(), value.into());
        self
    }

    /// Toggle request/response logging (only effective in debug builds)
    #[must_use]
    pub fn enable_logging(mut self, enabled: bool) -> Self {
        self.config.enable_logging = enabled;
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Enable refresh-on-401 against `path`, relative to the base URL
    #[must_use]
    pub fn token_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.config.token_refresh_path = Some(path.into());
        self
    }

    /// Replace the default [`TcpProbe`] reachability check
    #[must_use]
    pub fn connectivity(mut self, check: Arc<dyn ConnectivityCheck>) -> Self {
        self.connectivity = Some(check);
        self
    }

    /// Use a custom refresher instead of POSTing to `token_refresh_path`
    #[must_use]
    pub fn token_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Share a token store with other clients
    #[must_use]
    pub fn token_store(mut self, tokens: Arc<TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Build the client
    ///
    /// Must be called from within a Tokio runtime (the request buffer spawns
    /// its worker task).
    ///
    /// # Errors
    /// Returns an error if the config is invalid or TLS initialization fails
    pub fn build(self) -> Result<ApiClient, ConfigError> {
        let tokens = self.tokens.unwrap_or_default();
        let connectivity = self
            .connectivity
            .unwrap_or_else(|| {
                Arc::new(TcpProbe::new(self.config.connect_timeout)) as Arc<dyn ConnectivityCheck>
            });

        let state = build_state(self.config, &tokens, self.refresher.clone())?;
        tracing::debug!(base_url = %state.base_url, "api client initialized");

        Ok(ApiClient::from_parts(
            state,
            tokens,
            self.refresher,
            connectivity,
        ))
    }
}

/// Validate `config` and assemble the layer stack for it
///
/// Request flow (outer → inner):
///   Buffer → Logging (debug builds) → Auth → Retry →
///   Timeout → User-Agent → Decompression → FollowRedirect → hyper client
///
/// Auth sits outside retry: a 401 is never retried, only replayed once after
/// a refresh. The refresh call itself goes through its own buffer over the
/// retry stage, so it cannot recurse into auth.
pub(crate) fn build_state(
    config: NetworkConfig,
    tokens: &Arc<TokenStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
) -> Result<ClientState, ConfigError> {
    config.validate()?;
    let base_url = Url::parse(&config.base_url).map_err(|e| ConfigError::InvalidBaseUrl {
        url: config.base_url.clone(),
        reason: e.to_string(),
    })?;
    let default_headers = config.header_map()?;
    let buffer_capacity = config.buffer_capacity.max(1);

    let transport = build_transport(&config)?;
    let retried: TransportService = ServiceBuilder::new()
        .layer(RetryLayer::new(config.retry.clone()))
        .service(transport)
        .boxed_clone();

    let refresher = match (refresher, config.token_refresh_path.as_deref()) {
        (Some(custom), _) => Some(custom),
        (None, Some(path)) => {
            let url = refresh_uri(&base_url, path)?;
            let buffered: BufferedService = Buffer::new(retried.clone(), buffer_capacity);
            let service = buffered.map_err(map_buffer_error);
            Some(Arc::new(HttpTokenRefresher::new(service, url)) as Arc<dyn TokenRefresher>)
        }
        (None, None) => None,
    };

    let mut service: TransportService = ServiceBuilder::new()
        .layer(AuthLayer::new(tokens.clone(), refresher))
        .service(retried)
        .boxed_clone();

    if config.enable_logging && cfg!(debug_assertions) {
        service = ServiceBuilder::new()
            .layer(LoggingLayer::new(&config.redacted_headers))
            .service(service)
            .boxed_clone();
    }

    let service: BufferedService = Buffer::new(service, buffer_capacity);

    Ok(ClientState {
        config: Arc::new(config),
        base_url,
        default_headers: Arc::new(default_headers),
        service,
    })
}

fn refresh_uri(base_url: &Url, path: &str) -> Result<http::Uri, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidBaseUrl {
        url: path.to_owned(),
        reason,
    };
    let url = RequestContext::new(Method::POST, path)
        .resolve_url(base_url)
        .map_err(|e| invalid(e.to_string()))?;
    url.as_str()
        .parse::<http::Uri>()
        .map_err(|e| invalid(e.to_string()))
}
