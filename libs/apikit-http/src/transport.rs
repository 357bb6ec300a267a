//! Bottom of the layer stack: hyper client, TLS, timeouts, decompression and redirects

use crate::body::RequestBody;
use crate::config::{ConfigError, NetworkConfig};
use crate::error::HttpError;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Request, Response, Uri};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::Arc;
use std::time::Duration;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};
use tower_http::set_header::SetRequestHeaderLayer;

/// Type-erased service between layer composition steps
pub type TransportService =
    BoxCloneService<Request<RequestBody>, Response<ResponseBody>, HttpError>;

/// Headers removed when a redirect leaves the original origin
const CREDENTIAL_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Build the transport service for one configuration snapshot
///
/// Request flow (outer to inner):
///   Timeout(receive) -> User-Agent -> Decompression -> FollowRedirect -> hyper client
///
/// The connect timeout is enforced by the connector; the receive timeout
/// bounds each attempt until the response head arrives.
///
/// # Errors
/// Returns [`ConfigError::Tls`] if the TLS connector cannot be initialized,
/// or [`ConfigError::InvalidHeader`] for an unusable User-Agent.
pub fn build_transport(config: &NetworkConfig) -> Result<TransportService, ConfigError> {
    let https = build_https_connector(config.connect_timeout)?;

    let mut client_builder = Client::builder(TokioExecutor::new());
    client_builder.pool_timer(TokioTimer::new());
    let hyper_client = client_builder.build::<_, RequestBody>(https);

    let user_agent =
        HeaderValue::from_str(&config.user_agent).map_err(|e| ConfigError::InvalidHeader {
            name: header::USER_AGENT.to_string(),
            reason: e.to_string(),
        })?;

    let receive_timeout = config.receive_timeout;
    let connect_timeout = config.connect_timeout;

    let service = ServiceBuilder::new()
        .layer(TimeoutLayer::new(receive_timeout))
        .layer(SetRequestHeaderLayer::if_not_present(
            header::USER_AGENT,
            user_agent,
        ))
        .layer(DecompressionLayer::new())
        .layer(FollowRedirectLayer::with_policy(RedirectPolicy::new(
            config.max_redirects,
        )))
        .service(hyper_client)
        .map_response(map_decompression_response)
        .map_err(move |e: tower::BoxError| map_tower_error(e, receive_timeout, connect_timeout));

    Ok(service.boxed_clone())
}

fn build_https_connector(
    connect_timeout: Duration,
) -> Result<HttpsConnector<HttpConnector>, ConfigError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(Some(connect_timeout));

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(crypto_provider())
        .map_err(|e| ConfigError::Tls(Box::new(e)))?
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(http);
    Ok(connector)
}

/// Use the process-wide rustls provider when one is installed, aws-lc-rs otherwise
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    let boxed_body: ResponseBody = body.map_err(Into::into).boxed();
    Response::from_parts(parts, boxed_body)
}

/// Map tower errors to `HttpError`, telling connect failures from transport ones
fn map_tower_error(
    err: tower::BoxError,
    receive_timeout: Duration,
    connect_timeout: Duration,
) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(receive_timeout);
    }

    match err.downcast::<hyper_util::client::legacy::Error>() {
        Ok(client_err) if client_err.is_connect() => {
            if is_timed_out(&*client_err) {
                HttpError::ConnectTimeout(connect_timeout)
            } else {
                HttpError::Connect(client_err)
            }
        }
        Ok(client_err) => HttpError::Transport(client_err),
        Err(other) => match other.downcast::<HttpError>() {
            Ok(http_err) => *http_err,
            Err(other) => HttpError::Transport(other),
        },
    }
}

/// Whether any error in the source chain is an I/O timeout
fn is_timed_out(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::TimedOut)
        {
            return true;
        }
        current = e.source();
    }
    false
}

/// Redirect policy: bounded hop count, credentials dropped on cross-origin hops
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    max_redirects: usize,
    followed: usize,
    cross_origin: bool,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(max_redirects: usize) -> Self {
        Self {
            max_redirects,
            followed: 0,
            cross_origin: false,
        }
    }
}

fn origin(uri: &Uri) -> (Option<&str>, Option<&str>, Option<u16>) {
    let scheme = uri.scheme_str();
    let port = uri.port_u16().or(match scheme {
        Some("http") => Some(80),
        Some("https") => Some(443),
        _ => None,
    });
    (scheme, uri.host(), port)
}

impl<E> Policy<RequestBody, E> for RedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        self.followed += 1;
        if self.followed > self.max_redirects {
            tracing::debug!(max = self.max_redirects, "Redirect limit reached");
            return Ok(Action::Stop);
        }
        if origin(attempt.previous()) != origin(attempt.location()) {
            self.cross_origin = true;
        }
        Ok(Action::Follow)
    }

    fn on_request(&mut self, request: &mut Request<RequestBody>) {
        if self.cross_origin {
            let headers = request.headers_mut();
            for name in CREDENTIAL_HEADERS {
                headers.remove(name);
            }
        }
    }

    fn clone_body(&self, body: &RequestBody) -> Option<RequestBody> {
        Some(body.clone())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::fmt;

    fn test_config(base_url: &str) -> NetworkConfig {
        NetworkConfig {
            receive_timeout: Duration::from_millis(300),
            connect_timeout: Duration::from_millis(300),
            ..NetworkConfig::new(base_url)
        }
    }

    fn get(url: &str) -> Request<RequestBody> {
        Request::builder()
            .uri(url)
            .body(RequestBody::empty())
            .unwrap()
    }

    fn gzip_compress(data: &[u8]) -> Vec<u8> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[derive(Debug)]
    struct Wrapper(std::io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "tcp connect error")
        }
    }

    impl std::error::Error for Wrapper {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_is_timed_out_walks_source_chain() {
        let nested = Wrapper(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"));
        assert!(is_timed_out(&nested));

        let refused = Wrapper(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(!is_timed_out(&refused));
    }

    #[test]
    fn test_map_tower_error_passes_through_http_error() {
        let err: tower::BoxError = Box::new(HttpError::ServiceClosed);
        let mapped = map_tower_error(err, Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(mapped, HttpError::ServiceClosed));
    }

    #[test]
    fn test_map_tower_error_wraps_unknown_as_transport() {
        let err: tower::BoxError = Box::new(std::io::Error::other("weird"));
        let mapped = map_tower_error(err, Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(mapped, HttpError::Transport(_)));
    }

    #[test]
    fn test_redirect_policy_origin_comparison() {
        let a: Uri = "http://example.com/a".parse().unwrap();
        let b: Uri = "http://example.com:80/b".parse().unwrap();
        let c: Uri = "https://example.com/c".parse().unwrap();
        assert_eq!(origin(&a), origin(&b));
        assert_ne!(origin(&a), origin(&c));
    }

    #[tokio::test]
    async fn test_transport_sends_user_agent_and_decompresses() {
        let server = MockServer::start();
        let original = br#"{"name":"compressed"}"#;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/gzip")
                .header("user-agent", crate::config::DEFAULT_USER_AGENT)
                .header_exists("accept-encoding");
            then.status(200)
                .header("content-encoding", "gzip")
                .body(gzip_compress(original));
        });

        let transport = build_transport(&test_config(&server.base_url())).unwrap();
        let resp = transport
            .oneshot(get(&server.url("/gzip")))
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), original);
        mock.assert();
    }

    #[tokio::test]
    async fn test_transport_follows_redirects() {
        let server = MockServer::start();
        let _old = server.mock(|when, then| {
            when.method(GET).path("/old");
            then.status(302).header("location", "/new");
        });
        let new = server.mock(|when, then| {
            when.method(GET).path("/new");
            then.status(200).body("moved");
        });

        let transport = build_transport(&test_config(&server.base_url())).unwrap();
        let resp = transport.oneshot(get(&server.url("/old"))).await.unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(new.calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_receive_timeout() {
        let server = MockServer::start();
        let _slow = server.mock(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_secs(2));
        });

        let transport = build_transport(&test_config(&server.base_url())).unwrap();
        let err = transport
            .oneshot(get(&server.url("/slow")))
            .await
            .unwrap_err();

        assert!(matches!(err, HttpError::Timeout(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_transport_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = format!("http://127.0.0.1:{port}/");

        let transport = build_transport(&test_config(&url)).unwrap();
        let err = transport.oneshot(get(&url)).await.unwrap_err();

        assert!(matches!(err, HttpError::Connect(_)), "got {err:?}");
    }
}
