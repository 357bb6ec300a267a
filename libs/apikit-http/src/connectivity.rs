//! Pre-flight reachability checks
//!
//! Every facade call asks a [`ConnectivityCheck`] first; an `Offline` answer
//! fails the call with a `Connection` error before the transport is touched.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Decides whether a request to `target` should be attempted at all
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn check(&self, target: &Url) -> Connectivity;
}

/// Treats every target as reachable
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeOnline;

#[async_trait]
impl ConnectivityCheck for AssumeOnline {
    async fn check(&self, _target: &Url) -> Connectivity {
        Connectivity::Online
    }
}

/// Treats every target as unreachable
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

#[async_trait]
impl ConnectivityCheck for Offline {
    async fn check(&self, _target: &Url) -> Connectivity {
        Connectivity::Offline
    }
}

/// Opens (and immediately drops) a TCP connection to the target host
///
/// Answers whether the network path to the host works, not whether the host
/// accepts connections: a refused or reset connection still proves the host
/// was reached and reports `Online`, leaving the failure to the transport
/// (where it is retry-eligible). Resolution failures, unreachable networks
/// and timeouts report `Offline`.
///
/// The probe connection is separate from the pooled transport connections.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl ConnectivityCheck for TcpProbe {
    async fn check(&self, target: &Url) -> Connectivity {
        let (Some(host), Some(port)) = (target.host_str(), target.port_or_known_default()) else {
            return Connectivity::Offline;
        };
        // IPv6 literals come back bracketed from host_str()
        let host = host.trim_start_matches('[').trim_end_matches(']');

        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Connectivity::Online,
            Ok(Err(e)) if host_answered(&e) => {
                tracing::debug!(host, port, error = %e, "host reachable but not accepting");
                Connectivity::Online
            }
            Ok(Err(e)) => {
                tracing::debug!(host, port, error = %e, "connectivity probe failed");
                Connectivity::Offline
            }
            Err(_) => {
                tracing::debug!(host, port, "connectivity probe timed out");
                Connectivity::Offline
            }
        }
    }
}

fn host_answered(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_fixed_checks() {
        let url = Url::parse("https://example.com").unwrap();
        assert_eq!(AssumeOnline.check(&url).await, Connectivity::Online);
        assert_eq!(Offline.check(&url).await, Connectivity::Offline);
    }

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = Url::parse(&format!("http://127.0.0.1:{port}/health")).unwrap();

        assert_eq!(TcpProbe::default().check(&url).await, Connectivity::Online);
    }

    #[tokio::test]
    async fn test_refused_port_counts_as_online() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let url = Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap();

        assert_eq!(TcpProbe::default().check(&url).await, Connectivity::Online);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_offline() {
        let url = Url::parse("http://apikit-unresolvable.invalid/").unwrap();
        assert_eq!(TcpProbe::default().check(&url).await, Connectivity::Offline);
    }

    #[test]
    fn test_host_answered_kinds() {
        use std::io::Error;
        assert!(host_answered(&Error::from(ErrorKind::ConnectionRefused)));
        assert!(host_answered(&Error::from(ErrorKind::ConnectionReset)));
        assert!(!host_answered(&Error::from(ErrorKind::TimedOut)));
        assert!(!host_answered(&Error::other("failed to lookup address")));
    }

    #[tokio::test]
    async fn test_tcp_probe_requires_host() {
        let url = Url::parse("data:text/plain,hello").unwrap();
        assert_eq!(TcpProbe::default().check(&url).await, Connectivity::Offline);
    }
}
