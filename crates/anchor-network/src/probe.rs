//! Egress IP Probe
//!
//! Asks public "what is my IP" services which address the outside world
//! sees for this host. Services are tried in order and the first parseable
//! answer wins; the whole sweep shares one deadline, so a probe never blocks
//! longer than the timeout it was given no matter how many services are
//! configured.

use crate::client::{HttpClient, HttpClientConfig};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default whole-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Plain-text lookup services, in preference order
pub const DEFAULT_PROBE_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://icanhazip.com",
    "https://ifconfig.me/ip",
    "https://checkip.amazonaws.com",
];

/// Probe failures
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("egress probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("all egress IP services failed (last error: {0})")]
    AllServicesFailed(String),

    #[error("no egress IP services configured")]
    NoServices,
}

/// Source of the current egress IP
#[async_trait]
pub trait EgressProbe: Send + Sync {
    /// Current egress IP, or an error if no answer arrived within `timeout`
    async fn probe(&self, timeout: Duration) -> Result<IpAddr, NetworkError>;
}

/// Probe backed by HTTP lookup services
pub struct HttpEgressProbe {
    client: HttpClient,
    services: Vec<String>,
}

impl HttpEgressProbe {
    /// Probe using the default public services
    pub fn new() -> Self {
        Self::with_services(DEFAULT_PROBE_SERVICES.iter().map(|s| s.to_string()).collect())
    }

    /// Probe using a custom service list
    pub fn with_services(services: Vec<String>) -> Self {
        let client = HttpClient::new(HttpClientConfig {
            timeout: DEFAULT_PROBE_TIMEOUT,
            connect_timeout: DEFAULT_PROBE_TIMEOUT,
            max_body_size: 4 * 1024,
            ..HttpClientConfig::default()
        });
        Self { client, services }
    }

    /// Configured services
    pub fn services(&self) -> &[String] {
        &self.services
    }

    async fn sweep(&self) -> Result<IpAddr, NetworkError> {
        let mut last_error = None;

        for service in &self.services {
            match self.client.get(service).await {
                Ok(resp) if resp.is_success() => match parse_ip(&resp.body) {
                    Some(ip) => {
                        debug!("Egress IP {} via {}", ip, service);
                        return Ok(ip);
                    }
                    None => last_error = Some(format!("{}: unparseable body", service)),
                },
                Ok(resp) => last_error = Some(format!("{}: status {}", service, resp.status)),
                Err(e) => last_error = Some(format!("{}: {}", service, e)),
            }
        }

        match last_error {
            Some(e) => Err(NetworkError::AllServicesFailed(e)),
            None => Err(NetworkError::NoServices),
        }
    }
}

impl Default for HttpEgressProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EgressProbe for HttpEgressProbe {
    async fn probe(&self, timeout: Duration) -> Result<IpAddr, NetworkError> {
        tokio::time::timeout(timeout, self.sweep())
            .await
            .unwrap_or(Err(NetworkError::Timeout(timeout)))
    }
}

/// Parse a lookup service body ("203.0.113.7\n")
fn parse_ip(body: &[u8]) -> Option<IpAddr> {
    std::str::from_utf8(body).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn stub_service(status: StatusCode, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(move |_req: hyper::Request<hyper::body::Incoming>| async move {
                        let mut resp = hyper::Response::new(Full::new(Bytes::from(body)));
                        *resp.status_mut() = status;
                        Ok::<_, Infallible>(resp)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{}/", addr)
    }

    async fn silent_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        format!("http://{}/", addr)
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip(b"203.0.113.7\n"), Some("203.0.113.7".parse().unwrap()));
        assert_eq!(parse_ip(b"  2001:db8::1 "), Some("2001:db8::1".parse().unwrap()));
        assert_eq!(parse_ip(b"<html>nope</html>"), None);
    }

    #[test]
    fn test_default_services() {
        let probe = HttpEgressProbe::new();
        assert_eq!(probe.services().len(), DEFAULT_PROBE_SERVICES.len());
    }

    #[tokio::test]
    async fn test_falls_through_to_working_service() {
        let broken = stub_service(StatusCode::INTERNAL_SERVER_ERROR, "oops").await;
        let garbage = stub_service(StatusCode::OK, "not an ip").await;
        let good = stub_service(StatusCode::OK, "198.51.100.20\n").await;

        let probe = HttpEgressProbe::with_services(vec![broken, garbage, good]);
        let ip = probe.probe(Duration::from_secs(5)).await.unwrap();

        assert_eq!(ip, "198.51.100.20".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_all_services_failed() {
        let broken = stub_service(StatusCode::BAD_GATEWAY, "").await;
        let probe = HttpEgressProbe::with_services(vec![broken]);

        let result = probe.probe(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(NetworkError::AllServicesFailed(_))));
    }

    #[tokio::test]
    async fn test_no_services() {
        let probe = HttpEgressProbe::with_services(Vec::new());
        let result = probe.probe(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(NetworkError::NoServices)));
    }

    #[tokio::test]
    async fn test_timeout_bounds_whole_sweep() {
        let slow_a = silent_service().await;
        let slow_b = silent_service().await;
        let probe = HttpEgressProbe::with_services(vec![slow_a, slow_b]);

        let started = Instant::now();
        let result = probe.probe(Duration::from_millis(300)).await;

        assert!(matches!(result, Err(NetworkError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
