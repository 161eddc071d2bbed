//! HTTP Client
//!
//! Uses hyper with tokio for HTTP/1.1 over plain TCP or rustls.
//! Features:
//! - One connection per request (no pooling; probes and control calls are rare)
//! - Automatic HTTPS with rustls (memory-safe TLS, webpki roots)
//! - Whole-request timeout
//! - Raw connection handshakes for callers that stream bodies (the forwarder)
//!
//! Requests sent through [`HttpClient::request`] carry no body; the only
//! callers are IP lookups and control surface queries.

use http_body_util::{BodyExt, Empty, Limited};
use hyper::body::{Body, Bytes};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{HeaderMap, HeaderValue, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole-request timeout (connect + headers + body)
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: format!("anchor/{}", env!("CARGO_PKG_VERSION")),
            max_body_size: 1024 * 1024, // 1 MB
        }
    }
}

/// Fully buffered response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Body, capped at `max_body_size`
    pub body: Vec<u8>,
    /// Connect to last body byte
    pub elapsed: Duration,
}

impl Response {
    /// 2xx
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as UTF-8
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }
}

/// Client statistics
#[derive(Debug, Default)]
struct ClientStats {
    requests_made: AtomicU64,
    requests_failed: AtomicU64,
    bytes_received: AtomicU64,
}

/// Minimal HTTP/1.1 client
#[derive(Clone)]
pub struct HttpClient {
    /// Configuration
    config: HttpClientConfig,
    /// Shared TLS connector (root store is built once)
    tls: TlsConnector,
    /// Statistics
    stats: Arc<ClientStats>,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!(
            "HTTP client initialized (timeout: {:?}, connect timeout: {:?})",
            config.timeout, config.connect_timeout
        );

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
            stats: Arc::new(ClientStats::default()),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Client configuration
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// GET `url`
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.request(Method::GET, url).await
    }

    /// Bodiless request, bounded by the configured timeout
    pub async fn request(&self, method: Method, url: &str) -> Result<Response, HttpError> {
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(self.config.timeout, self.send(method, url))
            .await
            .unwrap_or(Err(HttpError::Timeout(self.config.timeout)));

        if result.is_err() {
            self.stats.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn send(&self, method: Method, url: &str) -> Result<Response, HttpError> {
        let started = Instant::now();

        let uri: Uri = url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;
        let host = uri
            .host()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?;
        let is_https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") | None => false,
            Some(other) => return Err(HttpError::InvalidUrl(format!("Unsupported scheme: {}", other))),
        };
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let host_header = match uri.port_u16() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };

        let request = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(USER_AGENT, &self.config.user_agent)
            .header(HOST, host_header)
            .body(Empty::<Bytes>::new())
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        let mut sender = self.handshake::<Empty<Bytes>>(host, port, is_https).await?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        let status = response.status();
        let headers = response.headers().clone();

        let collected = Limited::new(response.into_body(), self.config.max_body_size)
            .collect()
            .await
            .map_err(|e| HttpError::BodyError(e.to_string()))?;
        let body = collected.to_bytes().to_vec();
        let elapsed = started.elapsed();

        self.stats
            .bytes_received
            .fetch_add(body.len() as u64, Ordering::Relaxed);
        debug!("{} {} -> {} ({} bytes in {:?})", method, url, status, body.len(), elapsed);

        Ok(Response {
            status,
            headers,
            body,
            elapsed,
        })
    }

    /// Open a dedicated HTTP/1.1 connection to `host:port`
    ///
    /// The connection driver runs on its own task and ends when the
    /// returned sender is dropped.
    pub async fn handshake<B>(
        &self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> Result<SendRequest<B>, HttpError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| HttpError::ConnectionFailed(format!("connect to {} timed out", addr)))?
            .map_err(|e| HttpError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        if tls {
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;
            let tls_stream = self
                .tls
                .connect(server_name, stream)
                .await
                .map_err(|e| HttpError::TlsError(e.to_string()))?;
            drive(tls_stream).await
        } else {
            drive(stream).await
        }
    }

    /// (requests, failures, body bytes received)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.requests_failed.load(Ordering::Relaxed),
            self.stats.bytes_received.load(Ordering::Relaxed),
        )
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Run the HTTP/1.1 handshake over `io` and spawn the connection driver
async fn drive<I, B>(io: I) -> Result<SendRequest<B>, HttpError>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| HttpError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection error: {}", e);
        }
    });

    Ok(sender)
}

/// Header value for an IP or host string
pub(crate) fn header_value(value: &str) -> Result<HeaderValue, HttpError> {
    HeaderValue::from_str(value).map_err(|e| HttpError::HttpError(e.to_string()))
}
