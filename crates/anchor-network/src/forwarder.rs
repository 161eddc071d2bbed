//! Proxy Forwarder
//!
//! Local HTTP listener that relays requests to the exchange while the
//! coordinator is in Proxy mode.
//!
//! # Flow
//!
//! ```text
//! client → forwarder (127.0.0.1:8080) → rewrite headers → api.binance.com:443
//! ```
//!
//! # Behaviour
//!
//! - Always listening once started; relays only while the shared mode is
//!   Proxy, otherwise answers 503
//! - Upstream picked by path: anything mentioning `testnet` goes to the
//!   testnet host, everything else to production
//! - `X-Forwarded-For`, `X-Real-IP`, `X-Client-IP` and `CF-Connecting-IP`
//!   are overwritten with the target IP; all other headers pass through
//! - Upstream status, headers and body are streamed back untouched
//! - 30s upstream timeout (504); any other upstream failure is a 500
//!
//! # Limitation
//!
//! Rewriting forwarding headers does not change the source address of the
//! TCP/TLS connection the exchange sees. Only servers that trust these
//! headers from this hop will observe the target IP.

use crate::client::{header_value, HttpClient, HttpClientConfig, HttpError};
use crate::mode::ModeCell;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONTENT_TYPE, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Upstream request timeout
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers overwritten with the target IP
pub const FORWARDED_HEADERS: [&str; 4] = [
    "x-forwarded-for",
    "x-real-ip",
    "x-client-ip",
    "cf-connecting-ip",
];

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Exchange host the forwarder relays to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// Hostname (also used for SNI)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Wrap the connection in TLS
    pub tls: bool,
}

impl Upstream {
    /// TLS upstream on port 443
    pub fn https(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 443,
            tls: true,
        }
    }

    /// Plain-HTTP upstream (local stubs)
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Value for the Host header
    pub fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Production / testnet upstream pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRoutes {
    pub production: Upstream,
    pub testnet: Upstream,
}

impl Default for UpstreamRoutes {
    fn default() -> Self {
        Self {
            production: Upstream::https("api.binance.com"),
            testnet: Upstream::https("testnet.binance.vision"),
        }
    }
}

impl UpstreamRoutes {
    /// Pick the upstream for a request path
    pub fn select(&self, path: &str) -> &Upstream {
        if path.contains("testnet") {
            &self.testnet
        } else {
            &self.production
        }
    }
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Listen address
    pub listen_addr: SocketAddr,
    /// IP injected into forwarding headers
    pub target_ip: IpAddr,
    /// Upstream hosts
    pub routes: UpstreamRoutes,
    /// Upstream timeout (connect + response headers)
    pub upstream_timeout: Duration,
    /// Maximum concurrent client connections
    pub max_connections: usize,
}

impl ForwarderConfig {
    /// Configuration with default routes and limits
    pub fn new(listen_addr: SocketAddr, target_ip: IpAddr) -> Self {
        Self {
            listen_addr,
            target_ip,
            routes: UpstreamRoutes::default(),
            upstream_timeout: UPSTREAM_TIMEOUT,
            max_connections: 256,
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        )
    }
}

/// Forwarder errors
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct ForwardContext {
    config: ForwarderConfig,
    mode: ModeCell,
    client: HttpClient,
}

/// Header-rewriting forward proxy
pub struct ProxyForwarder {
    config: ForwarderConfig,
    mode: ModeCell,
}

impl ProxyForwarder {
    /// Create a forwarder gated on `mode`
    pub fn new(config: ForwarderConfig, mode: ModeCell) -> Self {
        Self { config, mode }
    }

    /// Bind the listener and start accepting connections
    pub async fn start(self) -> Result<ForwarderHandle, ForwarderError> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ForwarderError::Bind {
                addr,
                message: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Proxy forwarder listening on {} (production: {}, testnet: {})",
            local_addr, self.config.routes.production, self.config.routes.testnet
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));
        let client = HttpClient::new(HttpClientConfig {
            timeout: self.config.upstream_timeout,
            ..HttpClientConfig::default()
        });
        let ctx = Arc::new(ForwardContext {
            config: self.config,
            mode: self.mode,
            client,
        });
        let active = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            ctx,
            semaphore,
            active.clone(),
            shutdown_rx,
        ));

        Ok(ForwarderHandle {
            local_addr,
            shutdown_tx,
            task,
            active,
        })
    }
}

/// Running forwarder
pub struct ForwarderHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    active: Arc<AtomicU64>,
}

impl ForwarderHandle {
    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open client connections
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Close the listener and abort open connections
    pub async fn stop(self) {
        info!("Stopping proxy forwarder on {}", self.local_addr);
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Forwarder task ended abnormally: {}", e);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ForwardContext>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    warn!("Connection limit reached, dropping {}", peer);
                    continue;
                };

                let ctx = ctx.clone();
                let active = active.clone();
                active.fetch_add(1, Ordering::Relaxed);

                connections.spawn(async move {
                    debug!("Proxy connection from {}", peer);

                    let service = service_fn(move |req| handle(req, ctx.clone()));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Connection error from {}: {}", peer, e);
                    }

                    active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
        }
    }

    let open = connections.len();
    connections.shutdown().await;
    active.store(0, Ordering::Relaxed);
    info!("Proxy forwarder stopped ({} open connections aborted)", open);
}

async fn handle(
    req: Request<Incoming>,
    ctx: Arc<ForwardContext>,
) -> Result<hyper::Response<ProxyBody>, Infallible> {
    let mode = ctx.mode.get();
    if !mode.serves_proxy() {
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Proxy mode is not active (current mode: {})", mode),
        ));
    }

    let upstream = ctx.config.routes.select(req.uri().path()).clone();
    debug!("Forwarding {} {} -> {}", req.method(), req.uri(), upstream);

    let forwarded = forward(&ctx.client, req, &upstream, ctx.config.target_ip);
    match tokio::time::timeout(ctx.config.upstream_timeout, forwarded).await {
        Ok(Ok(resp)) => Ok(resp.map(|body| body.boxed())),
        Ok(Err(e)) => {
            warn!("Upstream {} failed: {}", upstream, e);
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Proxy error: {}", e),
            ))
        }
        Err(_) => {
            warn!(
                "Upstream {} timed out after {:?}",
                upstream, ctx.config.upstream_timeout
            );
            Ok(text_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Upstream request timed out".to_string(),
            ))
        }
    }
}

async fn forward(
    client: &HttpClient,
    req: Request<Incoming>,
    upstream: &Upstream,
    target_ip: IpAddr,
) -> Result<hyper::Response<Incoming>, HttpError> {
    let req = rewrite_request(req, upstream, target_ip)?;
    let mut sender = client
        .handshake::<Incoming>(&upstream.host, upstream.port, upstream.tls)
        .await?;
    sender
        .send_request(req)
        .await
        .map_err(|e| HttpError::HttpError(e.to_string()))
}

fn rewrite_request(
    req: Request<Incoming>,
    upstream: &Upstream,
    target_ip: IpAddr,
) -> Result<Request<Incoming>, HttpError> {
    let (mut parts, body) = req.into_parts();

    // Origin-form toward the upstream, even if the client sent absolute-form
    let origin: Uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| HttpError::InvalidUrl(e.to_string()))?;
    parts.uri = origin;

    rewrite_headers(&mut parts.headers, upstream, target_ip)?;
    Ok(Request::from_parts(parts, body))
}

/// Overwrite forwarding headers with `target_ip` and point Host at `upstream`
pub fn rewrite_headers(
    headers: &mut HeaderMap,
    upstream: &Upstream,
    target_ip: IpAddr,
) -> Result<(), HttpError> {
    let ip = header_value(&target_ip.to_string())?;
    for name in FORWARDED_HEADERS {
        headers.insert(HeaderName::from_static(name), ip.clone());
    }
    headers.insert(HOST, header_value(&upstream.authority())?);
    Ok(())
}

fn text_response(status: StatusCode, message: String) -> hyper::Response<ProxyBody> {
    let body = Full::new(Bytes::from(message))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = hyper::Response::new(body);
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::Mode;
    use hyper::header::HeaderValue;
    use std::time::Instant;

    const TARGET: &str = "203.0.113.50";

    /// Upstream stub: 200 "pong", echoing the received X-Real-IP and Host
    async fn stub_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let real_ip = req.headers().get("x-real-ip").cloned();
                        let host = req.headers().get(HOST).cloned();
                        let mut resp = hyper::Response::new(Full::new(Bytes::from_static(b"pong")));
                        *resp.status_mut() = StatusCode::OK;
                        if let Some(v) = real_ip {
                            resp.headers_mut().insert("x-seen-real-ip", v);
                        }
                        if let Some(v) = host {
                            resp.headers_mut().insert("x-seen-host", v);
                        }
                        resp.headers_mut()
                            .insert("x-upstream", HeaderValue::from_static("stub"));
                        Ok::<_, Infallible>(resp)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    async fn start_forwarder(upstream: Upstream, mode: Mode, timeout: Duration) -> (ForwarderHandle, ModeCell) {
        let mut config = ForwarderConfig::new("127.0.0.1:0".parse().unwrap(), TARGET.parse().unwrap());
        config.routes = UpstreamRoutes {
            production: upstream.clone(),
            testnet: upstream,
        };
        config.upstream_timeout = timeout;

        let cell = ModeCell::new(mode);
        let handle = ProxyForwarder::new(config, cell.clone()).start().await.unwrap();
        (handle, cell)
    }

    #[test]
    fn test_route_selection() {
        let routes = UpstreamRoutes::default();
        assert_eq!(routes.select("/api/v3/ping").host, "api.binance.com");
        assert_eq!(routes.select("/testnet/api/v3/order").host, "testnet.binance.vision");
    }

    #[test]
    fn test_upstream_authority() {
        assert_eq!(Upstream::https("api.binance.com").authority(), "api.binance.com");
        assert_eq!(Upstream::plain("127.0.0.1", 9000).authority(), "127.0.0.1:9000");
    }

    #[test]
    fn test_rewrite_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert("x-mbx-apikey", HeaderValue::from_static("key"));
        headers.insert(HOST, HeaderValue::from_static("localhost:8080"));

        rewrite_headers(&mut headers, &Upstream::https("api.binance.com"), TARGET.parse().unwrap())
            .unwrap();

        for name in FORWARDED_HEADERS {
            assert_eq!(headers.get(name).unwrap(), TARGET);
        }
        assert_eq!(headers.get(HOST).unwrap(), "api.binance.com");
        assert_eq!(headers.get("x-mbx-apikey").unwrap(), "key");
    }

    #[tokio::test]
    async fn test_forwards_in_proxy_mode() {
        let upstream_addr = stub_upstream().await;
        let upstream = Upstream::plain("127.0.0.1", upstream_addr.port());
        let (handle, _cell) = start_forwarder(upstream.clone(), Mode::Proxy, UPSTREAM_TIMEOUT).await;

        let client = HttpClient::with_defaults();
        let resp = client
            .get(&format!("http://{}/ping", handle.local_addr()))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"pong");
        assert_eq!(resp.headers.get("x-upstream").unwrap(), "stub");
        assert_eq!(resp.headers.get("x-seen-real-ip").unwrap(), TARGET);
        assert_eq!(
            resp.headers.get("x-seen-host").unwrap().to_str().unwrap(),
            upstream.authority()
        );

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_outside_proxy_mode() {
        let upstream_addr = stub_upstream().await;
        let upstream = Upstream::plain("127.0.0.1", upstream_addr.port());
        let (handle, cell) = start_forwarder(upstream, Mode::Vpn, UPSTREAM_TIMEOUT).await;
        let client = HttpClient::with_defaults();

        for path in ["/ping", "/api/v3/order", "/testnet/anything"] {
            let resp = client
                .get(&format!("http://{}{}", handle.local_addr(), path))
                .await
                .unwrap();
            assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        }

        cell.set(Mode::Direct);
        let resp = client
            .get(&format!("http://{}/ping", handle.local_addr()))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.text().unwrap().contains("direct"));

        cell.set(Mode::Proxy);
        let resp = client
            .get(&format!("http://{}/ping", handle.local_addr()))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_500() {
        // Reserve a port, then close it
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let (handle, _cell) = start_forwarder(
            Upstream::plain("127.0.0.1", closed_port),
            Mode::Proxy,
            UPSTREAM_TIMEOUT,
        )
        .await;

        let resp = HttpClient::with_defaults()
            .get(&format!("http://{}/ping", handle.local_addr()))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(resp.text().unwrap().starts_with("Proxy error"));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_slow_upstream_is_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let slow_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let (handle, _cell) = start_forwarder(
            Upstream::plain("127.0.0.1", slow_port),
            Mode::Proxy,
            Duration::from_millis(200),
        )
        .await;

        let started = Instant::now();
        let resp = HttpClient::with_defaults()
            .get(&format!("http://{}/ping", handle.local_addr()))
            .await
            .unwrap();

        assert_eq!(resp.status, StatusCode::GATEWAY_TIMEOUT);
        assert!(started.elapsed() < Duration::from_secs(5));

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let (handle, _cell) = start_forwarder(
            Upstream::plain("127.0.0.1", 9),
            Mode::Proxy,
            UPSTREAM_TIMEOUT,
        )
        .await;
        let addr = handle.local_addr();

        handle.stop().await;

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
