//! Anchor Network Layer
//!
//! Everything that touches the wire on behalf of the failover coordinator:
//!
//! 1. `client`: minimal hyper/rustls HTTP client shared by the probe,
//!    the forwarder and the CLI
//! 2. `probe`: egress IP lookup against public "what is my IP" services
//! 3. `mode`: the operating mode and the atomic cell it is published through
//! 4. `forwarder`: header-rewriting HTTP forward proxy toward the exchange
//!
//! ```text
//!  client ──▶ ProxyForwarder (127.0.0.1:8080) ──TLS──▶ api.binance.com:443
//!                   │
//!                   └── reads ModeCell per request (serves only in Proxy)
//! ```

mod client;
mod forwarder;
mod mode;
mod probe;

pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use forwarder::{
    ForwarderConfig, ForwarderError, ForwarderHandle, ProxyForwarder, Upstream, UpstreamRoutes,
    rewrite_headers, FORWARDED_HEADERS, UPSTREAM_TIMEOUT,
};
pub use mode::{Mode, ModeCell, ModeParseError};
pub use probe::{EgressProbe, HttpEgressProbe, NetworkError, DEFAULT_PROBE_SERVICES, DEFAULT_PROBE_TIMEOUT};
