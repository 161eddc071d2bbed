//! Status snapshots

use crate::event::FailoverEvent;
use anchor_network::Mode;
use anchor_vpn::VpnStatus;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};

/// Result of the most recent egress probe
///
/// Recomputed on every probe. A failed probe clears `current_ip` and
/// forces `is_target_ip` to false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub mode: Mode,
    pub current_ip: Option<IpAddr>,
    pub target_ip: IpAddr,
    pub is_target_ip: bool,
    /// Unix time in milliseconds; `None` before the first probe
    pub last_checked_at: Option<u64>,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn new(target_ip: IpAddr) -> Self {
        Self {
            mode: Mode::None,
            current_ip: None,
            target_ip,
            is_target_ip: false,
            last_checked_at: None,
            last_error: None,
        }
    }
}

/// One-off probe result for `GET /ip/check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpCheck {
    pub current_ip: Option<IpAddr>,
    pub target_ip: IpAddr,
    pub is_target_ip: bool,
    pub error: Option<String>,
    pub checked_at: u64,
}

/// Everything the control surface reports
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub connection: ConnectionStatus,
    pub vpn: VpnStatus,
    /// Bound forwarder address while running
    pub proxy_addr: Option<SocketAddr>,
    pub proxy_active_connections: u64,
    /// Most recent events, oldest first
    pub recent_events: Vec<FailoverEvent>,
}
