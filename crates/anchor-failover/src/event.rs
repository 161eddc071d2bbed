//! Failover events
//!
//! Every mode decision the coordinator makes is recorded as an immutable
//! [`FailoverEvent`] and broadcast to subscribers.

use anchor_network::Mode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Egress already on target without our VPN
    DirectConnectionDetected,
    VpnConnected,
    VpnFailedFallbackToProxy,
    /// VPN looked down but the egress IP still matched
    VpnDisconnectedButIpMaintained,
    #[serde(rename = "failover-triggered")]
    FailoverTriggered,
    VpnReconnectionFailedProxyActivated,
    VpnReconnected,
    /// Session reported lost or exited
    VpnLost,
    ManualOverride,
    CoordinatorStopped,
}

impl EventKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DirectConnectionDetected => "direct_connection_detected",
            EventKind::VpnConnected => "vpn_connected",
            EventKind::VpnFailedFallbackToProxy => "vpn_failed_fallback_to_proxy",
            EventKind::VpnDisconnectedButIpMaintained => "vpn_disconnected_but_ip_maintained",
            EventKind::FailoverTriggered => "failover-triggered",
            EventKind::VpnReconnectionFailedProxyActivated => {
                "vpn_reconnection_failed_proxy_activated"
            }
            EventKind::VpnReconnected => "vpn_reconnected",
            EventKind::VpnLost => "vpn_lost",
            EventKind::ManualOverride => "manual_override",
            EventKind::CoordinatorStopped => "coordinator_stopped",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEvent {
    /// Sequential per coordinator, starting at 1
    pub id: u64,
    /// Unix time in milliseconds
    pub timestamp_ms: u64,
    pub event_type: EventKind,
    /// Mode after the event
    pub mode: Mode,
    pub details: String,
}

impl FailoverEvent {
    pub fn new(id: u64, event_type: EventKind, mode: Mode, details: impl Into<String>) -> Self {
        Self {
            id,
            timestamp_ms: now_ms(),
            event_type,
            mode,
            details: details.into(),
        }
    }
}

/// Get current timestamp
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
