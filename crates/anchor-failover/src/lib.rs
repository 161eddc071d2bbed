//! Anchor Failover - Network Identity Coordinator
//!
//! Keeps exchange traffic appearing to come from one fixed public IP by
//! switching between a supervised VPN and a header-rewriting proxy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   FailoverCoordinator                     │
//! │                                                           │
//! │  monitor loop ──▶ health check ──▶ decision (one at a     │
//! │      ▲                               time, VPN lock held) │
//! │      │                                   │                │
//! │  VpnNotice                     ModeCell ◀┘  EventHistory  │
//! │      │                            │                       │
//! └──────│────────────────────────────│───────────────────────┘
//!        │                            ▼
//!   VpnManager                  ProxyForwarder
//! ```
//!
//! # Modes
//!
//! - **Vpn**: the VPN client gives this host the target egress IP
//! - **Proxy**: VPN unavailable; the forwarder relays exchange requests
//! - **Direct**: egress already matches without our VPN
//! - **None**: not started, or stopped

mod coordinator;
mod event;
mod history;
mod status;

pub use coordinator::{CoordinatorBuilder, CoordinatorError, FailoverCoordinator};
pub use event::{EventKind, FailoverEvent};
pub use history::EventHistory;
pub use status::{ConnectionStatus, CoordinatorStatus, IpCheck};

pub use anchor_network::Mode;
