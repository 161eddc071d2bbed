//! Anchor VPN - Supervised VPN Client
//!
//! Runs an external VPN client (OpenVPN by default) and tracks whether it
//! actually gives this host the target egress IP.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     VpnManager                        │
//! │                                                       │
//! │  connect() ──▶ ProcessSupervisor ──▶ openvpn --config │
//! │      │                │                               │
//! │      │          output lines ──▶ ReadyDetector        │
//! │      ▼                                                │
//! │  session task: drain output, watch exit,              │
//! │                confirm egress IP every check interval │
//! └──────────────────────┬───────────────────────────────┘
//!                        ▼
//!          VpnNotice { Connected, Lost, Exited }
//! ```
//!
//! The manager never reconnects by itself; it reports and lets the
//! failover coordinator decide.

mod config;
mod manager;
pub mod ready;
mod supervisor;

pub use config::{ConfigError, ConnectionConfig};
pub use manager::{VpnError, VpnManager, VpnNotice, VpnState, VpnStatus};
pub use ready::ReadyDetector;
pub use supervisor::{
    ExitState, LaunchSpec, OutputLine, OutputStream, ProcessControl, ProcessHandle,
    ProcessSupervisor, Signal, SupervisorError, SystemSupervisor, DEFAULT_KILL_GRACE,
};
