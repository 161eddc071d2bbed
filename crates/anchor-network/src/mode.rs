//! Operating Mode
//!
//! The coordinator is the only writer of the mode. Everything else (the
//! forwarder in particular) reads it through a shared [`ModeCell`], which is
//! a single atomic byte so the per-request check never takes a lock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

/// Active connectivity strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Not started, or stopped
    #[default]
    None,
    /// Egress goes through the supervised VPN client
    Vpn,
    /// Exchange traffic is relayed by the forwarder
    Proxy,
    /// Egress already has the target IP without our VPN
    Direct,
}

impl Mode {
    /// Lowercase wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::None => "none",
            Mode::Vpn => "vpn",
            Mode::Proxy => "proxy",
            Mode::Direct => "direct",
        }
    }

    /// Whether the forwarder should relay requests in this mode
    pub fn serves_proxy(&self) -> bool {
        matches!(self, Mode::Proxy)
    }

    fn to_u8(self) -> u8 {
        match self {
            Mode::None => 0,
            Mode::Vpn => 1,
            Mode::Proxy => 2,
            Mode::Direct => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Mode::Vpn,
            2 => Mode::Proxy,
            3 => Mode::Direct,
            _ => Mode::None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Mode::None),
            "vpn" => Ok(Mode::Vpn),
            "proxy" => Ok(Mode::Proxy),
            "direct" => Ok(Mode::Direct),
            _ => Err(ModeParseError(s.to_string())),
        }
    }
}

/// Unknown mode string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode '{0}' (expected vpn, proxy or direct)")]
pub struct ModeParseError(pub String);

/// Shared, lock-free view of the current mode
///
/// Cloning yields another handle to the same cell.
#[derive(Debug, Clone, Default)]
pub struct ModeCell {
    inner: Arc<AtomicU8>,
}

impl ModeCell {
    /// Create a cell holding `mode`
    pub fn new(mode: Mode) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(mode.to_u8())),
        }
    }

    /// Current mode
    pub fn get(&self) -> Mode {
        Mode::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Publish a new mode, returning the previous one
    pub fn set(&self, mode: Mode) -> Mode {
        let previous = Mode::from_u8(self.inner.swap(mode.to_u8(), Ordering::AcqRel));
        if previous != mode {
            debug!("Mode cell: {} -> {}", previous, mode);
        }
        previous
    }

    /// Whether the forwarder may relay right now
    pub fn serves_proxy(&self) -> bool {
        self.get().serves_proxy()
    }
}
