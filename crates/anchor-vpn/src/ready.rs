//! Ready detection for VPN client output

use std::sync::Arc;

/// Marker printed by OpenVPN once the tunnel is usable
pub const DEFAULT_READY_MARKER: &str = "Initialization Sequence Completed";

/// Decides whether a client output line means "tunnel ready"
pub type ReadyDetector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Detector matching lines that contain `marker`
pub fn marker(marker: impl Into<String>) -> ReadyDetector {
    let marker = marker.into();
    Arc::new(move |line: &str| line.contains(&marker))
}

/// Detector for the OpenVPN marker
pub fn default_detector() -> ReadyDetector {
    marker(DEFAULT_READY_MARKER)
}
