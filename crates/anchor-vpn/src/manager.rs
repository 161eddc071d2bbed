//! VPN Manager
//!
//! Owns at most one VPN client session and reports on it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut vpn = VpnManager::new(config, probe, Arc::new(SystemSupervisor::new()));
//! let mut notices = vpn.subscribe();
//!
//! vpn.connect().await?;
//! assert!(vpn.is_healthy().await);
//!
//! // Later: VpnNotice::Lost / VpnNotice::Exited arrive on `notices`
//! vpn.disconnect().await;
//! ```
//!
//! # States
//!
//! ```text
//! Disconnected ──connect()──▶ Connecting ──ready marker──▶ Connected
//!      ▲                          │                            │
//!      └──── retries exhausted ───┘      client exit / disconnect()
//! ```

use crate::config::ConnectionConfig;
use crate::ready::{self, ReadyDetector};
use crate::supervisor::{
    ExitState, LaunchSpec, OutputLine, ProcessControl, ProcessHandle, ProcessSupervisor,
    SupervisorError,
};
use anchor_network::EgressProbe;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// VPN connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnState {
    /// No session
    #[default]
    Disconnected,
    /// Client launched, waiting for the ready marker
    Connecting,
    /// Tunnel reported ready (or egress already matched)
    Connected,
}

impl VpnState {
    /// Check if VPN is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }
}

/// Session events published to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnNotice {
    /// Session established
    Connected { pid: Option<u32> },
    /// Confirmation probe stopped matching the target
    Lost { reason: String },
    /// Client exited after the session was established
    Exited { code: Option<i32> },
}

/// Snapshot of the manager
#[derive(Debug, Clone, Default, Serialize)]
pub struct VpnStatus {
    pub state: VpnState,
    pub pid: Option<u32>,
    pub retry_count: u32,
    /// Egress already matched; no client process was launched
    pub external: bool,
    /// Last confirmation matched the target
    pub confirmed: bool,
    pub last_confirmed_ip: Option<IpAddr>,
    pub connected_for_ms: Option<u64>,
}

/// VPN Manager errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum VpnError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("VPN client exited before ready (code {code:?}) after {attempts} attempts")]
    Process { code: Option<i32>, attempts: u32 },

    #[error("VPN client not ready within {0:?}")]
    Timeout(Duration),

    #[error("Supervisor error: {0}")]
    Supervisor(SupervisorError),
}

impl VpnError {
    /// Errors the coordinator hands back to its caller after falling back
    pub fn propagates(&self) -> bool {
        matches!(self, VpnError::Configuration(_) | VpnError::Process { .. })
    }
}

impl From<SupervisorError> for VpnError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::Configuration(msg) => VpnError::Configuration(msg),
            other => VpnError::Supervisor(other),
        }
    }
}

/// Outcome of one launch attempt that did not reach ready
enum AttemptError {
    Exited(ExitState),
    Failed(VpnError),
}

/// State shared with the session task
#[derive(Debug, Default)]
struct Shared {
    state: VpnState,
    confirmed: bool,
    last_confirmed_ip: Option<IpAddr>,
}

struct Session {
    control: Option<ProcessControl>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// What the session task needs to confirm and report
struct SessionContext {
    shared: Arc<RwLock<Shared>>,
    notices: broadcast::Sender<VpnNotice>,
    probe: Arc<dyn EgressProbe>,
    target_ip: IpAddr,
    probe_timeout: Duration,
    check_interval: Duration,
}

/// VPN Manager
///
/// - Launches the client and waits for it to report ready
/// - Retries early exits up to `max_retries`
/// - Confirms the egress IP while connected and reports drift
pub struct VpnManager {
    config: ConnectionConfig,
    probe: Arc<dyn EgressProbe>,
    supervisor: Arc<dyn ProcessSupervisor>,
    ready: ReadyDetector,
    shared: Arc<RwLock<Shared>>,
    session: Option<Session>,
    notices: broadcast::Sender<VpnNotice>,
    connected_at: Option<Instant>,
    retry_count: u32,
    external: bool,
}

impl VpnManager {
    /// Create a manager; the ready detector matches `config.ready_marker`
    pub fn new(
        config: ConnectionConfig,
        probe: Arc<dyn EgressProbe>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        let ready = ready::marker(config.ready_marker.clone());
        let (notices, _) = broadcast::channel(32);

        Self {
            config,
            probe,
            supervisor,
            ready,
            shared: Arc::new(RwLock::new(Shared::default())),
            session: None,
            notices,
            connected_at: None,
            retry_count: 0,
            external: false,
        }
    }

    /// Replace the ready detector
    pub fn with_ready_detector(mut self, ready: ReadyDetector) -> Self {
        self.ready = ready;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get current state
    pub async fn state(&self) -> VpnState {
        self.shared.read().await.state
    }

    /// Check if VPN is connected
    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    /// Connected and the last confirmation did not fail
    pub async fn is_healthy(&self) -> bool {
        let shared = self.shared.read().await;
        shared.state.is_connected() && shared.confirmed
    }

    /// Session notices
    pub fn subscribe(&self) -> broadcast::Receiver<VpnNotice> {
        self.notices.subscribe()
    }

    /// Client pid, if a process-backed session is running
    pub fn pid(&self) -> Option<u32> {
        self.session
            .as_ref()
            .and_then(|s| s.control.as_ref())
            .and_then(|c| c.pid())
    }

    /// Get connection duration
    pub fn connection_duration(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }

    /// Side-effect-free snapshot
    pub async fn status(&self) -> VpnStatus {
        let shared = self.shared.read().await;
        VpnStatus {
            state: shared.state,
            pid: self.pid(),
            retry_count: self.retry_count,
            external: self.external,
            confirmed: shared.confirmed,
            last_confirmed_ip: shared.last_confirmed_ip,
            connected_for_ms: self.connection_duration().map(|d| d.as_millis() as u64),
        }
    }

    /// Client invocation for the configured profile
    pub fn launch_spec(&self) -> LaunchSpec {
        let profile = &self.config.vpn_config_path;
        let credentials = &self.config.vpn_credentials_path;

        LaunchSpec::new(&self.config.vpn_client_path)
            .arg("--config")
            .arg(profile.to_string_lossy())
            .arg("--auth-user-pass")
            .arg(credentials.to_string_lossy())
            .require(profile)
            .credentials_file(credentials)
    }

    /// Connect to VPN
    ///
    /// 1. No-op while a healthy session exists
    /// 2. Egress already on target: record an external connection
    /// 3. Otherwise launch the client and wait for the ready marker,
    ///    retrying early exits
    pub async fn connect(&mut self) -> Result<(), VpnError> {
        if self.is_healthy().await {
            debug!("VPN already connected");
            return Ok(());
        }

        self.teardown().await;
        self.set_state(VpnState::Connecting).await;

        match self.probe.probe(self.config.probe_timeout()).await {
            Ok(ip) if ip == self.config.target_ip => {
                info!("Egress IP already {}, using existing VPN", ip);
                self.external = true;
                self.retry_count = 0;
                self.establish(None, Some(ip)).await;
                return Ok(());
            }
            Ok(ip) => debug!(
                "Egress IP {} differs from target {}, launching VPN client",
                ip, self.config.target_ip
            ),
            Err(e) => debug!("Pre-connect probe failed: {}", e),
        }

        let spec = self.launch_spec();
        let total = self.config.max_retries + 1;

        loop {
            info!(
                "Connecting VPN via {} (attempt {}/{})",
                self.config.vpn_client_path.display(),
                self.retry_count + 1,
                total
            );

            match self.attempt(&spec).await {
                Ok(handle) => {
                    self.retry_count = 0;
                    self.establish(Some(handle), None).await;
                    return Ok(());
                }
                Err(AttemptError::Exited(exit)) if self.retry_count < self.config.max_retries => {
                    self.retry_count += 1;
                    warn!(
                        "VPN client exited before ready ({}), retry {}/{} in {:?}",
                        exit,
                        self.retry_count,
                        self.config.max_retries,
                        self.config.retry_delay()
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                Err(AttemptError::Exited(exit)) => {
                    let attempts = self.retry_count + 1;
                    self.retry_count = 0;
                    self.set_state(VpnState::Disconnected).await;
                    error!("VPN client failed {} times, giving up ({})", attempts, exit);
                    return Err(VpnError::Process {
                        code: exit.code,
                        attempts,
                    });
                }
                Err(AttemptError::Failed(e)) => {
                    self.retry_count = 0;
                    self.set_state(VpnState::Disconnected).await;
                    error!("VPN connection failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    /// Disconnect from VPN
    ///
    /// Also terminates stray client instances left by earlier runs.
    pub async fn disconnect(&mut self) {
        info!("Disconnecting VPN");

        self.teardown().await;
        self.supervisor
            .kill_strays(&self.config.vpn_client_path)
            .await;
        self.retry_count = 0;

        info!("VPN disconnected");
    }

    /// Reconnect (after tunnel drop)
    pub async fn reconnect(&mut self) -> Result<(), VpnError> {
        warn!("Reconnecting VPN");
        self.teardown().await;
        self.connect().await
    }

    async fn attempt(&self, spec: &LaunchSpec) -> Result<ProcessHandle, AttemptError> {
        let mut handle = self
            .supervisor
            .spawn(spec)
            .await
            .map_err(|e| AttemptError::Failed(e.into()))?;
        let control = handle.control().clone();
        let deadline = self.config.failover_timeout();
        let ready = self.ready.clone();

        let watch_output = async {
            loop {
                tokio::select! {
                    biased;
                    line = handle.next_line() => match line {
                        Some(line) if ready(&line.text) => return Ok(()),
                        Some(_) => {}
                        None => return Err(control.wait().await),
                    },
                    exit = control.wait() => return Err(exit),
                }
            }
        };

        let outcome = tokio::time::timeout(deadline, watch_output).await;
        match outcome {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(exit)) => Err(AttemptError::Exited(exit)),
            Err(_) => {
                warn!("VPN client not ready within {:?}, stopping it", deadline);
                if let Err(e) = self.supervisor.kill(&control, self.config.kill_grace()).await {
                    error!("Failed to stop VPN client: {}", e);
                }
                Err(AttemptError::Failed(VpnError::Timeout(deadline)))
            }
        }
    }

    async fn establish(&mut self, handle: Option<ProcessHandle>, confirmed_ip: Option<IpAddr>) {
        let (control, output) = match handle {
            Some(handle) => {
                let (control, output) = handle.into_parts();
                (Some(control), Some(output))
            }
            None => (None, None),
        };

        {
            let mut shared = self.shared.write().await;
            shared.state = VpnState::Connected;
            shared.confirmed = true;
            shared.last_confirmed_ip = confirmed_ip;
        }
        self.connected_at = Some(Instant::now());

        let ctx = SessionContext {
            shared: self.shared.clone(),
            notices: self.notices.clone(),
            probe: self.probe.clone(),
            target_ip: self.config.target_ip,
            probe_timeout: self.config.probe_timeout(),
            check_interval: self.config.check_interval(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_session(ctx, control.clone(), output, shutdown_rx));

        let pid = control.as_ref().and_then(|c| c.pid());
        self.session = Some(Session {
            control,
            shutdown: shutdown_tx,
            task,
        });

        info!("VPN connected (pid {:?}, external: {})", pid, self.external);
        let _ = self.notices.send(VpnNotice::Connected { pid });
    }

    /// Stop the session and its client, without stray cleanup
    async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown.send(true);
            if let Err(e) = session.task.await {
                warn!("VPN session task ended abnormally: {}", e);
            }

            if let Some(control) = session.control.filter(|c| c.is_alive()) {
                info!("Stopping VPN client (pid {:?})", control.pid());
                match self.supervisor.kill(&control, self.config.kill_grace()).await {
                    Ok(exit) => debug!("VPN client stopped ({})", exit),
                    Err(e) => error!("Failed to stop VPN client: {}", e),
                }
            }
        }

        self.connected_at = None;
        self.external = false;

        let mut shared = self.shared.write().await;
        shared.state = VpnState::Disconnected;
        shared.confirmed = false;
        shared.last_confirmed_ip = None;
    }

    async fn set_state(&self, state: VpnState) {
        self.shared.write().await.state = state;
    }
}

async fn run_session(
    ctx: SessionContext,
    control: Option<ProcessControl>,
    mut output: Option<mpsc::Receiver<OutputLine>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + ctx.check_interval;
    let mut ticker = tokio::time::interval_at(start, ctx.check_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            line = next_output(&mut output) => match line {
                Some(line) => trace!("vpn client: {}", line.text),
                None => output = None,
            },
            exit = wait_exit(control.as_ref()) => {
                {
                    let mut shared = ctx.shared.write().await;
                    shared.state = VpnState::Disconnected;
                    shared.confirmed = false;
                }
                warn!("VPN client exited after connecting ({})", exit);
                let _ = ctx.notices.send(VpnNotice::Exited { code: exit.code });
                break;
            }
            _ = ticker.tick() => confirm(&ctx).await,
        }
    }
}

async fn next_output(output: &mut Option<mpsc::Receiver<OutputLine>>) -> Option<OutputLine> {
    match output {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_exit(control: Option<&ProcessControl>) -> ExitState {
    match control {
        Some(control) => control.wait().await,
        None => std::future::pending().await,
    }
}

/// One confirmation probe; publishes `Lost` on the confirmed → unconfirmed edge
async fn confirm(ctx: &SessionContext) {
    let reason = match ctx.probe.probe(ctx.probe_timeout).await {
        Ok(ip) if ip == ctx.target_ip => {
            let mut shared = ctx.shared.write().await;
            if !shared.confirmed {
                info!("VPN egress confirmed again ({})", ip);
            }
            shared.confirmed = true;
            shared.last_confirmed_ip = Some(ip);
            return;
        }
        Ok(ip) => format!("egress IP {} does not match target {}", ip, ctx.target_ip),
        Err(e) => format!("confirmation probe failed: {}", e),
    };

    let was_confirmed = {
        let mut shared = ctx.shared.write().await;
        std::mem::replace(&mut shared.confirmed, false)
    };

    if was_confirmed {
        warn!("VPN lost: {}", reason);
        let _ = ctx.notices.send(VpnNotice::Lost { reason });
    } else {
        debug!("VPN still unconfirmed: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SystemSupervisor;
    use anchor_network::NetworkError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const TARGET: &str = "203.0.113.50";
    const OTHER: &str = "198.51.100.1";

    /// Probe whose answer the test can change
    struct FixedProbe {
        answer: Mutex<Result<IpAddr, NetworkError>>,
    }

    impl FixedProbe {
        fn new(ip: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Ok(ip.parse().unwrap())),
            })
        }

        fn set(&self, ip: &str) {
            *self.answer.lock().unwrap() = Ok(ip.parse().unwrap());
        }
    }

    #[async_trait]
    impl EgressProbe for FixedProbe {
        async fn probe(&self, _timeout: Duration) -> Result<IpAddr, NetworkError> {
            self.answer.lock().unwrap().clone()
        }
    }

    fn test_config(dir: &tempfile::TempDir, client: &str) -> ConnectionConfig {
        let profile = dir.path().join("client.ovpn");
        let credentials = dir.path().join("credentials.txt");
        std::fs::write(&profile, "remote vpn.example.net 1194\n").unwrap();
        std::fs::write(&credentials, "user\npass\n").unwrap();

        let mut config = ConnectionConfig::new(TARGET.parse().unwrap());
        config.vpn_client_path = dir.path().join(client);
        config.vpn_config_path = profile;
        config.vpn_credentials_path = credentials;
        config.retry_delay_ms = 10;
        config.kill_grace_ms = 500;
        config
    }

    #[test]
    fn test_vpn_state() {
        assert!(VpnState::Connected.is_connected());
        assert!(!VpnState::Connecting.is_connected());
        assert_eq!(VpnState::default(), VpnState::Disconnected);
    }

    #[test]
    fn test_error_propagation_classes() {
        assert!(VpnError::Configuration("x".into()).propagates());
        assert!(VpnError::Process { code: Some(1), attempts: 4 }.propagates());
        assert!(!VpnError::Timeout(Duration::from_secs(1)).propagates());
    }

    #[test]
    fn test_launch_spec_args() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "openvpn");
        let vpn = VpnManager::new(config.clone(), FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()));

        let spec = vpn.launch_spec();
        assert_eq!(spec.args[0], "--config");
        assert_eq!(spec.args[1], config.vpn_config_path.to_string_lossy());
        assert_eq!(spec.args[2], "--auth-user-pass");
        assert_eq!(spec.args[3], config.vpn_credentials_path.to_string_lossy());
    }

    #[tokio::test]
    async fn test_missing_client_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "missing-client");
        let mut vpn = VpnManager::new(config, FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()));

        let result = vpn.connect().await;

        assert!(matches!(result, Err(VpnError::Configuration(_))));
        assert_eq!(vpn.state().await, VpnState::Disconnected);
        assert_eq!(vpn.status().await.retry_count, 0);
    }

    #[tokio::test]
    async fn test_external_connection() {
        let dir = tempfile::tempdir().unwrap();
        // Client does not exist: the short-circuit must not launch anything
        let config = test_config(&dir, "missing-client");
        let mut vpn = VpnManager::new(config, FixedProbe::new(TARGET), Arc::new(SystemSupervisor::new()));
        let mut notices = vpn.subscribe();

        vpn.connect().await.unwrap();

        let status = vpn.status().await;
        assert_eq!(status.state, VpnState::Connected);
        assert!(status.external);
        assert_eq!(status.pid, None);
        assert_eq!(status.last_confirmed_ip, Some(TARGET.parse().unwrap()));
        assert_eq!(notices.recv().await.unwrap(), VpnNotice::Connected { pid: None });

        // Healthy session: connect again is a no-op
        vpn.connect().await.unwrap();
        assert!(vpn.status().await.external);
    }

    #[tokio::test]
    async fn test_confirmation_loss_notified_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "missing-client");
        config.check_interval_ms = 50;
        let probe = FixedProbe::new(TARGET);
        let mut vpn = VpnManager::new(config, probe.clone(), Arc::new(SystemSupervisor::new()));

        vpn.connect().await.unwrap();
        let mut notices = vpn.subscribe();
        probe.set(OTHER);

        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice, VpnNotice::Lost { .. }));
        assert!(!vpn.is_healthy().await);
        assert!(vpn.is_connected().await);

        // Several more failing ticks, no second notice
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(notices.try_recv().is_err());
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn write_client(dir: &tempfile::TempDir, name: &str, body: &str) {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        #[tokio::test]
        async fn test_connect_on_ready_marker() {
            let dir = tempfile::tempdir().unwrap();
            write_client(
                &dir,
                "client.sh",
                "echo 'TLS handshake'\necho 'Initialization Sequence Completed'\nexec sleep 30",
            );
            let config = test_config(&dir, "client.sh");
            let mut vpn = VpnManager::new(config, FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()));

            vpn.connect().await.unwrap();

            let status = vpn.status().await;
            assert_eq!(status.state, VpnState::Connected);
            assert!(!status.external);
            assert!(status.pid.is_some());

            vpn.disconnect().await;
            assert_eq!(vpn.state().await, VpnState::Disconnected);
            assert_eq!(vpn.pid(), None);
        }

        #[tokio::test]
        async fn test_immediate_exit_retries_then_fails() {
            let dir = tempfile::tempdir().unwrap();
            let counter = dir.path().join("attempts");
            write_client(
                &dir,
                "client.sh",
                &format!("echo attempt >> '{}'\nexit 1", counter.display()),
            );
            let mut config = test_config(&dir, "client.sh");
            config.max_retries = 2;
            let mut vpn = VpnManager::new(config, FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()));

            let result = vpn.connect().await;

            match result {
                Err(VpnError::Process { code, attempts }) => {
                    assert_eq!(code, Some(1));
                    assert_eq!(attempts, 3);
                }
                other => panic!("unexpected: {:?}", other),
            }
            let launched = std::fs::read_to_string(&counter).unwrap().lines().count();
            assert_eq!(launched, 3);
            assert_eq!(vpn.status().await.retry_count, 0);
            assert_eq!(vpn.state().await, VpnState::Disconnected);
        }

        #[tokio::test]
        async fn test_timeout_kills_client() {
            let dir = tempfile::tempdir().unwrap();
            write_client(&dir, "client.sh", "echo connecting\nexec sleep 30");
            let mut config = test_config(&dir, "client.sh");
            config.failover_timeout_ms = 300;
            let mut vpn = VpnManager::new(config, FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()));

            let started = Instant::now();
            let result = vpn.connect().await;

            assert!(matches!(result, Err(VpnError::Timeout(_))));
            assert!(started.elapsed() < Duration::from_secs(3));
            assert_eq!(vpn.state().await, VpnState::Disconnected);
        }

        #[tokio::test]
        async fn test_exit_after_connect_notifies() {
            let dir = tempfile::tempdir().unwrap();
            write_client(
                &dir,
                "client.sh",
                "echo 'Initialization Sequence Completed'\nsleep 0.3\nexit 2",
            );
            let config = test_config(&dir, "client.sh");
            let mut vpn = VpnManager::new(config, FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()));
            let mut notices = vpn.subscribe();

            vpn.connect().await.unwrap();
            assert!(matches!(notices.recv().await.unwrap(), VpnNotice::Connected { .. }));

            let notice = tokio::time::timeout(Duration::from_secs(3), notices.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(notice, VpnNotice::Exited { code: Some(2) });
            assert_eq!(vpn.state().await, VpnState::Disconnected);
        }

        #[tokio::test]
        async fn test_custom_ready_detector() {
            let dir = tempfile::tempdir().unwrap();
            write_client(&dir, "client.sh", "echo 'wg0: handshake complete'\nexec sleep 30");
            let config = test_config(&dir, "client.sh");
            let mut vpn = VpnManager::new(config, FixedProbe::new(OTHER), Arc::new(SystemSupervisor::new()))
                .with_ready_detector(ready::marker("handshake complete"));

            vpn.connect().await.unwrap();
            assert!(vpn.is_connected().await);

            vpn.reconnect().await.unwrap();
            assert!(vpn.is_connected().await);
            assert!(vpn.pid().is_some());

            vpn.disconnect().await;
        }
    }
}
