//! Failover Coordinator
//!
//! Decides which transport carries exchange traffic and moves between
//! them when one stops working.
//!
//! # Decisions
//!
//! ```text
//! ensure_connection():
//!     egress == target ─┬─ VPN down      → Direct
//!                       └─ VPN up        → Vpn
//!     egress != target ─┬─ connect() ok  → Vpn
//!                       └─ connect() err → Proxy
//!
//! health check (every check interval, or on a VPN notice):
//!     Vpn    + mismatch → re-probe → match: Direct
//!                                  → reconnect ok: Vpn
//!                                  → reconnect err: failover → Proxy
//!     Direct + mismatch → try VPN, fall back to Proxy
//! ```
//!
//! Every decision runs while holding the VPN manager's mutex, so at most
//! one is in flight. The mode is published through a [`ModeCell`] that
//! the forwarder reads per request.

use crate::event::{now_ms, EventKind, FailoverEvent};
use crate::history::EventHistory;
use crate::status::{ConnectionStatus, CoordinatorStatus, IpCheck};
use anchor_network::{
    EgressProbe, ForwarderConfig, ForwarderError, ForwarderHandle, HttpEgressProbe, Mode,
    ModeCell, NetworkError, ProxyForwarder, UpstreamRoutes,
};
use anchor_vpn::{
    ConfigError, ConnectionConfig, ProcessSupervisor, ReadyDetector, SystemSupervisor, VpnError,
    VpnManager, VpnNotice, VpnState, VpnStatus,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events returned by `status()`
const STATUS_RECENT_EVENTS: usize = 10;

/// Coordinator errors
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("VPN error: {0}")]
    Vpn(#[from] VpnError),

    #[error("Proxy forwarder error: {0}")]
    Forwarder(#[from] ForwarderError),

    #[error("Mode '{0}' cannot be forced")]
    InvalidMode(Mode),

    #[error("Coordinator is not running")]
    NotRunning,
}

/// Builder for [`FailoverCoordinator`]
pub struct CoordinatorBuilder {
    config: ConnectionConfig,
    probe: Option<Arc<dyn EgressProbe>>,
    supervisor: Option<Arc<dyn ProcessSupervisor>>,
    ready: Option<ReadyDetector>,
    routes: UpstreamRoutes,
}

impl CoordinatorBuilder {
    /// Egress probe (default: HTTP lookup services from the config)
    pub fn probe(mut self, probe: Arc<dyn EgressProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Process supervisor (default: [`SystemSupervisor`])
    pub fn supervisor(mut self, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Ready detector (default: the configured marker)
    pub fn ready_detector(mut self, ready: ReadyDetector) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Forwarder upstreams (default: Binance production / testnet)
    pub fn routes(mut self, routes: UpstreamRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn build(self) -> Result<FailoverCoordinator, CoordinatorError> {
        self.config.validate()?;

        let probe: Arc<dyn EgressProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpEgressProbe::with_services(self.config.probe_services.clone())),
        };
        let supervisor: Arc<dyn ProcessSupervisor> = match self.supervisor {
            Some(supervisor) => supervisor,
            None => Arc::new(SystemSupervisor::new()),
        };

        let mut vpn = VpnManager::new(self.config.clone(), probe.clone(), supervisor);
        if let Some(ready) = self.ready {
            vpn = vpn.with_ready_detector(ready);
        }

        let (events, _) = broadcast::channel(256);

        Ok(FailoverCoordinator {
            inner: Arc::new(Inner {
                status: RwLock::new(ConnectionStatus::new(self.config.target_ip)),
                history: Mutex::new(EventHistory::new(self.config.history_capacity)),
                config: self.config,
                probe,
                routes: self.routes,
                vpn: tokio::sync::Mutex::new(vpn),
                vpn_snapshot: Mutex::new(VpnStatus::default()),
                mode: ModeCell::default(),
                next_event_id: AtomicU64::new(1),
                events,
                lifecycle: tokio::sync::Mutex::new(()),
                runtime: Mutex::new(None),
            }),
        })
    }
}

/// Forwarder and monitor of a started coordinator
struct Runtime {
    forwarder: ForwarderHandle,
    shutdown: watch::Sender<bool>,
    monitor: JoinHandle<()>,
}

struct Inner {
    config: ConnectionConfig,
    probe: Arc<dyn EgressProbe>,
    routes: UpstreamRoutes,
    /// Decision lock: held for every transition, probe and history write
    vpn: tokio::sync::Mutex<VpnManager>,
    /// VPN status as of the last decision, for readers that must not wait
    vpn_snapshot: Mutex<VpnStatus>,
    mode: ModeCell,
    status: RwLock<ConnectionStatus>,
    history: Mutex<EventHistory>,
    next_event_id: AtomicU64,
    events: broadcast::Sender<FailoverEvent>,
    /// Serializes start() and stop()
    lifecycle: tokio::sync::Mutex<()>,
    runtime: Mutex<Option<Runtime>>,
}

/// Network identity failover coordinator
///
/// Cheap to clone; all clones drive the same coordinator.
#[derive(Clone)]
pub struct FailoverCoordinator {
    inner: Arc<Inner>,
}

impl FailoverCoordinator {
    /// Start building a coordinator for `config`
    pub fn builder(config: ConnectionConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            probe: None,
            supervisor: None,
            ready: None,
            routes: UpstreamRoutes::default(),
        }
    }

    /// Coordinator with the default probe, supervisor and routes
    pub fn new(config: ConnectionConfig) -> Result<Self, CoordinatorError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Current mode
    pub fn mode(&self) -> Mode {
        self.inner.mode.get()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.runtime).is_some()
    }

    /// Every recorded event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.inner.events.subscribe()
    }

    /// All retained events, oldest first
    pub fn history(&self) -> Vec<FailoverEvent> {
        lock(&self.inner.history).all()
    }

    /// Start the forwarder and monitoring loop, then pick a mode
    ///
    /// Idempotent. A failed initial VPN attempt is logged and leaves the
    /// coordinator running in Proxy mode.
    pub async fn start(&self) -> Result<Mode, CoordinatorError> {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            if self.is_running() {
                debug!("Coordinator already running");
                return Ok(self.mode());
            }

            let config = &self.inner.config;
            info!(
                "Starting failover coordinator (target IP {}, proxy {})",
                config.target_ip,
                config.proxy_addr()
            );

            let mut forwarder_config = ForwarderConfig::new(config.proxy_addr(), config.target_ip);
            forwarder_config.routes = self.inner.routes.clone();
            forwarder_config.upstream_timeout = config.upstream_timeout();
            let forwarder = ProxyForwarder::new(forwarder_config, self.inner.mode.clone())
                .start()
                .await?;

            let notices = self.inner.vpn.lock().await.subscribe();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let monitor = tokio::spawn(monitor(
                Arc::downgrade(&self.inner),
                shutdown_rx,
                notices,
            ));

            *lock(&self.inner.runtime) = Some(Runtime {
                forwarder,
                shutdown: shutdown_tx,
                monitor,
            });
        }

        match self.ensure_connection().await {
            Ok(mode) => Ok(mode),
            Err(e) => {
                warn!("Initial connection attempt failed: {}", e);
                Ok(self.mode())
            }
        }
    }

    /// Stop monitoring, close the forwarder and disconnect the VPN
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let runtime = lock(&self.inner.runtime).take();
        let Some(runtime) = runtime else {
            debug!("Coordinator not running");
            return Ok(());
        };

        info!("Stopping failover coordinator");

        // Let an in-flight check finish before tearing anything down
        let _ = runtime.shutdown.send(true);
        if let Err(e) = runtime.monitor.await {
            warn!("Monitor task ended abnormally: {}", e);
        }
        runtime.forwarder.stop().await;

        let mut vpn = self.inner.vpn.lock().await;
        if vpn.state().await != VpnState::Disconnected {
            vpn.disconnect().await;
        }

        let previous = self.mode();
        self.transition(
            Mode::None,
            EventKind::CoordinatorStopped,
            format!("Stopped (was {})", previous),
        );
        self.remember_vpn(&vpn).await;

        info!("Failover coordinator stopped");
        Ok(())
    }

    /// Probe and pick VPN, Direct or Proxy
    ///
    /// Configuration and process errors are returned after the fallback to
    /// Proxy has been made; timeouts and probe failures are not. Fails with
    /// `NotRunning` before `start()` and after `stop()`.
    pub async fn ensure_connection(&self) -> Result<Mode, CoordinatorError> {
        let mut vpn = self.inner.vpn.lock().await;
        if !self.is_running() {
            return Err(CoordinatorError::NotRunning);
        }
        let result = self.ensure_locked(&mut vpn).await;
        self.remember_vpn(&vpn).await;
        result
    }

    /// One monitoring pass
    pub async fn run_health_check(&self) -> Mode {
        let mut vpn = self.inner.vpn.lock().await;
        self.health_check_locked(&mut vpn).await;
        self.remember_vpn(&vpn).await;
        self.mode()
    }

    /// Manually select a mode
    ///
    /// `vpn` connects first and fails without changing mode if that fails;
    /// `proxy` and `direct` disconnect the VPN. A call is a no-op only when
    /// the mode already matches and the VPN is in the matching state.
    pub async fn force_mode(&self, mode: Mode) -> Result<Mode, CoordinatorError> {
        if mode == Mode::None {
            return Err(CoordinatorError::InvalidMode(mode));
        }

        let mut vpn = self.inner.vpn.lock().await;
        if !self.is_running() {
            return Err(CoordinatorError::NotRunning);
        }

        let previous = self.mode();
        let vpn_state = vpn.state().await;
        let settled = match mode {
            Mode::Vpn => vpn.is_healthy().await,
            _ => vpn_state == VpnState::Disconnected,
        };
        if previous == mode && settled {
            debug!("Mode already {}", mode);
            return Ok(mode);
        }

        info!("Manual override: {} -> {}", previous, mode);
        let result = match mode {
            Mode::Vpn => vpn.connect().await.map_err(CoordinatorError::from),
            _ => {
                if vpn_state != VpnState::Disconnected {
                    vpn.disconnect().await;
                }
                Ok(())
            }
        };

        if result.is_ok() {
            if previous != mode {
                self.transition(
                    mode,
                    EventKind::ManualOverride,
                    format!("Manual override from {} to {}", previous, mode),
                );
            }
            if mode == Mode::Vpn {
                let _ = self.probe_egress().await;
            }
        }

        self.remember_vpn(&vpn).await;
        result.map(|()| mode)
    }

    /// Fresh egress probe; does not change any state
    pub async fn check_ip(&self) -> IpCheck {
        let target_ip = self.inner.config.target_ip;
        let result = self.inner.probe.probe(self.inner.config.probe_timeout()).await;

        IpCheck {
            current_ip: result.as_ref().ok().copied(),
            target_ip,
            is_target_ip: matches!(result, Ok(ip) if ip == target_ip),
            error: result.err().map(|e| e.to_string()),
            checked_at: now_ms(),
        }
    }

    /// Connection, VPN and forwarder status with recent events
    pub async fn status(&self) -> CoordinatorStatus {
        // Fresh VPN status when no decision is in flight
        let vpn = match self.inner.vpn.try_lock() {
            Ok(vpn) => vpn.status().await,
            Err(_) => lock(&self.inner.vpn_snapshot).clone(),
        };

        let mut connection = self
            .inner
            .status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        connection.mode = self.mode();

        let (proxy_addr, proxy_active_connections) = match lock(&self.inner.runtime).as_ref() {
            Some(runtime) => (
                Some(runtime.forwarder.local_addr()),
                runtime.forwarder.active_connections(),
            ),
            None => (None, 0),
        };

        CoordinatorStatus {
            running: proxy_addr.is_some(),
            connection,
            vpn,
            proxy_addr,
            proxy_active_connections,
            recent_events: lock(&self.inner.history).recent(STATUS_RECENT_EVENTS),
        }
    }

    async fn ensure_locked(&self, vpn: &mut VpnManager) -> Result<Mode, CoordinatorError> {
        let target_ip = self.inner.config.target_ip;

        match self.probe_egress().await {
            Ok(ip) if ip == target_ip => {
                let current = self.mode();
                if vpn.state().await == VpnState::Disconnected {
                    if current != Mode::Direct {
                        self.transition(
                            Mode::Direct,
                            EventKind::DirectConnectionDetected,
                            format!("Egress IP {} already matches target", ip),
                        );
                    }
                } else if vpn.is_connected().await && current != Mode::Vpn {
                    self.transition(
                        Mode::Vpn,
                        EventKind::VpnConnected,
                        format!("VPN session active, egress IP {}", ip),
                    );
                }
                Ok(self.mode())
            }
            Ok(ip) => {
                info!("Egress IP {} does not match target {}, trying VPN", ip, target_ip);
                self.try_vpn(vpn).await
            }
            Err(e) => {
                info!("Egress probe failed ({}), trying VPN", e);
                self.try_vpn(vpn).await
            }
        }
    }

    /// Connect the VPN or fall back to Proxy
    async fn try_vpn(&self, vpn: &mut VpnManager) -> Result<Mode, CoordinatorError> {
        match vpn.connect().await {
            Ok(()) => {
                if self.mode() != Mode::Vpn {
                    let details = match vpn.pid() {
                        Some(pid) => format!("VPN client running (pid {})", pid),
                        None => "Egress already on target".to_string(),
                    };
                    self.transition(Mode::Vpn, EventKind::VpnConnected, details);
                }
                // Confirmation probe refreshes the status snapshot
                let _ = self.probe_egress().await;
                Ok(Mode::Vpn)
            }
            Err(e) => {
                warn!("VPN unavailable ({}), falling back to proxy", e);
                self.transition(Mode::Proxy, EventKind::VpnFailedFallbackToProxy, e.to_string());
                if e.propagates() {
                    Err(e.into())
                } else {
                    Ok(Mode::Proxy)
                }
            }
        }
    }

    async fn health_check_locked(&self, vpn: &mut VpnManager) {
        let target_ip = self.inner.config.target_ip;
        let on_target = matches!(self.probe_egress().await, Ok(ip) if ip == target_ip);
        let vpn_connected = vpn.is_connected().await;

        match self.mode() {
            Mode::Vpn if !on_target || !vpn_connected => {
                self.handle_vpn_disconnection(vpn).await;
            }
            Mode::Direct if !on_target => {
                warn!("Direct egress no longer matches target, trying VPN");
                if let Err(e) = self.try_vpn(vpn).await {
                    warn!("VPN attempt after direct drift failed: {}", e);
                }
            }
            mode => debug!("Health check: mode {}, on target: {}", mode, on_target),
        }
    }

    async fn handle_vpn_disconnection(&self, vpn: &mut VpnManager) {
        let target_ip = self.inner.config.target_ip;
        warn!("VPN connection appears down, verifying egress IP");

        if let Ok(ip) = self.probe_egress().await {
            if ip == target_ip {
                // Direct never carries a VPN session
                if vpn.state().await != VpnState::Disconnected {
                    vpn.disconnect().await;
                }
                self.transition(
                    Mode::Direct,
                    EventKind::VpnDisconnectedButIpMaintained,
                    format!("Egress IP {} still matches target", ip),
                );
                return;
            }
        }

        match vpn.reconnect().await {
            Ok(()) => {
                self.transition(
                    Mode::Vpn,
                    EventKind::VpnReconnected,
                    format!("VPN reconnected (pid {:?})", vpn.pid()),
                );
                let _ = self.probe_egress().await;
            }
            Err(e) => {
                self.record(
                    EventKind::FailoverTriggered,
                    self.mode(),
                    format!("VPN reconnection failed: {}", e),
                );
                self.transition(
                    Mode::Proxy,
                    EventKind::VpnReconnectionFailedProxyActivated,
                    e.to_string(),
                );
            }
        }
    }

    /// Probe and fold the result into the status snapshot
    async fn probe_egress(&self) -> Result<IpAddr, NetworkError> {
        let result = self.inner.probe.probe(self.inner.config.probe_timeout()).await;

        let mut status = self
            .inner
            .status
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        status.last_checked_at = Some(now_ms());
        match &result {
            Ok(ip) => {
                status.current_ip = Some(*ip);
                status.is_target_ip = *ip == status.target_ip;
                status.last_error = None;
            }
            Err(e) => {
                status.current_ip = None;
                status.is_target_ip = false;
                status.last_error = Some(e.to_string());
            }
        }

        result
    }

    fn transition(&self, mode: Mode, kind: EventKind, details: String) {
        let previous = self.inner.mode.set(mode);
        if previous != mode {
            info!("Mode {} -> {} ({})", previous, mode, kind);
        }
        self.record(kind, mode, details);
    }

    fn record(&self, kind: EventKind, mode: Mode, details: String) {
        let id = self.inner.next_event_id.fetch_add(1, Ordering::Relaxed);
        let event = FailoverEvent::new(id, kind, mode, details);
        debug!("Event #{} {}: {}", event.id, event.event_type, event.details);

        lock(&self.inner.history).push(event.clone());
        let _ = self.inner.events.send(event);
    }

    async fn on_vpn_lost(&self, reason: String) {
        let mut vpn = self.inner.vpn.lock().await;
        warn!("VPN lost: {}", reason);
        self.record(EventKind::VpnLost, self.mode(), reason);
        self.health_check_locked(&mut vpn).await;
        self.remember_vpn(&vpn).await;
    }

    async fn remember_vpn(&self, vpn: &VpnManager) {
        let snapshot = vpn.status().await;
        *lock(&self.inner.vpn_snapshot) = snapshot;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Periodic health checks plus immediate checks on VPN notices
async fn monitor(
    inner: Weak<Inner>,
    mut shutdown: watch::Receiver<bool>,
    mut notices: broadcast::Receiver<VpnNotice>,
) {
    let period = match inner.upgrade() {
        Some(inner) => inner.config.check_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut notices_open = true;

    debug!("Monitoring every {:?}", period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                FailoverCoordinator { inner }.run_health_check().await;
            }
            notice = notices.recv(), if notices_open => {
                let reason = match notice {
                    Ok(VpnNotice::Lost { reason }) => reason,
                    Ok(VpnNotice::Exited { code }) => format!("VPN client exited (code {:?})", code),
                    Ok(VpnNotice::Connected { .. }) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} VPN notices", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        notices_open = false;
                        continue;
                    }
                };
                let Some(inner) = inner.upgrade() else { break };
                FailoverCoordinator { inner }.on_vpn_lost(reason).await;
            }
        }
    }

    debug!("Monitoring stopped");
}
