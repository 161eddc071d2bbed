//! Command line interface

use crate::api;
use anchor_failover::{FailoverCoordinator, FailoverEvent};
use anchor_network::{EgressProbe, HttpClient, HttpEgressProbe};
use anchor_vpn::{ConnectionConfig, SystemSupervisor, VpnManager, VpnNotice};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

/// Config file picked up from the working directory when `--config` is absent
const DEFAULT_CONFIG_FILE: &str = "anchor.toml";

#[derive(Parser, Debug)]
#[command(
    name = "anchor",
    version,
    about = "Keep exchange traffic on a whitelisted egress IP (VPN with relay failover)"
)]
pub struct Cli {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Public IP the exchange expects; overrides the config file
    #[arg(long, global = true)]
    pub target_ip: Option<IpAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the VPN client directly
    Vpn {
        #[command(subcommand)]
        action: VpnCommand,
    },
    /// Run the failover coordinator until interrupted
    Start {
        /// Also serve the REST control API
        #[arg(long)]
        api: bool,

        /// REST API listen address (default from config)
        #[arg(long)]
        api_addr: Option<SocketAddr>,
    },
    /// Query a running coordinator over its REST API
    Status {
        #[arg(long)]
        api_addr: Option<SocketAddr>,
    },
    /// Check egress IP and VPN client setup without changing anything
    Test,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnCommand {
    /// Connect and hold the session until interrupted
    Connect,
    /// Stop any running VPN client
    Disconnect,
    /// Show egress IP and client invocation
    Status,
    /// Connect, reconnect on loss, and log session events
    Monitor,
}

/// Load the config file and apply command line overrides
pub fn load_config(path: Option<&Path>, target_ip: Option<IpAddr>) -> Result<ConnectionConfig> {
    let mut config = match path {
        Some(path) => ConnectionConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
            ConnectionConfig::load(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("failed to load {}", DEFAULT_CONFIG_FILE))?
        }
        None => ConnectionConfig::default(),
    };

    if let Some(ip) = target_ip {
        config.target_ip = ip;
    }
    Ok(config)
}

/// Execute the parsed command
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref(), cli.target_ip)?;

    match cli.command {
        Command::Vpn { action } => run_vpn(config, action).await,
        Command::Start { api, api_addr } => {
            let api_addr = api.then(|| api_addr.unwrap_or(config.api_listen_addr));
            run_start(config, api_addr).await
        }
        Command::Status { api_addr } => {
            run_status(api_addr.unwrap_or(config.api_listen_addr)).await
        }
        Command::Test => run_test(config).await,
    }
}

fn vpn_manager(config: ConnectionConfig) -> VpnManager {
    let probe = Arc::new(HttpEgressProbe::with_services(config.probe_services.clone()));
    VpnManager::new(config, probe, Arc::new(SystemSupervisor::new()))
}

async fn run_vpn(config: ConnectionConfig, action: VpnCommand) -> Result<()> {
    config.validate()?;
    let mut manager = vpn_manager(config.clone());

    match action {
        VpnCommand::Connect => {
            manager.connect().await?;
            print_vpn_status(&manager).await;
            println!("VPN connected; press Ctrl+C to disconnect");

            shutdown_signal().await;
            manager.disconnect().await;
        }
        VpnCommand::Disconnect => {
            manager.disconnect().await;
            println!("VPN disconnected");
        }
        VpnCommand::Status => {
            let spec = manager.launch_spec();
            println!("Client:  {} {}", spec.executable.display(), spec.args.join(" "));
            match spec.validate() {
                Ok(program) => println!("Resolved: {}", program.display()),
                Err(e) => println!("Setup:   {}", e),
            }
            report_egress(&config).await?;
        }
        VpnCommand::Monitor => {
            let mut notices = manager.subscribe();
            manager.connect().await?;
            print_vpn_status(&manager).await;

            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);

            loop {
                let notice = tokio::select! {
                    _ = &mut shutdown => break,
                    notice = notices.recv() => notice,
                };

                match notice {
                    Ok(VpnNotice::Connected { pid }) => {
                        info!("VPN session up (pid {:?})", pid);
                    }
                    Ok(VpnNotice::Lost { reason }) => {
                        warn!("VPN lost: {}", reason);
                        if let Err(e) = manager.reconnect().await {
                            error!("Reconnect failed: {}", e);
                        }
                    }
                    Ok(VpnNotice::Exited { code }) => {
                        warn!("VPN client exited (code {:?})", code);
                        if let Err(e) = manager.reconnect().await {
                            error!("Reconnect failed: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} VPN notices", n),
                    Err(RecvError::Closed) => break,
                }
            }

            manager.disconnect().await;
        }
    }

    Ok(())
}

async fn print_vpn_status(manager: &VpnManager) {
    let status = manager.status().await;
    println!(
        "VPN {:?} (pid {}, external: {}, egress {})",
        status.state,
        status.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
        status.external,
        status
            .last_confirmed_ip
            .map_or_else(|| "unknown".to_string(), |ip| ip.to_string()),
    );
}

async fn run_start(config: ConnectionConfig, api_addr: Option<SocketAddr>) -> Result<()> {
    let coordinator = FailoverCoordinator::new(config)?;
    tokio::spawn(log_events(coordinator.subscribe()));

    let mode = coordinator.start().await?;
    println!("Coordinator running in {} mode; press Ctrl+C to stop", mode);

    match api_addr {
        Some(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind API on {}", addr))?;
            info!("Control API listening on http://{}", addr);

            axum::serve(listener, api::router(coordinator.clone()))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        None => shutdown_signal().await,
    }

    coordinator.stop().await?;
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<FailoverEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => info!(
                "[{}] {} -> {}: {}",
                event.id, event.event_type, event.mode, event.details
            ),
            Err(RecvError::Lagged(n)) => warn!("Missed {} failover events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_status(api_addr: SocketAddr) -> Result<()> {
    let url = format!("http://{}/status", api_addr);
    let response = HttpClient::with_defaults()
        .get(&url)
        .await
        .with_context(|| format!("coordinator API not reachable at {}", api_addr))?;

    if !response.is_success() {
        bail!("{} returned {}", url, response.status);
    }

    let status: serde_json::Value = serde_json::from_slice(&response.body)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn run_test(config: ConnectionConfig) -> Result<()> {
    config.validate()?;

    let spec = vpn_manager(config.clone()).launch_spec();
    match spec.validate() {
        Ok(program) => println!("[OK]   VPN client: {}", program.display()),
        Err(e) => println!("[WARN] VPN client: {}", e),
    }

    report_egress(&config).await
}

async fn report_egress(config: &ConnectionConfig) -> Result<()> {
    let probe = HttpEgressProbe::with_services(config.probe_services.clone());
    let ip = probe
        .probe(config.probe_timeout())
        .await
        .context("egress IP probe failed")?;

    let verdict = if ip == config.target_ip { "OK  " } else { "WARN" };
    println!(
        "[{}] Egress IP: {} (target {})",
        verdict, ip, config.target_ip
    );
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
