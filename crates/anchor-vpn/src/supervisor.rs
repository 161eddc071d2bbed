//! Process Supervisor
//!
//! Launches the VPN client, streams its output line by line and takes it
//! down again. The [`ProcessSupervisor`] trait is the seam the manager talks
//! to; [`SystemSupervisor`] is the real implementation on `tokio::process`.
//!
//! # Process lifecycle
//!
//! ```text
//! spawn ──▶ reaper task ──▶ exit state published on a watch channel
//!             ▲
//!             └── signal requests (Terminate / Kill) from any ProcessControl
//! ```
//!
//! A process whose controls have all been dropped is killed.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Buffered output lines per process
const OUTPUT_BUFFER: usize = 1024;

/// Upper bound for the stray-cleanup helper
const STRAY_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default grace period between Terminate and Kill
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Supervisor errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to spawn: {0}")]
    Spawn(String),

    #[error("Failed to signal process: {0}")]
    Signal(String),

    #[error("Process {0:?} survived kill")]
    Unkillable(Option<u32>),
}

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of client output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code; `None` when ended by a signal or unknown
    pub code: Option<i32>,
}

impl ExitState {
    const UNKNOWN: ExitState = ExitState { code: None };

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask politely (SIGTERM on Unix)
    Terminate,
    /// Force (SIGKILL / TerminateProcess)
    Kill,
}

/// What to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub credentials_file: Option<PathBuf>,
    pub required_files: Vec<PathBuf>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            credentials_file: None,
            required_files: Vec::new(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Credentials file that must exist before launch
    pub fn credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    /// Additional file that must exist before launch
    pub fn require(mut self, path: impl Into<PathBuf>) -> Self {
        self.required_files.push(path.into());
        self
    }

    /// Resolve the executable and check every required file
    ///
    /// Bare names (no path separator) are looked up on `PATH`.
    pub fn validate(&self) -> Result<PathBuf, SupervisorError> {
        let program = resolve_executable(&self.executable).ok_or_else(|| {
            SupervisorError::Configuration(format!(
                "VPN client not found: {}",
                self.executable.display()
            ))
        })?;

        for file in self.required_files.iter().chain(self.credentials_file.iter()) {
            if !file.is_file() {
                return Err(SupervisorError::Configuration(format!(
                    "required file not found: {}",
                    file.display()
                )));
            }
        }

        Ok(program)
    }
}

fn resolve_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        return executable.is_file().then(|| executable.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        let candidate = dir.join(executable);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

/// Clonable control side of a running process
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitState>>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl ProcessControl {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit state, if the process has ended
    pub fn exit_state(&self) -> Option<ExitState> {
        *self.exit.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_state().is_none()
    }

    /// Wait for the process to end
    pub async fn wait(&self) -> ExitState {
        let mut exit = self.exit.clone();
        let state = match exit.wait_for(Option::is_some).await {
            Ok(state) => *state,
            Err(_) => self.exit_state(),
        };
        state.unwrap_or(ExitState::UNKNOWN)
    }

    fn request(&self, signal: Signal) -> Result<(), SupervisorError> {
        self.signals.send(signal).map_err(|_| {
            SupervisorError::Signal(format!("pid {:?} already reaped", self.pid))
        })
    }
}

/// Running process: control plus its output stream
#[derive(Debug)]
pub struct ProcessHandle {
    control: ProcessControl,
    output: mpsc::Receiver<OutputLine>,
}

impl ProcessHandle {
    pub fn control(&self) -> &ProcessControl {
        &self.control
    }

    /// Next output line; `None` once both pipes are closed
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.output.recv().await
    }

    pub fn into_parts(self) -> (ProcessControl, mpsc::Receiver<OutputLine>) {
        (self.control, self.output)
    }
}

/// Launches and terminates the VPN client
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Validate `spec` and start the process
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError>;

    /// Deliver a termination request
    async fn signal(&self, control: &ProcessControl, signal: Signal) -> Result<(), SupervisorError> {
        control.request(signal)
    }

    /// Terminate, escalating to Kill once `grace` has passed
    async fn kill(&self, control: &ProcessControl, grace: Duration) -> Result<ExitState, SupervisorError> {
        if let Some(state) = control.exit_state() {
            return Ok(state);
        }

        if let Err(e) = self.signal(control, Signal::Terminate).await {
            debug!("Terminate request failed: {}", e);
        }
        if let Ok(state) = tokio::time::timeout(grace, control.wait()).await {
            return Ok(state);
        }

        warn!(
            "Process {:?} still alive after {:?}, killing",
            control.pid(),
            grace
        );
        if let Err(e) = self.signal(control, Signal::Kill).await {
            debug!("Kill request failed: {}", e);
        }
        tokio::time::timeout(grace, control.wait())
            .await
            .map_err(|_| SupervisorError::Unkillable(control.pid()))
    }

    /// Best-effort termination of other instances of `executable`
    async fn kill_strays(&self, executable: &Path);
}

/// Supervisor backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemSupervisor;

impl SystemSupervisor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSupervisor for SystemSupervisor {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<ProcessHandle, SupervisorError> {
        let program = spec.validate()?;

        let mut child = Command::new(&program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", program.display(), e)))?;

        let pid = child.id();
        info!("Spawned {} (pid {:?})", program.display(), pid);

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, OutputStream::Stderr, line_tx));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        tokio::spawn(reap(child, signal_rx, exit_tx));

        Ok(ProcessHandle {
            control: ProcessControl {
                pid,
                exit: exit_rx,
                signals: signal_tx,
            },
            output: line_rx,
        })
    }

    #[cfg(unix)]
    async fn kill_strays(&self, executable: &Path) {
        let Some(name) = process_name(executable) else {
            return;
        };

        let mut cmd = stray_lookup_command(&name);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let output = match tokio::time::timeout(STRAY_CLEANUP_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!("Stray lookup unavailable: {}", e);
                return;
            }
            Err(_) => {
                warn!("Stray lookup for {} timed out", name);
                return;
            }
        };

        let pids = stray_pids(&String::from_utf8_lossy(&output.stdout), std::process::id());
        for pid in pids {
            info!("Terminating stray {} (pid {})", name, pid);
            if let Err(e) = send_terminate(pid) {
                debug!("SIGTERM to stray pid {} failed: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    async fn kill_strays(&self, executable: &Path) {
        let Some(name) = process_name(executable) else {
            return;
        };

        let mut cmd = stray_cleanup_command(&name, std::process::id());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::time::timeout(STRAY_CLEANUP_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => debug!("Stray cleanup for {} finished ({})", name, status),
            Ok(Err(e)) => debug!("Stray cleanup unavailable: {}", e),
            Err(_) => warn!("Stray cleanup for {} timed out", name),
        }
    }
}

/// Process name the OS reports for `executable`
///
/// Linux truncates the name to 15 bytes, and an exact-match lookup with a
/// longer pattern never matches.
fn process_name(executable: &Path) -> Option<String> {
    let name = executable.file_name()?.to_str()?;
    if name.is_empty() {
        return None;
    }

    if cfg!(target_os = "linux") {
        let mut end = name.len().min(15);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        Some(name[..end].to_string())
    } else {
        Some(name.to_string())
    }
}

/// Exact process-name lookup; never matches on arguments
#[cfg(unix)]
fn stray_lookup_command(name: &str) -> Command {
    let mut cmd = Command::new("pgrep");
    cmd.arg("-x").arg(name);
    cmd
}

/// Pids listed by the lookup, minus our own process
#[cfg(unix)]
fn stray_pids(listing: &str, own_pid: u32) -> Vec<u32> {
    listing
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid != own_pid)
        .collect()
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> nix::Result<()> {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), NixSignal::SIGTERM)
}

#[cfg(not(unix))]
fn stray_cleanup_command(image: &str, own_pid: u32) -> Command {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/F", "/IM"])
        .arg(image)
        .arg("/FI")
        .arg(format!("PID ne {}", own_pid));
    cmd
}

async fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(text)) => {
                debug!("[{:?}] {}", stream, text);
                // Keep draining after the receiver is gone so the client never blocks on a full pipe
                let _ = tx.send(OutputLine { stream, text }).await;
            }
            Ok(None) => break,
            Err(e) => {
                debug!("{:?} read error: {}", stream, e);
                break;
            }
        }
    }
}

async fn reap(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    exit_tx: watch::Sender<Option<ExitState>>,
) {
    let pid = child.id();
    let mut orphaned = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = signals.recv(), if !orphaned => match request {
                Some(Signal::Terminate) => {
                    debug!("Terminating pid {:?}", pid);
                    terminate(&mut child);
                }
                Some(Signal::Kill) => {
                    debug!("Killing pid {:?}", pid);
                    if let Err(e) = child.start_kill() {
                        warn!("Kill of pid {:?} failed: {}", pid, e);
                    }
                }
                None => {
                    debug!("All controls for pid {:?} dropped, killing", pid);
                    orphaned = true;
                    let _ = child.start_kill();
                }
            },
        }
    };

    let state = match status {
        Ok(status) => ExitState {
            code: status.code(),
        },
        Err(e) => {
            warn!("Waiting on pid {:?} failed: {}", pid, e);
            ExitState::UNKNOWN
        }
    };

    info!("Process {:?} ended ({})", pid, state);
    exit_tx.send_replace(Some(state));
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = send_terminate(pid) {
        warn!("SIGTERM to pid {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!("Terminate of pid {:?} failed: {}", child.id(), e);
    }
}
