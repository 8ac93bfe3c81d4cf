//! Companion process lifecycle: probe, launch, handshake, shutdown.
//!
//! The supervisor owns the listening socket, the connected stream, and the
//! child process handle. Lifecycle is a one-way state machine:
//!
//! ```text
//! NotStarted → Probing → Launched → Listening → Ready → ShuttingDown → Stopped
//!                  \________\→ Failed
//! ```
//!
//! The launch sequence binds an ephemeral local port first, then starts the
//! companion pointed at that port and waits (bounded) for it to connect back.
//! The first frame on the accepted connection must be the `pid_response`
//! handshake ack.
//!
//! Steady-state command round trips have no timeout, so a wedged companion
//! can leave a thread parked in a socket read while it holds the supervisor.
//! [`TeardownHandle`] exists for exactly that case: it carries everything
//! teardown needs (a cloned stream, the shared child handle, the recorded
//! PID) outside the supervisor, killing the companion and unblocking the
//! parked reader without ever waiting for the supervisor itself.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::bootstrap::StagedScripts;
use crate::codec;
use crate::error::{PyBridgeError, Result};
use crate::protocol::{self, DebugBufferAck};

/// How long the launch waits for the companion to connect back.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval for the non-blocking accept loop.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Probe output at or above this length is treated as an error report.
/// A healthy check script prints nothing (or at most stray whitespace).
const PROBE_NOISE_MAX: usize = 5;

/// Launch parameters for the companion process.
#[derive(Debug)]
pub struct LaunchConfig {
    python_command: String,
    check_script: PathBuf,
    server_script: PathBuf,
    accept_timeout: Duration,
    // Keeps staged temp files alive for the life of the supervisor.
    _staged: Option<StagedScripts>,
}

impl LaunchConfig {
    /// Configure a launch using scripts already on disk.
    pub fn new(
        python_command: impl Into<String>,
        check_script: impl Into<PathBuf>,
        server_script: impl Into<PathBuf>,
    ) -> LaunchConfig {
        LaunchConfig {
            python_command: python_command.into(),
            check_script: check_script.into(),
            server_script: server_script.into(),
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            _staged: None,
        }
    }

    /// Configure a launch that stages the embedded bootstrap scripts.
    pub fn embedded(python_command: impl Into<String>) -> Result<LaunchConfig> {
        let staged = StagedScripts::stage_embedded()?;
        let mut config = LaunchConfig::new(
            python_command,
            staged.check_script(),
            staged.server_script(),
        );
        config._staged = Some(staged);
        Ok(config)
    }

    /// Override the accept timeout (primarily for tests).
    pub fn accept_timeout(mut self, timeout: Duration) -> LaunchConfig {
        self.accept_timeout = timeout;
        self
    }

    /// The interpreter command used for probe and launch.
    pub fn python_command(&self) -> &str {
        &self.python_command
    }

    /// Path of the server script handed to the companion.
    pub fn server_script(&self) -> &Path {
        &self.server_script
    }
}

/// Seam for starting the companion process.
///
/// The default [`PythonLauncher`] spawns the interpreter; tests substitute a
/// launcher that connects an in-process protocol double to the listener, the
/// same way the original system supported a manually started server for
/// development.
pub trait Launcher: Send {
    /// Start the companion pointed at `port`.
    ///
    /// Returning `Ok(None)` means the companion is managed externally and
    /// there is no child handle to supervise.
    fn launch(&mut self, config: &LaunchConfig, port: u16, debug: bool) -> Result<Option<Child>>;
}

/// Spawns `python_command server_script PORT [debug]`.
#[derive(Debug, Default)]
pub struct PythonLauncher;

impl Launcher for PythonLauncher {
    fn launch(&mut self, config: &LaunchConfig, port: u16, debug: bool) -> Result<Option<Child>> {
        let child = Command::new(&config.python_command)
            .arg(&config.server_script)
            .arg(port.to_string())
            .arg(if debug { "debug" } else { "" })
            // The companion redirects its own stdout/stderr into in-process
            // buffers; null here so an unread pipe can never wedge it.
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                PyBridgeError::ProcessStart(format!(
                    "could not spawn `{}`: {e}",
                    config.python_command
                ))
            })?;
        Ok(Some(child))
    }
}

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing has happened yet.
    NotStarted,
    /// Running the environment-check script.
    Probing,
    /// Companion process started, not yet connected.
    Launched,
    /// Waiting for the companion to connect back.
    Listening,
    /// Handshake complete; commands may flow.
    Ready,
    /// Teardown in progress.
    ShuttingDown,
    /// Teardown complete.
    Stopped,
    /// Probe or launch failed; absorbing.
    Failed,
}

/// Owns the companion process and its socket channel.
#[derive(Debug)]
pub struct Supervisor {
    config: LaunchConfig,
    state: SupervisorState,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    child: Arc<Mutex<Option<Child>>>,
    companion_pid: Option<u32>,
    shutdown_done: Arc<AtomicBool>,
}

impl Supervisor {
    /// Run the full startup sequence: probe, launch, handshake.
    ///
    /// On any failure no partial session is left behind: the listener and any
    /// spawned child are torn down before the error is returned.
    pub fn start(config: LaunchConfig, launcher: &mut dyn Launcher) -> Result<Supervisor> {
        let mut sup = Supervisor {
            config,
            state: SupervisorState::NotStarted,
            listener: None,
            stream: None,
            child: Arc::new(Mutex::new(None)),
            companion_pid: None,
            shutdown_done: Arc::new(AtomicBool::new(false)),
        };
        sup.probe()?;
        sup.launch(launcher)?;
        sup.handshake()?;
        Ok(sup)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// PID reported by the companion in the handshake.
    pub fn companion_pid(&self) -> Option<u32> {
        self.companion_pid
    }

    /// Borrow the live stream, or fail if the session is not usable.
    pub fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        if self.state != SupervisorState::Ready {
            return Err(PyBridgeError::SessionUnavailable);
        }
        self.stream
            .as_mut()
            .ok_or(PyBridgeError::SessionUnavailable)
    }

    /// Build a [`TeardownHandle`] sharing this supervisor's teardown state.
    pub fn teardown_handle(&self) -> Result<TeardownHandle> {
        Ok(TeardownHandle {
            stream: self
                .stream
                .as_ref()
                .map(TcpStream::try_clone)
                .transpose()?,
            child: Arc::clone(&self.child),
            pid: self.companion_pid,
            done: Arc::clone(&self.shutdown_done),
        })
    }

    fn set_state(&mut self, next: SupervisorState) {
        log::debug!("supervisor: {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Run the companion in check mode (no socket) and treat non-trivial
    /// combined output as an environment error report.
    fn probe(&mut self) -> Result<()> {
        self.set_state(SupervisorState::Probing);
        let output = Command::new(&self.config.python_command)
            .arg(&self.config.check_script)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                self.state = SupervisorState::Failed;
                PyBridgeError::ProcessStart(format!(
                    "could not run environment check with `{}`: {e}",
                    self.config.python_command
                ))
            })?;

        let mut details = String::from_utf8_lossy(&output.stdout).into_owned();
        details.push_str(&String::from_utf8_lossy(&output.stderr));
        if details.len() >= PROBE_NOISE_MAX {
            self.set_state(SupervisorState::Failed);
            return Err(PyBridgeError::EnvironmentUnavailable { details });
        }
        Ok(())
    }

    /// Bind the ephemeral listener, start the companion, and wait (bounded)
    /// for it to connect back.
    fn launch(&mut self, launcher: &mut dyn Launcher) -> Result<()> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
            self.state = SupervisorState::Failed;
            PyBridgeError::ProcessStart(format!("could not bind local listener: {e}"))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                self.state = SupervisorState::Failed;
                PyBridgeError::Io(e)
            })?
            .port();
        log::debug!("listening for companion on 127.0.0.1:{port}");

        let debug = protocol::debug_flag();
        match launcher.launch(&self.config, port, debug) {
            Ok(child) => *lock_child(&self.child) = child,
            Err(e) => {
                self.set_state(SupervisorState::Failed);
                return Err(e);
            }
        }
        self.set_state(SupervisorState::Launched);

        listener.set_nonblocking(true)?;
        self.set_state(SupervisorState::Listening);
        let deadline = Instant::now() + self.config.accept_timeout;
        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("companion connected from {peer}");
                    break stream;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        // Listener and any spawned child are torn down here;
                        // the ephemeral port is released on return.
                        self.set_state(SupervisorState::Failed);
                        if let Some(mut child) = lock_child(&self.child).take() {
                            let _ = child.kill();
                            let _ = child.wait();
                        }
                        return Err(PyBridgeError::ProcessStart(format!(
                            "companion did not connect within {:?}",
                            self.config.accept_timeout
                        )));
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    self.set_state(SupervisorState::Failed);
                    return Err(PyBridgeError::ProcessStart(format!("accept failed: {e}")));
                }
            }
        };

        stream.set_nonblocking(false)?;
        let _ = stream.set_nodelay(true);
        self.listener = Some(listener);
        self.stream = Some(stream);
        Ok(())
    }

    /// Read the single framed PID acknowledgement that opens the session.
    fn handshake(&mut self) -> Result<()> {
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(PyBridgeError::SessionUnavailable),
        };
        let result = codec::read_frame(stream)
            .and_then(|bytes| protocol::parse_ack(&bytes))
            .and_then(protocol::expect_pid);
        match result {
            Ok(pid) => {
                log::info!("companion process ready (pid {pid})");
                self.companion_pid = Some(pid);
                self.set_state(SupervisorState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(SupervisorState::Failed);
                self.stream = None;
                if let Some(mut child) = lock_child(&self.child).take() {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                Err(match e {
                    e @ PyBridgeError::Handshake(_) => e,
                    other => PyBridgeError::Handshake(other.to_string()),
                })
            }
        }
    }

    /// Tear the companion down. Idempotent: the teardown effects happen at
    /// most once between this, repeated calls, and any [`TeardownHandle`]
    /// sharing the one-shot flag.
    pub fn shutdown(&mut self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            // Teardown already ran (earlier call, or a handle); just settle
            // the local state.
            self.stream = None;
            self.listener = None;
            self.set_state(SupervisorState::Stopped);
            return;
        }
        self.set_state(SupervisorState::ShuttingDown);

        if let Err(e) = self.graceful_shutdown() {
            log::warn!("graceful companion shutdown failed ({e}); forcing kill");
            self.forceful_kill();
        }
        self.stream = None;
        self.listener = None;
        self.set_state(SupervisorState::Stopped);
    }

    fn graceful_shutdown(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            if log::log_enabled!(log::Level::Debug) {
                // One last drain of the companion's captured output.
                codec::write_frame(stream, &protocol::Command::GetDebugBuffer.to_wire()?)?;
                let ack = protocol::parse_ack(&codec::read_frame(stream)?)?;
                let buffers: DebugBufferAck = protocol::expect_ok(ack)?;
                if !buffers.std_out.is_empty() {
                    log::debug!("companion stdout:\n{}", buffers.std_out);
                }
                if !buffers.std_err.is_empty() {
                    log::debug!("companion stderr:\n{}", buffers.std_err);
                }
            }
            log::debug!("sending shutdown command");
            codec::write_frame(stream, &protocol::Command::Shutdown.to_wire()?)?;
        }
        self.stream = None;

        if let Some(mut child) = lock_child(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    /// Last-resort teardown when the graceful path itself failed.
    ///
    /// Prefers the child handle (immune to PID reuse); falls back to an
    /// OS-level kill by the handshake PID only when no handle exists, i.e.
    /// when the companion was launched externally.
    fn forceful_kill(&mut self) {
        if let Some(mut child) = lock_child(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
            return;
        }
        if let Some(pid) = self.companion_pid {
            kill_by_pid(pid);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tears the companion down without touching the supervisor.
///
/// A command round trip holds the supervisor for its whole request/ack
/// exchange, and that exchange has no timeout; teardown triggered from a
/// signal handler or another thread must therefore never wait for the
/// supervisor. The handle writes one shutdown frame on its cloned stream,
/// shuts the socket down both ways (which unblocks any thread parked in a
/// read on the shared connection), then kills the child. The one-shot flag
/// is shared with [`Supervisor::shutdown`], so the teardown effects happen
/// at most once between the two paths.
#[derive(Debug)]
pub struct TeardownHandle {
    stream: Option<TcpStream>,
    child: Arc<Mutex<Option<Child>>>,
    pid: Option<u32>,
    done: Arc<AtomicBool>,
}

impl TeardownHandle {
    /// Kill the companion and unblock any in-flight reader. Idempotent.
    pub fn shutdown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = &self.stream {
            if let Ok(bytes) = protocol::Command::Shutdown.to_wire() {
                let mut writer = stream;
                if let Err(e) = codec::write_frame(&mut writer, &bytes) {
                    log::debug!("shutdown frame not delivered: {e}");
                }
            }
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(mut child) = lock_child(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
            return;
        }
        if let Some(pid) = self.pid {
            kill_by_pid(pid);
        }
    }
}

fn lock_child(child: &Mutex<Option<Child>>) -> MutexGuard<'_, Option<Child>> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bare OS-level kill, only for companions with no owned child handle.
fn kill_by_pid(pid: u32) {
    log::warn!("killing companion by pid {pid}");
    let result = if cfg!(windows) {
        Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
    } else {
        Command::new("kill").args(["-9", &pid.to_string()]).output()
    };
    if let Err(e) = result {
        log::error!("pid kill failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_config_defaults_and_overrides() {
        let config = LaunchConfig::new("python3", "/tmp/check.py", "/tmp/server.py");
        assert_eq!(config.python_command(), "python3");
        assert_eq!(config.accept_timeout, DEFAULT_ACCEPT_TIMEOUT);

        let config = config.accept_timeout(Duration::from_millis(250));
        assert_eq!(config.accept_timeout, Duration::from_millis(250));
    }

    #[test]
    fn embedded_config_stages_scripts() {
        let config = LaunchConfig::embedded("python3").unwrap();
        assert!(config.check_script.exists());
        assert!(config.server_script().exists());
    }
}
