//! Lifecycle of the instrumented server process.
//!
//! The server runs in its own process group with stdout/stderr redirected
//! to a log file. Shutdown interrupts the whole group, waits for it to
//! drain, escalates to a kill, and then checks that the group is gone and
//! the port no longer accepts connections.

use std::fs::File;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::error::{CovrunError, Result};
use crate::workload::CommandSpec;

/// How often a stopping process is polled.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Budget for a process group to disappear after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Pause between the process exiting and the port check.
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(1);

/// Fail fast when something already listens on `host:port`. Any other
/// bind failure (non-local address, privileged port, unknown host) is
/// reported with its cause.
pub fn check_port_available(host: &str, port: u16) -> Result<()> {
    match TcpListener::bind((host, port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(CovrunError::PortInUse { port }),
        Err(e) => {
            tracing::debug!(host, port, error = %e, "bind check failed");
            Err(CovrunError::Io(std::io::Error::new(
                e.kind(),
                format!("cannot bind {host}:{port}: {e}"),
            )))
        }
    }
}

/// Whether a local connection to `host:port` succeeds within `timeout`.
pub fn port_accepts(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => return false,
    };
    addrs
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}

/// Everything needed to launch the server.
#[derive(Debug, Clone)]
pub struct ServerLaunch {
    pub command: CommandSpec,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Failed,
    Stopped,
}

/// What `stop` observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    /// The session had already been stopped; nothing was signalled.
    pub already_stopped: bool,
    /// The graceful interrupt was not enough and the group was killed.
    pub forced: bool,
    pub exit_status: Option<ExitStatus>,
    /// The port refused a connection after shutdown.
    pub port_released: bool,
}

/// A running (or stopped) server process group.
#[derive(Debug)]
pub struct ServerSession {
    child: Option<Child>,
    pgid: Pid,
    host: String,
    port: u16,
    config_path: Option<PathBuf>,
    log_path: PathBuf,
    state: SessionState,
    release_grace: Duration,
}

/// Start the server described by `launch` in a new process group.
pub fn start(launch: &ServerLaunch) -> Result<ServerSession> {
    check_port_available(&launch.host, launch.port)?;

    if let Some(parent) = launch.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = File::create(&launch.log_path)?;
    let stderr = stdout.try_clone()?;

    tracing::info!(log = %launch.log_path.display(), "server logs will be written to file");
    tracing::info!("> {}", launch.command);

    let child = launch
        .command
        .command(&[])
        .envs(launch.env.iter().map(|(k, v)| (k, v)))
        .current_dir(&launch.cwd)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CovrunError::ToolMissing {
                    tool: launch.command.program.clone(),
                    hint: "check the `server` command in the settings file".to_string(),
                }
            } else {
                CovrunError::Io(e)
            }
        })?;

    let raw = i32::try_from(child.id()).map_err(|_| CovrunError::WorkloadExecution {
        command: launch.command.to_string(),
        reason: format!("pid {} out of range", child.id()),
    })?;
    tracing::debug!(pid = raw, port = launch.port, "server started");

    Ok(ServerSession {
        child: Some(child),
        pgid: Pid::from_raw(raw),
        host: launch.host.clone(),
        port: launch.port,
        config_path: launch.config_path.clone(),
        log_path: launch.log_path.clone(),
        state: SessionState::Starting,
        release_grace: DEFAULT_RELEASE_GRACE,
    })
}

impl ServerSession {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn pid(&self) -> i32 {
        self.pgid.as_raw()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn mark_ready(&mut self) {
        self.state = SessionState::Ready;
    }

    pub fn mark_failed(&mut self) {
        self.state = SessionState::Failed;
    }

    pub fn set_release_grace(&mut self, grace: Duration) {
        self.release_grace = grace;
    }

    /// Whether any process of the session's group still exists.
    pub fn group_alive(&self) -> bool {
        match killpg(self.pgid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Interrupt the process group, wait up to `drain_timeout`, kill on
    /// timeout, then verify the port. Stopping a stopped session only
    /// repeats the port check.
    pub fn stop(&mut self, drain_timeout: Duration) -> Result<StopOutcome> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome {
                already_stopped: true,
                forced: false,
                exit_status: None,
                port_released: !self.port_still_open(),
            });
        };

        tracing::info!(pid = self.pid(), "stopping server");
        if let Err(e) = killpg(self.pgid, Signal::SIGINT) {
            tracing::debug!(error = %e, "interrupting process group failed, terminating leader");
            let _ = nix::sys::signal::kill(self.pgid, Signal::SIGTERM);
        }

        let (status, forced) = match self.reap(&mut child, drain_timeout) {
            Ok(reaped) => reaped,
            Err(e) => {
                // Kill the group before reporting the failure.
                tracing::warn!(pid = self.pid(), error = %e, "waiting for server failed, killing it");
                if killpg(self.pgid, Signal::SIGKILL).is_err() {
                    let _ = child.kill();
                }
                let _ = child.try_wait();
                self.state = SessionState::Failed;
                return Err(e);
            }
        };
        self.state = SessionState::Stopped;
        tracing::debug!(%status, forced, "server exited");

        if self.group_alive() {
            tracing::warn!(pgid = self.pid(), "process group outlived its leader, killing it");
            let _ = killpg(self.pgid, Signal::SIGKILL);
            let deadline = Instant::now() + KILL_GRACE;
            while self.group_alive() && Instant::now() < deadline {
                std::thread::sleep(WAIT_POLL);
            }
            if self.group_alive() {
                tracing::warn!(pgid = self.pid(), "process group still present after SIGKILL");
            }
        }

        std::thread::sleep(self.release_grace);
        let port_released = !self.port_still_open();
        tracing::info!(log = %self.log_path.display(), "server stopped");

        Ok(StopOutcome {
            already_stopped: false,
            forced,
            exit_status: Some(status),
            port_released,
        })
    }

    /// Wait for the leader to drain, killing the group on timeout. Returns
    /// the exit status and whether the kill was needed.
    fn reap(&self, child: &mut Child, drain_timeout: Duration) -> Result<(ExitStatus, bool)> {
        if let Some(status) = wait_timeout(child, drain_timeout)? {
            return Ok((status, false));
        }
        tracing::warn!(?drain_timeout, "server did not exit in time, killing process group");
        if let Err(e) = killpg(self.pgid, Signal::SIGKILL) {
            tracing::debug!(error = %e, "killing process group failed, killing leader");
            let _ = child.kill();
        }
        Ok((child.wait()?, true))
    }

    fn port_still_open(&self) -> bool {
        let open = port_accepts(&self.host, self.port, Duration::from_millis(500));
        if open {
            tracing::warn!(
                port = self.port,
                "port still occupied after shutdown; you may need to kill remaining processes manually"
            );
        }
        open
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            tracing::warn!(pid = self.pid(), "server session dropped while running, killing it");
            if killpg(self.pgid, Signal::SIGKILL).is_err() {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
    }
}

/// Poll `child` until it exits or `timeout` elapses.
fn wait_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(WAIT_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_port_available_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = check_port_available("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, CovrunError::PortInUse { port: p } if p == port));
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn test_check_port_available_reports_bind_cause() {
        // TEST-NET-1 is never a local address.
        let err = check_port_available("192.0.2.1", 8087).unwrap_err();
        assert!(!matches!(err, CovrunError::PortInUse { .. }), "{err}");
        assert!(err.to_string().contains("cannot bind 192.0.2.1:8087"), "{err}");
    }

    #[test]
    fn test_port_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_accepts("127.0.0.1", port, Duration::from_millis(500)));
        drop(listener);
        assert!(!port_accepts("127.0.0.1", port, Duration::from_millis(500)));
    }
}
