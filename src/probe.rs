//! Readiness probing for an instrumented server.
//!
//! Two phases under one wall-clock budget: first the TCP port must accept
//! connections, then one of the health paths must answer with a 2xx.
//! Failed attempts back off exponentially, capped, and never sleep past
//! the deadline.

use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Shortest pause between two attempts.
pub const MIN_SLEEP: Duration = Duration::from_millis(100);

pub const DEFAULT_HEALTH_PATHS: [&str; 2] = ["/healthz", "/health"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    Tcp,
    Http,
}

impl fmt::Display for ProbePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbePhase::Tcp => f.write_str("TCP"),
            ProbePhase::Http => f.write_str("HTTP health"),
        }
    }
}

/// The server did not become ready within the budget.
#[derive(Debug, Error)]
#[error(
    "{phase} check for {target} did not succeed within {elapsed:.1?} ({attempts} attempts){}",
    render_tail(.log_tail)
)]
pub struct TimeoutError {
    pub phase: ProbePhase,
    pub target: String,
    pub elapsed: Duration,
    pub attempts: u32,
    /// Last lines of the server log, if one was configured.
    pub log_tail: Vec<String>,
}

fn render_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        return String::new();
    }
    format!(
        "\n--- Server log (tail) ---\n{}\n--- End server log ---",
        tail.join("\n")
    )
}

/// Successful probe.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub elapsed: Duration,
    pub attempts: u32,
}

/// Capped exponential backoff: `initial`, `2 * initial`, ... up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(MIN_SLEEP);
        Self {
            initial,
            current: initial,
            max: max.max(initial),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Read the last `n` lines of a log file. Unreadable files give nothing.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].iter().map(|l| (*l).to_string()).collect()
        }
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "could not read server log");
            Vec::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    host: String,
    port: u16,
    health_paths: Vec<String>,
    timeout: Duration,
    connect_timeout: Duration,
    request_timeout: Duration,
    initial_interval: Duration,
    max_interval: Duration,
    log_path: Option<PathBuf>,
    log_tail_lines: usize,
}

impl ReadinessProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            health_paths: DEFAULT_HEALTH_PATHS.iter().map(|p| (*p).to_string()).collect(),
            timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(2),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(8),
            log_path: None,
            log_tail_lines: 200,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_health_paths<S: AsRef<str>>(mut self, paths: &[S]) -> Self {
        self.health_paths = paths.iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max;
        self
    }

    #[must_use]
    pub fn with_log(mut self, path: impl Into<PathBuf>, tail_lines: usize) -> Self {
        self.log_path = Some(path.into());
        self.log_tail_lines = tail_lines;
        self
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Block until the server is ready or the budget is spent.
    pub fn wait_ready(&self) -> Result<Ready, TimeoutError> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut backoff = Backoff::new(self.initial_interval, self.max_interval);
        let mut attempts = 0u32;

        tracing::info!(host = %self.host, port = self.port, "waiting for TCP port to accept connections");
        loop {
            attempts += 1;
            if self.tcp_accepts(deadline) {
                tracing::info!(attempts, "TCP port is accepting connections");
                break;
            }
            if !pause(&mut backoff, deadline) {
                return Err(self.timed_out(ProbePhase::Tcp, start, attempts));
            }
        }

        backoff.reset();
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout)
            .timeout(self.request_timeout)
            .build();
        tracing::info!(
            url = %self.base_url(),
            paths = ?self.health_paths,
            "waiting for health endpoint"
        );
        loop {
            attempts += 1;
            if self.health_ok(&agent, deadline) {
                let elapsed = start.elapsed();
                tracing::info!(attempts, ?elapsed, "server is ready");
                return Ok(Ready { elapsed, attempts });
            }
            if !pause(&mut backoff, deadline) {
                return Err(self.timed_out(ProbePhase::Http, start, attempts));
            }
        }
    }

    fn addrs(&self) -> Vec<SocketAddr> {
        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                tracing::debug!(host = %self.host, error = %e, "could not resolve host");
                Vec::new()
            }
        }
    }

    fn tcp_accepts(&self, deadline: Instant) -> bool {
        self.addrs().iter().any(|addr| {
            let budget = bounded(self.connect_timeout, deadline);
            TcpStream::connect_timeout(addr, budget).is_ok()
        })
    }

    fn health_ok(&self, agent: &ureq::Agent, deadline: Instant) -> bool {
        let base = self.base_url();
        for path in &self.health_paths {
            let url = format!("{base}{path}");
            let result = agent
                .get(&url)
                .timeout(bounded(self.request_timeout, deadline))
                .call();
            match result {
                Ok(resp) if (200..300).contains(&resp.status()) => return true,
                Ok(resp) => tracing::debug!(url = %url, status = resp.status(), "not ready"),
                Err(ureq::Error::Status(code, _)) => {
                    tracing::debug!(url = %url, status = code, "not ready")
                }
                Err(e) => tracing::debug!(url = %url, error = %e, "not ready"),
            }
        }
        false
    }

    fn timed_out(&self, phase: ProbePhase, start: Instant, attempts: u32) -> TimeoutError {
        let log_tail = match &self.log_path {
            Some(path) => tail_lines(path, self.log_tail_lines),
            None => Vec::new(),
        };
        let err = TimeoutError {
            phase,
            target: format!("{}:{}", self.host, self.port),
            elapsed: start.elapsed(),
            attempts,
            log_tail,
        };
        tracing::error!(%phase, elapsed = ?err.elapsed, attempts, "server did not become ready in time");
        err
    }
}

/// Per-attempt timeout, clipped to what is left of the budget.
fn bounded(limit: Duration, deadline: Instant) -> Duration {
    let remaining = deadline.saturating_duration_since(Instant::now());
    limit.min(remaining).max(Duration::from_millis(10))
}

/// Sleep before the next attempt. Returns `false` once the deadline has
/// passed.
fn pause(backoff: &mut Backoff, deadline: Instant) -> bool {
    let now = Instant::now();
    if now >= deadline {
        return false;
    }
    let remaining = deadline - now;
    let delay = backoff.next_delay().min(remaining).max(MIN_SLEEP);
    std::thread::sleep(delay);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 8, 8]);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_has_floor() {
        let mut b = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(b.next_delay(), MIN_SLEEP);
        assert_eq!(b.next_delay(), MIN_SLEEP);
    }

    #[test]
    fn test_tail_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();

        let tail = tail_lines(&path, 3);
        assert_eq!(tail, vec!["line 8", "line 9", "line 10"]);
        assert_eq!(tail_lines(&path, 100).len(), 10);
        assert!(tail_lines(&dir.path().join("missing.log"), 5).is_empty());
    }

    #[test]
    fn test_timeout_error_display_includes_tail() {
        let err = TimeoutError {
            phase: ProbePhase::Http,
            target: "127.0.0.1:8080".to_string(),
            elapsed: Duration::from_secs(5),
            attempts: 4,
            log_tail: vec!["panicked at main.rs".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("HTTP health check for 127.0.0.1:8080"));
        assert!(msg.contains("4 attempts"));
        assert!(msg.contains("--- Server log (tail) ---"));
        assert!(msg.contains("panicked at main.rs"));
    }

    #[test]
    fn test_base_url() {
        let probe = ReadinessProbe::new("127.0.0.1", 8087);
        assert_eq!(probe.base_url(), "http://127.0.0.1:8087");
    }
}
