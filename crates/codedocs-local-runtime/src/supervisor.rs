//! Process manager for the local runtime (`ollama serve`).

use std::collections::VecDeque;
use std::future::Future;
use std::net::Ipv4Addr;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::client::OllamaClient;
use crate::config::RuntimeConfig;
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::port::{PortLease, PortNegotiator};
use crate::text::{strip_control_sequences, LineSplitter};

/// Lifecycle state of the runtime process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    NotStarted,
    Starting,
    Ready,
    Terminating,
    Terminated,
    Failed,
}

impl RuntimeState {
    /// Whether `self → next` is allowed. States only move forward; a fresh
    /// start is the one way back to `Starting`.
    pub fn can_transition_to(self, next: RuntimeState) -> bool {
        use RuntimeState::*;
        matches!(
            (self, next),
            (NotStarted | Terminated | Failed, Starting)
                | (Starting, Ready | Failed)
                | (Ready, Terminating)
                | (Terminating, Terminated | Failed)
        )
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuntimeState::NotStarted => "not started",
            RuntimeState::Starting => "starting",
            RuntimeState::Ready => "ready",
            RuntimeState::Terminating => "terminating",
            RuntimeState::Terminated => "terminated",
            RuntimeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the supervisor, cheap to read at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub bound_port: Option<u16>,
    pub pid: Option<u32>,
}

/// Handle to a ready runtime process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeHandle {
    /// Process ID
    pub pid: u32,
    /// Port the runtime listens on
    pub lease: PortLease,
    /// HTTP base URL of the runtime
    pub base_url: String,
    /// When the process was spawned
    pub started_at: SystemTime,
}

impl RuntimeHandle {
    /// Port the runtime listens on.
    pub fn port(&self) -> u16 {
        self.lease.bound
    }

    /// Get a client connected to this runtime.
    pub fn client(&self) -> OllamaClient {
        OllamaClient::with_url(self.base_url.clone())
    }
}

/// Ring buffer of the most recent output lines of a child process.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Arc<StdMutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputBuffer {
    /// Buffer keeping at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(StdMutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Copy of the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }
}

async fn capture_output<R>(mut source: R, buffer: OutputBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in splitter.push(&buf[..n]) {
            record_line(&buffer, &line);
        }
    }

    if let Some(line) = splitter.finish() {
        record_line(&buffer, &line);
    }
}

fn record_line(buffer: &OutputBuffer, raw: &str) {
    let line = strip_control_sequences(raw);
    let line = line.trim_end();
    if !line.is_empty() {
        debug!(target: "codedocs::runtime", "{}", line);
        buffer.push(line.to_string());
    }
}

/// `true` if something accepts TCP connections on `127.0.0.1:<port>`.
pub async fn probe_port(port: u16, probe_timeout: Duration) -> bool {
    matches!(
        timeout(probe_timeout, TcpStream::connect((Ipv4Addr::LOCALHOST, port))).await,
        Ok(Ok(_))
    )
}

struct RuntimeProcess {
    child: Child,
    pid: u32,
    lease: PortLease,
    started_at: SystemTime,
    readers: Vec<JoinHandle<()>>,
}

impl RuntimeProcess {
    fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            pid: self.pid,
            lease: self.lease,
            base_url: format!("http://{}", RuntimeConfig::runtime_host(self.lease.bound)),
            started_at: self.started_at,
        }
    }
}

enum NotReady {
    Exited(ExitStatus),
    TimedOut,
}

struct SupervisorState {
    state: RuntimeState,
    process: Option<RuntimeProcess>,
    /// `(pid, port)` of the process being started or running.
    endpoint: Option<(u32, u16)>,
    last_failure: Option<(ErrorKind, String)>,
    fault: Option<String>,
}

/// Owns the runtime child process.
///
/// All lifecycle operations go through one async mutex, so at most one
/// process exists per supervisor and concurrent `start` calls share a single
/// spawn. Dropping the supervisor kills a still-running process.
pub struct RuntimeSupervisor {
    config: RuntimeConfig,
    ports: PortNegotiator,
    inner: Mutex<SupervisorState>,
    attempts: AtomicU64,
    status: watch::Sender<RuntimeStatus>,
}

impl RuntimeSupervisor {
    /// Create a supervisor. Nothing is spawned until [`start`](Self::start).
    pub fn new(config: RuntimeConfig) -> Self {
        let (status, _) = watch::channel(RuntimeStatus {
            state: RuntimeState::NotStarted,
            bound_port: None,
            pid: None,
        });
        Self {
            config,
            ports: PortNegotiator::new(),
            inner: Mutex::new(SupervisorState {
                state: RuntimeState::NotStarted,
                process: None,
                endpoint: None,
                last_failure: None,
                fault: None,
            }),
            attempts: AtomicU64::new(0),
            status,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Current state, bound port and pid. Never waits on a running start.
    pub fn status(&self) -> RuntimeStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeStatus> {
        self.status.subscribe()
    }

    /// Handle of the ready process, if any.
    pub async fn handle(&self) -> Option<RuntimeHandle> {
        let inner = self.inner.lock().await;
        match (inner.state, inner.process.as_ref()) {
            (RuntimeState::Ready, Some(process)) => Some(process.handle()),
            _ => None,
        }
    }

    /// Whether the runtime is `Ready` and its port accepts connections.
    pub async fn is_healthy(&self) -> bool {
        match self.status() {
            RuntimeStatus {
                state: RuntimeState::Ready,
                bound_port: Some(port),
                ..
            } => probe_port(port, self.config.probe_timeout).await,
            _ => false,
        }
    }

    /// Start the runtime, or return the handle of the one already serving.
    ///
    /// Blocks until the runtime is ready or the startup timeout elapsed.
    pub async fn start(&self) -> Result<RuntimeHandle> {
        let observed = self.attempts.load(Ordering::SeqCst);
        let mut inner = self.inner.lock().await;

        if let Some(fault) = &inner.fault {
            return Err(RuntimeError::SupervisorFaulted(fault.clone()));
        }

        if inner.state == RuntimeState::Ready {
            if let Some(process) = inner.process.as_ref() {
                if probe_port(process.lease.bound, self.config.probe_timeout).await {
                    debug!("Runtime already running (PID: {})", process.pid);
                    return Ok(process.handle());
                }
                warn!(
                    "Runtime (PID: {}) stopped answering on port {}, restarting",
                    process.pid, process.lease.bound
                );
            }
            self.shutdown_locked(&mut inner).await?;
        } else if self.attempts.load(Ordering::SeqCst) != observed {
            // Another caller's attempt finished while we waited for the lock.
            if let Some((kind, message)) = inner.last_failure.clone() {
                return Err(RuntimeError::ConcurrentStartFailed { kind, message });
            }
        }

        let result = self.spawn_locked(&mut inner).await;
        inner.last_failure = result.as_ref().err().map(|e| (e.kind(), e.to_string()));
        self.attempts.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Stop the runtime: SIGTERM, then SIGKILL after the grace period.
    ///
    /// A no-op when nothing is running.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.process.is_none() {
            debug!("No runtime process to stop");
            return Ok(());
        }
        self.shutdown_locked(&mut inner).await
    }

    /// Clear a fault left by a failed termination so `start` works again.
    pub async fn clear_fault(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(fault) = inner.fault.take() {
            info!("Clearing supervisor fault: {}", fault);
        }
    }

    async fn spawn_locked(&self, inner: &mut SupervisorState) -> Result<RuntimeHandle> {
        self.config.validate()?;
        let lease = self
            .ports
            .reserve(self.config.runtime_port, self.config.port_scan_attempts)?;

        info!(
            "Starting runtime {} on port {}",
            self.config.runtime_binary.display(),
            lease.bound
        );
        self.transition(inner, RuntimeState::Starting);

        let spawned = Command::new(&self.config.runtime_binary)
            .args(&self.config.binary_args)
            .arg("serve")
            .envs(self.config.runtime_env(lease.bound))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.transition(inner, RuntimeState::Failed);
                return Err(RuntimeError::SpawnFailed(e.to_string()));
            }
        };

        let started_at = SystemTime::now();
        let pid = child.id().unwrap_or_default();
        debug!("Runtime process started with PID: {}", pid);
        inner.endpoint = Some((pid, lease.bound));
        self.publish(inner);

        let output = OutputBuffer::new(self.config.output_buffer_lines);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture_output(stdout, output.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture_output(stderr, output.clone())));
        }

        match self.wait_ready(&mut child, lease.bound).await {
            Ok(()) => {
                let process = RuntimeProcess {
                    child,
                    pid,
                    lease,
                    started_at,
                    readers,
                };
                let handle = process.handle();
                inner.process = Some(process);
                self.transition(inner, RuntimeState::Ready);
                info!("Runtime is ready (PID: {}, Port: {})", pid, lease.bound);
                Ok(handle)
            }
            Err(NotReady::Exited(status)) => {
                self.drain_readers(readers).await;
                self.transition(inner, RuntimeState::Failed);
                error!("Runtime exited during startup ({})", status);
                Err(RuntimeError::ExitedDuringStartup {
                    status: status.to_string(),
                    diagnostics: output.snapshot(),
                })
            }
            Err(NotReady::TimedOut) => {
                warn!(
                    "Runtime not ready after {:?}, killing PID {}",
                    self.config.startup_timeout, pid
                );
                let _ = child.start_kill();
                if timeout(self.config.kill_timeout, child.wait()).await.is_err() {
                    error!("Orphaned runtime PID {} did not exit after kill", pid);
                }
                self.drain_readers(readers).await;
                self.transition(inner, RuntimeState::Failed);
                Err(RuntimeError::StartTimeout {
                    port: lease.bound,
                    timeout: self.config.startup_timeout,
                    diagnostics: output.snapshot(),
                })
            }
        }
    }

    /// Poll the port until it accepts connections, the child exits, or the
    /// startup timeout elapses. Never sleeps past the deadline.
    async fn wait_ready(&self, child: &mut Child, port: u16) -> std::result::Result<(), NotReady> {
        let deadline = Instant::now() + self.config.startup_timeout;

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(NotReady::Exited(status));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if probe_port(port, self.config.probe_timeout.min(remaining)).await {
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NotReady::TimedOut);
            }
            debug!("Runtime not ready yet on port {}", port);
            sleep(self.config.ready_poll_interval.min(remaining)).await;
        }
    }

    async fn shutdown_locked(&self, inner: &mut SupervisorState) -> Result<()> {
        let Some(mut process) = inner.process.take() else {
            return Ok(());
        };
        let pid = process.pid;

        self.transition(inner, RuntimeState::Terminating);
        info!("Stopping runtime (PID: {})", pid);
        send_terminate(&mut process.child);

        let graceful = matches!(
            timeout(self.config.shutdown_grace, process.child.wait()).await,
            Ok(Ok(_))
        );

        if graceful {
            info!("Runtime stopped gracefully");
        } else {
            warn!(
                "Runtime didn't exit within {:?}, killing...",
                self.config.shutdown_grace
            );
            if let Err(reason) = self.force_kill(&mut process.child).await {
                return Err(self.termination_failed(inner, pid, reason));
            }
            info!("Runtime killed");
        }

        self.drain_readers(std::mem::take(&mut process.readers)).await;
        inner.endpoint = None;
        self.transition(inner, RuntimeState::Terminated);
        Ok(())
    }

    async fn force_kill(&self, child: &mut Child) -> std::result::Result<(), String> {
        if let Err(e) = child.start_kill() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                return Err(e.to_string());
            }
        }
        await_exit(child.wait(), self.config.kill_timeout).await
    }

    /// Fault the supervisor after a process survived termination.
    fn termination_failed(
        &self,
        inner: &mut SupervisorState,
        pid: u32,
        reason: String,
    ) -> RuntimeError {
        error!("Failed to kill runtime (PID: {}): {}", pid, reason);
        inner.fault = Some(format!("runtime PID {} survived kill: {}", pid, reason));
        inner.endpoint = None;
        self.transition(inner, RuntimeState::Failed);
        RuntimeError::TerminationFailed { pid, reason }
    }

    async fn drain_readers(&self, readers: Vec<JoinHandle<()>>) {
        for mut reader in readers {
            if timeout(self.config.output_drain_timeout, &mut reader).await.is_err() {
                reader.abort();
            }
        }
    }

    fn transition(&self, inner: &mut SupervisorState, next: RuntimeState) {
        if !inner.state.can_transition_to(next) {
            warn!("Refusing runtime state change {} -> {}", inner.state, next);
            return;
        }
        debug!("Runtime state {} -> {}", inner.state, next);
        inner.state = next;
        if matches!(next, RuntimeState::Failed | RuntimeState::Terminated) {
            inner.endpoint = None;
        }
        self.publish(inner);
    }

    fn publish(&self, inner: &SupervisorState) {
        self.status.send_replace(RuntimeStatus {
            state: inner.state,
            bound_port: inner.endpoint.map(|(_, port)| port),
            pid: inner.endpoint.map(|(pid, _)| pid),
        });
    }
}

/// Wait at most `limit` for a killed process to be reaped.
async fn await_exit<F>(exit: F, limit: Duration) -> std::result::Result<(), String>
where
    F: Future<Output = std::io::Result<ExitStatus>>,
{
    match timeout(limit, exit).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("still running {:?} after SIGKILL", limit)),
    }
}

fn send_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(
                    "SIGTERM to {} failed: {}",
                    pid,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(unix))]
    {
        // No graceful signal available; the grace wait then returns at once.
        let _ = child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_state_transitions() {
        use RuntimeState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Ready));
        assert!(Starting.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Terminated));
        assert!(Terminating.can_transition_to(Failed));
        assert!(Terminated.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Starting));

        assert!(!Ready.can_transition_to(Starting));
        assert!(!Terminated.can_transition_to(Ready));
        assert!(!NotStarted.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Starting.can_transition_to(Starting));
    }

    #[test]
    fn test_output_buffer_is_bounded() {
        let buffer = OutputBuffer::new(2);
        buffer.push("one".into());
        buffer.push("two".into());
        buffer.push("three".into());
        assert_eq!(buffer.snapshot(), vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_capture_output_cleans_lines() {
        let buffer = OutputBuffer::new(10);
        let input: &[u8] = b"\x1b[32mListening on 127.0.0.1:11434\x1b[0m\r\n\r\nversion 0.3.0";
        capture_output(input, buffer.clone()).await;
        assert_eq!(
            buffer.snapshot(),
            vec!["Listening on 127.0.0.1:11434", "version 0.3.0"]
        );
    }

    #[tokio::test]
    async fn test_probe_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_port(port, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!probe_port(port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_new_supervisor_is_idle() {
        let supervisor = RuntimeSupervisor::new(RuntimeConfig::default());
        assert_eq!(
            supervisor.status(),
            RuntimeStatus {
                state: RuntimeState::NotStarted,
                bound_port: None,
                pid: None
            }
        );
        assert!(!supervisor.is_healthy().await);
        assert!(supervisor.handle().await.is_none());
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.status().state, RuntimeState::NotStarted);
    }

    #[tokio::test]
    async fn test_await_exit_times_out() {
        let reason = await_exit(
            std::future::pending::<std::io::Result<ExitStatus>>(),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(reason.contains("still running"), "{}", reason);
    }

    #[tokio::test]
    async fn test_termination_failure_faults_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = RuntimeSupervisor::new(
            RuntimeConfig::builder()
                .runtime_binary(dir.path().join("ollama"))
                .models_dir(dir.path().join("models"))
                .build(),
        );

        {
            let mut inner = supervisor.inner.lock().await;
            inner.state = RuntimeState::Terminating;
            inner.endpoint = Some((4242, 11434));
            let err = supervisor.termination_failed(&mut inner, 4242, "still running".into());
            assert!(matches!(err, RuntimeError::TerminationFailed { pid: 4242, .. }));
            assert_eq!(err.kind(), ErrorKind::Fatal);
        }

        let status = supervisor.status();
        assert_eq!(status.state, RuntimeState::Failed);
        assert_eq!(status.pid, None);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, RuntimeError::SupervisorFaulted(ref m) if m.contains("4242")));
        assert!(!err.is_retryable());
        // Still faulted on the next attempt.
        assert!(matches!(
            supervisor.start().await,
            Err(RuntimeError::SupervisorFaulted(_))
        ));

        supervisor.clear_fault().await;
        let err = supervisor.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = RuntimeSupervisor::new(
            RuntimeConfig::builder()
                .runtime_binary(dir.path().join("ollama"))
                .models_dir(dir.path().join("models"))
                .build(),
        );
        let err = supervisor.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(supervisor.status().state, RuntimeState::NotStarted);
    }
}
