//! Application process supervision.
//!
//! The supervisor spawns the child in its own process group, streams its
//! stdout/stderr line-by-line into the log buffer, drives the readiness
//! probe, and tracks the state machine:
//!
//! Initializing -> Starting -> Running | Failed, any -> Stopped/Failed on
//! exit. A readiness timeout marks the supervisor Failed but leaves the
//! process alive so its logs stay inspectable.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::health::{ProbeConfig, Prober};
use crate::logs::{LogBuffer, LogEntry, Stream};

/// Grace between SIGTERM and SIGKILL when stopping the process group.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Initializing,
    Starting,
    Running,
    Failed,
    Stopped,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Initializing => "initializing",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Failed => "failed",
            ProcessState::Stopped => "stopped",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<String>,
    pub ready_probe: Option<ProbeConfig>,
}

struct Inner {
    state: ProcessState,
    pid: u32,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    logs: Arc<LogBuffer>,
    inner: RwLock<Inner>,
    state_tx: watch::Sender<ProcessState>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, logs: Arc<LogBuffer>) -> Result<Arc<Self>, ProxyError> {
        if config.command.is_empty() {
            return Err(ProxyError::Config("command cannot be empty".into()));
        }
        let (state_tx, _) = watch::channel(ProcessState::Initializing);
        Ok(Arc::new(Self {
            config,
            logs,
            inner: RwLock::new(Inner {
                state: ProcessState::Initializing,
                pid: 0,
                started_at: None,
                stopped_at: None,
            }),
            state_tx,
        }))
    }

    /// Spawns the process and the background tasks that drive it. Returns
    /// once the process has been spawned; readiness is resolved
    /// asynchronously through the state machine.
    pub fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        {
            let inner = crate::sync::read_or_recover(&self.inner);
            if inner.state == ProcessState::Running {
                return Err(ProxyError::AlreadyRunning);
            }
        }

        info!(command = ?self.config.command, "starting process");
        self.set_state(ProcessState::Starting);

        let mut command = Command::new(&self.config.command[0]);
        command
            .args(&self.config.command[1..])
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.config.workdir.as_deref() {
            command.current_dir(dir);
        }
        // Own process group: the parent's SIGINT/SIGTERM must not reach the
        // child; termination is explicit and staged through stop().
        #[cfg(unix)]
        command.process_group(0);

        {
            let mut inner = crate::sync::write_or_recover(&self.inner);
            inner.started_at = Some(Utc::now());
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.set_state(ProcessState::Failed);
                error!(error = %err, command = ?self.config.command, "failed to start process");
                return Err(ProxyError::Spawn(err));
            }
        };

        let pid = child.id().unwrap_or(0);
        {
            let mut inner = crate::sync::write_or_recover(&self.inner);
            inner.pid = pid;
        }
        info!(pid, "process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(Arc::clone(self).read_lines(stdout, Stream::Stdout, pid)));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(Arc::clone(self).read_lines(stderr, Stream::Stderr, pid)));
        }

        match self.config.ready_probe.clone() {
            Some(probe) => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    let prober = Prober::new(probe);
                    match prober.wait_until_ready().await {
                        Ok(()) => {
                            if this.transition_from_starting(ProcessState::Running) {
                                info!(pid, "process ready check passed");
                            }
                        }
                        Err(err) => {
                            // Do not kill: leave the process running so its
                            // logs remain inspectable through the viewer.
                            if this.transition_from_starting(ProcessState::Failed) {
                                error!(pid, error = %err, "process ready check failed");
                                this.add_error_log(format!("ERROR: Readiness check failed: {err}"));
                            }
                        }
                    }
                });
            }
            None => {
                self.set_state(ProcessState::Running);
            }
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            // Drain the pipe readers before recording the stop time so the
            // last output lines land in the buffer first.
            for reader in readers {
                let _ = reader.await;
            }

            let final_state = match &status {
                Ok(status) if status.success() => ProcessState::Stopped,
                _ => ProcessState::Failed,
            };
            {
                let mut inner = crate::sync::write_or_recover(&this.inner);
                inner.stopped_at = Some(Utc::now());
            }
            this.set_state(final_state);
            match status {
                Ok(status) => info!(pid, exit = ?status.code(), "process exited"),
                Err(err) => error!(pid, error = %err, "failed to wait for process"),
            }
        });

        Ok(())
    }

    async fn read_lines(
        self: Arc<Self>,
        pipe: impl AsyncRead + Unpin,
        stream: Stream,
        pid: u32,
    ) {
        let mut reader = BufReader::with_capacity(64 * 1024, pipe);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = line.trim_end_matches(['\n', '\r']).to_string();
                    debug!(stream = stream.as_str(), line = %text, "process output");
                    self.logs.append(LogEntry {
                        timestamp: Utc::now(),
                        stream,
                        line: text,
                        pid,
                    });
                }
                Err(err) => {
                    error!(stream = stream.as_str(), error = %err, "error reading process output");
                    break;
                }
            }
        }
    }

    /// Sends SIGTERM to the process group, waits up to the stop grace, then
    /// SIGKILLs the group.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let pid = self.pid();
        if pid == 0 {
            return Err(ProxyError::NotStarted);
        }

        info!(pid, "stopping process");
        let pgid = Pid::from_raw(pid as i32);
        if let Err(err) = killpg(pgid, Signal::SIGTERM) {
            warn!(pid, error = %err, "failed to send SIGTERM");
        }

        let stopped = self.wait_terminal(STOP_GRACE).await;
        if !stopped {
            warn!(pid, "process did not stop gracefully, sending SIGKILL");
            if let Err(err) = killpg(pgid, Signal::SIGKILL) {
                warn!(pid, error = %err, "failed to send SIGKILL");
            }
        }

        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    async fn wait_terminal(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
    }

    /// Adds an error line directly to the log buffer; used for failures that
    /// happen before (or instead of) any process output.
    pub fn add_error_log(&self, message: String) {
        self.logs.append(LogEntry {
            timestamp: Utc::now(),
            stream: Stream::Stderr,
            line: message,
            pid: self.pid(),
        });
    }

    pub fn state(&self) -> ProcessState {
        crate::sync::read_or_recover(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn pid(&self) -> u32 {
        crate::sync::read_or_recover(&self.inner).pid
    }

    /// Process uptime in seconds: still counting while alive, frozen at the
    /// stop time once exited.
    pub fn uptime_secs(&self) -> f64 {
        let inner = crate::sync::read_or_recover(&self.inner);
        let Some(started) = inner.started_at else {
            return 0.0;
        };
        let end = inner.stopped_at.unwrap_or_else(Utc::now);
        (end - started)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn command(&self) -> &[String] {
        &self.config.command
    }

    pub fn workdir(&self) -> Option<&str> {
        self.config.workdir.as_deref()
    }

    /// Observers (the server's deployment watcher, stop()) follow state
    /// transitions through this channel.
    pub fn subscribe_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: ProcessState) {
        let mut inner = crate::sync::write_or_recover(&self.inner);
        let old = inner.state;
        inner.state = state;
        drop(inner);
        debug!(from = old.as_str(), to = state.as_str(), "process state changed");
        self.state_tx.send_replace(state);
    }

    /// Readiness outcomes only apply while still Starting; a process that
    /// already exited keeps its terminal state.
    fn transition_from_starting(&self, state: ProcessState) -> bool {
        {
            let mut inner = crate::sync::write_or_recover(&self.inner);
            if inner.state != ProcessState::Starting {
                return false;
            }
            inner.state = state;
        }
        self.state_tx.send_replace(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &[&str]) -> SupervisorConfig {
        SupervisorConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            workdir: None,
            ready_probe: None,
        }
    }

    async fn wait_for(supervisor: &Arc<Supervisor>, state: ProcessState) {
        let mut rx = supervisor.subscribe_state();
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *rx.borrow_and_update() == state {
                    return;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {state:?}"));
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let logs = Arc::new(LogBuffer::new(100));
        let supervisor = Supervisor::new(
            config(&["sh", "-c", "echo hello; echo oops 1>&2"]),
            Arc::clone(&logs),
        )
        .unwrap();
        supervisor.start().unwrap();
        wait_for(&supervisor, ProcessState::Stopped).await;

        let entries = logs.recent(0);
        assert!(entries
            .iter()
            .any(|e| e.stream == Stream::Stdout && e.line == "hello"));
        assert!(entries
            .iter()
            .any(|e| e.stream == Stream::Stderr && e.line == "oops"));
        assert!(entries.iter().all(|e| e.pid == supervisor.pid()));
        logs.close();
    }

    #[tokio::test]
    async fn clean_exit_is_stopped_nonzero_is_failed() {
        let logs = Arc::new(LogBuffer::new(10));
        let ok = Supervisor::new(config(&["sh", "-c", "exit 0"]), Arc::clone(&logs)).unwrap();
        ok.start().unwrap();
        wait_for(&ok, ProcessState::Stopped).await;

        let bad = Supervisor::new(config(&["sh", "-c", "exit 3"]), Arc::clone(&logs)).unwrap();
        bad.start().unwrap();
        wait_for(&bad, ProcessState::Failed).await;
        logs.close();
    }

    #[tokio::test]
    async fn spawn_failure_sets_failed_state() {
        let logs = Arc::new(LogBuffer::new(10));
        let supervisor =
            Supervisor::new(config(&["/no/such/binary-hubproxy-test"]), Arc::clone(&logs)).unwrap();
        let err = supervisor.start().unwrap_err();
        assert!(matches!(err, ProxyError::Spawn(_)));
        assert_eq!(supervisor.state(), ProcessState::Failed);
        assert!(!supervisor.is_running());
        logs.close();
    }

    #[tokio::test]
    async fn no_probe_means_running_immediately() {
        let logs = Arc::new(LogBuffer::new(10));
        let supervisor =
            Supervisor::new(config(&["sh", "-c", "sleep 5"]), Arc::clone(&logs)).unwrap();
        supervisor.start().unwrap();
        wait_for(&supervisor, ProcessState::Running).await;
        assert!(supervisor.is_running());
        assert!(supervisor.pid() > 0);

        let err = supervisor.start().unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyRunning));

        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), ProcessState::Stopped);
        assert!(supervisor.uptime_secs() > 0.0);
        logs.close();
    }

    #[tokio::test]
    async fn readiness_timeout_fails_without_killing() {
        let dead_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut cfg = config(&["sh", "-c", "sleep 30"]);
        cfg.ready_probe = Some(ProbeConfig {
            url: format!("http://127.0.0.1:{dead_port}/"),
            deadline: Duration::from_millis(200),
            interval: Duration::from_millis(50),
            initial_delay: Duration::ZERO,
            success_threshold: 1,
            request_timeout: Duration::from_millis(200),
        });

        let logs = Arc::new(LogBuffer::new(10));
        let supervisor = Supervisor::new(cfg, Arc::clone(&logs)).unwrap();
        supervisor.start().unwrap();
        wait_for(&supervisor, ProcessState::Failed).await;

        // The process is still alive: signal 0 probes for existence.
        let pid = Pid::from_raw(supervisor.pid() as i32);
        assert!(nix::sys::signal::kill(pid, None).is_ok());
        assert!(logs
            .recent(0)
            .iter()
            .any(|e| e.line.contains("Readiness check failed")));

        supervisor.stop().await.unwrap();
        logs.close();
    }

    #[tokio::test]
    async fn stop_without_start_errors() {
        let logs = Arc::new(LogBuffer::new(10));
        let supervisor = Supervisor::new(config(&["sh", "-c", "true"]), Arc::clone(&logs)).unwrap();
        assert!(matches!(
            supervisor.stop().await.unwrap_err(),
            ProxyError::NotStarted
        ));
        logs.close();
    }
}
