//! Remote process supervision
//!
//! One supervisor per (host, service). The lifecycle is a sum type with
//! monotonic transitions; a process that has entered `Terminated` is never
//! reused. `stop` is safe in any state and always lands in a terminal
//! state.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pqb_core::error::{SupervisorError, TransportError};
use pqb_core::types::{HostId, Role};

use crate::probe::ReadinessProbe;
use crate::transport::{HostTransport, StreamEvent};

/// Interval between readiness/liveness polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lines kept when capturing a service log tail
pub const LOG_TAIL_LINES: usize = 20;

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Declared but not launched
    Created,
    /// Launch issued, readiness probe pending
    Launching,
    /// Readiness probe passed
    Ready,
    /// Serving work
    Running,
    /// Polite termination in progress
    Draining,
    /// Gone, by our hand
    Terminated,
    /// Gone or unusable, not by our hand (terminal)
    Failed,
}

impl ProcessState {
    /// Stable name for logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Created => "created",
            ProcessState::Launching => "launching",
            ProcessState::Ready => "ready",
            ProcessState::Running => "running",
            ProcessState::Draining => "draining",
            ProcessState::Terminated => "terminated",
            ProcessState::Failed => "failed",
        }
    }

    /// Whether the lifecycle is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Terminated | ProcessState::Failed)
    }

    /// Legal transitions. Monotonic: no path re-enters an earlier state,
    /// and nothing leaves a terminal state.
    pub fn can_advance_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (Created, Launching) => true,
            (Launching, Ready) => true,
            (Ready, Running) => true,
            // stop() may be called in any live state
            (Created | Launching | Ready | Running, Draining) => true,
            (Draining, Terminated) => true,
            // anything still alive can fail
            (Created | Launching | Ready | Running | Draining, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Supervises one named long-running process on one host
pub struct ProcessSupervisor {
    transport: Arc<dyn HostTransport>,
    service: Role,
    command: String,
    workdir: String,
    log_path: String,
    command_timeout: Duration,
    state: Mutex<ProcessState>,
    pid: Mutex<Option<u32>>,
}

impl ProcessSupervisor {
    /// Declare a process; nothing runs until [`start`](Self::start)
    pub fn new(
        transport: Arc<dyn HostTransport>,
        service: Role,
        command: String,
        workdir: String,
        log_path: String,
        command_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            service,
            command,
            workdir,
            log_path,
            command_timeout,
            state: Mutex::new(ProcessState::Created),
            pid: Mutex::new(None),
        }
    }

    /// The host this process runs on
    pub fn host(&self) -> &HostId {
        self.transport.host()
    }

    /// The service name
    pub fn service(&self) -> Role {
        self.service
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    /// Remote process id, once launched
    pub fn pid(&self) -> Option<u32> {
        *lock(&self.pid)
    }

    fn advance(&self, next: ProcessState) -> Result<(), SupervisorError> {
        let mut state = lock(&self.state);
        if !state.can_advance_to(next) {
            return Err(SupervisorError::InvalidTransition {
                service: self.service.to_string(),
                from: state.as_str(),
                to: next.as_str(),
            });
        }
        tracing::debug!(
            "{} on {}: {} -> {}",
            self.service,
            self.host(),
            state,
            next
        );
        *state = next;
        Ok(())
    }

    /// Launch the process and poll its readiness probe until it passes or
    /// `ready_timeout` elapses. On failure the process is killed and the
    /// supervisor lands in `Failed`.
    pub async fn start(
        &self,
        probe: &ReadinessProbe,
        ready_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        self.advance(ProcessState::Launching)?;

        // The brace group keeps `&` scoped to the nohup command, so `$!` is
        // the service pid rather than a wrapping subshell's.
        let launch = format!(
            "cd '{0}' && rm -f '{1}' && {{ nohup {2} >> '{1}' 2>&1 & echo $!; }}",
            self.workdir, self.log_path, self.command
        );
        let out = match self.transport.exec(&launch, self.command_timeout).await {
            Ok(out) => out,
            Err(err) => {
                let _ = self.advance(ProcessState::Failed);
                return Err(err.into());
            }
        };
        if !out.success() {
            let _ = self.advance(ProcessState::Failed);
            return Err(SupervisorError::LaunchFailed {
                host: self.host().to_string(),
                service: self.service.to_string(),
                detail: format!("launch exited {}: {}", out.exit_code, out.stderr.trim()),
            });
        }

        let pid: u32 = match out.stdout.trim().lines().last().and_then(|l| l.trim().parse().ok()) {
            Some(pid) => pid,
            None => {
                let _ = self.advance(ProcessState::Failed);
                return Err(SupervisorError::LaunchFailed {
                    host: self.host().to_string(),
                    service: self.service.to_string(),
                    detail: format!("no pid in launch output: {:?}", out.stdout),
                });
            }
        };
        *lock(&self.pid) = Some(pid);
        tracing::info!("Launched {} on {} (pid {})", self.service, self.host(), pid);

        let deadline = tokio::time::Instant::now() + ready_timeout;
        loop {
            if cancel.is_cancelled() {
                let _ = self.stop(Duration::ZERO).await;
                return Err(SupervisorError::Cancelled {
                    host: self.host().to_string(),
                    service: self.service.to_string(),
                });
            }

            match self.alive().await {
                Ok(true) => {}
                Ok(false) => {
                    let log_tail = self.log_tail(LOG_TAIL_LINES).await.unwrap_or_default();
                    let _ = self.advance(ProcessState::Failed);
                    return Err(SupervisorError::ExitedEarly {
                        host: self.host().to_string(),
                        service: self.service.to_string(),
                        log_tail,
                    });
                }
                Err(err) => {
                    let _ = self.advance(ProcessState::Failed);
                    return Err(err.into());
                }
            }

            match probe.check(self.transport.as_ref(), self.command_timeout).await {
                Ok(true) => {
                    self.advance(ProcessState::Ready)?;
                    tracing::info!("{} on {} is ready", self.service, self.host());
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => {
                    let _ = self.advance(ProcessState::Failed);
                    return Err(err.into());
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = self.kill(Duration::ZERO).await;
                let _ = self.advance(ProcessState::Failed);
                return Err(SupervisorError::ReadyTimeout {
                    host: self.host().to_string(),
                    service: self.service.to_string(),
                    timeout: ready_timeout,
                });
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Mark the first accepted external request (immediate for non-serving
    /// roles)
    pub fn mark_running(&self) -> Result<(), SupervisorError> {
        self.advance(ProcessState::Running)
    }

    /// Terminate the process: polite signal, wait up to `grace`, then
    /// force-kill. Idempotent and safe in any state.
    pub async fn stop(&self, grace: Duration) -> Result<(), SupervisorError> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let _ = self.advance(ProcessState::Draining);

        match self.kill(grace).await {
            Ok(()) => {
                let _ = self.advance(ProcessState::Terminated);
                Ok(())
            }
            Err(err) => {
                let _ = self.advance(ProcessState::Failed);
                Err(err.into())
            }
        }
    }

    /// Last `lines` lines of the service log
    pub async fn log_tail(&self, lines: usize) -> Result<String, TransportError> {
        let command = format!("cd '{}' && tail -n {} '{}'", self.workdir, lines, self.log_path);
        let out = self.transport.exec(&command, self.command_timeout).await?;
        Ok(out.stdout)
    }

    /// Stream the service log back to the controller
    pub async fn follow_log(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let command = format!("cd '{}' && tail -n +1 -f '{}'", self.workdir, self.log_path);
        self.transport.stream(&command, cancel).await
    }

    async fn alive(&self) -> Result<bool, TransportError> {
        let pid = match self.pid() {
            Some(pid) => pid,
            None => return Ok(false),
        };
        let out = self
            .transport
            .exec(&format!("kill -0 {}", pid), self.command_timeout)
            .await?;
        Ok(out.success())
    }

    async fn kill(&self, grace: Duration) -> Result<(), TransportError> {
        let pid = match self.pid() {
            Some(pid) => pid,
            None => return Ok(()),
        };

        let _ = self
            .transport
            .exec(&format!("kill -TERM {}", pid), self.command_timeout)
            .await?;

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if !self.alive().await? {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        if self.alive().await? {
            self.transport
                .exec(&format!("kill -KILL {}", pid), self.command_timeout)
                .await?;
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
