//! Error types for the pqtor-bench orchestrator
//!
//! One enum per recovery domain: transport errors may be retried at the
//! session layer, shaping errors skip the iteration, supervisor errors fail
//! it, plan errors abort the campaign before the first run.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Traffic shaping error
    #[error("Shaping error: {0}")]
    Shaping(#[from] ShapingError),

    /// Process supervision error
    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// Campaign plan error
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a Host Session
#[derive(Error, Debug)]
pub enum TransportError {
    /// Authentication rejected by the host
    #[error("Authentication failed for {host}")]
    AuthenticationFailed { host: String },

    /// Could not establish a connection
    #[error("Connection to {host} failed: {reason}")]
    ConnectFailed { host: String, reason: String },

    /// An established connection dropped mid-operation
    #[error("Connection to {host} lost: {reason}")]
    ConnectionLost { host: String, reason: String },

    /// Wall-clock timeout elapsed; the remote command is best-effort killed
    #[error("Command timed out after {timeout:?} on {host}: {command}")]
    Timeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    /// Remote path missing during a file transfer
    #[error("Remote path not found on {host}: {path}")]
    NotFound { host: String, path: String },

    /// SSH channel failure
    #[error("Channel error on {host}: {reason}")]
    Channel { host: String, reason: String },
}

impl TransportError {
    /// Whether a reconnect-and-reissue is worth attempting.
    ///
    /// Timeouts are never retried; auth failures and missing paths will not
    /// change on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectFailed { .. }
                | TransportError::ConnectionLost { .. }
                | TransportError::Channel { .. }
        )
    }

    /// The host this error occurred on
    pub fn host(&self) -> &str {
        match self {
            TransportError::AuthenticationFailed { host }
            | TransportError::ConnectFailed { host, .. }
            | TransportError::ConnectionLost { host, .. }
            | TransportError::Timeout { host, .. }
            | TransportError::NotFound { host, .. }
            | TransportError::Channel { host, .. } => host,
        }
    }
}

/// Errors raised by the Traffic Shaper
#[derive(Error, Debug)]
pub enum ShapingError {
    /// The host kernel lacks the required queueing discipline
    #[error("Queueing discipline unsupported on {host}: {detail}")]
    Unsupported { host: String, detail: String },

    /// The discipline exists but installation failed (after one retry)
    #[error("Shaping failed on {host}: {detail}")]
    Failed { host: String, detail: String },

    /// Underlying transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by a Process Supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The launch command itself failed
    #[error("Failed to launch {service} on {host}: {detail}")]
    LaunchFailed {
        host: String,
        service: String,
        detail: String,
    },

    /// Readiness probe did not pass within the deadline
    #[error("{service} on {host} not ready within {timeout:?}")]
    ReadyTimeout {
        host: String,
        service: String,
        timeout: Duration,
    },

    /// The process exited before reaching ready
    #[error("{service} on {host} exited before ready")]
    ExitedEarly {
        host: String,
        service: String,
        log_tail: String,
    },

    /// Lifecycle transitions are monotonic; this one went backwards
    #[error("Invalid lifecycle transition {from} -> {to} for {service}")]
    InvalidTransition {
        service: String,
        from: &'static str,
        to: &'static str,
    },

    /// At most one supervisor per (host, service)
    #[error("Supervisor already registered for {service} on {host}")]
    AlreadyRegistered { host: String, service: String },

    /// The operation was cancelled
    #[error("Supervision of {service} on {host} cancelled")]
    Cancelled { host: String, service: String },

    /// Underlying transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors in the campaign plan or fleet file, detected before any run starts
#[derive(Error, Debug)]
pub enum PlanError {
    /// File not found
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// A schedule item references an undefined topology
    #[error("Unknown topology id {0} in schedule")]
    UnknownTopology(u32),

    /// Two topology profiles share an id
    #[error("Duplicate topology id {0}")]
    DuplicateTopology(u32),

    /// A role has no host mapped
    #[error("No host mapped for role {0}")]
    MissingRole(String),

    /// A role maps to a host missing from the fleet file
    #[error("Role {role} mapped to unknown host {host}")]
    UnknownHost { role: String, host: String },

    /// A topology profile fails validation
    #[error("Invalid topology profile {id}: {reason}")]
    InvalidProfile { id: u32, reason: String },

    /// Anything else wrong with the plan
    #[error("Invalid plan: {0}")]
    Invalid(String),

    /// I/O failure while reading a plan or fleet file
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
