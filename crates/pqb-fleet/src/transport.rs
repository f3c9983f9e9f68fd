//! Host transport seam
//!
//! A Host Session is a capability handle, not a hierarchy: `exec`,
//! `stream`, file transfer, and a scoped `close`. Differences between hosts
//! (role, interface, working directory) are data held by the caller.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pqb_core::error::TransportError;
use pqb_core::types::HostId;

/// Captured output of one remote command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Remote exit code
    pub exit_code: i32,
    /// Full stdout, lossily decoded
    pub stdout: String,
    /// Full stderr, lossily decoded
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One event from a streamed remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A stdout line
    Stdout(String),
    /// A stderr line
    Stderr(String),
    /// The command finished; always the final event
    Exited(i32),
}

/// Reliable command/file transport to one remote host.
///
/// Implementations own retry and reconnection on transient failure and
/// serialize commands so that operations on a single host are strictly
/// ordered. Timeouts are surfaced, never retried.
#[async_trait]
pub trait HostTransport: Send + Sync {
    /// The host this session is bound to
    fn host(&self) -> &HostId;

    /// Run a command, blocking until exit or `timeout`.
    ///
    /// On timeout the remote process is best-effort killed before the error
    /// is returned.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    /// Run a long-lived command, yielding tagged output lines as they
    /// arrive and a final [`StreamEvent::Exited`]. Cancelling the token
    /// terminates the remote command best-effort and closes the stream.
    async fn stream(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError>;

    /// Upload a local file to a path on the host
    async fn put(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Download a file from the host
    async fn get(&self, remote: &str, local: &Path) -> Result<(), TransportError>;

    /// Close the channel; outstanding streams are cancelled
    async fn close(&self) -> Result<(), TransportError>;
}
