//! SSH host session
//!
//! Implements [`HostTransport`] over russh. One session per host; commands
//! on a session are serialized through a mutex over the client handle, so
//! per-host operations are strictly ordered. Transient transport failures
//! are retried with a fresh connection up to the policy's attempt budget;
//! timeouts are never retried.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use pqb_core::config::HostConfig;
use pqb_core::error::TransportError;
use pqb_core::types::HostId;

use crate::retry::RetryPolicy;
use crate::transport::{ExecOutput, HostTransport, StreamEvent};

/// Deadline for establishing the TCP+SSH handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single file transfer
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

/// Buffer for streamed output events
const STREAM_CHANNEL_CAPACITY: usize = 256;

/// SSH client handler for fleet hosts.
///
/// The fleet file is the trust anchor: hosts are provisioned by the
/// operator and addressed on a closed experiment network, so any presented
/// host key is accepted.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!("Host key: {}", server_public_key.fingerprint());
        Ok(true)
    }
}

/// An authenticated SSH session to one fleet host
pub struct SshSession {
    host: HostId,
    config: HostConfig,
    key: Arc<KeyPair>,
    retry: RetryPolicy,
    handle: Mutex<Handle<ClientHandler>>,
}

impl SshSession {
    /// Connect and authenticate to a host
    pub async fn connect(
        host: HostId,
        config: HostConfig,
        retry: RetryPolicy,
    ) -> Result<Self, TransportError> {
        let key = russh_keys::load_secret_key(&config.key_path, None).map_err(|e| {
            TransportError::ConnectFailed {
                host: host.to_string(),
                reason: format!("failed to load key {}: {}", config.key_path.display(), e),
            }
        })?;
        let key = Arc::new(key);

        let handle = Self::open(&host, &config, &key).await?;

        Ok(Self {
            host,
            config,
            key,
            retry,
            handle: Mutex::new(handle),
        })
    }

    /// Establish one authenticated connection
    async fn open(
        host: &HostId,
        config: &HostConfig,
        key: &Arc<KeyPair>,
    ) -> Result<Handle<ClientHandler>, TransportError> {
        let ssh_config = Arc::new(Config::default());

        tracing::debug!("Connecting to {} at {}", host, config.address);
        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(ssh_config, &config.address, ClientHandler),
        )
        .await
        .map_err(|_| TransportError::ConnectFailed {
            host: host.to_string(),
            reason: format!("connection to {} timed out", config.address),
        })?
        .map_err(|e| TransportError::ConnectFailed {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let authenticated = handle
            .authenticate_publickey(&config.username, Arc::clone(key))
            .await
            .map_err(|e| TransportError::ConnectFailed {
                host: host.to_string(),
                reason: format!("authentication error: {}", e),
            })?;

        if !authenticated {
            return Err(TransportError::AuthenticationFailed {
                host: host.to_string(),
            });
        }

        tracing::debug!("Authenticated to {} as {}", host, config.username);
        Ok(handle)
    }

    /// Replace the underlying connection after a transport failure
    async fn reconnect(&self) -> Result<(), TransportError> {
        let fresh = Self::open(&self.host, &self.config, &self.key).await?;
        *self.handle.lock().await = fresh;
        tracing::info!("Reconnected to {}", self.host);
        Ok(())
    }

    /// Run `op` with reconnect-and-reissue on retryable failures
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, TransportError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "Transport failure on {} (attempt {}): {}. Retrying in {:?}",
                        self.host,
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(reconnect_err) = self.reconnect().await {
                        tracing::warn!("Reconnect to {} failed: {}", self.host, reconnect_err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Open a session channel on the current connection.
    ///
    /// Used for streams, which outlive the lock; plain commands go through
    /// [`run_channel`](Self::run_channel) instead.
    async fn open_channel(&self) -> Result<Channel<Msg>, TransportError> {
        let handle = self.handle.lock().await;
        handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::ConnectionLost {
                host: self.host.to_string(),
                reason: e.to_string(),
            })
    }

    /// Run one command on a fresh channel, optionally feeding stdin,
    /// collecting raw output until exit or `timeout`. The session lock is
    /// held for the whole command, so commands on one host are strictly
    /// ordered.
    async fn run_channel(
        &self,
        command: &str,
        timeout: Duration,
        stdin: Option<&[u8]>,
    ) -> Result<(i32, Vec<u8>, Vec<u8>), TransportError> {
        let handle = self.handle.lock().await;
        let mut channel =
            handle
                .channel_open_session()
                .await
                .map_err(|e| TransportError::ConnectionLost {
                    host: self.host.to_string(),
                    reason: e.to_string(),
                })?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Channel {
                host: self.host.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(data) = stdin {
            channel
                .data(data)
                .await
                .map_err(|e| TransportError::Channel {
                    host: self.host.to_string(),
                    reason: e.to_string(),
                })?;
            channel.eof().await.map_err(|e| TransportError::Channel {
                host: self.host.to_string(),
                reason: e.to_string(),
            })?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        let drained = tokio::time::timeout(
            timeout,
            drain_channel(&mut channel, &mut stdout, &mut stderr, &mut exit_code),
        )
        .await;

        match drained {
            Ok(()) => Ok((exit_code.unwrap_or(-1), stdout, stderr)),
            Err(_) => {
                // Best-effort kill: closing the channel sends the remote
                // side EOF and releases the pty-less exec.
                let _ = channel.close().await;
                Err(TransportError::Timeout {
                    host: self.host.to_string(),
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }
}

/// Read channel messages until the remote side closes
async fn drain_channel(
    channel: &mut Channel<Msg>,
    stdout: &mut Vec<u8>,
    stderr: &mut Vec<u8>,
    exit_code: &mut Option<i32>,
) {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { ref data }) => stdout.extend_from_slice(data),
            Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => stderr.extend_from_slice(data),
            Some(ChannelMsg::ExitStatus { exit_status }) => *exit_code = Some(exit_status as i32),
            Some(ChannelMsg::Eof) => {}
            Some(ChannelMsg::Close) | None => break,
            Some(_) => {}
        }
    }
}

/// Append `data` to `buf`, emitting each completed line
fn push_lines(buf: &mut BytesMut, data: &[u8], mut emit: impl FnMut(String)) {
    buf.extend_from_slice(data);
    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
        let line = buf.split_to(pos + 1);
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        emit(text.trim_end_matches('\r').to_string());
    }
}

#[async_trait]
impl HostTransport for SshSession {
    fn host(&self) -> &HostId {
        &self.host
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.with_retry(|| async {
            let (exit_code, stdout, stderr) = self.run_channel(command, timeout, None).await?;
            Ok(ExecOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        })
        .await
    }

    async fn stream(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Channel {
                host: self.host.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let host = self.host.clone();

        tokio::spawn(async move {
            let mut stdout_buf = BytesMut::new();
            let mut stderr_buf = BytesMut::new();
            let mut exit_code = 0;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = channel.close().await;
                        tracing::debug!("Stream on {} cancelled", host);
                        break;
                    }
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { ref data }) => {
                            push_lines(&mut stdout_buf, data, |line| {
                                let _ = tx.try_send(StreamEvent::Stdout(line));
                            });
                        }
                        Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                            push_lines(&mut stderr_buf, data, |line| {
                                let _ = tx.try_send(StreamEvent::Stderr(line));
                            });
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            exit_code = exit_status as i32;
                        }
                        Some(ChannelMsg::Eof) => {}
                        Some(ChannelMsg::Close) | None => {
                            if !stdout_buf.is_empty() {
                                let tail = String::from_utf8_lossy(&stdout_buf).into_owned();
                                let _ = tx.try_send(StreamEvent::Stdout(tail));
                            }
                            if !stderr_buf.is_empty() {
                                let tail = String::from_utf8_lossy(&stderr_buf).into_owned();
                                let _ = tx.try_send(StreamEvent::Stderr(tail));
                            }
                            let _ = tx.send(StreamEvent::Exited(exit_code)).await;
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let data = tokio::fs::read(local)
            .await
            .map_err(|e| TransportError::NotFound {
                host: self.host.to_string(),
                path: format!("{} ({})", local.display(), e),
            })?;

        self.with_retry(|| async {
            let command = format!("cat > '{}'", remote);
            let (exit_code, _, stderr) = self
                .run_channel(&command, TRANSFER_TIMEOUT, Some(&data))
                .await?;
            if exit_code != 0 {
                return Err(TransportError::Channel {
                    host: self.host.to_string(),
                    reason: format!(
                        "upload to {} exited {}: {}",
                        remote,
                        exit_code,
                        String::from_utf8_lossy(&stderr)
                    ),
                });
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), TransportError> {
        let data = self
            .with_retry(|| async {
                let command = format!("cat '{}'", remote);
                let (exit_code, stdout, stderr) =
                    self.run_channel(&command, TRANSFER_TIMEOUT, None).await?;
                if exit_code != 0 {
                    let stderr = String::from_utf8_lossy(&stderr);
                    if stderr.contains("No such file") {
                        return Err(TransportError::NotFound {
                            host: self.host.to_string(),
                            path: remote.to_string(),
                        });
                    }
                    return Err(TransportError::Channel {
                        host: self.host.to_string(),
                        reason: format!("download of {} exited {}: {}", remote, exit_code, stderr),
                    });
                }
                Ok(stdout)
            })
            .await?;

        tokio::fs::write(local, data)
            .await
            .map_err(|e| TransportError::Channel {
                host: self.host.to_string(),
                reason: format!("failed to write {}: {}", local.display(), e),
            })
    }

    async fn close(&self) -> Result<(), TransportError> {
        let handle = self.handle.lock().await;
        handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TransportError::Channel {
                host: self.host.to_string(),
                reason: e.to_string(),
            })
    }
}
