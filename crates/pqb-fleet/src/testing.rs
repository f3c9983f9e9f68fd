//! Scripted in-memory transport for tests
//!
//! Behaves like a compliant fleet host: launches allocate pids, `kill`
//! variants update a process table, `tc qdisc` commands track shaping
//! state. Tests layer rules on top (first match wins, newest first) to
//! inject failures, markers, and canned output without a real fleet.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pqb_core::error::TransportError;
use pqb_core::types::HostId;

use crate::transport::{ExecOutput, HostTransport, StreamEvent};

/// Canned response for a matched command
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return this exit code and output
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    /// Surface a command timeout
    Timeout,
    /// Surface a dropped connection
    ConnectionLost,
}

impl Scripted {
    /// Shorthand for a clean exit with stdout
    pub fn ok(stdout: &str) -> Self {
        Scripted::Exit {
            code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Shorthand for a failing exit with stderr
    pub fn fail(code: i32, stderr: &str) -> Self {
        Scripted::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

struct Rule {
    pattern: String,
    response: Scripted,
    remaining: Option<u32>,
}

/// A scripted [`HostTransport`] with a built-in process and shaping model
pub struct ScriptedTransport {
    host: HostId,
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    procs: Mutex<HashSet<u32>>,
    next_pid: AtomicU32,
    shaped: AtomicBool,
    shaped_args: Mutex<Option<String>>,
    streams: Mutex<Vec<(String, Vec<StreamEvent>)>>,
    uploads: Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    pub fn new(host: &str) -> Self {
        Self {
            host: HostId::new(host),
            rules: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            procs: Mutex::new(HashSet::new()),
            next_pid: AtomicU32::new(4000),
            shaped: AtomicBool::new(false),
            shaped_args: Mutex::new(None),
            streams: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        }
    }

    /// Respond to every command containing `pattern`
    pub fn on(&self, pattern: &str, response: Scripted) {
        self.rules.lock().unwrap().insert(
            0,
            Rule {
                pattern: pattern.to_string(),
                response,
                remaining: None,
            },
        );
    }

    /// Respond to the next `times` commands containing `pattern`
    pub fn on_n(&self, pattern: &str, response: Scripted, times: u32) {
        self.rules.lock().unwrap().insert(
            0,
            Rule {
                pattern: pattern.to_string(),
                response,
                remaining: Some(times),
            },
        );
    }

    /// Script the events yielded for a streamed command
    pub fn set_stream(&self, pattern: &str, events: Vec<StreamEvent>) {
        self.streams
            .lock()
            .unwrap()
            .push((pattern.to_string(), events));
    }

    /// Every command executed so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of processes currently alive on the host model
    pub fn live_processes(&self) -> usize {
        self.procs.lock().unwrap().len()
    }

    /// Whether a qdisc is currently installed
    pub fn is_shaped(&self) -> bool {
        self.shaped.load(Ordering::SeqCst)
    }

    /// Files uploaded as (local, remote) pairs
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    fn take_rule(&self, command: &str) -> Option<Scripted> {
        let mut rules = self.rules.lock().unwrap();
        let idx = rules.iter().position(|r| command.contains(&r.pattern))?;
        let response = rules[idx].response.clone();
        if let Some(remaining) = &mut rules[idx].remaining {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(idx);
            }
        }
        Some(response)
    }

    fn builtin(&self, command: &str) -> ExecOutput {
        let ok = |stdout: String| ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        };

        if command.contains("nohup") {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.procs.lock().unwrap().insert(pid);
            return ok(format!("{}\n", pid));
        }
        if let Some(rest) = command.split("kill -0 ").nth(1) {
            let alive = rest
                .trim()
                .parse::<u32>()
                .map(|pid| self.procs.lock().unwrap().contains(&pid))
                .unwrap_or(false);
            return ExecOutput {
                exit_code: if alive { 0 } else { 1 },
                stdout: String::new(),
                stderr: String::new(),
            };
        }
        for signal in ["kill -TERM ", "kill -KILL "] {
            if let Some(rest) = command.split(signal).nth(1) {
                if let Ok(pid) = rest.trim().parse::<u32>() {
                    self.procs.lock().unwrap().remove(&pid);
                }
                return ok(String::new());
            }
        }
        if command.contains("pkill") {
            self.procs.lock().unwrap().clear();
            return ok(String::new());
        }
        if command.contains("tc qdisc add") {
            self.shaped.store(true, Ordering::SeqCst);
            let args = command.split("netem ").nth(1).unwrap_or("").to_string();
            *self.shaped_args.lock().unwrap() = Some(args);
            return ok(String::new());
        }
        if command.contains("tc qdisc del") {
            if self.shaped.swap(false, Ordering::SeqCst) {
                return ok(String::new());
            }
            return ExecOutput {
                exit_code: 2,
                stdout: String::new(),
                stderr: "RTNETLINK answers: No such file or directory\n".to_string(),
            };
        }
        if command.contains("tc qdisc show") {
            if self.shaped.load(Ordering::SeqCst) {
                let args = self.shaped_args.lock().unwrap().clone().unwrap_or_default();
                return ok(format!(
                    "qdisc netem 8001: root refcnt 2 limit 1000 {}\n",
                    args.replace("mbit", "Mbit")
                ));
            }
            return ok("qdisc fq_codel 0: root refcnt 2 limit 10240p\n".to_string());
        }
        if command.starts_with("grep") || command.contains("&& grep") {
            // Markers are absent unless a test scripts them present
            return ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: String::new(),
            };
        }
        ok(String::new())
    }
}

#[async_trait]
impl HostTransport for ScriptedTransport {
    fn host(&self) -> &HostId {
        &self.host
    }

    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.calls.lock().unwrap().push(command.to_string());

        if let Some(response) = self.take_rule(command) {
            return match response {
                Scripted::Exit {
                    code,
                    stdout,
                    stderr,
                } => Ok(ExecOutput {
                    exit_code: code,
                    stdout,
                    stderr,
                }),
                Scripted::Timeout => Err(TransportError::Timeout {
                    host: self.host.to_string(),
                    command: command.to_string(),
                    timeout,
                }),
                Scripted::ConnectionLost => Err(TransportError::ConnectionLost {
                    host: self.host.to_string(),
                    reason: "scripted".to_string(),
                }),
            };
        }

        Ok(self.builtin(command))
    }

    async fn stream(
        &self,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        self.calls.lock().unwrap().push(command.to_string());

        let events = {
            let streams = self.streams.lock().unwrap();
            streams
                .iter()
                .find(|(pattern, _)| command.contains(pattern))
                .map(|(_, events)| events.clone())
                .unwrap_or_else(|| vec![StreamEvent::Exited(0)])
        };

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for event in events {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        self.uploads
            .lock()
            .unwrap()
            .push((local.display().to_string(), remote.to_string()));
        Ok(())
    }

    async fn get(&self, _remote: &str, local: &Path) -> Result<(), TransportError> {
        let _ = tokio::fs::write(local, b"").await;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Serve a canned directory node list over HTTP for probe tests.
///
/// Returns the bound address; the listener serves until the handle is
/// aborted or the runtime shuts down.
pub async fn spawn_node_list_server(nodes: usize) -> std::net::SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind node list server");
    let addr = listener.local_addr().expect("local addr");

    let body = serde_json::to_string(
        &(0..nodes)
            .map(|i| serde_json::json!({ "id": format!("relay-{}", i) }))
            .collect::<Vec<_>>(),
    )
    .expect("serialize node list");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    addr
}
