//! One (topology, iteration) unit of work, end-to-end
//!
//! Phase order: teardown (fresh environment) -> stage -> shape ->
//! start-directory -> start-relays -> client -> collect -> teardown.
//! Teardown runs unconditionally on both ends; its errors are logged and
//! never raised past this module. The executor itself never retries.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use pqb_core::config::{ServiceSpec, Timeouts, TopologyProfile};
use pqb_core::error::{ShapingError, SupervisorError, TransportError};
use pqb_core::types::Role;
use pqb_fleet::controller::{FleetController, ServiceLaunch};
use pqb_fleet::probe::ReadinessProbe;
use pqb_fleet::supervisor::{LOG_TAIL_LINES, POLL_INTERVAL};

use crate::record::{epoch_secs, FailureKind, HostOutcome, RunRecord, RunStatus, SkipKind};

/// Drives one iteration through the fleet and produces exactly one record
pub struct RunExecutor<'a> {
    fleet: &'a FleetController,
    services: &'a ServiceSpec,
    timeouts: &'a Timeouts,
    artifacts: &'a [PathBuf],
}

/// A non-success outcome, with whatever client output was captured
struct DriveFailure {
    status: RunStatus,
    client_stdout: String,
}

impl DriveFailure {
    fn status(status: RunStatus) -> Self {
        Self {
            status,
            client_stdout: String::new(),
        }
    }
}

impl<'a> RunExecutor<'a> {
    pub fn new(
        fleet: &'a FleetController,
        services: &'a ServiceSpec,
        timeouts: &'a Timeouts,
        artifacts: &'a [PathBuf],
    ) -> Self {
        Self {
            fleet,
            services,
            timeouts,
            artifacts,
        }
    }

    /// Execute one iteration under `profile`. Always returns a record;
    /// every failure mode is folded into its status.
    pub async fn execute(
        &self,
        profile: &TopologyProfile,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> RunRecord {
        let started_at = epoch_secs();
        let mut phases = BTreeMap::new();

        tracing::info!("Starting {} iteration {}", profile.id, iteration);

        // Fresh environment: recover anything a previous crashed run leaked
        let t = Instant::now();
        self.fleet.teardown(self.timeouts.teardown).await;
        phases.insert("pre_teardown".to_string(), millis(t));

        let drive_started = Instant::now();
        let outcome = self.drive(profile, &mut phases, cancel).await;
        let mut duration_ms = millis(drive_started);

        let (status, client_stdout) = match outcome {
            Ok(stdout) => (RunStatus::Success, stdout),
            Err(failure) => (failure.status, failure.client_stdout),
        };

        // Recorded duration of a client timeout is the timeout itself
        if matches!(status, RunStatus::Failed(FailureKind::ClientTimeout)) {
            duration_ms = self.timeouts.iteration.as_millis() as u64;
        }

        let t = Instant::now();
        let hosts = self.collect().await;
        phases.insert("collect".to_string(), millis(t));

        // Unconditional; errors are reported by the controller, never here
        let t = Instant::now();
        self.fleet.teardown(self.timeouts.teardown).await;
        phases.insert("teardown".to_string(), millis(t));

        tracing::info!(
            "{} iteration {}: {} in {:.1}s",
            profile.id,
            iteration,
            status.label(),
            duration_ms as f64 / 1000.0
        );

        RunRecord {
            topology: profile.id,
            iteration,
            started_at,
            finished_at: epoch_secs(),
            duration_ms,
            phase_durations_ms: phases,
            hosts,
            client_stdout,
            status,
        }
    }

    /// Run the setup and client phases; the caller owns collect/teardown
    async fn drive(
        &self,
        profile: &TopologyProfile,
        phases: &mut BTreeMap<String, u64>,
        cancel: &CancellationToken,
    ) -> Result<String, DriveFailure> {
        if cancel.is_cancelled() {
            return Err(DriveFailure::status(RunStatus::Aborted));
        }

        let t = Instant::now();
        self.fleet
            .stage(self.artifacts)
            .await
            .map_err(|err| DriveFailure::status(transport_status(err)))?;
        phases.insert("stage".to_string(), millis(t));

        let t = Instant::now();
        self.fleet.shape(profile).await.map_err(|err| {
            DriveFailure::status(match err {
                ShapingError::Unsupported { host, .. } => {
                    RunStatus::Skipped(SkipKind::ShapingUnsupported { host })
                }
                ShapingError::Failed { host, .. } => {
                    RunStatus::Skipped(SkipKind::ShapingFailed { host })
                }
                ShapingError::Transport(err) => transport_status(err),
            })
        })?;
        phases.insert("shape".to_string(), millis(t));

        let directory = self
            .fleet
            .service_address(Role::Directory, self.services.directory_port);
        let node_list_url = format!("http://{}/nodes", directory);

        // Directory tier: ready once it answers with a well-formed (possibly
        // empty) node list
        let t = Instant::now();
        self.start_tier(
            vec![ServiceLaunch {
                role: Role::Directory,
                command: self.services.command_for(Role::Directory, &directory),
                probe: ReadinessProbe::NodeList {
                    url: node_list_url.clone(),
                    expected: 0,
                },
            }],
            cancel,
        )
        .await?;
        phases.insert("start_directory".to_string(), millis(t));

        // Relay tier: each relay logs its registration marker, then the
        // directory census must reach the full relay count
        let t = Instant::now();
        let relay_launches = Role::RELAYS
            .iter()
            .map(|&role| ServiceLaunch {
                role,
                command: self.services.command_for(role, &directory),
                probe: ReadinessProbe::LogMarker {
                    log_path: self
                        .fleet
                        .remote_log_path(role, &self.services.log_path(role)),
                    marker: self.services.registered_marker.clone(),
                },
            })
            .collect();
        self.start_tier(relay_launches, cancel).await?;
        self.await_census(&node_list_url, cancel).await?;
        phases.insert("start_relays".to_string(), millis(t));

        // Client phase: every service is ready, so it is serving now
        for supervisor in self.fleet.supervisors() {
            let _ = supervisor.mark_running();
        }

        let t = Instant::now();
        let client_command = self.services.command_for(Role::Client, &directory);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DriveFailure::status(RunStatus::Aborted));
            }
            outcome = self.fleet.run_client(&client_command, self.timeouts.iteration) => outcome,
        };
        phases.insert("client".to_string(), millis(t));

        let outcome = outcome.map_err(|err| match err {
            TransportError::Timeout { .. } => {
                DriveFailure::status(RunStatus::Failed(FailureKind::ClientTimeout))
            }
            err => DriveFailure::status(transport_status(err)),
        })?;

        if outcome.exit_code != 0 {
            return Err(DriveFailure {
                status: RunStatus::Failed(FailureKind::ClientError {
                    exit_code: outcome.exit_code,
                }),
                client_stdout: format!("{}{}", outcome.stdout, outcome.stderr),
            });
        }
        if !outcome.stdout.contains(&self.services.success_marker) {
            tracing::warn!(
                "Client exited zero without marker {:?}",
                self.services.success_marker
            );
            return Err(DriveFailure {
                status: RunStatus::Failed(FailureKind::ClientError { exit_code: 0 }),
                client_stdout: outcome.stdout,
            });
        }

        Ok(outcome.stdout)
    }

    async fn start_tier(
        &self,
        launches: Vec<ServiceLaunch>,
        cancel: &CancellationToken,
    ) -> Result<(), DriveFailure> {
        let services = self.services;
        self.fleet
            .start_tier(
                launches,
                |role| services.log_path(role),
                self.timeouts.ready,
                cancel,
            )
            .await
            .map_err(|(role, err)| DriveFailure::status(startup_status(role, err)))
    }

    /// Poll the directory until its node list holds every relay
    async fn await_census(
        &self,
        node_list_url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DriveFailure> {
        let census = ReadinessProbe::NodeList {
            url: node_list_url.to_string(),
            expected: Role::RELAYS.len(),
        };
        let deadline = tokio::time::Instant::now() + self.timeouts.ready;

        loop {
            if cancel.is_cancelled() {
                return Err(DriveFailure::status(RunStatus::Aborted));
            }
            match self.fleet.probe(Role::Directory, &census).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => return Err(DriveFailure::status(transport_status(err))),
            }
            if tokio::time::Instant::now() >= deadline {
                let role = self.unregistered_relay().await;
                return Err(DriveFailure::status(RunStatus::Failed(
                    FailureKind::Startup { role },
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Name the relay whose registration is missing; the directory itself
    /// when every relay looks registered but the census still fell short
    async fn unregistered_relay(&self) -> Role {
        for role in Role::RELAYS {
            let probe = ReadinessProbe::LogMarker {
                log_path: self
                    .fleet
                    .remote_log_path(role, &self.services.log_path(role)),
                marker: self.services.registered_marker.clone(),
            };
            match self.fleet.probe(role, &probe).await {
                Ok(true) => continue,
                _ => return role,
            }
        }
        Role::Directory
    }

    /// Capture per-service outcomes before teardown clears the registry
    async fn collect(&self) -> Vec<HostOutcome> {
        let mut outcomes = Vec::new();
        for supervisor in self.fleet.supervisors() {
            let log_tail = supervisor
                .log_tail(LOG_TAIL_LINES)
                .await
                .unwrap_or_default();
            outcomes.push(HostOutcome {
                host: supervisor.host().to_string(),
                service: supervisor.service(),
                state: supervisor.state().as_str().to_string(),
                exit_code: None,
                log_tail,
            });
        }
        outcomes.sort_by_key(|outcome| {
            Role::ALL
                .iter()
                .position(|role| *role == outcome.service)
                .unwrap_or(Role::ALL.len())
        });
        outcomes
    }
}

fn millis(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

fn transport_status(err: TransportError) -> RunStatus {
    RunStatus::Failed(FailureKind::Transport {
        detail: err.to_string(),
    })
}

fn startup_status(role: Role, err: SupervisorError) -> RunStatus {
    match err {
        SupervisorError::Cancelled { .. } => RunStatus::Aborted,
        SupervisorError::Transport(err) => transport_status(err),
        _ => RunStatus::Failed(FailureKind::Startup { role }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use pqb_core::config::RoleMapping;
    use pqb_core::types::{HostId, TopologyId};
    use pqb_fleet::controller::{FleetHost, RoleAssignment};
    use pqb_fleet::testing::{spawn_node_list_server, Scripted, ScriptedTransport};

    const HOST_IDS: [&str; 5] = ["pi-01", "pi-02", "pi-03", "pi-04", "pi-05"];

    fn fleet() -> (FleetController, Vec<Arc<ScriptedTransport>>) {
        let mut mapping = RoleMapping::new();
        for (role, id) in Role::ALL.iter().zip(HOST_IDS) {
            mapping.insert(*role, id.to_string());
        }
        let roles = RoleAssignment::from_mapping(&mapping).unwrap();

        let mut hosts = HashMap::new();
        let mut transports = Vec::new();
        for id in HOST_IDS {
            let transport = Arc::new(ScriptedTransport::new(id));
            transports.push(Arc::clone(&transport));
            hosts.insert(
                HostId::new(id),
                FleetHost {
                    transport,
                    workdir: "/home/pi/pqtor".to_string(),
                    interface: "eth0".to_string(),
                    address: "127.0.0.1".to_string(),
                },
            );
        }
        let controller = FleetController::new(
            hosts,
            roles,
            Duration::from_secs(5),
            vec!["directory".into(), "relay".into(), "client".into()],
        )
        .unwrap();
        (controller, transports)
    }

    fn timeouts(ready_ms: u64, iteration_ms: u64) -> Timeouts {
        Timeouts {
            ready: Duration::from_millis(ready_ms),
            iteration: Duration::from_millis(iteration_ms),
            teardown: Duration::from_secs(5),
            command: Duration::from_secs(5),
        }
    }

    fn mark_relays_registered(transports: &[Arc<ScriptedTransport>]) {
        for transport in &transports[1..4] {
            transport.on("grep -q -F 'registered", Scripted::ok(""));
        }
    }

    fn profile() -> TopologyProfile {
        TopologyProfile {
            id: TopologyId::new(1),
            delay_ms: 5.0,
            bandwidth_mbps: 60.0,
            loss_percent: 3.0,
            jitter_ms: None,
        }
    }

    #[tokio::test]
    async fn test_successful_iteration() {
        let addr = spawn_node_list_server(3).await;
        let (controller, transports) = fleet();
        mark_relays_registered(&transports);
        transports[4].on("./client", Scripted::ok("handshake 812ms\nBENCH_OK\n"));

        let services = ServiceSpec {
            directory_port: addr.port(),
            ..ServiceSpec::default()
        };
        let timeouts = timeouts(5_000, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor
            .execute(&profile(), 1, &CancellationToken::new())
            .await;

        assert_eq!(record.status, RunStatus::Success);
        assert!(record.client_stdout.contains("BENCH_OK"));
        assert_eq!(record.hosts.len(), 4, "directory plus three relays");
        assert!(record.phase_durations_ms.contains_key("client"));

        // No process leak, no shaping leak
        for transport in &transports {
            assert_eq!(transport.live_processes(), 0);
            assert!(!transport.is_shaped());
        }

        // Shaping was installed before any service started
        let calls = transports[0].calls();
        let shaped_at = calls.iter().position(|c| c.contains("tc qdisc add"));
        let launched_at = calls.iter().position(|c| c.contains("nohup"));
        assert!(shaped_at.unwrap() < launched_at.unwrap());
    }

    #[tokio::test]
    async fn test_directory_never_ready_fails_without_relays() {
        // No node-list server: the directory probe never passes
        let (controller, transports) = fleet();

        let services = ServiceSpec {
            directory_port: 1, // closed port
            ..ServiceSpec::default()
        };
        let timeouts = timeouts(300, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor
            .execute(&profile(), 1, &CancellationToken::new())
            .await;

        assert_eq!(
            record.status,
            RunStatus::Failed(FailureKind::Startup {
                role: Role::Directory
            })
        );
        // Relays were never launched
        for transport in &transports[1..4] {
            assert!(
                !transport.calls().iter().any(|c| c.contains("nohup")),
                "no relay may start when the directory is down"
            );
        }
        // Cleanup still happened everywhere
        for transport in &transports {
            assert_eq!(transport.live_processes(), 0);
            assert!(!transport.is_shaped());
        }
    }

    #[tokio::test]
    async fn test_relay_never_ready_names_the_offender() {
        let addr = spawn_node_list_server(3).await;
        let (controller, transports) = fleet();
        // Middle and exit register; the guard's marker never appears
        for transport in &transports[2..4] {
            transport.on("grep -q -F 'registered", Scripted::ok(""));
        }

        let services = ServiceSpec {
            directory_port: addr.port(),
            ..ServiceSpec::default()
        };
        let timeouts = timeouts(300, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor
            .execute(&profile(), 1, &CancellationToken::new())
            .await;

        assert_eq!(
            record.status,
            RunStatus::Failed(FailureKind::Startup { role: Role::Guard })
        );
        // The next iteration starts from a clean fleet
        for transport in &transports {
            assert_eq!(transport.live_processes(), 0);
            assert!(!transport.is_shaped());
        }
    }

    #[tokio::test]
    async fn test_client_timeout_records_timeout_duration() {
        let addr = spawn_node_list_server(3).await;
        let (controller, transports) = fleet();
        mark_relays_registered(&transports);
        transports[4].on("./client", Scripted::Timeout);

        let services = ServiceSpec {
            directory_port: addr.port(),
            ..ServiceSpec::default()
        };
        let timeouts = timeouts(5_000, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor
            .execute(&profile(), 1, &CancellationToken::new())
            .await;

        assert_eq!(record.status, RunStatus::Failed(FailureKind::ClientTimeout));
        assert_eq!(record.duration_ms, 10_000);
        for transport in &transports {
            assert_eq!(transport.live_processes(), 0, "all services terminated");
            assert!(!transport.is_shaped(), "shaping cleared");
        }
    }

    #[tokio::test]
    async fn test_shaping_unsupported_skips_without_starting_services() {
        let (controller, transports) = fleet();
        transports[1].on(
            "tc qdisc add",
            Scripted::fail(2, "Error: Specified qdisc not found.\n"),
        );

        let services = ServiceSpec::default();
        let timeouts = timeouts(5_000, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor
            .execute(&profile(), 1, &CancellationToken::new())
            .await;

        assert_eq!(
            record.status,
            RunStatus::Skipped(SkipKind::ShapingUnsupported {
                host: "pi-02".to_string()
            })
        );
        for transport in &transports {
            assert!(
                !transport.calls().iter().any(|c| c.contains("nohup")),
                "no service may start on a skipped iteration"
            );
            assert!(!transport.is_shaped());
        }
    }

    #[tokio::test]
    async fn test_client_error_preserves_output() {
        let addr = spawn_node_list_server(3).await;
        let (controller, transports) = fleet();
        mark_relays_registered(&transports);
        transports[4].on(
            "./client",
            Scripted::Exit {
                code: 3,
                stdout: "circuit build failed\n".to_string(),
                stderr: "no route to exit\n".to_string(),
            },
        );

        let services = ServiceSpec {
            directory_port: addr.port(),
            ..ServiceSpec::default()
        };
        let timeouts = timeouts(5_000, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor
            .execute(&profile(), 1, &CancellationToken::new())
            .await;

        assert_eq!(
            record.status,
            RunStatus::Failed(FailureKind::ClientError { exit_code: 3 })
        );
        assert!(record.client_stdout.contains("circuit build failed"));
        assert!(record.client_stdout.contains("no route to exit"));
    }

    #[tokio::test]
    async fn test_cancelled_iteration_is_aborted_but_clean() {
        let (controller, transports) = fleet();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let services = ServiceSpec::default();
        let timeouts = timeouts(5_000, 10_000);
        let executor = RunExecutor::new(&controller, &services, &timeouts, &[]);

        let record = executor.execute(&profile(), 1, &cancel).await;
        assert!(record.status.is_aborted());
        for transport in &transports {
            assert!(!transport.is_shaped());
            assert_eq!(transport.live_processes(), 0);
        }
    }
}
