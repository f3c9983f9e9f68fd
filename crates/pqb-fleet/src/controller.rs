//! Fleet-wide phase execution
//!
//! Acts on all hosts at once with explicit barriers: within a phase the
//! per-host futures run concurrently and the `join_all` is the barrier;
//! across phases the controller imposes strict ordering. Teardown runs
//! every step regardless of individual failures and never observes
//! cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use pqb_core::config::{RoleMapping, TopologyProfile};
use pqb_core::error::{PlanError, ShapingError, SupervisorError, TransportError};
use pqb_core::types::{HostId, Role};

use crate::probe::ReadinessProbe;
use crate::shaper::TrafficShaper;
use crate::supervisor::ProcessSupervisor;
use crate::transport::HostTransport;

/// One host as the controller sees it
pub struct FleetHost {
    /// Transport session to the host
    pub transport: Arc<dyn HostTransport>,
    /// Remote working directory containing the service binaries
    pub workdir: String,
    /// Interface carrying experiment traffic
    pub interface: String,
    /// Reachable address of the host (no port)
    pub address: String,
}

/// Static role-to-host assignment for one campaign, fully resolved
#[derive(Debug, Clone)]
pub struct RoleAssignment {
    directory: HostId,
    guard: HostId,
    middle: HostId,
    exit: HostId,
    client: HostId,
}

impl RoleAssignment {
    /// Build from the plan's role mapping; every role must be present
    pub fn from_mapping(mapping: &RoleMapping) -> Result<Self, PlanError> {
        let resolve = |role: Role| -> Result<HostId, PlanError> {
            mapping
                .get(&role)
                .map(|host| HostId::from(host.as_str()))
                .ok_or_else(|| PlanError::MissingRole(role.to_string()))
        };
        Ok(Self {
            directory: resolve(Role::Directory)?,
            guard: resolve(Role::Guard)?,
            middle: resolve(Role::Middle)?,
            exit: resolve(Role::Exit)?,
            client: resolve(Role::Client)?,
        })
    }

    /// Host assigned to a role
    pub fn host_for(&self, role: Role) -> &HostId {
        match role {
            Role::Directory => &self.directory,
            Role::Guard => &self.guard,
            Role::Middle => &self.middle,
            Role::Exit => &self.exit,
            Role::Client => &self.client,
        }
    }

    /// Participating hosts, deduplicated, in role order
    pub fn participants(&self) -> Vec<HostId> {
        let mut seen = Vec::new();
        for role in Role::ALL {
            let host = self.host_for(role);
            if !seen.contains(host) {
                seen.push(host.clone());
            }
        }
        seen
    }
}

/// Captured result of one benchmark client execution
#[derive(Debug, Clone)]
pub struct ClientOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall: Duration,
}

/// One launch request within a dependency tier
pub struct ServiceLaunch {
    pub role: Role,
    pub command: String,
    pub probe: ReadinessProbe,
}

/// Everything that went wrong during a teardown pass
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub issues: Vec<TeardownIssue>,
}

/// One teardown step that failed
#[derive(Debug)]
pub struct TeardownIssue {
    pub host: String,
    pub detail: String,
}

impl TeardownReport {
    /// No step failed
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Coordinates all hosts of one campaign
pub struct FleetController {
    hosts: HashMap<HostId, FleetHost>,
    roles: RoleAssignment,
    supervisors: DashMap<(HostId, Role), Arc<ProcessSupervisor>>,
    command_timeout: Duration,
    sweep_patterns: Vec<String>,
}

impl FleetController {
    /// Build a controller; every assigned role must resolve to a host
    pub fn new(
        hosts: HashMap<HostId, FleetHost>,
        roles: RoleAssignment,
        command_timeout: Duration,
        sweep_patterns: Vec<String>,
    ) -> Result<Self, PlanError> {
        for role in Role::ALL {
            let host = roles.host_for(role);
            if !hosts.contains_key(host) {
                return Err(PlanError::UnknownHost {
                    role: role.to_string(),
                    host: host.to_string(),
                });
            }
        }
        Ok(Self {
            hosts,
            roles,
            supervisors: DashMap::new(),
            command_timeout,
            sweep_patterns,
        })
    }

    /// The role assignment in effect
    pub fn roles(&self) -> &RoleAssignment {
        &self.roles
    }

    fn fleet_host(&self, host: &HostId) -> &FleetHost {
        // Checked at construction: every assigned role resolves
        self.hosts
            .get(host)
            .expect("assigned host resolved at construction")
    }

    fn host_of(&self, role: Role) -> &FleetHost {
        self.fleet_host(self.roles.host_for(role))
    }

    /// Reachable `address:port` of the service bound to `role`
    pub fn service_address(&self, role: Role, port: u16) -> String {
        format!("{}:{}", self.host_of(role).address, port)
    }

    /// Absolute remote path of a log file in `role`'s working directory
    pub fn remote_log_path(&self, role: Role, name: &str) -> String {
        format!("{}/{}", self.host_of(role).workdir, name)
    }

    /// Run a readiness probe against the transport bound to `role`
    pub async fn probe(
        &self,
        role: Role,
        probe: &ReadinessProbe,
    ) -> Result<bool, TransportError> {
        probe
            .check(self.host_of(role).transport.as_ref(), self.command_timeout)
            .await
    }

    /// Upload artifacts into every participant's working directory and mark
    /// them executable. Parallel across hosts; the join is the barrier.
    pub async fn stage(&self, artifacts: &[PathBuf]) -> Result<(), TransportError> {
        if artifacts.is_empty() {
            return Ok(());
        }

        let uploads = self.roles.participants().into_iter().map(|host_id| {
            let fleet_host = self.fleet_host(&host_id);
            async move {
                let mut names = Vec::new();
                for artifact in artifacts {
                    let name = match artifact.file_name() {
                        Some(name) => name.to_string_lossy().into_owned(),
                        None => continue,
                    };
                    let remote = format!("{}/{}", fleet_host.workdir, name);
                    fleet_host.transport.put(artifact, &remote).await?;
                    names.push(name);
                }
                if !names.is_empty() {
                    let command = format!(
                        "cd '{}' && chmod +x {}",
                        fleet_host.workdir,
                        names.join(" ")
                    );
                    fleet_host
                        .transport
                        .exec(&command, self.command_timeout)
                        .await?;
                }
                Ok::<(), TransportError>(())
            }
        });

        for result in join_all(uploads).await {
            result?;
        }
        tracing::info!("Staged {} artifacts on the fleet", artifacts.len());
        Ok(())
    }

    /// Apply a topology profile on every participant. A single failure
    /// aborts the phase and clears shaping everywhere.
    pub async fn shape(&self, profile: &TopologyProfile) -> Result<(), ShapingError> {
        let applies = self.roles.participants().into_iter().map(|host_id| {
            let fleet_host = self.fleet_host(&host_id);
            let shaper = TrafficShaper::new(&fleet_host.interface, self.command_timeout);
            async move { shaper.apply(fleet_host.transport.as_ref(), profile).await }
        });

        let mut first_error = None;
        for result in join_all(applies).await {
            if let Err(err) = result {
                tracing::warn!("Shaping phase failed: {}", err);
                first_error.get_or_insert(err);
            }
        }

        if let Some(err) = first_error {
            self.unshape_all().await;
            return Err(err);
        }
        tracing::info!("Applied {} across the fleet", profile.id);
        Ok(())
    }

    /// Clear shaping on every participant, collecting failures
    pub async fn unshape_all(&self) -> Vec<(HostId, ShapingError)> {
        let clears = self.roles.participants().into_iter().map(|host_id| {
            let fleet_host = self.fleet_host(&host_id);
            let shaper = TrafficShaper::new(&fleet_host.interface, self.command_timeout);
            async move {
                (
                    host_id,
                    shaper.clear(fleet_host.transport.as_ref()).await,
                )
            }
        });

        join_all(clears)
            .await
            .into_iter()
            .filter_map(|(host, result)| result.err().map(|err| (host, err)))
            .collect()
    }

    /// Launch one dependency tier in parallel and block on its readiness
    /// barrier. On failure the offending role is reported; supervisors of
    /// the whole tier stay registered for teardown.
    pub async fn start_tier(
        &self,
        launches: Vec<ServiceLaunch>,
        log_path_for: impl Fn(Role) -> String,
        ready_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), (Role, SupervisorError)> {
        let mut starts = Vec::new();
        for launch in launches {
            let role = launch.role;
            let supervisor = self
                .register(role, launch.command, log_path_for(role))
                .map_err(|err| (role, err))?;
            let cancel = cancel.clone();
            starts.push(async move {
                supervisor
                    .start(&launch.probe, ready_timeout, &cancel)
                    .await
                    .map_err(|err| (role, err))
            });
        }

        let mut first_error = None;
        for result in join_all(starts).await {
            if let Err((role, err)) = result {
                tracing::warn!("{} failed to start: {}", role, err);
                first_error.get_or_insert((role, err));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Create and register a supervisor, enforcing at most one per
    /// (host, service)
    fn register(
        &self,
        role: Role,
        command: String,
        log_path: String,
    ) -> Result<Arc<ProcessSupervisor>, SupervisorError> {
        let host_id = self.roles.host_for(role).clone();
        let fleet_host = self.fleet_host(&host_id);

        let key = (host_id.clone(), role);
        if self.supervisors.contains_key(&key) {
            return Err(SupervisorError::AlreadyRegistered {
                host: host_id.to_string(),
                service: role.to_string(),
            });
        }

        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&fleet_host.transport),
            role,
            command,
            fleet_host.workdir.clone(),
            log_path,
            self.command_timeout,
        ));
        self.supervisors.insert(key, Arc::clone(&supervisor));
        Ok(supervisor)
    }

    /// All registered supervisors
    pub fn supervisors(&self) -> Vec<Arc<ProcessSupervisor>> {
        self.supervisors
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Execute the benchmark client in the foreground, capturing stdout,
    /// exit code, and wall time
    pub async fn run_client(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ClientOutcome, TransportError> {
        let fleet_host = self.host_of(Role::Client);
        let full = format!("cd '{}' && {}", fleet_host.workdir, command);

        let started = tokio::time::Instant::now();
        let out = fleet_host.transport.exec(&full, timeout).await?;
        Ok(ClientOutcome {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            wall: started.elapsed(),
        })
    }

    /// Stop every supervisor, sweep stray service processes, and clear
    /// shaping on every host. Runs every step even when earlier ones fail;
    /// failures are collected, never raised. Not cancellable.
    pub async fn teardown(&self, grace: Duration) -> TeardownReport {
        let mut report = TeardownReport::default();

        let stops = self.supervisors().into_iter().map(|supervisor| async move {
            let host = supervisor.host().to_string();
            supervisor
                .stop(grace)
                .await
                .map_err(|err| (host, err.to_string()))
        });
        for result in join_all(stops).await {
            if let Err((host, detail)) = result {
                report.issues.push(TeardownIssue { host, detail });
            }
        }
        self.supervisors.clear();

        // Sweep processes leaked by a previous crashed orchestrator.
        // pkill exits 1 when nothing matched; that is the good case.
        for host_id in self.roles.participants() {
            let fleet_host = self.fleet_host(&host_id);
            for pattern in &self.sweep_patterns {
                let command = format!("pkill -f '{}'", pattern);
                if let Err(err) = fleet_host.transport.exec(&command, self.command_timeout).await
                {
                    report.issues.push(TeardownIssue {
                        host: host_id.to_string(),
                        detail: format!("sweep '{}': {}", pattern, err),
                    });
                }
            }
        }

        for (host, err) in self.unshape_all().await {
            report.issues.push(TeardownIssue {
                host: host.to_string(),
                detail: err.to_string(),
            });
        }

        if report.is_clean() {
            tracing::info!("Teardown clean");
        } else {
            for issue in &report.issues {
                tracing::warn!("Teardown issue on {}: {}", issue.host, issue.detail);
            }
        }
        report
    }

    /// Close every transport session
    pub async fn close_all(&self) {
        let closes = self
            .hosts
            .values()
            .map(|fleet_host| fleet_host.transport.close());
        for result in join_all(closes).await {
            if let Err(err) = result {
                tracing::debug!("Session close: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Scripted, ScriptedTransport};
    use pqb_core::types::TopologyId;

    fn assignment() -> RoleAssignment {
        let mut mapping = RoleMapping::new();
        mapping.insert(Role::Directory, "pi-01".to_string());
        mapping.insert(Role::Guard, "pi-02".to_string());
        mapping.insert(Role::Middle, "pi-03".to_string());
        mapping.insert(Role::Exit, "pi-04".to_string());
        mapping.insert(Role::Client, "pi-05".to_string());
        RoleAssignment::from_mapping(&mapping).unwrap()
    }

    fn fleet() -> (FleetController, Vec<Arc<ScriptedTransport>>) {
        let mut hosts = HashMap::new();
        let mut transports = Vec::new();
        for (i, id) in ["pi-01", "pi-02", "pi-03", "pi-04", "pi-05"]
            .iter()
            .enumerate()
        {
            let transport = Arc::new(ScriptedTransport::new(id));
            transports.push(Arc::clone(&transport));
            hosts.insert(
                HostId::new(*id),
                FleetHost {
                    transport,
                    workdir: "/home/pi/pqtor".to_string(),
                    interface: "eth0".to_string(),
                    address: format!("10.0.0.{}", 11 + i),
                },
            );
        }
        let controller = FleetController::new(
            hosts,
            assignment(),
            Duration::from_secs(5),
            vec!["directory".into(), "relay".into(), "client".into()],
        )
        .unwrap();
        (controller, transports)
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

    #[test]
    fn test_assignment_requires_all_roles() {
        let mut mapping = RoleMapping::new();
        mapping.insert(Role::Directory, "pi-01".to_string());
        assert!(matches!(
            RoleAssignment::from_mapping(&mapping),
            Err(PlanError::MissingRole(_))
        ));
    }

    #[test]
    fn test_participants_deduplicate_shared_hosts() {
        let mut mapping = RoleMapping::new();
        for role in Role::ALL {
            mapping.insert(role, "pi-01".to_string());
        }
        mapping.insert(Role::Client, "pi-02".to_string());
        let assignment = RoleAssignment::from_mapping(&mapping).unwrap();
        assert_eq!(
            assignment.participants(),
            vec![HostId::new("pi-01"), HostId::new("pi-02")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shape_failure_clears_everywhere() {
        let (controller, transports) = fleet();
        // Middle host cannot shape
        transports[2].on(
            "tc qdisc add",
            Scripted::fail(2, "Error: Specified qdisc not found.\n"),
        );

        let err = controller.shape(&profile()).await;
        assert!(matches!(err, Err(ShapingError::Unsupported { .. })));
        for transport in &transports {
            assert!(!transport.is_shaped(), "no shaping may survive the abort");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shape_applies_on_all_participants() {
        let (controller, transports) = fleet();
        controller.shape(&profile()).await.unwrap();
        for transport in &transports {
            assert!(transport.is_shaped());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_tier_registers_and_reports_offender() {
        let (controller, transports) = fleet();
        // Guard's marker never appears; directory tier unaffected
        transports[1].on("kill -0", Scripted::fail(1, ""));

        let cancel = CancellationToken::new();
        let result = controller
            .start_tier(
                vec![ServiceLaunch {
                    role: Role::Guard,
                    command: "./relay --role guard".to_string(),
                    probe: ReadinessProbe::LogMarker {
                        log_path: "guard.log".to_string(),
                        marker: "registered".to_string(),
                    },
                }],
                |role| format!("{}.log", role),
                Duration::from_secs(2),
                &cancel,
            )
            .await;

        match result {
            Err((role, _)) => assert_eq!(role, Role::Guard),
            Ok(()) => panic!("tier must fail"),
        }
        // Failed supervisor stays registered so teardown can account for it
        assert_eq!(controller.supervisors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registration_rejected() {
        let (controller, transports) = fleet();
        transports[0].on("grep -q", Scripted::ok(""));

        let cancel = CancellationToken::new();
        let launch = || ServiceLaunch {
            role: Role::Directory,
            command: "./directory".to_string(),
            probe: ReadinessProbe::LogMarker {
                log_path: "directory.log".to_string(),
                marker: "serving".to_string(),
            },
        };
        controller
            .start_tier(
                vec![launch()],
                |role| format!("{}.log", role),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();

        let result = controller
            .start_tier(
                vec![launch()],
                |role| format!("{}.log", role),
                Duration::from_secs(5),
                &cancel,
            )
            .await;
        assert!(matches!(
            result,
            Err((Role::Directory, SupervisorError::AlreadyRegistered { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_is_idempotent_and_total() {
        let (controller, transports) = fleet();
        transports[0].on("grep -q", Scripted::ok(""));
        controller.shape(&profile()).await.unwrap();

        let cancel = CancellationToken::new();
        controller
            .start_tier(
                vec![ServiceLaunch {
                    role: Role::Directory,
                    command: "./directory".to_string(),
                    probe: ReadinessProbe::LogMarker {
                        log_path: "directory.log".to_string(),
                        marker: "serving".to_string(),
                    },
                }],
                |role| format!("{}.log", role),
                Duration::from_secs(5),
                &cancel,
            )
            .await
            .unwrap();

        let report = controller.teardown(Duration::ZERO).await;
        assert!(report.is_clean());
        for transport in &transports {
            assert!(!transport.is_shaped());
            assert_eq!(transport.live_processes(), 0);
        }
        assert!(controller.supervisors().is_empty());

        // Second teardown leaves the same observable state
        let report = controller.teardown(Duration::ZERO).await;
        assert!(report.is_clean());
        for transport in &transports {
            assert!(!transport.is_shaped());
            assert_eq!(transport.live_processes(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_uploads_to_every_participant() {
        let (controller, transports) = fleet();
        controller
            .stage(&[PathBuf::from("./bin/relay")])
            .await
            .unwrap();
        for transport in &transports {
            let uploads = transport.uploads();
            assert_eq!(uploads.len(), 1);
            assert_eq!(uploads[0].1, "/home/pi/pqtor/relay");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_client_captures_outcome() {
        let (controller, transports) = fleet();
        transports[4].on("./client", Scripted::ok("handshake 812ms\nBENCH_OK\n"));

        let outcome = controller
            .run_client("./client --directory 10.0.0.11:7000", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("BENCH_OK"));
    }
}
