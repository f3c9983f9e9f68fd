//! Campaign plan: schedule, role mapping, timeouts, service templates

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::duration_ms;
use super::fleet::FleetConfig;
use super::topology::TopologyProfile;
use crate::error::PlanError;
use crate::types::{HostId, Role, TopologyId};

/// One schedule entry: run `repetitions` iterations under `topology`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanItem {
    /// Topology profile to apply
    pub topology: TopologyId,

    /// Number of iterations
    pub repetitions: u32,
}

/// Static role-to-host mapping for the whole campaign
pub type RoleMapping = HashMap<Role, String>;

/// Timeout budget, per level: command < phase < iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Readiness deadline per service tier
    #[serde(rename = "ready_ms", with = "duration_ms")]
    pub ready: Duration,

    /// Wall-clock budget for one client iteration
    #[serde(rename = "iteration_ms", with = "duration_ms")]
    pub iteration: Duration,

    /// Budget for the whole teardown phase
    #[serde(rename = "teardown_ms", with = "duration_ms")]
    pub teardown: Duration,

    /// Default per-command timeout on a host session
    #[serde(rename = "command_ms", with = "duration_ms")]
    pub command: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(30),
            iteration: Duration::from_secs(120),
            teardown: Duration::from_secs(60),
            command: Duration::from_secs(15),
        }
    }
}

/// Command templates and markers for the external service binaries
///
/// Templates may reference `{port}`, `{role}`, and `{directory}`; the
/// orchestrator substitutes them per launch. The markers are the strings the
/// external binaries print; they are configuration, not protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    /// Port the directory listens on
    pub directory_port: u16,

    /// Base port for relays; guard/middle/exit get base, base+1, base+2
    pub relay_base_port: u16,

    /// Launch template for the directory
    pub directory_command: String,

    /// Launch template for a relay
    pub relay_command: String,

    /// Launch template for the benchmark client
    pub client_command: String,

    /// Line the client prints on a successful measurement
    pub success_marker: String,

    /// Line a relay logs once registered with the directory
    pub registered_marker: String,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            directory_port: 7000,
            relay_base_port: 9000,
            directory_command: "./directory --listen 0.0.0.0:{port}".to_string(),
            relay_command: "./relay --role {role} --listen 0.0.0.0:{port} --directory {directory}"
                .to_string(),
            client_command: "./client --directory {directory}".to_string(),
            success_marker: "BENCH_OK".to_string(),
            registered_marker: "registered with directory".to_string(),
        }
    }
}

impl ServiceSpec {
    /// Port assigned to a role
    pub fn port_for(&self, role: Role) -> u16 {
        match role {
            Role::Directory => self.directory_port,
            Role::Guard => self.relay_base_port,
            Role::Middle => self.relay_base_port + 1,
            Role::Exit => self.relay_base_port + 2,
            // The client dials out; it has no listen port
            Role::Client => 0,
        }
    }

    /// Render the launch command for a role, given the directory endpoint
    pub fn command_for(&self, role: Role, directory: &str) -> String {
        let template = match role {
            Role::Directory => &self.directory_command,
            Role::Guard | Role::Middle | Role::Exit => &self.relay_command,
            Role::Client => &self.client_command,
        };
        template
            .replace("{port}", &self.port_for(role).to_string())
            .replace("{role}", role.as_str())
            .replace("{directory}", directory)
    }

    /// Remote log file for a role, relative to the working directory
    pub fn log_path(&self, role: Role) -> String {
        format!("{}.log", role.as_str())
    }

    /// Process patterns swept by teardown, one per service binary
    pub fn sweep_patterns(&self) -> Vec<String> {
        [
            &self.directory_command,
            &self.relay_command,
            &self.client_command,
        ]
        .iter()
        .filter_map(|template| template.split_whitespace().next())
        .map(|binary| binary.trim_start_matches("./").to_string())
        .collect()
    }
}

/// The campaign plan file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignPlan {
    /// Path to the fleet file, relative to the plan file
    pub fleet: PathBuf,

    /// Append-only result log path
    #[serde(default = "default_result_log")]
    pub result_log: PathBuf,

    /// Abort on the first transport-caused failure
    #[serde(default)]
    pub fail_fast: bool,

    /// Consecutive-failure threshold that aborts the remainder
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Timeout budgets
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Role-to-host mapping
    pub roles: RoleMapping,

    /// Local artifacts staged into every host's working directory
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    /// Service command templates
    #[serde(default)]
    pub services: ServiceSpec,

    /// Ordered schedule
    pub schedule: Vec<PlanItem>,

    /// Topology profiles referenced by the schedule
    pub topologies: Vec<TopologyProfile>,
}

fn default_result_log() -> PathBuf {
    PathBuf::from("results.jsonl")
}

fn default_max_consecutive_failures() -> u32 {
    5
}

impl CampaignPlan {
    /// Load a plan file; the embedded fleet path is resolved against the
    /// plan file's directory.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let mut plan: CampaignPlan = super::load_config(path)?;
        if plan.fleet.is_relative() {
            if let Some(dir) = path.parent() {
                plan.fleet = dir.join(&plan.fleet);
            }
        }
        Ok(plan)
    }

    /// Look up a topology profile by id
    pub fn topology(&self, id: TopologyId) -> Option<&TopologyProfile> {
        self.topologies.iter().find(|t| t.id == id)
    }

    /// Host mapped to a role
    pub fn host_for(&self, role: Role) -> Option<HostId> {
        self.roles.get(&role).map(|s| HostId::from(s.as_str()))
    }

    /// Total number of iterations the schedule will produce
    pub fn total_iterations(&self) -> u32 {
        self.schedule.iter().map(|item| item.repetitions).sum()
    }

    /// Validate the plan against the fleet file. Must pass before the
    /// first run; nothing here is recoverable mid-campaign.
    pub fn validate(&self, fleet: &FleetConfig) -> Result<(), PlanError> {
        if self.schedule.is_empty() {
            return Err(PlanError::Invalid("schedule is empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for profile in &self.topologies {
            profile.validate()?;
            if !seen.insert(profile.id) {
                return Err(PlanError::DuplicateTopology(profile.id.as_u32()));
            }
        }

        for item in &self.schedule {
            if item.repetitions == 0 {
                return Err(PlanError::Invalid(format!(
                    "{} scheduled with zero repetitions",
                    item.topology
                )));
            }
            if self.topology(item.topology).is_none() {
                return Err(PlanError::UnknownTopology(item.topology.as_u32()));
            }
        }

        for role in Role::ALL {
            let host = self
                .roles
                .get(&role)
                .ok_or_else(|| PlanError::MissingRole(role.to_string()))?;
            if fleet.host(&HostId::from(host.as_str())).is_none() {
                return Err(PlanError::UnknownHost {
                    role: role.to_string(),
                    host: host.clone(),
                });
            }
        }

        if self.max_consecutive_failures == 0 {
            return Err(PlanError::Invalid(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;

    const PLAN_TOML: &str = r#"
        fleet = "fleet.toml"

        [roles]
        directory = "pi-01"
        guard = "pi-02"
        middle = "pi-03"
        exit = "pi-04"
        client = "pi-05"

        [[schedule]]
        topology = 1
        repetitions = 3

        [[topologies]]
        id = 1
        delay_ms = 5.0
        bandwidth_mbps = 60.0
        loss_percent = 3.0
    "#;

    fn fleet_with(ids: &[&str]) -> FleetConfig {
        let mut fleet = FleetConfig::default();
        for id in ids {
            fleet.hosts.insert(
                id.to_string(),
                HostConfig {
                    address: "10.0.0.1:22".into(),
                    username: "pi".into(),
                    key_path: PathBuf::from("/key"),
                    workdir: "/home/pi/pqtor".into(),
                    interface: "eth0".into(),
                },
            );
        }
        fleet
    }

    fn full_fleet() -> FleetConfig {
        fleet_with(&["pi-01", "pi-02", "pi-03", "pi-04", "pi-05"])
    }

    #[test]
    fn test_parse_plan_with_defaults() {
        let plan: CampaignPlan = toml::from_str(PLAN_TOML).unwrap();
        assert_eq!(plan.timeouts.ready, Duration::from_secs(30));
        assert_eq!(plan.timeouts.iteration, Duration::from_secs(120));
        assert_eq!(plan.max_consecutive_failures, 5);
        assert!(!plan.fail_fast);
        assert_eq!(plan.total_iterations(), 3);
    }

    #[test]
    fn test_timeouts_parse_from_millis() {
        let plan: CampaignPlan = toml::from_str(&format!(
            "{}\n[timeouts]\nready_ms = 10000\niteration_ms = 10000\nteardown_ms = 5000\ncommand_ms = 2000\n",
            PLAN_TOML
        ))
        .unwrap();
        assert_eq!(plan.timeouts.ready, Duration::from_secs(10));
        assert_eq!(plan.timeouts.command, Duration::from_secs(2));
    }

    #[test]
    fn test_validate_accepts_complete_plan() {
        let plan: CampaignPlan = toml::from_str(PLAN_TOML).unwrap();
        assert!(plan.validate(&full_fleet()).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_topology() {
        let mut plan: CampaignPlan = toml::from_str(PLAN_TOML).unwrap();
        plan.schedule.push(PlanItem {
            topology: TopologyId::new(9),
            repetitions: 1,
        });
        assert!(matches!(
            plan.validate(&full_fleet()),
            Err(PlanError::UnknownTopology(9))
        ));
    }

    #[test]
    fn test_validate_rejects_missing_role() {
        let mut plan: CampaignPlan = toml::from_str(PLAN_TOML).unwrap();
        plan.roles.remove(&Role::Exit);
        assert!(matches!(
            plan.validate(&full_fleet()),
            Err(PlanError::MissingRole(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unmapped_host() {
        let plan: CampaignPlan = toml::from_str(PLAN_TOML).unwrap();
        let fleet = fleet_with(&["pi-01", "pi-02", "pi-03", "pi-04"]);
        assert!(matches!(
            plan.validate(&fleet),
            Err(PlanError::UnknownHost { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_topology() {
        let mut plan: CampaignPlan = toml::from_str(PLAN_TOML).unwrap();
        let dup = plan.topologies[0].clone();
        plan.topologies.push(dup);
        assert!(matches!(
            plan.validate(&full_fleet()),
            Err(PlanError::DuplicateTopology(1))
        ));
    }

    #[test]
    fn test_command_substitution() {
        let spec = ServiceSpec::default();
        assert_eq!(
            spec.command_for(Role::Directory, "10.0.0.11:7000"),
            "./directory --listen 0.0.0.0:7000"
        );
        assert_eq!(
            spec.command_for(Role::Middle, "10.0.0.11:7000"),
            "./relay --role middle --listen 0.0.0.0:9001 --directory 10.0.0.11:7000"
        );
        assert_eq!(
            spec.command_for(Role::Client, "10.0.0.11:7000"),
            "./client --directory 10.0.0.11:7000"
        );
    }

    #[test]
    fn test_sweep_patterns_are_binary_names() {
        let spec = ServiceSpec::default();
        assert_eq!(spec.sweep_patterns(), vec!["directory", "relay", "client"]);
    }

    #[test]
    fn test_log_path_per_role() {
        let spec = ServiceSpec::default();
        assert_eq!(spec.log_path(Role::Guard), "guard.log");
    }
}
