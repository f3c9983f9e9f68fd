//! Fleet file: the hosts and their transport credentials

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::HostId;

/// One remote host in the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// SSH endpoint, `host:port`
    pub address: String,

    /// SSH username
    #[serde(default = "default_username")]
    pub username: String,

    /// Path to the SSH private key
    pub key_path: PathBuf,

    /// Remote working directory containing the service binaries
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Network interface carrying experiment traffic
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_username() -> String {
    "pi".to_string()
}

fn default_workdir() -> String {
    "/home/pi/pqtor".to_string()
}

fn default_interface() -> String {
    "eth0".to_string()
}

impl HostConfig {
    /// Host part of the SSH endpoint, without the port
    pub fn host_addr(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }
}

/// The fleet file: hosts indexed by their stable id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Hosts indexed by host id
    pub hosts: HashMap<String, HostConfig>,
}

/// Credential/interface overrides supplied via environment or CLI flags
#[derive(Debug, Clone, Default)]
pub struct FleetOverrides {
    pub username: Option<String>,
    pub key_path: Option<PathBuf>,
    pub interface: Option<String>,
}

impl FleetConfig {
    /// Look up a host by id
    pub fn host(&self, id: &HostId) -> Option<&HostConfig> {
        self.hosts.get(id.as_str())
    }

    /// All host ids in the fleet
    pub fn host_ids(&self) -> Vec<HostId> {
        self.hosts.keys().map(|k| HostId::from(k.as_str())).collect()
    }

    /// Apply environment/CLI overrides to every host
    pub fn apply_overrides(&mut self, overrides: &FleetOverrides) {
        for host in self.hosts.values_mut() {
            if let Some(username) = &overrides.username {
                host.username = username.clone();
            }
            if let Some(key_path) = &overrides.key_path {
                host.key_path = key_path.clone();
            }
            if let Some(interface) = &overrides.interface {
                host.interface = interface.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLEET_TOML: &str = r#"
        [hosts.pi-01]
        address = "10.0.0.11:22"
        key_path = "/home/op/.ssh/id_ed25519"

        [hosts.pi-02]
        address = "10.0.0.12:22"
        username = "op"
        key_path = "/home/op/.ssh/id_ed25519"
        workdir = "/opt/pqtor"
        interface = "wlan0"
    "#;

    #[test]
    fn test_parse_fleet_with_defaults() {
        let fleet: FleetConfig = toml::from_str(FLEET_TOML).unwrap();
        let host = fleet.host(&HostId::new("pi-01")).unwrap();
        assert_eq!(host.username, "pi");
        assert_eq!(host.workdir, "/home/pi/pqtor");
        assert_eq!(host.interface, "eth0");

        let host = fleet.host(&HostId::new("pi-02")).unwrap();
        assert_eq!(host.username, "op");
        assert_eq!(host.interface, "wlan0");
    }

    #[test]
    fn test_host_addr_strips_port() {
        let fleet: FleetConfig = toml::from_str(FLEET_TOML).unwrap();
        let host = fleet.host(&HostId::new("pi-01")).unwrap();
        assert_eq!(host.host_addr(), "10.0.0.11");
    }

    #[test]
    fn test_overrides_apply_to_all_hosts() {
        let mut fleet: FleetConfig = toml::from_str(FLEET_TOML).unwrap();
        fleet.apply_overrides(&FleetOverrides {
            username: Some("bench".into()),
            key_path: None,
            interface: Some("eth1".into()),
        });
        for host in fleet.hosts.values() {
            assert_eq!(host.username, "bench");
            assert_eq!(host.interface, "eth1");
        }
    }
}
