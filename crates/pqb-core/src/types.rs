//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a fleet host
///
/// The identity is the stable hostname or address key used in the fleet
/// file; per-run attributes (role, interface, working directory) are data
/// attached elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostId(pub String);

impl HostId {
    /// Create a new host ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Service role a host plays during one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Directory service publishing the relay set
    Directory,
    /// Entry relay
    Guard,
    /// Middle relay
    Middle,
    /// Exit relay
    Exit,
    /// Benchmark client
    Client,
}

impl Role {
    /// All roles, in dependency order: directory first, relays, then client
    pub const ALL: [Role; 5] = [
        Role::Directory,
        Role::Guard,
        Role::Middle,
        Role::Exit,
        Role::Client,
    ];

    /// The relay tier, in circuit position order
    pub const RELAYS: [Role; 3] = [Role::Guard, Role::Middle, Role::Exit];

    /// Stable lowercase name, also used as the remote service name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Directory => "directory",
            Role::Guard => "guard",
            Role::Middle => "middle",
            Role::Exit => "exit",
            Role::Client => "client",
        }
    }

    /// Whether this role is part of the relay tier
    pub fn is_relay(&self) -> bool {
        matches!(self, Role::Guard | Role::Middle | Role::Exit)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "directory" => Ok(Role::Directory),
            "guard" => Ok(Role::Guard),
            "middle" => Ok(Role::Middle),
            "exit" => Ok(Role::Exit),
            "client" => Ok(Role::Client),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Identifier of a topology profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopologyId(pub u32);

impl TopologyId {
    /// Create a new topology ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TopologyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topology-{}", self.0)
    }
}

impl From<u32> for TopologyId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>(), Ok(role));
        }
    }

    #[test]
    fn test_role_rejects_unknown() {
        assert!("bridge".parse::<Role>().is_err());
    }

    #[test]
    fn test_relay_tier_membership() {
        assert!(Role::Guard.is_relay());
        assert!(Role::Middle.is_relay());
        assert!(Role::Exit.is_relay());
        assert!(!Role::Directory.is_relay());
        assert!(!Role::Client.is_relay());
    }

    #[test]
    fn test_topology_id_display() {
        assert_eq!(format!("{}", TopologyId::new(7)), "topology-7");
    }

    #[test]
    fn test_host_id_display() {
        let id = HostId::new("pi-01");
        assert_eq!(id.as_str(), "pi-01");
        assert_eq!(format!("{}", id), "pi-01");
    }
}
