//! Configuration management for pqtor-bench
//!
//! Three on-disk structures, all TOML: the fleet file (hosts and transport
//! credentials), the campaign plan (schedule, role mapping, timeouts,
//! service command templates, embedded topology profiles), and nothing
//! else. Everything a run needs is data in these files.

mod fleet;
mod plan;
mod topology;

pub use fleet::{FleetConfig, FleetOverrides, HostConfig};
pub use plan::{CampaignPlan, PlanItem, RoleMapping, ServiceSpec, Timeouts};
pub use topology::TopologyProfile;

use crate::error::PlanError;
use std::path::Path;

/// Load a TOML configuration file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, PlanError> {
    if !path.exists() {
        return Err(PlanError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| PlanError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

// Helper module for Duration fields serialized as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config::<FleetConfig>(Path::new("/nonexistent/fleet.toml"));
        assert!(matches!(err, Err(PlanError::NotFound(_))));
    }

    #[test]
    fn test_load_config_rejects_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is not toml at all [[[").unwrap();
        let err = load_config::<FleetConfig>(file.path());
        assert!(matches!(err, Err(PlanError::Parse(_))));
    }
}
