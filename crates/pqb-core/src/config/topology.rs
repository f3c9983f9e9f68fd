//! Topology profile configuration

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::types::TopologyId;

/// One aggregate bandwidth/delay/loss setting, applied uniformly across the
/// fleet for the duration of an iteration. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyProfile {
    /// Profile identifier referenced by the schedule
    pub id: TopologyId,

    /// Aggregate one-way delay in milliseconds
    pub delay_ms: f64,

    /// Aggregate bandwidth in megabits per second
    pub bandwidth_mbps: f64,

    /// Aggregate packet loss rate in percent (0..=100)
    pub loss_percent: f64,

    /// Optional delay jitter in milliseconds
    #[serde(default)]
    pub jitter_ms: Option<f64>,
}

impl TopologyProfile {
    /// Validate the profile ranges
    pub fn validate(&self) -> Result<(), PlanError> {
        let invalid = |reason: String| PlanError::InvalidProfile {
            id: self.id.as_u32(),
            reason,
        };

        if !self.delay_ms.is_finite() || self.delay_ms < 0.0 {
            return Err(invalid(format!("delay_ms must be >= 0, got {}", self.delay_ms)));
        }
        if !self.bandwidth_mbps.is_finite() || self.bandwidth_mbps <= 0.0 {
            return Err(invalid(format!(
                "bandwidth_mbps must be > 0, got {}",
                self.bandwidth_mbps
            )));
        }
        if !self.loss_percent.is_finite() || !(0.0..=100.0).contains(&self.loss_percent) {
            return Err(invalid(format!(
                "loss_percent must be within 0..=100, got {}",
                self.loss_percent
            )));
        }
        if let Some(jitter) = self.jitter_ms {
            if !jitter.is_finite() || jitter < 0.0 {
                return Err(invalid(format!("jitter_ms must be >= 0, got {}", jitter)));
            }
        }
        Ok(())
    }
}
