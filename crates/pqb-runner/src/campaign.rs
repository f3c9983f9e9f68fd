//! Campaign execution
//!
//! Topologies and iterations run strictly sequentially: the fleet has one
//! global shaping state, and each topology gets exclusive control of it.
//! Every scheduled iteration produces exactly one record, including the
//! ones an early abort never ran.

use tokio_util::sync::CancellationToken;

use pqb_core::config::CampaignPlan;
use pqb_core::error::{OrchestratorError, PlanError};
use pqb_fleet::controller::FleetController;

use crate::executor::RunExecutor;
use crate::record::{FailureKind, ResultLog, RunRecord, RunStatus};
use crate::summary::{summarize, TopologySummary};

/// All records of one campaign, in schedule order
#[derive(Debug)]
pub struct CampaignReport {
    pub records: Vec<RunRecord>,
}

impl CampaignReport {
    /// Per-topology aggregation
    pub fn summaries(&self) -> Vec<TopologySummary> {
        summarize(&self.records)
    }

    /// Whether every record is a success
    pub fn all_succeeded(&self) -> bool {
        self.records.iter().all(|r| r.status.is_success())
    }
}

/// Executes a campaign plan against a connected fleet
pub struct CampaignRunner {
    plan: CampaignPlan,
    fleet: FleetController,
    log: ResultLog,
}

impl CampaignRunner {
    pub fn new(plan: CampaignPlan, fleet: FleetController, log: ResultLog) -> Self {
        Self { plan, fleet, log }
    }

    /// The fleet controller, for cleanup after the campaign
    pub fn fleet(&self) -> &FleetController {
        &self.fleet
    }

    /// Run the whole schedule. Returns a report with one record per
    /// scheduled iteration; the result log receives each record as soon as
    /// its iteration completes.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CampaignReport, OrchestratorError> {
        let plan = &self.plan;
        let fleet = &self.fleet;
        let log = &mut self.log;

        let executor = RunExecutor::new(fleet, &plan.services, &plan.timeouts, &plan.artifacts);

        let total = plan.total_iterations();
        let mut records: Vec<RunRecord> = Vec::with_capacity(total as usize);
        let mut consecutive_failures = 0u32;
        let mut aborted = false;

        for item in &plan.schedule {
            let profile = plan
                .topology(item.topology)
                .ok_or(PlanError::UnknownTopology(item.topology.as_u32()))?;

            for iteration in 1..=item.repetitions {
                let record = if aborted || cancel.is_cancelled() {
                    RunRecord::aborted(item.topology, iteration)
                } else {
                    let record = executor.execute(profile, iteration, cancel).await;

                    match &record.status {
                        RunStatus::Success => consecutive_failures = 0,
                        RunStatus::Failed(kind) => {
                            consecutive_failures += 1;
                            if plan.fail_fast
                                && matches!(kind, FailureKind::Transport { .. })
                            {
                                tracing::error!(
                                    "FATAL: transport failure with fail_fast set, aborting campaign"
                                );
                                aborted = true;
                            }
                        }
                        RunStatus::Skipped(_) | RunStatus::Aborted => {}
                    }
                    if consecutive_failures >= plan.max_consecutive_failures {
                        tracing::error!(
                            "FATAL: {} consecutive failures, aborting campaign",
                            consecutive_failures
                        );
                        aborted = true;
                    }
                    record
                };

                log.append(&record)?;
                tracing::info!(
                    "Recorded {} iteration {}/{}: {} ({}/{} scheduled)",
                    item.topology,
                    iteration,
                    item.repetitions,
                    record.status.label(),
                    records.len() + 1,
                    total
                );
                records.push(record);
            }
        }

        Ok(CampaignReport { records })
    }
}
