//! Run command: execute a campaign plan against the fleet

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use pqb_core::config::{load_config, CampaignPlan, FleetConfig, FleetOverrides};
use pqb_fleet::controller::{FleetController, FleetHost, RoleAssignment};
use pqb_fleet::retry::RetryPolicy;
use pqb_fleet::ssh::SshSession;
use pqb_runner::{CampaignRunner, ResultLog};

use crate::output::{format_summary, print_info, print_success, print_warning};

/// Execute the run command.
///
/// Exits cleanly iff every scheduled iteration produced a record, not iff
/// every iteration succeeded.
pub async fn run_command(plan_path: &Path, overrides: &FleetOverrides) -> Result<()> {
    let plan = CampaignPlan::load(plan_path)?;
    let mut fleet_config: FleetConfig = load_config(&plan.fleet)?;
    fleet_config.apply_overrides(overrides);
    plan.validate(&fleet_config)?;

    let planned = plan.total_iterations();
    print_info(&format!(
        "Campaign: {} iterations over {} schedule entries, results -> {}",
        planned,
        plan.schedule.len(),
        plan.result_log.display()
    ));

    let controller = connect_fleet(&plan, &fleet_config).await?;
    let log = ResultLog::append_to(&plan.result_log)
        .with_context(|| format!("failed to open {}", plan.result_log.display()))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                print_warning(
                    "Interrupt: finishing teardown, remaining iterations will be aborted",
                );
                cancel.cancel();
            }
        });
    }

    let mut runner = CampaignRunner::new(plan, controller, log);
    let report = runner.run(&cancel).await?;
    runner.fleet().close_all().await;

    println!("{}", format_summary(&report.summaries()));

    let produced = report.records.len() as u32;
    if produced != planned {
        anyhow::bail!(
            "only {} of {} scheduled iterations produced a record",
            produced,
            planned
        );
    }
    print_success(&format!(
        "{} of {} scheduled iterations recorded",
        produced, planned
    ));
    Ok(())
}

/// Open one SSH session per participating host, in parallel
async fn connect_fleet(
    plan: &CampaignPlan,
    fleet_config: &FleetConfig,
) -> Result<FleetController> {
    let roles = RoleAssignment::from_mapping(&plan.roles)?;

    let connects = roles.participants().into_iter().map(|host_id| async move {
        let host_config = fleet_config
            .host(&host_id)
            .cloned()
            .with_context(|| format!("host {} missing from fleet file", host_id))?;
        print_info(&format!("Connecting to {} ({})", host_id, host_config.address));
        let session =
            SshSession::connect(host_id.clone(), host_config.clone(), RetryPolicy::default())
                .await
                .with_context(|| format!("failed to connect to {}", host_id))?;
        Ok::<_, anyhow::Error>((host_id, host_config, session))
    });

    let mut hosts = HashMap::new();
    for result in join_all(connects).await {
        let (host_id, host_config, session) = result?;
        let address = host_config.host_addr().to_string();
        hosts.insert(
            host_id,
            FleetHost {
                transport: Arc::new(session),
                workdir: host_config.workdir,
                interface: host_config.interface,
                address,
            },
        );
    }

    let controller = FleetController::new(
        hosts,
        roles,
        plan.timeouts.command,
        plan.services.sweep_patterns(),
    )?;
    Ok(controller)
}
