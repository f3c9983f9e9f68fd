//! Teardown command: best-effort cleanup of leaked fleet state
//!
//! Used after an orchestrator crash: kills any stray service processes and
//! clears shaping on every host in the fleet file. Never aborts on a
//! failing host; everything it could not clean is reported at the end.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;

use pqb_core::config::{load_config, FleetConfig, FleetOverrides, ServiceSpec};
use pqb_core::types::HostId;
use pqb_fleet::retry::RetryPolicy;
use pqb_fleet::shaper::TrafficShaper;
use pqb_fleet::ssh::SshSession;
use pqb_fleet::transport::HostTransport;

use crate::output::{print_success, print_warning};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Execute the teardown command
pub async fn teardown_command(fleet_path: &Path, overrides: &FleetOverrides) -> Result<()> {
    let mut fleet: FleetConfig = load_config(fleet_path)?;
    fleet.apply_overrides(overrides);

    if fleet.hosts.is_empty() {
        print_warning("Fleet file lists no hosts");
        return Ok(());
    }

    let patterns = ServiceSpec::default().sweep_patterns();

    let cleanups = fleet.hosts.iter().map(|(id, host_config)| {
        let host_id = HostId::from(id.as_str());
        let patterns = &patterns;
        async move {
            let mut issues = Vec::new();

            let session = match SshSession::connect(
                host_id.clone(),
                host_config.clone(),
                RetryPolicy::default(),
            )
            .await
            {
                Ok(session) => session,
                Err(err) => {
                    issues.push(format!("{}: {}", host_id, err));
                    return issues;
                }
            };

            for pattern in patterns {
                // pkill exits 1 when nothing matched; only transport
                // failures count as issues
                let command = format!("pkill -f '{}'", pattern);
                if let Err(err) = session.exec(&command, COMMAND_TIMEOUT).await {
                    issues.push(format!("{}: sweep '{}': {}", host_id, pattern, err));
                }
            }

            let shaper = TrafficShaper::new(&host_config.interface, COMMAND_TIMEOUT);
            if let Err(err) = shaper.clear(&session).await {
                issues.push(format!("{}: {}", host_id, err));
            }

            let _ = session.close().await;
            issues
        }
    });

    let issues: Vec<String> = join_all(cleanups).await.into_iter().flatten().collect();

    if issues.is_empty() {
        print_success(&format!("Fleet clean ({} hosts)", fleet.hosts.len()));
    } else {
        for issue in &issues {
            print_warning(issue);
        }
        print_warning(&format!("Teardown finished with {} issues", issues.len()));
    }
    Ok(())
}
