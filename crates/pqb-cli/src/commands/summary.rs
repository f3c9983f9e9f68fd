//! Summary command: recompute the per-topology table from a result log

use std::path::Path;

use anyhow::{Context, Result};

use pqb_runner::{summarize, ResultLog};

use crate::output::{format_summary, print_info, print_warning};

/// Execute the summary command
pub fn summary_command(log_path: &Path) -> Result<()> {
    let records = ResultLog::load(log_path)
        .with_context(|| format!("failed to read {}", log_path.display()))?;

    if records.is_empty() {
        print_warning("Result log is empty");
        return Ok(());
    }

    print_info(&format!(
        "{} records in {}",
        records.len(),
        log_path.display()
    ));
    println!("{}", format_summary(&summarize(&records)));
    Ok(())
}
