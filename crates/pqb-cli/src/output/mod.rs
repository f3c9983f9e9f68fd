//! Output formatting for the orchestrator CLI
//!
//! Colored status lines plus the per-topology summary table.

use tabled::{settings::Style, Table, Tabled};

use pqb_runner::TopologySummary;

/// Format the per-topology summary as an ASCII table
pub fn format_summary(summaries: &[TopologySummary]) -> String {
    if summaries.is_empty() {
        return "No records".to_string();
    }

    #[derive(Tabled)]
    struct SummaryRow {
        #[tabled(rename = "TOPOLOGY")]
        topology: u32,
        #[tabled(rename = "RUNS")]
        runs: u32,
        #[tabled(rename = "OK")]
        successes: u32,
        #[tabled(rename = "FAILED")]
        failed: u32,
        #[tabled(rename = "SKIPPED")]
        skipped: u32,
        #[tabled(rename = "ABORTED")]
        aborted: u32,
        #[tabled(rename = "SUCCESS %")]
        success_rate: String,
        #[tabled(rename = "MEAN s")]
        mean: String,
        #[tabled(rename = "P50 s")]
        median: String,
        #[tabled(rename = "P95 s")]
        p95: String,
    }

    let rows: Vec<SummaryRow> = summaries
        .iter()
        .map(|s| SummaryRow {
            topology: s.topology,
            runs: s.runs,
            successes: s.successes,
            failed: s.failed,
            skipped: s.skipped,
            aborted: s.aborted,
            success_rate: format!("{:.1}", s.success_rate_percent),
            mean: format!("{:.2}", s.mean_duration_s),
            median: format!("{:.2}", s.median_duration_s),
            p95: format!("{:.2}", s.p95_duration_s),
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::sharp());
    table.to_string()
}

/// Print a success message with a green checkmark
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message with a red cross
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message with a yellow marker
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message with a cyan marker
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
