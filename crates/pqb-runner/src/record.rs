//! Run records and the append-only result log
//!
//! One JSON Lines record per iteration, written as soon as the iteration
//! completes. The Campaign Runner is the only writer; partial results
//! survive any later failure.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use pqb_core::types::{Role, TopologyId};

/// Seconds since the UNIX epoch; the fleet's clocks are only assumed good
/// to this granularity
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Why an iteration that ran did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// A service never became ready
    Startup { role: Role },
    /// The client exceeded the iteration timeout
    ClientTimeout,
    /// The client exited non-zero or without its success marker
    ClientError { exit_code: i32 },
    /// The transport gave out mid-iteration
    Transport { detail: String },
}

/// Why an iteration could not run at all
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipKind {
    /// The host kernel cannot shape
    ShapingUnsupported { host: String },
    /// Shaping kept failing after clear-and-retry
    ShapingFailed { host: String },
}

/// Outcome of one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RunStatus {
    /// Client exited zero with its success marker
    Success,
    /// Ran, did not succeed
    Failed(FailureKind),
    /// Could not run; the fleet was never touched beyond shaping
    Skipped(SkipKind),
    /// Scheduled but not run (campaign aborted or cancelled)
    Aborted,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RunStatus::Skipped(_))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RunStatus::Aborted)
    }

    /// Short label for logs and tables
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed(_) => "failed",
            RunStatus::Skipped(_) => "skipped",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Per-service outcome captured at collect time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostOutcome {
    pub host: String,
    pub service: Role,
    /// Final lifecycle state of the supervised process
    pub state: String,
    /// Remote exit code, when one was observed
    pub exit_code: Option<i32>,
    /// Last lines of the service log
    pub log_tail: String,
}

/// One record per iteration, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub topology: TopologyId,
    pub iteration: u32,
    pub started_at: u64,
    pub finished_at: u64,
    /// Measured iteration duration; for a client timeout this is exactly
    /// the iteration timeout
    pub duration_ms: u64,
    #[serde(default)]
    pub phase_durations_ms: BTreeMap<String, u64>,
    #[serde(default)]
    pub hosts: Vec<HostOutcome>,
    /// Raw benchmark output captured from the client
    #[serde(default)]
    pub client_stdout: String,
    pub status: RunStatus,
}

impl RunRecord {
    /// A record for an iteration that was scheduled but never run
    pub fn aborted(topology: TopologyId, iteration: u32) -> Self {
        let now = epoch_secs();
        Self {
            topology,
            iteration,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            phase_durations_ms: BTreeMap::new(),
            hosts: Vec::new(),
            client_stdout: String::new(),
            status: RunStatus::Aborted,
        }
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

/// Append-only JSON Lines result log, one writer
pub struct ResultLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ResultLog {
    /// Open for appending, creating the file if needed
    pub fn append_to(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Append one record and flush, so a crash never loses completed
    /// iterations
    pub fn append(&mut self, record: &RunRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()
    }

    /// The log path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back from a result log
    pub fn load(path: &Path) -> io::Result<Vec<RunRecord>> {
        let file = File::open(path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            records.push(record);
        }
        Ok(records)
    }
}
