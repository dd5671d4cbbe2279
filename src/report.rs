//! Per-unit outcomes and run-level reporting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::backend::Verdict;

/// Final state of one executed unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Passed,
    /// Visual mismatch, with the backend's diff summary
    Failed(String),
    /// The unit could not produce a verdict
    Errored(String),
}

impl ExecutionOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, ExecutionOutcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed(_))
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, ExecutionOutcome::Errored(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Passed => "PASSED",
            ExecutionOutcome::Failed(_) => "FAILED",
            ExecutionOutcome::Errored(_) => "ERROR",
        }
    }
}

impl From<Verdict> for ExecutionOutcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Passed | Verdict::NewBaseline => ExecutionOutcome::Passed,
            Verdict::Failed(details) => ExecutionOutcome::Failed(details),
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionOutcome::Passed => write!(f, "{}", self.label()),
            ExecutionOutcome::Failed(detail) | ExecutionOutcome::Errored(detail) => {
                write!(f, "{}: {}", self.label(), detail)
            }
        }
    }
}

/// One recorded outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub name: String,
    pub outcome: ExecutionOutcome,
}

/// Thread-safe collector of unit outcomes, in completion order
#[derive(Debug, Default)]
pub struct ResultAggregator {
    records: Mutex<Vec<UnitRecord>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one unit; safe to call from any worker
    pub fn record(&self, name: &str, outcome: ExecutionOutcome) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(UnitRecord {
                name: name.to_string(),
                outcome,
            });
    }

    /// Copy of every outcome recorded so far.
    ///
    /// Complete only once the owning executor's `join` has returned.
    pub fn snapshot(&self) -> Vec<UnitRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Summary of a complete run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<UnitRecord>,
}

impl RunReport {
    pub fn from_records(records: Vec<UnitRecord>, started_at: DateTime<Utc>) -> Self {
        let passed = records.iter().filter(|r| r.outcome.is_passed()).count();
        let failed = records.iter().filter(|r| r.outcome.is_failed()).count();
        let errored = records.iter().filter(|r| r.outcome.is_errored()).count();
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;

        Self {
            total: records.len(),
            passed,
            failed,
            errored,
            started_at,
            duration_ms,
            results: records,
        }
    }

    /// Whether any unit failed to produce a verdict
    pub fn has_errors(&self) -> bool {
        self.errored > 0
    }

    /// Write the report as pretty-printed JSON
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Print one line per unit and a summary line
    pub fn print_table(&self) {
        for record in &self.results {
            println!("  [{}] {}", record.outcome.label(), record.name);
            match &record.outcome {
                ExecutionOutcome::Failed(detail) | ExecutionOutcome::Errored(detail) => {
                    println!("      {}", detail);
                }
                ExecutionOutcome::Passed => {}
            }
        }
        println!();
        println!(
            "Results: {} passed, {} failed, {} errored ({} total, {} ms)",
            self.passed, self.failed, self.errored, self.total, self.duration_ms
        );
    }
}
