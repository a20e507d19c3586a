//! go-test-style result listing and slowest-unit ranking.

use tracing::info;

use incrtest_core::{DiffedUnit, UnitSet};

use crate::run::RunOutcome;

/// How many of the slowest units the report lists.
pub const SLOWEST_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitStatus {
    /// Digest matched the index; not executed.
    Cached,
    Passed { duration_ms: u64 },
    /// `duration_ms` is `None` when the binary could not be started.
    Failed { duration_ms: Option<u64> },
    /// Due to run but no outcome was recorded.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub import_path: String,
    pub status: UnitStatus,
}

impl ReportEntry {
    fn executed_ms(&self) -> Option<u64> {
        match self.status {
            UnitStatus::Passed { duration_ms } => Some(duration_ms),
            UnitStatus::Failed { duration_ms } => duration_ms,
            UnitStatus::Cached | UnitStatus::Missing => None,
        }
    }

    /// Single go-test-style line for this unit.
    pub fn line(&self) -> String {
        match self.status {
            UnitStatus::Cached => format!("ok  \t{}\t(cached)", self.import_path),
            UnitStatus::Passed { duration_ms } => {
                format!("ok  \t{}\t{}", self.import_path, format_duration(duration_ms))
            }
            UnitStatus::Failed {
                duration_ms: Some(duration_ms),
            } => format!("FAIL\t{}\t{}", self.import_path, format_duration(duration_ms)),
            UnitStatus::Failed { duration_ms: None } => {
                format!("FAIL\t{}\t[not started]", self.import_path)
            }
            UnitStatus::Missing => format!("?   \t{}\t[not run]", self.import_path),
        }
    }
}

/// Per-unit results of a run stage, sorted by import path.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn new(units: &UnitSet<DiffedUnit>, outcomes: &[RunOutcome]) -> Self {
        let entries = units
            .iter()
            .map(|(import_path, unit)| {
                let outcome = outcomes.iter().find(|o| o.import_path() == import_path);
                let status = match outcome {
                    Some(o) if o.passed() => UnitStatus::Passed {
                        duration_ms: o.duration_ms().unwrap_or_default(),
                    },
                    Some(o) => UnitStatus::Failed {
                        duration_ms: o.duration_ms(),
                    },
                    None if unit.should_run => UnitStatus::Missing,
                    None => UnitStatus::Cached,
                };
                ReportEntry {
                    import_path: import_path.clone(),
                    status,
                }
            })
            .collect();
        Self { entries }
    }

    /// The `n` longest executed units, longest first. Ties keep import path order.
    pub fn slowest(&self, n: usize) -> Vec<&ReportEntry> {
        let mut executed: Vec<&ReportEntry> =
            self.entries.iter().filter(|e| e.executed_ms().is_some()).collect();
        executed.sort_by_key(|e| std::cmp::Reverse(e.executed_ms().unwrap_or(0)));
        executed.truncate(n);
        executed
    }

    pub fn count(&self, pred: impl Fn(&UnitStatus) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(&e.status)).count()
    }

    pub fn log(&self) {
        for entry in &self.entries {
            info!("{}", entry.line());
        }

        let slowest = self.slowest(SLOWEST_COUNT);
        if !slowest.is_empty() {
            let lines: Vec<String> = slowest
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    format!(
                        "{}. {} {}",
                        i + 1,
                        e.import_path,
                        format_duration(e.executed_ms().unwrap_or(0))
                    )
                })
                .collect();
            info!("Top {} slowest tests:\n{}", slowest.len(), lines.join("\n"));
        }

        info!(
            passed = self.count(|s| matches!(s, UnitStatus::Passed { .. })),
            failed = self.count(|s| matches!(s, UnitStatus::Failed { .. })),
            cached = self.count(|s| matches!(s, UnitStatus::Cached)),
            "run summary"
        );
    }
}

/// `XminYsec`, truncated to whole seconds.
pub fn format_duration(duration_ms: u64) -> String {
    let secs = duration_ms / 1000;
    format!("{}min{}sec", secs / 60, secs % 60)
}
