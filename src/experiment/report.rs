//! Run report: an ordered record of every phase entered and every cell outcome.
//!
//! The report is the persisted trace of a campaign. It is written as JSON next
//! to the data files when the run ends, whether it finished, was cancelled, or
//! had cells aborted along the way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::error::AppResult;
use crate::experiment::acquisition::TaskStatus;
use crate::experiment::phases::Phase;

/// One phase entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    /// Channel being worked on; `None` for terminal phases
    pub channel: Option<u8>,
    /// Cell temperature; `None` outside a cell
    pub temperature_c: Option<f64>,
    /// Phase entered
    pub phase: Phase,
    /// Wall-clock entry time
    pub at: DateTime<Utc>,
}

/// How a matrix cell ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CellOutcome {
    /// All phases ran. Acquisition status is informational.
    Completed {
        /// Potentiostat task
        measurement: TaskStatus,
        /// Recorder task
        recording: TaskStatus,
    },
    /// A device or convergence failure stopped the cell.
    Aborted {
        /// Phase the failure happened in
        phase: Phase,
        /// Rendered error
        reason: String,
    },
}

/// Outcome of one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Electrolyte channel
    pub channel: u8,
    /// Target temperature
    pub temperature_c: f64,
    /// How it ended
    pub outcome: CellOutcome,
}

/// Full trace of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Campaign name from configuration
    pub name: String,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end, set once shutdown has been attempted
    pub finished_at: Option<DateTime<Utc>>,
    /// Every phase entered, in order
    pub phases: Vec<PhaseRecord>,
    /// Every cell attempted, in order
    pub cells: Vec<CellRecord>,
    /// Whether the matrix was interrupted
    pub cancelled: bool,
    /// Fault that stopped the matrix early, if any
    pub fault: Option<String>,
    /// Error from the shutdown path, if any
    pub shutdown_error: Option<String>,
}

impl RunReport {
    /// Start an empty report.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            name: name.into(),
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            cells: Vec::new(),
            cancelled: false,
            fault: None,
            shutdown_error: None,
        }
    }

    /// Record entry into `phase`.
    pub fn enter(&mut self, phase: Phase, channel: Option<u8>, temperature_c: Option<f64>) {
        self.phases.push(PhaseRecord {
            channel,
            temperature_c,
            phase,
            at: Utc::now(),
        });
    }

    /// Last phase entered.
    pub fn last_phase(&self) -> Option<Phase> {
        self.phases.last().map(|r| r.phase)
    }

    /// How many times `phase` was entered.
    pub fn count(&self, phase: Phase) -> usize {
        self.phases.iter().filter(|r| r.phase == phase).count()
    }

    /// Phase sequence entered while working on `channel`.
    pub fn phases_for(&self, channel: u8) -> Vec<Phase> {
        self.phases
            .iter()
            .filter(|r| r.channel == Some(channel))
            .map(|r| r.phase)
            .collect()
    }

    /// Cells that ran to completion.
    pub fn completed_cells(&self) -> usize {
        self.cells
            .iter()
            .filter(|c| matches!(c.outcome, CellOutcome::Completed { .. }))
            .count()
    }

    /// Write the report as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> AppResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
