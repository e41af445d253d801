use std::path::PathBuf;

use anyhow::Result;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::state::{self, StateManager};

/// Precondition violations raised before any unit of work is processed.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("entry points file not found: {0}")]
    MissingEntryPoints(PathBuf),
    #[error("stage {stage} results not found at {path}; run stage {stage} first")]
    MissingStageOutput { stage: u8, path: PathBuf },
}

/// Per-stage run summary. `halted` means the stage's loop stopped on a
/// unit-hard-failure; everything up to that unit is flushed and checkpointed,
/// so re-invoking the stage resumes where it stopped.
#[derive(Debug, Default)]
pub struct StageStats {
    pub processed: usize,
    pub recovered: usize,
    pub halted: bool,
}

impl StageStats {
    pub fn log_summary(&self, stage: &str) {
        if self.halted {
            warn!(
                "{}: halted after {} units ({} recovered); re-run to resume",
                stage, self.processed, self.recovered
            );
        } else {
            info!(
                "{}: completed {} units ({} recovered)",
                stage, self.processed, self.recovered
            );
        }
    }
}

/// How a single row finished: `Recovered` marks a soft-failed extraction
/// whose default stand-in was merged instead.
pub enum RowOutcome {
    Done,
    Recovered,
}

/// Row loop shared by stages 2 and 3: resume at the checkpointed `row_index`,
/// process rows strictly in order, advance the cursor only after `step` has
/// merged and flushed, and halt the stage (without propagating) on the first
/// unit-hard-failure.
pub fn drive_rows<F>(
    state_mgr: &StateManager,
    stage: &str,
    total: usize,
    mut step: F,
) -> StageStats
where
    F: FnMut(usize) -> Result<RowOutcome>,
{
    let cursor = state_mgr.stage(stage);
    let start = state::offset(&cursor, "row_index");
    let mut stats = StageStats::default();

    for row in start..total {
        match step(row) {
            Ok(outcome) => {
                if matches!(outcome, RowOutcome::Recovered) {
                    stats.recovered += 1;
                }
                if let Err(err) = state_mgr.update(stage, &[("row_index", row as u64 + 1)]) {
                    error!("Failed to checkpoint {} at row {}: {:#}", stage, row, err);
                    stats.halted = true;
                    break;
                }
                stats.processed += 1;
            }
            Err(err) => {
                error!("{} halted at row {}: {:#}", stage, row, err);
                stats.halted = true;
                break;
            }
        }
    }
    stats
}
