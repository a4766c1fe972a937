use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single stage (cohort, batch or core) of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkUnitStatus {
    Init,
    InProgress,
    Skipped,
    Finished,
    Failed,
    TempFailed,
}

impl WorkUnitStatus {
    /// Done from the orchestration point of view: nothing left to run.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            WorkUnitStatus::Finished | WorkUnitStatus::Skipped | WorkUnitStatus::Failed
        )
    }

    pub fn is_terminal_success(self) -> bool {
        matches!(self, WorkUnitStatus::Finished | WorkUnitStatus::Skipped)
    }

    pub fn is_terminal_failure(self) -> bool {
        self == WorkUnitStatus::Failed
    }

    /// Statuses a crash can leave behind that must be rerolled before work resumes.
    pub fn should_reroll_to_init(self) -> bool {
        matches!(self, WorkUnitStatus::InProgress | WorkUnitStatus::TempFailed)
    }
}

impl fmt::Display for WorkUnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnitStatus::Init => write!(f, "INIT"),
            WorkUnitStatus::InProgress => write!(f, "IN_PROGRESS"),
            WorkUnitStatus::Skipped => write!(f, "SKIPPED"),
            WorkUnitStatus::Finished => write!(f, "FINISHED"),
            WorkUnitStatus::Failed => write!(f, "FAILED"),
            WorkUnitStatus::TempFailed => write!(f, "TEMP_FAILED"),
        }
    }
}

/// Status, timestamps and retry counter of one stage.
///
/// Pure value: every transition returns a new state. The retry ceiling is not
/// stored here, callers pass it to [`WorkUnitState::reroll_from_temp_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnitState {
    pub status: WorkUnitStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl WorkUnitState {
    pub fn init_now() -> Self {
        Self {
            status: WorkUnitStatus::Init,
            started_at: Utc::now(),
            finished_at: None,
            retry_count: 0,
        }
    }

    pub fn start_now(&self) -> Self {
        Self {
            status: WorkUnitStatus::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            retry_count: self.retry_count,
        }
    }

    /// Finishes with a terminal-success status (`Finished` or `Skipped`).
    pub fn finish_now(&self, terminal: WorkUnitStatus) -> Self {
        Self {
            status: terminal,
            finished_at: Some(Utc::now()),
            ..*self
        }
    }

    pub fn skip(&self) -> Self {
        self.finish_now(WorkUnitStatus::Skipped)
    }

    /// Back to `Init` without consuming a retry attempt.
    pub fn reset_to_init(&self) -> Self {
        Self {
            status: WorkUnitStatus::Init,
            started_at: Utc::now(),
            finished_at: None,
            retry_count: self.retry_count,
        }
    }

    /// Marks the stage failed. The retry counter is left alone: an attempt is
    /// only consumed by [`WorkUnitState::reroll_from_temp_failed`].
    pub fn on_failure(&self, retryable: bool) -> Self {
        let status = if retryable {
            WorkUnitStatus::TempFailed
        } else {
            WorkUnitStatus::Failed
        };
        Self { status, ..*self }
    }

    /// Consumes one retry attempt of a `TempFailed` stage.
    ///
    /// Yields `Init` while the incremented counter stays below `max_retries`,
    /// `Failed` once it reaches the ceiling. Any other status is returned as is.
    pub fn reroll_from_temp_failed(&self, max_retries: u32) -> Self {
        if self.status != WorkUnitStatus::TempFailed {
            return *self;
        }

        let retry_count = self.retry_count + 1;
        if retry_count >= max_retries {
            return Self {
                status: WorkUnitStatus::Failed,
                retry_count,
                ..*self
            };
        }

        Self {
            status: WorkUnitStatus::Init,
            started_at: Utc::now(),
            finished_at: None,
            retry_count,
        }
    }
}
