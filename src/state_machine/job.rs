use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::batch::BatchState;
use super::issue::{Issue, Severity};
use super::results::{BatchResult, CoreResult};
use super::work_unit_state::{WorkUnitState, WorkUnitStatus};
use crate::error::{JobError, is_retryable};
use crate::work_unit::{ProcessBatchWorkUnit, ProcessCohortWorkUnit, ProcessCoreWorkUnit, WorkUnit};

/// Overall stage of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    RunningGetCohort,
    RunningProcessBatch,
    RunningProcessCore,
    Paused,
    Failed,
    Completed,
    Cancelled,
    TempFailed,
}

impl JobStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::RunningGetCohort => "RUNNING_GET_COHORT",
            JobStatus::RunningProcessBatch => "RUNNING_PROCESS_BATCH",
            JobStatus::RunningProcessCore => "RUNNING_PROCESS_CORE",
            JobStatus::Paused => "PAUSED",
            JobStatus::Failed => "FAILED",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::TempFailed => "TEMP_FAILED",
        };
        write!(f, "{name}")
    }
}

/// Scheduling priority; `High` jobs are selected before `Normal` ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    #[default]
    Normal,
    High,
}

impl JobPriority {
    pub fn value(self) -> i32 {
        match self {
            JobPriority::Normal => 0,
            JobPriority::High => 1,
        }
    }

    pub fn from_value(value: i32) -> Result<Self, JobError> {
        match value {
            0 => Ok(JobPriority::Normal),
            1 => Ok(JobPriority::High),
            other => Err(JobError::other(format!("Unknown job priority: {other}"))),
        }
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPriority::Normal => write!(f, "NORMAL"),
            JobPriority::High => write!(f, "HIGH"),
        }
    }
}

/// Run parameters, opaque to orchestration.
///
/// `crtdl` is the extraction definition; a non-empty `param_batch` replaces the
/// cohort query with an explicit list of patient ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameters {
    pub crtdl: Value,
    #[serde(default)]
    pub param_batch: Vec<String>,
}

/// Durable state of one extraction run.
///
/// A `Job` is a snapshot: every transition returns a new value and leaves the
/// receiver untouched. Swapping the stored snapshot atomically is the job of
/// the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub cohort_state: WorkUnitState,
    pub cohort_size: usize,
    pub batches: BTreeMap<Uuid, BatchState>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub issues: Vec<Issue>,
    pub parameters: JobParameters,
    #[serde(default)]
    pub priority: JobPriority,
    pub core_state: WorkUnitState,
}

impl Job {
    pub fn create_initial_job(crtdl: Value, patient_ids: Vec<String>, job_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: job_id,
            status: JobStatus::Pending,
            cohort_state: WorkUnitState::init_now(),
            cohort_size: 0,
            batches: BTreeMap::new(),
            started_at: now,
            updated_at: now,
            finished_at: None,
            issues: Vec::new(),
            parameters: JobParameters {
                crtdl,
                param_batch: patient_ids,
            },
            priority: JobPriority::Normal,
            core_state: WorkUnitState::init_now(),
        }
    }

    // ---- happy path ----

    /// Finishes the cohort stage and installs the batches.
    ///
    /// Without any batch there is nothing to wait for, so the job moves straight
    /// to the core stage.
    pub fn on_batches_created(
        &self,
        initial_states: BTreeMap<Uuid, BatchState>,
        cohort_size: usize,
    ) -> Job {
        let updated = Job {
            cohort_state: self.cohort_state.finish_now(WorkUnitStatus::Finished),
            cohort_size,
            batches: initial_states,
            updated_at: Utc::now(),
            ..self.clone()
        };

        if updated.batches.is_empty() {
            return updated
                .with_status(JobStatus::RunningProcessCore)
                .with_core_state(WorkUnitState::init_now())
                .with_issues_added(&[Issue::new(
                    Severity::Warning,
                    "Empty cohort",
                    "Cohort size = 0. Skipping patient batches and continuing with core processing.",
                )]);
        }
        updated.with_status(JobStatus::RunningProcessBatch)
    }

    /// A report arriving after the job reached a final status only adds its
    /// issues; the stage never moves again.
    pub fn on_batch_processing_success(&self, result: &BatchResult) -> Job {
        if self.status.is_final() {
            return self.with_issues_added(&result.issues);
        }

        let updated = self
            .with_batch_state(result.batch_state)
            .with_issues_added(&result.issues);

        if all_batches_done(&updated.batches) {
            return updated
                .with_status(JobStatus::RunningProcessCore)
                .with_core_state(WorkUnitState::init_now());
        }
        updated
    }

    pub fn on_core_success(&self, result: &CoreResult) -> Job {
        if self.status.is_final() {
            return self.with_issues_added(&result.issues);
        }
        self.with_status(JobStatus::Completed)
            .with_issues_added(&result.issues)
            .with_core_state(self.core_state.finish_now(result.status))
    }

    // ---- error path ----

    pub fn on_cohort_error(&self, cause: &JobError, issues: &[Issue]) -> Job {
        let retryable = is_retryable(cause);
        self.with_cohort_state(self.cohort_state.on_failure(retryable))
            .with_issues_added(issues)
            .with_status(failure_status(retryable))
    }

    /// Records a batch failure. An unknown batch id fails the job with a
    /// diagnostic instead of panicking.
    pub fn on_batch_error(&self, batch_id: Uuid, cause: &JobError, issues: &[Issue]) -> Job {
        let updated = self.with_issues_added(issues);

        let Some(batch) = updated.batches.get(&batch_id).copied() else {
            let issue = Issue::from_error(
                Severity::Error,
                format!("Missing batch {batch_id} in job {}", self.id),
                cause,
            );
            return updated
                .with_issues_added(&[issue])
                .with_status(JobStatus::Failed);
        };

        let retryable = is_retryable(cause);
        updated
            .with_batch_state(batch.on_failure(retryable))
            .with_status(failure_status(retryable))
    }

    pub fn on_core_error(&self, cause: &JobError, issues: &[Issue]) -> Job {
        let retryable = is_retryable(cause);
        let generated = Issue::from_error(
            issue_severity(retryable),
            format!("CoreState failed: {cause}"),
            cause,
        );

        self.with_core_state(self.core_state.on_failure(retryable))
            .with_issues_added(&Issue::merge(issues, &[generated]))
            .with_status(failure_status(retryable))
    }

    /// Failures outside a work unit proper, e.g. persisting a result.
    pub fn on_job_error(&self, cause: &JobError, issues: &[Issue]) -> Job {
        let retryable = is_retryable(cause);
        let generated = Issue::from_error(
            issue_severity(retryable),
            format!("Infrastructure/persistence error: {cause}"),
            cause,
        );

        self.with_issues_added(&Issue::merge(issues, &[generated]))
            .with_status(failure_status(retryable))
    }

    // ---- selection ----

    /// First batch still waiting to be claimed, in batch id order.
    pub fn next_batch(&self) -> Option<Uuid> {
        self.batches
            .values()
            .find(|batch| batch.status() == WorkUnitStatus::Init)
            .map(|batch| batch.batch_id)
    }

    /// Emits at most one unit of work. The unit carries the staged job snapshot
    /// the caller must store to claim it.
    pub fn select_next_work_unit(&self) -> Option<WorkUnit> {
        match self.status {
            JobStatus::Pending => Some(WorkUnit::Cohort(ProcessCohortWorkUnit::new(
                self.with_cohort_state(WorkUnitState::init_now())
                    .with_status(JobStatus::RunningGetCohort),
            ))),
            JobStatus::RunningProcessBatch => self.next_batch().map(|batch_id| {
                WorkUnit::Batch(ProcessBatchWorkUnit::new(self.clone(), batch_id))
            }),
            JobStatus::RunningProcessCore if self.core_state.status == WorkUnitStatus::Init => {
                Some(WorkUnit::Core(ProcessCoreWorkUnit::new(
                    self.with_core_state(self.core_state.start_now()),
                )))
            }
            _ => None,
        }
    }

    // ---- recovery ----

    /// Repairs state left unstable by a crash or a transient failure.
    ///
    /// Substates are repaired first (`TempFailed` consumes a retry, other
    /// unstable statuses go back to `Init`), then the job-level stage is
    /// derived from them. Calling it on an already repaired job is a no-op.
    pub fn rollback(&self, max_retries: u32) -> Job {
        if self.status.is_final() {
            return self.clone();
        }

        if self.has_terminal_failure() {
            return self.with_status(JobStatus::Failed);
        }

        let mut updated = self.clone();

        if let Some(state) = reroll_substate(&updated.cohort_state, max_retries) {
            updated = updated.with_cohort_state(state);
        }
        if let Some(state) = reroll_substate(&updated.core_state, max_retries) {
            updated = updated.with_core_state(state);
        }
        for batch in self.batches.values() {
            if let Some(state) = reroll_substate(&batch.state, max_retries) {
                updated = updated.with_batch_state(BatchState {
                    batch_id: batch.batch_id,
                    state,
                });
            }
        }

        if let Some(failed) = updated.fail_if_retries_exhausted() {
            return failed;
        }

        match updated.status {
            JobStatus::RunningGetCohort => updated.with_status(JobStatus::Pending),
            JobStatus::TempFailed => {
                let inferred = updated.infer_runnable_status();
                updated.with_status(inferred)
            }
            _ => updated,
        }
    }

    fn has_terminal_failure(&self) -> bool {
        self.cohort_state.status.is_terminal_failure()
            || self.core_state.status.is_terminal_failure()
            || self
                .batches
                .values()
                .any(|batch| batch.status().is_terminal_failure())
    }

    fn fail_if_retries_exhausted(&self) -> Option<Job> {
        let mut exhausted = Vec::new();
        if self.cohort_state.status.is_terminal_failure() {
            exhausted.push("cohort".to_string());
        }
        if self.core_state.status.is_terminal_failure() {
            exhausted.push("core".to_string());
        }
        for batch in self.batches.values() {
            if batch.status().is_terminal_failure() {
                exhausted.push(format!("batch {}", batch.batch_id));
            }
        }

        if exhausted.is_empty() {
            return None;
        }

        let issue = Issue::simple(
            Severity::Error,
            format!("Retries exhausted after reroll: {}", exhausted.join(", ")),
        );
        Some(
            self.with_issues_added(&[issue])
                .with_status(JobStatus::Failed),
        )
    }

    // Order: cohort -> batches -> core.
    fn infer_runnable_status(&self) -> JobStatus {
        if self.has_terminal_failure() {
            return JobStatus::Failed;
        }
        if !self.cohort_state.status.is_done() {
            return JobStatus::Pending;
        }
        if self.batches.values().any(|batch| !batch.status().is_done()) {
            return JobStatus::RunningProcessBatch;
        }
        if !self.core_state.status.is_done() {
            return JobStatus::RunningProcessCore;
        }
        JobStatus::Completed
    }

    // ---- progress ----

    /// Percentage of batches that are done; 0 before batches exist.
    pub fn calculate_batch_progress(&self) -> f64 {
        if self.batches.is_empty() {
            return 0.0;
        }
        let done = self
            .batches
            .values()
            .filter(|batch| batch.status().is_done())
            .count();
        done as f64 / self.batches.len() as f64 * 100.0
    }

    // ---- withers ----

    pub fn with_status(&self, status: JobStatus) -> Job {
        let now = Utc::now();
        Job {
            status,
            updated_at: now,
            finished_at: if status.is_final() {
                Some(now)
            } else {
                self.finished_at
            },
            ..self.clone()
        }
    }

    pub fn with_batch_state(&self, batch: BatchState) -> Job {
        let mut batches = self.batches.clone();
        batches.insert(batch.batch_id, batch);
        Job {
            batches,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_cohort_state(&self, cohort_state: WorkUnitState) -> Job {
        Job {
            cohort_state,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_core_state(&self, core_state: WorkUnitState) -> Job {
        Job {
            core_state,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_issues_added(&self, issues: &[Issue]) -> Job {
        if issues.is_empty() {
            return self.clone();
        }
        Job {
            issues: Issue::merge(&self.issues, issues),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn with_priority(&self, priority: JobPriority) -> Job {
        Job {
            priority,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }
}

fn all_batches_done(batches: &BTreeMap<Uuid, BatchState>) -> bool {
    batches
        .values()
        .all(|batch| batch.status().is_terminal_success())
}

fn failure_status(retryable: bool) -> JobStatus {
    if retryable {
        JobStatus::TempFailed
    } else {
        JobStatus::Failed
    }
}

fn issue_severity(retryable: bool) -> Severity {
    if retryable {
        Severity::Warning
    } else {
        Severity::Error
    }
}

// None when the substate is stable and must be left as is.
fn reroll_substate(state: &WorkUnitState, max_retries: u32) -> Option<WorkUnitState> {
    match state.status {
        WorkUnitStatus::TempFailed => Some(state.reroll_from_temp_failed(max_retries)),
        status if status.should_reroll_to_init() => Some(state.reset_to_init()),
        _ => None,
    }
}
