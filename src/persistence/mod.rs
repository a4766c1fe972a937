//! Persistence boundary between the scheduler, the work units and job storage.
//!
//! Implementations must make every operation atomic per job id: two workers
//! racing on the same job must observe one update after the other. Calls are
//! blocking; async callers go through `tokio::task::spawn_blocking`.

mod files;
mod store;

use uuid::Uuid;

use crate::error::JobError;
use crate::state_machine::{BatchResult, CoreInfo, CoreResult, Issue, Job, PatientBatch};
use crate::work_unit::WorkUnit;

pub use files::JobFiles;
pub use store::JobStore;

pub trait JobPersistence: Send + Sync {
    /// Selects the next unit of work across all jobs. Cohort and core units
    /// are claimed by the selection itself and handed out once. Batch units are
    /// not: the same batch may be selected repeatedly until one caller wins
    /// [`JobPersistence::try_start_batch`].
    fn select_next_work_unit(&self) -> Result<Option<WorkUnit>, JobError>;

    /// Claims a batch (`Init` -> `InProgress`). `false` means someone else did.
    fn try_start_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<bool, JobError>;

    fn get_job(&self, job_id: Uuid) -> Option<Job>;

    fn load_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<PatientBatch, JobError>;

    fn load_core_info(&self, job_id: Uuid) -> Result<CoreInfo, JobError>;

    fn on_cohort_success(&self, job_id: Uuid, patient_ids: Vec<String>) -> Result<(), JobError>;

    fn on_batch_processing_success(&self, result: BatchResult) -> Result<(), JobError>;

    fn on_core_success(&self, result: CoreResult) -> Result<(), JobError>;

    fn on_cohort_error(&self, job_id: Uuid, issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError>;

    fn on_batch_error(
        &self,
        job_id: Uuid,
        batch_id: Uuid,
        issues: Vec<Issue>,
        cause: &JobError,
    ) -> Result<(), JobError>;

    fn on_core_error(&self, job_id: Uuid, issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError>;

    fn on_job_error(&self, job_id: Uuid, issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError>;
}
