use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::batch::{BatchState, PatientBatch};
use super::issue::Issue;
use super::job::Job;
use super::work_unit_state::WorkUnitStatus;

/// Outcome of processing one batch.
///
/// `core_bundle` carries the batch's contribution to the core stage; it is
/// persisted before the batch is recorded as done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub job_id: Uuid,
    pub batch_id: Uuid,
    pub batch_state: BatchState,
    pub core_bundle: Option<Value>,
    pub issues: Vec<Issue>,
}

/// Outcome of the core stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreResult {
    pub job_id: Uuid,
    pub issues: Vec<Issue>,
    pub status: WorkUnitStatus,
}

/// Input of batch processing: the job snapshot and the patients to extract.
#[derive(Debug, Clone)]
pub struct BatchSelection {
    pub job: Job,
    pub batch: PatientBatch,
}

impl BatchSelection {
    pub fn batch_state(&self) -> Option<&BatchState> {
        self.job.batches.get(&self.batch.batch_id)
    }
}

/// Core parts collected from every finished batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreInfo {
    pub parts: Vec<Value>,
}
