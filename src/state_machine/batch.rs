use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work_unit_state::{WorkUnitState, WorkUnitStatus};

/// State of one patient batch of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: Uuid,
    pub state: WorkUnitState,
}

impl BatchState {
    pub fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            state: WorkUnitState::init_now(),
        }
    }

    pub fn status(&self) -> WorkUnitStatus {
        self.state.status
    }

    pub fn retry_count(&self) -> u32 {
        self.state.retry_count
    }

    fn with_state(&self, state: WorkUnitState) -> Self {
        Self {
            batch_id: self.batch_id,
            state,
        }
    }

    pub fn start_now(&self) -> Self {
        self.with_state(self.state.start_now())
    }

    pub fn finish_now(&self, terminal: WorkUnitStatus) -> Self {
        self.with_state(self.state.finish_now(terminal))
    }

    pub fn skip(&self) -> Self {
        self.with_state(self.state.skip())
    }

    pub fn reset_to_init(&self) -> Self {
        self.with_state(self.state.reset_to_init())
    }

    pub fn on_failure(&self, retryable: bool) -> Self {
        self.with_state(self.state.on_failure(retryable))
    }

    pub fn reroll_from_temp_failed(&self, max_retries: u32) -> Self {
        self.with_state(self.state.reroll_from_temp_failed(max_retries))
    }
}

/// The patient ids of one batch, persisted as `<batch_id>.ndjson`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientBatch {
    pub batch_id: Uuid,
    pub ids: Vec<String>,
}

impl PatientBatch {
    pub fn new(batch_id: Uuid, ids: Vec<String>) -> Self {
        Self { batch_id, ids }
    }

    /// Partitions a cohort into batches of at most `batch_size` ids, each with a
    /// fresh batch id. An empty cohort yields no batches.
    pub fn split(ids: &[String], batch_size: usize) -> Vec<PatientBatch> {
        ids.chunks(batch_size.max(1))
            .map(|chunk| PatientBatch::new(Uuid::new_v4(), chunk.to_vec()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
