//! Dry-run extractor used by `run` and `demo` when no FHIR pipeline is wired in.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::JobError;
use crate::state_machine::{
    BatchResult, BatchSelection, CoreInfo, CoreResult, Issue, Job, Severity, WorkUnitStatus,
};
use crate::work_unit::ExtractService;

/// Finishes every batch and the core stage, optionally after a fixed delay so
/// progress is visible.
#[derive(Debug, Clone, Default)]
pub struct DryRunExtract {
    delay: Duration,
}

impl DryRunExtract {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ExtractService for DryRunExtract {
    async fn process_batch(&self, selection: BatchSelection) -> Result<BatchResult, JobError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let batch_id = selection.batch.batch_id;
        let state = selection
            .batch_state()
            .copied()
            .map(|state| state.finish_now(WorkUnitStatus::Finished))
            .ok_or(JobError::MissingBatch {
                job_id: selection.job.id,
                batch_id,
            })?;

        Ok(BatchResult {
            job_id: selection.job.id,
            batch_id,
            batch_state: state,
            core_bundle: Some(json!({
                "batch_id": batch_id,
                "patients": selection.batch.len(),
            })),
            issues: vec![Issue::simple(
                Severity::Info,
                format!("Dry run: {} patients in batch {batch_id}", selection.batch.len()),
            )],
        })
    }

    async fn process_core(&self, job: &Job, core_info: CoreInfo) -> Result<CoreResult, JobError> {
        let patients: u64 = core_info
            .parts
            .iter()
            .filter_map(|part| part.get("patients").and_then(|n| n.as_u64()))
            .sum();

        Ok(CoreResult {
            job_id: job.id,
            issues: vec![Issue::simple(
                Severity::Info,
                format!(
                    "Dry run: core merged {} batch parts covering {patients} patients",
                    core_info.parts.len()
                ),
            )],
            status: WorkUnitStatus::Finished,
        })
    }
}
