//! Test doubles shared by the work unit and scheduler tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{JobError, is_retryable};
use crate::persistence::JobPersistence;
use crate::state_machine::{
    BatchResult, BatchSelection, BatchState, CoreInfo, CoreResult, Issue, Job, PatientBatch,
    WorkUnitStatus,
};
use crate::work_unit::{CohortQueryService, ExtractService, JobExecutionContext, WorkUnit};

/// Recorded persistence call. Error reports carry the retryability of their
/// cause.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    TryStartBatch(Uuid, Uuid),
    LoadBatch(Uuid, Uuid),
    LoadCoreInfo(Uuid),
    CohortSuccess(Uuid, Vec<String>),
    BatchSuccess(Uuid, Uuid, WorkUnitStatus),
    CoreSuccess(Uuid),
    CohortError(Uuid, bool),
    BatchError(Uuid, Uuid, bool),
    CoreError(Uuid, bool),
    JobError(Uuid, bool),
}

#[derive(Default)]
pub(crate) struct MockPersistence {
    calls: Mutex<Vec<Call>>,
    selections: AtomicUsize,
    script: Mutex<VecDeque<Result<Option<WorkUnit>, JobError>>>,
    refuse_claims: bool,
    job: Option<Job>,
    batch: Option<PatientBatch>,
    fail_core_info: bool,
    report_failure: Option<fn() -> JobError>,
    job_error_failure: Option<fn() -> JobError>,
}

impl MockPersistence {
    /// Answers for successive `select_next_work_unit` calls; `Ok(None)` once
    /// exhausted.
    pub fn with_selections(self, selections: Vec<Result<Option<WorkUnit>, JobError>>) -> Self {
        *self.script.lock().unwrap() = selections.into();
        self
    }

    pub fn with_claim(mut self, claimed: bool) -> Self {
        self.refuse_claims = !claimed;
        self
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }

    pub fn with_batch(mut self, batch: PatientBatch) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn failing_core_info(mut self) -> Self {
        self.fail_core_info = true;
        self
    }

    /// Cohort, batch and core error reports fail with `f()` after recording.
    pub fn failing_error_reports(mut self, f: fn() -> JobError) -> Self {
        self.report_failure = Some(f);
        self
    }

    pub fn failing_job_error_reports(mut self, f: fn() -> JobError) -> Self {
        self.job_error_failure = Some(f);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn selections(&self) -> usize {
        self.selections.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn report(&self, call: Call) -> Result<(), JobError> {
        self.record(call);
        match self.report_failure {
            Some(f) => Err(f()),
            None => Ok(()),
        }
    }
}

impl JobPersistence for MockPersistence {
    fn select_next_work_unit(&self) -> Result<Option<WorkUnit>, JobError> {
        self.selections.fetch_add(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    fn try_start_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<bool, JobError> {
        self.record(Call::TryStartBatch(job_id, batch_id));
        Ok(!self.refuse_claims)
    }

    fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.job.clone().filter(|job| job.id == job_id)
    }

    fn load_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<PatientBatch, JobError> {
        self.record(Call::LoadBatch(job_id, batch_id));
        self.batch
            .clone()
            .ok_or_else(|| JobError::other("no batch configured"))
    }

    fn load_core_info(&self, job_id: Uuid) -> Result<CoreInfo, JobError> {
        self.record(Call::LoadCoreInfo(job_id));
        if self.fail_core_info {
            return Err(io::Error::other("core parts unreadable").into());
        }
        Ok(CoreInfo::default())
    }

    fn on_cohort_success(&self, job_id: Uuid, patient_ids: Vec<String>) -> Result<(), JobError> {
        self.record(Call::CohortSuccess(job_id, patient_ids));
        Ok(())
    }

    fn on_batch_processing_success(&self, result: BatchResult) -> Result<(), JobError> {
        self.record(Call::BatchSuccess(
            result.job_id,
            result.batch_id,
            result.batch_state.status(),
        ));
        Ok(())
    }

    fn on_core_success(&self, result: CoreResult) -> Result<(), JobError> {
        self.record(Call::CoreSuccess(result.job_id));
        Ok(())
    }

    fn on_cohort_error(&self, job_id: Uuid, _issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError> {
        self.report(Call::CohortError(job_id, is_retryable(cause)))
    }

    fn on_batch_error(
        &self,
        job_id: Uuid,
        batch_id: Uuid,
        _issues: Vec<Issue>,
        cause: &JobError,
    ) -> Result<(), JobError> {
        self.report(Call::BatchError(job_id, batch_id, is_retryable(cause)))
    }

    fn on_core_error(&self, job_id: Uuid, _issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError> {
        self.report(Call::CoreError(job_id, is_retryable(cause)))
    }

    fn on_job_error(&self, job_id: Uuid, _issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError> {
        self.record(Call::JobError(job_id, is_retryable(cause)));
        match self.job_error_failure {
            Some(f) => Err(f()),
            None => Ok(()),
        }
    }
}

pub(crate) struct StubCohortQuery {
    result: Result<Vec<String>, fn() -> JobError>,
    calls: AtomicUsize,
}

impl StubCohortQuery {
    pub fn ok(ids: Vec<String>) -> Self {
        Self {
            result: Ok(ids),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(f: fn() -> JobError) -> Self {
        Self {
            result: Err(f),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CohortQueryService for StubCohortQuery {
    async fn run_cohort_query(&self, _crtdl: &Value) -> Result<Vec<String>, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(ids) => Ok(ids.clone()),
            Err(f) => Err(f()),
        }
    }
}

/// Succeeds unless told otherwise; batch results are `Finished` without a
/// core bundle.
#[derive(Default)]
pub(crate) struct StubExtract {
    batch_calls: AtomicUsize,
    core_calls: AtomicUsize,
    batch_failure: Option<fn() -> JobError>,
    core_failure: Option<fn() -> JobError>,
    delay: Option<Duration>,
}

impl StubExtract {
    pub fn failing_batches(mut self, f: fn() -> JobError) -> Self {
        self.batch_failure = Some(f);
        self
    }

    pub fn failing_core(mut self, f: fn() -> JobError) -> Self {
        self.core_failure = Some(f);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn core_calls(&self) -> usize {
        self.core_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractService for StubExtract {
    async fn process_batch(&self, selection: BatchSelection) -> Result<BatchResult, JobError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(f) = self.batch_failure {
            return Err(f());
        }

        let batch_id = selection.batch.batch_id;
        let state = selection
            .batch_state()
            .copied()
            .unwrap_or_else(|| BatchState::new(batch_id));
        Ok(BatchResult {
            job_id: selection.job.id,
            batch_id,
            batch_state: state.start_now().finish_now(WorkUnitStatus::Finished),
            core_bundle: None,
            issues: Vec::new(),
        })
    }

    async fn process_core(&self, job: &Job, _core_info: CoreInfo) -> Result<CoreResult, JobError> {
        self.core_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(f) = self.core_failure {
            return Err(f());
        }
        Ok(CoreResult {
            job_id: job.id,
            issues: Vec::new(),
            status: WorkUnitStatus::Finished,
        })
    }
}

pub(crate) fn context(
    persistence: Arc<MockPersistence>,
    extract: Arc<StubExtract>,
    cohort_query: Arc<StubCohortQuery>,
) -> JobExecutionContext {
    JobExecutionContext::new(persistence, extract, cohort_query)
}
