use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{JobFiles, JobPersistence};
use crate::config::ExtractionConfig;
use crate::error::JobError;
use crate::state_machine::{
    BatchResult, BatchState, CoreInfo, CoreResult, Issue, Job, JobPriority, JobStatus, PatientBatch,
    WorkUnitStatus,
};
use crate::work_unit::WorkUnit;

/// File-backed job store with an in-memory registry.
///
/// The registry is the source of truth while the process runs; every change
/// is written through to `job.json` before it becomes visible. Updates of one
/// job are serialized by the map entry lock, updates of different jobs run in
/// parallel.
pub struct JobStore {
    jobs: DashMap<Uuid, Job>,
    files: JobFiles,
    batch_size: usize,
    max_retries: u32,
}

impl JobStore {
    /// Opens the results directory and reconciles every non-final job with
    /// [`Job::rollback`], so work interrupted by a crash becomes claimable again.
    pub fn open(
        results_dir: impl Into<PathBuf>,
        batch_size: usize,
        max_retries: u32,
    ) -> Result<Self, JobError> {
        let files = JobFiles::new(results_dir);
        files.ensure_base_dir()?;

        let jobs = DashMap::new();
        for job in files.load_all_jobs()? {
            let reconciled = if job.status.is_final() {
                job.clone()
            } else {
                job.rollback(max_retries)
            };

            if reconciled != job {
                if let Err(e) = files.save_job(&reconciled) {
                    tracing::warn!(job_id = %job.id, error = %e, "Could not persist reconciled job, skipping");
                    continue;
                }
                tracing::info!(
                    job_id = %job.id,
                    from = %job.status,
                    to = %reconciled.status,
                    "Reconciled job"
                );
            }
            jobs.insert(reconciled.id, reconciled);
        }

        tracing::info!(
            dir = %files.base_dir().display(),
            jobs = jobs.len(),
            "Job store opened"
        );

        Ok(Self {
            jobs,
            files,
            batch_size: batch_size.max(1),
            max_retries,
        })
    }

    pub fn from_config(config: &ExtractionConfig) -> Result<Self, JobError> {
        Self::open(&config.results_dir, config.batch_size, config.max_retries)
    }

    pub fn files(&self) -> &JobFiles {
        &self.files
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Registers a new `Pending` job. Explicit patient ids bypass the cohort
    /// query.
    pub fn create_job(
        &self,
        crtdl: Value,
        patient_ids: Vec<String>,
        priority: JobPriority,
    ) -> Result<Uuid, JobError> {
        let job_id = Uuid::new_v4();
        let job = Job::create_initial_job(crtdl, patient_ids, job_id).with_priority(priority);

        self.files.save_job(&job)?;
        self.jobs.insert(job_id, job);
        tracing::info!(%job_id, %priority, "Job created");
        Ok(job_id)
    }

    /// Snapshot of every job, oldest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by_key(|job| job.started_at);
        jobs
    }

    /// `true` once nothing is running and nothing can be selected. Parked
    /// `TempFailed` jobs count as idle until resumed.
    pub fn is_idle(&self) -> bool {
        self.jobs.iter().all(|entry| {
            let job = entry.value();
            !has_running_work(job) && job.select_next_work_unit().is_none()
        })
    }

    /// Operator-triggered recovery: runs [`Job::rollback`] on a single job.
    pub fn resume_job(&self, job_id: Uuid) -> Result<Option<Job>, JobError> {
        let max_retries = self.max_retries;
        self.update_job(job_id, |job| {
            let resumed = job.rollback(max_retries);
            Ok((resumed.clone(), resumed))
        })
    }

    /// Applies `f` to the current job atomically and persists the outcome.
    ///
    /// An error from `f` is recorded on the job as a job error instead of being
    /// returned. An unchanged job is not written. When writing fails the
    /// failure is recorded in memory and returned. Unknown ids give `None`.
    fn update_job<T, F>(&self, job_id: Uuid, f: F) -> Result<Option<T>, JobError>
    where
        F: FnOnce(&Job) -> Result<(Job, T), JobError>,
    {
        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            tracing::warn!(%job_id, "Update for unknown job ignored");
            return Ok(None);
        };
        let current = entry.value().clone();

        let (updated, outcome) = match f(&current) {
            Ok((job, outcome)) => (job, Some(outcome)),
            Err(cause) => {
                tracing::warn!(%job_id, error = %cause, "Job update failed");
                (current.on_job_error(&cause, &[]), None)
            }
        };

        if updated == current {
            return Ok(outcome);
        }

        match self.files.save_job(&updated) {
            Ok(()) => {
                *entry = updated;
                Ok(outcome)
            }
            Err(cause) => {
                tracing::error!(%job_id, error = %cause, "Persisting job failed");
                *entry = current.on_job_error(&cause, &[]);
                Err(cause)
            }
        }
    }

    fn record_failure<F>(&self, job_id: Uuid, f: F) -> Result<(), JobError>
    where
        F: FnOnce(&Job) -> Job,
    {
        self.update_job(job_id, |job| Ok((f(job), ())))?;
        Ok(())
    }

    /// Candidates ordered by priority (HIGH first), then newest `started_at`.
    fn selection_order(&self) -> Vec<Uuid> {
        let mut candidates: Vec<(Uuid, JobPriority, DateTime<Utc>)> = self
            .jobs
            .iter()
            .filter(|entry| !entry.value().status.is_final())
            .map(|entry| {
                let job = entry.value();
                (job.id, job.priority, job.started_at)
            })
            .collect();

        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)));
        candidates.into_iter().map(|(id, _, _)| id).collect()
    }
}

fn has_running_work(job: &Job) -> bool {
    match job.status {
        JobStatus::RunningGetCohort => true,
        JobStatus::RunningProcessBatch => job
            .batches
            .values()
            .any(|batch| batch.status() == WorkUnitStatus::InProgress),
        JobStatus::RunningProcessCore => job.core_state.status == WorkUnitStatus::InProgress,
        _ => false,
    }
}

impl JobPersistence for JobStore {
    fn select_next_work_unit(&self) -> Result<Option<WorkUnit>, JobError> {
        for job_id in self.selection_order() {
            let selected = self.update_job(job_id, |job| match job.select_next_work_unit() {
                Some(unit) => Ok((unit.job().clone(), Some(unit))),
                None => Ok((job.clone(), None)),
            })?;

            if let Some(Some(unit)) = selected {
                tracing::debug!(%job_id, kind = %unit.kind(), "Work unit selected");
                return Ok(Some(unit));
            }
        }
        Ok(None)
    }

    /// Only jobs still in the batch stage hand out batches.
    fn try_start_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<bool, JobError> {
        let claimed = self.update_job(job_id, |job| {
            let batch = job
                .batches
                .get(&batch_id)
                .ok_or(JobError::MissingBatch { job_id, batch_id })?;

            if job.status != JobStatus::RunningProcessBatch || batch.status() != WorkUnitStatus::Init {
                return Ok((job.clone(), false));
            }
            Ok((job.with_batch_state(batch.start_now()), true))
        })?;
        Ok(claimed.unwrap_or(false))
    }

    fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.get(&job_id).map(|entry| entry.value().clone())
    }

    fn load_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<PatientBatch, JobError> {
        self.files.load_batch(job_id, batch_id)
    }

    fn load_core_info(&self, job_id: Uuid) -> Result<CoreInfo, JobError> {
        Ok(CoreInfo {
            parts: self.files.load_core_parts(job_id)?,
        })
    }

    fn on_cohort_success(&self, job_id: Uuid, patient_ids: Vec<String>) -> Result<(), JobError> {
        let batches = PatientBatch::split(&patient_ids, self.batch_size);
        let cohort_size = patient_ids.len();

        self.update_job(job_id, |job| {
            let mut states = BTreeMap::new();
            for batch in &batches {
                self.files.save_batch(job_id, batch)?;
                states.insert(batch.batch_id, BatchState::new(batch.batch_id));
            }
            Ok((job.on_batches_created(states, cohort_size), ()))
        })?;

        tracing::info!(%job_id, cohort_size, batches = batches.len(), "Batches created");
        Ok(())
    }

    fn on_batch_processing_success(&self, result: BatchResult) -> Result<(), JobError> {
        self.update_job(result.job_id, |job| {
            if let Some(bundle) = &result.core_bundle
                && !job.status.is_final()
            {
                self.files.save_core_part(result.job_id, result.batch_id, bundle)?;
            }
            Ok((job.on_batch_processing_success(&result), ()))
        })?;
        Ok(())
    }

    fn on_core_success(&self, result: CoreResult) -> Result<(), JobError> {
        self.update_job(result.job_id, |job| Ok((job.on_core_success(&result), ())))?;
        tracing::info!(job_id = %result.job_id, "Job completed");
        Ok(())
    }

    fn on_cohort_error(&self, job_id: Uuid, issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError> {
        self.record_failure(job_id, |job| job.on_cohort_error(cause, &issues))
    }

    fn on_batch_error(
        &self,
        job_id: Uuid,
        batch_id: Uuid,
        issues: Vec<Issue>,
        cause: &JobError,
    ) -> Result<(), JobError> {
        self.record_failure(job_id, |job| job.on_batch_error(batch_id, cause, &issues))
    }

    fn on_core_error(&self, job_id: Uuid, issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError> {
        self.record_failure(job_id, |job| job.on_core_error(cause, &issues))
    }

    fn on_job_error(&self, job_id: Uuid, issues: Vec<Issue>, cause: &JobError) -> Result<(), JobError> {
        self.record_failure(job_id, |job| job.on_job_error(cause, &issues))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportFailure;
    use crate::state_machine::Severity;
    use crate::work_unit::WorkUnitKind;
    use serde_json::json;
    use std::fs;
    use std::thread;
    use std::time::Duration;

    fn store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::open(dir.path(), 2, 3).unwrap();
        (dir, store)
    }

    fn crtdl() -> Value {
        json!({"cohortDefinition": {"inclusionCriteria": []}})
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("patient-{i}")).collect()
    }

    fn finished(result_job: &Job, batch_id: Uuid) -> BatchResult {
        let state = result_job.batches[&batch_id].start_now().finish_now(WorkUnitStatus::Finished);
        BatchResult {
            job_id: result_job.id,
            batch_id,
            batch_state: state,
            core_bundle: Some(json!({"batch_id": batch_id})),
            issues: Vec::new(),
        }
    }

    #[test]
    fn cohort_unit_is_claimed_once() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();

        let unit = store.select_next_work_unit().unwrap().unwrap();
        assert_eq!(unit.kind(), WorkUnitKind::Cohort);
        assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::RunningGetCohort);

        assert!(store.select_next_work_unit().unwrap().is_none());
    }

    #[test]
    fn full_lifecycle_reaches_completed() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        store.select_next_work_unit().unwrap();

        store.on_cohort_success(job_id, ids(3)).unwrap();
        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::RunningProcessBatch);
        assert_eq!(job.batches.len(), 2);
        assert_eq!(job.cohort_size, 3);

        let batch_ids: Vec<Uuid> = job.batches.keys().copied().collect();
        for batch_id in &batch_ids {
            assert!(store.try_start_batch(job_id, *batch_id).unwrap());
            let loaded = store.load_batch(job_id, *batch_id).unwrap();
            assert!(!loaded.is_empty());
            let job = store.get_job(job_id).unwrap();
            store.on_batch_processing_success(finished(&job, *batch_id)).unwrap();
        }

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::RunningProcessCore);
        assert_eq!(store.load_core_info(job_id).unwrap().parts.len(), 2);

        // Selecting the core unit claims it.
        let unit = store.select_next_work_unit().unwrap().unwrap();
        assert_eq!(unit.kind(), WorkUnitKind::Core);
        assert_eq!(
            store.get_job(job_id).unwrap().core_state.status,
            WorkUnitStatus::InProgress
        );
        assert!(store.select_next_work_unit().unwrap().is_none());

        store
            .on_core_success(CoreResult {
                job_id,
                issues: Vec::new(),
                status: WorkUnitStatus::Finished,
            })
            .unwrap();

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.finished_at.is_some());
        assert!(store.select_next_work_unit().unwrap().is_none());
        assert!(store.is_idle());
    }

    #[test]
    fn late_batch_success_does_not_revive_failed_job() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        store.select_next_work_unit().unwrap();
        store.on_cohort_success(job_id, ids(1)).unwrap();
        let batch_id = store.get_job(job_id).unwrap().next_batch().unwrap();
        assert!(store.try_start_batch(job_id, batch_id).unwrap());

        store
            .on_job_error(job_id, Vec::new(), &JobError::other("fatal"))
            .unwrap();
        let failed = store.get_job(job_id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        store.on_batch_processing_success(finished(&failed, batch_id)).unwrap();

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.finished_at, failed.finished_at);
        assert!(store.load_core_info(job_id).unwrap().parts.is_empty());
        assert!(store.select_next_work_unit().unwrap().is_none());
        assert_eq!(store.files().load_job(job_id).unwrap(), job);
    }

    #[test]
    fn batches_are_claimed_by_try_start_batch_not_selection() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        store.select_next_work_unit().unwrap();
        store.on_cohort_success(job_id, ids(1)).unwrap();

        let first = store.select_next_work_unit().unwrap().unwrap();
        let second = store.select_next_work_unit().unwrap().unwrap();
        let (WorkUnit::Batch(first), WorkUnit::Batch(second)) = (first, second) else {
            panic!("expected batch units");
        };
        assert_eq!(first.batch_id, second.batch_id);

        assert!(store.try_start_batch(job_id, first.batch_id).unwrap());
        assert!(!store.try_start_batch(job_id, second.batch_id).unwrap());
        assert!(store.select_next_work_unit().unwrap().is_none());
    }

    #[test]
    fn concurrent_claims_grant_a_batch_once() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        store.select_next_work_unit().unwrap();
        store.on_cohort_success(job_id, ids(2)).unwrap();
        let batch_id = store.get_job(job_id).unwrap().next_batch().unwrap();

        let granted = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| store.try_start_batch(job_id, batch_id).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|claimed| *claimed)
                .count()
        });

        assert_eq!(granted, 1);
    }

    #[test]
    fn high_priority_is_selected_first() {
        let (_dir, store) = store();
        let normal = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        thread::sleep(Duration::from_millis(2));
        let high = store.create_job(crtdl(), Vec::new(), JobPriority::High).unwrap();
        thread::sleep(Duration::from_millis(2));
        let newer_normal = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();

        let order: Vec<Uuid> = (0..3)
            .map(|_| store.select_next_work_unit().unwrap().unwrap().job_id())
            .collect();

        assert_eq!(order[0], high);
        // Same priority: the most recently started job goes first.
        assert_eq!(&order[1..], &[newer_normal, normal]);
    }

    #[test]
    fn reopen_rolls_back_interrupted_work() {
        let dir = tempfile::tempdir().unwrap();
        let job_id;
        {
            let store = JobStore::open(dir.path(), 2, 3).unwrap();
            job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
            store.select_next_work_unit().unwrap();
            assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::RunningGetCohort);
        }

        let reopened = JobStore::open(dir.path(), 2, 3).unwrap();
        assert_eq!(reopened.get_job(job_id).unwrap().status, JobStatus::Pending);
        assert_eq!(
            reopened.select_next_work_unit().unwrap().unwrap().kind(),
            WorkUnitKind::Cohort
        );
    }

    #[test]
    fn reopen_releases_claimed_batches() {
        let dir = tempfile::tempdir().unwrap();
        let (job_id, batch_id);
        {
            let store = JobStore::open(dir.path(), 5, 3).unwrap();
            job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
            store.select_next_work_unit().unwrap();
            store.on_cohort_success(job_id, ids(2)).unwrap();
            batch_id = store.get_job(job_id).unwrap().next_batch().unwrap();
            assert!(store.try_start_batch(job_id, batch_id).unwrap());
        }

        let reopened = JobStore::open(dir.path(), 5, 3).unwrap();
        let job = reopened.get_job(job_id).unwrap();
        assert_eq!(job.batches[&batch_id].status(), WorkUnitStatus::Init);
        assert!(reopened.try_start_batch(job_id, batch_id).unwrap());
    }

    #[test]
    fn transient_batch_failure_parks_job_until_resumed() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        store.select_next_work_unit().unwrap();
        store.on_cohort_success(job_id, ids(1)).unwrap();
        let batch_id = store.get_job(job_id).unwrap().next_batch().unwrap();
        store.try_start_batch(job_id, batch_id).unwrap();

        let cause = JobError::Transport(TransportFailure::ConnectionReset);
        store.on_batch_error(job_id, batch_id, Vec::new(), &cause).unwrap();

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::TempFailed);
        assert!(store.select_next_work_unit().unwrap().is_none());

        let resumed = store.resume_job(job_id).unwrap().unwrap();
        assert_eq!(resumed.status, JobStatus::RunningProcessBatch);
        assert_eq!(resumed.batches[&batch_id].status(), WorkUnitStatus::Init);
        assert_eq!(resumed.batches[&batch_id].retry_count(), 1);
        assert_eq!(store.files().load_job(job_id).unwrap(), resumed);
    }

    #[test]
    fn empty_cohort_goes_straight_to_core() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();
        store.select_next_work_unit().unwrap();
        store.on_cohort_success(job_id, Vec::new()).unwrap();

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::RunningProcessCore);
        assert!(job.issues.iter().any(|i| i.severity == Severity::Warning));
        assert_eq!(
            store.select_next_work_unit().unwrap().unwrap().kind(),
            WorkUnitKind::Core
        );
    }

    #[test]
    fn claiming_unknown_batch_fails_the_job() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();

        assert!(!store.try_start_batch(job_id, Uuid::new_v4()).unwrap());
        assert_eq!(store.get_job(job_id).unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn unknown_job_is_ignored() {
        let (_dir, store) = store();
        assert!(!store.try_start_batch(Uuid::new_v4(), Uuid::new_v4()).unwrap());
        assert!(store.resume_job(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_failure_is_recorded_in_memory_and_returned() {
        let (_dir, store) = store();
        let job_id = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();

        // A plain file where the job directory should be makes every write fail.
        let job_dir = store.files().job_dir(job_id);
        fs::remove_dir_all(&job_dir).unwrap();
        fs::write(&job_dir, "not a directory").unwrap();

        let err = store.select_next_work_unit().unwrap_err();
        assert!(matches!(err, JobError::Io(_)));

        let job = store.get_job(job_id).unwrap();
        assert_eq!(job.status, JobStatus::TempFailed);
        assert!(job
            .issues
            .iter()
            .any(|i| i.message.starts_with("Infrastructure/persistence error")));
    }

    #[test]
    fn list_jobs_is_oldest_first() {
        let (_dir, store) = store();
        let first = store.create_job(crtdl(), Vec::new(), JobPriority::High).unwrap();
        thread::sleep(Duration::from_millis(2));
        let second = store.create_job(crtdl(), Vec::new(), JobPriority::Normal).unwrap();

        let listed: Vec<Uuid> = store.list_jobs().iter().map(|job| job.id).collect();
        assert_eq!(listed, vec![first, second]);
    }
}
