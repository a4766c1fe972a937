//! Executable units of work handed out by job selection.
//!
//! A unit is transient: it carries the job snapshot it was selected from and
//! reports its outcome back through [`JobPersistence`]. Failures of the stage
//! itself are recorded on the job; only failures of that recording escape
//! [`WorkUnit::execute`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::persistence::JobPersistence;
use crate::state_machine::{BatchResult, BatchSelection, CoreInfo, CoreResult, Job};

/// Resolves the patient ids of a cohort definition.
#[async_trait]
pub trait CohortQueryService: Send + Sync {
    async fn run_cohort_query(&self, crtdl: &Value) -> Result<Vec<String>, JobError>;
}

/// The extraction pipeline: per-batch processing and the final core stage.
#[async_trait]
pub trait ExtractService: Send + Sync {
    async fn process_batch(&self, selection: BatchSelection) -> Result<BatchResult, JobError>;

    async fn process_core(&self, job: &Job, core_info: CoreInfo) -> Result<CoreResult, JobError>;
}

/// Collaborators available to every unit.
#[derive(Clone)]
pub struct JobExecutionContext {
    pub persistence: Arc<dyn JobPersistence>,
    pub extract: Arc<dyn ExtractService>,
    pub cohort_query: Arc<dyn CohortQueryService>,
}

impl JobExecutionContext {
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        extract: Arc<dyn ExtractService>,
        cohort_query: Arc<dyn CohortQueryService>,
    ) -> Self {
        Self {
            persistence,
            extract,
            cohort_query,
        }
    }

    /// Runs a blocking persistence call off the async worker threads.
    pub async fn with_persistence<T, F>(&self, f: F) -> Result<T, JobError>
    where
        F: FnOnce(&dyn JobPersistence) -> Result<T, JobError> + Send + 'static,
        T: Send + 'static,
    {
        let persistence = Arc::clone(&self.persistence);
        tokio::task::spawn_blocking(move || f(persistence.as_ref())).await?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnitKind {
    Cohort,
    Batch,
    Core,
}

impl fmt::Display for WorkUnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkUnitKind::Cohort => write!(f, "cohort"),
            WorkUnitKind::Batch => write!(f, "batch"),
            WorkUnitKind::Core => write!(f, "core"),
        }
    }
}

/// How an execution ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The unit ran; its result or failure has been recorded.
    Done,
    /// Another worker already claimed the unit, so nothing ran.
    ClaimLost,
}

#[derive(Debug, Clone)]
pub enum WorkUnit {
    Cohort(ProcessCohortWorkUnit),
    Batch(ProcessBatchWorkUnit),
    Core(ProcessCoreWorkUnit),
}

impl WorkUnit {
    pub fn job(&self) -> &Job {
        match self {
            WorkUnit::Cohort(unit) => &unit.job,
            WorkUnit::Batch(unit) => &unit.job,
            WorkUnit::Core(unit) => &unit.job,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job().id
    }

    pub fn kind(&self) -> WorkUnitKind {
        match self {
            WorkUnit::Cohort(_) => WorkUnitKind::Cohort,
            WorkUnit::Batch(_) => WorkUnitKind::Batch,
            WorkUnit::Core(_) => WorkUnitKind::Core,
        }
    }

    pub async fn execute(&self, ctx: &JobExecutionContext) -> Result<UnitOutcome, JobError> {
        match self {
            WorkUnit::Cohort(unit) => unit.execute(ctx).await,
            WorkUnit::Batch(unit) => unit.execute(ctx).await,
            WorkUnit::Core(unit) => unit.execute(ctx).await,
        }
    }
}

/// Resolves the cohort and partitions it into batches.
#[derive(Debug, Clone)]
pub struct ProcessCohortWorkUnit {
    pub job: Job,
}

impl ProcessCohortWorkUnit {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    /// Explicit patient ids in the job parameters take the place of the cohort
    /// query.
    pub async fn execute(&self, ctx: &JobExecutionContext) -> Result<UnitOutcome, JobError> {
        let job_id = self.job.id;
        tracing::debug!(%job_id, "Resolving cohort");

        if let Err(cause) = self.resolve(ctx).await {
            tracing::warn!(%job_id, error = %cause, "Cohort stage failed");
            ctx.with_persistence(move |p| p.on_cohort_error(job_id, Vec::new(), &cause))
                .await?;
        }
        Ok(UnitOutcome::Done)
    }

    async fn resolve(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        let job_id = self.job.id;
        let ids = if self.job.parameters.param_batch.is_empty() {
            ctx.cohort_query
                .run_cohort_query(&self.job.parameters.crtdl)
                .await?
        } else {
            self.job.parameters.param_batch.clone()
        };

        tracing::info!(%job_id, cohort_size = ids.len(), "Cohort resolved");
        ctx.with_persistence(move |p| p.on_cohort_success(job_id, ids))
            .await
    }
}

/// Extracts one patient batch.
#[derive(Debug, Clone)]
pub struct ProcessBatchWorkUnit {
    pub job: Job,
    pub batch_id: Uuid,
}

impl ProcessBatchWorkUnit {
    pub fn new(job: Job, batch_id: Uuid) -> Self {
        Self { job, batch_id }
    }

    /// Claims the batch first; a unit whose batch was claimed by another
    /// worker finishes without doing anything.
    pub async fn execute(&self, ctx: &JobExecutionContext) -> Result<UnitOutcome, JobError> {
        let (job_id, batch_id) = (self.job.id, self.batch_id);

        let claimed = ctx
            .with_persistence(move |p| p.try_start_batch(job_id, batch_id))
            .await?;
        if !claimed {
            tracing::debug!(%job_id, %batch_id, "Batch already claimed");
            return Ok(UnitOutcome::ClaimLost);
        }

        let selection = ctx
            .with_persistence(move |p| {
                let job = p.get_job(job_id).ok_or(JobError::JobNotFound(job_id))?;
                let batch = p.load_batch(job_id, batch_id)?;
                Ok(BatchSelection { job, batch })
            })
            .await?;

        let patients = selection.batch.len();
        let result = match ctx.extract.process_batch(selection).await {
            Ok(result) => result,
            Err(cause) => {
                tracing::warn!(%job_id, %batch_id, error = %cause, "Batch processing failed");
                ctx.with_persistence(move |p| p.on_batch_error(job_id, batch_id, Vec::new(), &cause))
                    .await?;
                return Ok(UnitOutcome::Done);
            }
        };

        tracing::info!(%job_id, %batch_id, patients, "Batch processed");
        ctx.with_persistence(move |p| p.on_batch_processing_success(result))
            .await?;
        Ok(UnitOutcome::Done)
    }
}

/// Runs the core stage once every batch is done.
#[derive(Debug, Clone)]
pub struct ProcessCoreWorkUnit {
    pub job: Job,
}

impl ProcessCoreWorkUnit {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub async fn execute(&self, ctx: &JobExecutionContext) -> Result<UnitOutcome, JobError> {
        let job_id = self.job.id;

        if let Err(cause) = self.process(ctx).await {
            tracing::warn!(%job_id, error = %cause, "Core stage failed");
            ctx.with_persistence(move |p| p.on_core_error(job_id, Vec::new(), &cause))
                .await?;
        }
        Ok(UnitOutcome::Done)
    }

    async fn process(&self, ctx: &JobExecutionContext) -> Result<(), JobError> {
        let job_id = self.job.id;
        let core_info = ctx
            .with_persistence(move |p| p.load_core_info(job_id))
            .await?;
        let result = ctx.extract.process_core(&self.job, core_info).await?;
        tracing::info!(%job_id, status = %result.status, "Core processed");
        ctx.with_persistence(move |p| p.on_core_success(result))
            .await
    }
}
