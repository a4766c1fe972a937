//! Fixed pool of workers polling the persistence layer for work.
//!
//! Each worker selects one unit, runs it to completion and polls again, so at
//! most `max_concurrency` units are in flight. Failures of a unit are recorded
//! on its job; only failures to record them reach the worker loop, where a
//! non-retryable one (or too many retryable ones in a row) terminates the
//! process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::ExtractionConfig;
use crate::error::{JobError, is_retryable, root_cause_message};
use crate::work_unit::{JobExecutionContext, UnitOutcome, WorkUnit};

/// Called once a worker loop fails fatally.
pub type TerminateHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    pub max_consecutive_failures: u32,
    pub retry_sleep: Duration,
    pub idle_poll: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&ExtractionConfig> for SchedulerSettings {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            max_consecutive_failures: config.max_consecutive_failures,
            retry_sleep: config.retry_sleep(),
            idle_poll: config.idle_poll(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ExtractionConfig::default())
    }
}

pub struct JobScheduler {
    ctx: JobExecutionContext,
    settings: SchedulerSettings,
    terminate: TerminateHook,
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<Result<(), JobError>>,
}

impl JobScheduler {
    pub fn new(config: &ExtractionConfig, ctx: JobExecutionContext) -> Self {
        Self::with_settings(SchedulerSettings::from(config), ctx)
    }

    pub fn with_settings(settings: SchedulerSettings, ctx: JobExecutionContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            settings,
            terminate: Arc::new(|| std::process::exit(1)),
            shutdown_tx,
            workers: JoinSet::new(),
        }
    }

    /// Replaces process termination, e.g. in tests.
    pub fn with_terminate(mut self, terminate: TerminateHook) -> Self {
        self.terminate = terminate;
        self
    }

    /// Spawns the worker pool. Calling it on a running pool does nothing.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        self.shutdown_tx.send_replace(false);

        let workers = self.settings.max_concurrency.max(1);
        for id in 0..workers {
            let worker = Worker {
                id,
                ctx: self.ctx.clone(),
                settings: self.settings.clone(),
                terminate: Arc::clone(&self.terminate),
                shutdown: self.shutdown_tx.subscribe(),
            };
            self.workers.spawn(worker.run());
        }
        tracing::info!(workers, "Scheduler started");
    }

    /// Workers still running their loop.
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stops polling, lets in-flight units finish within `shutdown_timeout`
    /// and aborts whatever is left.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(error = %e, "Worker had already failed"),
                    Err(e) => tracing::warn!(error = %e, "Worker task panicked"),
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.workers.len(),
                "Shutdown timed out, aborting workers"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
        tracing::info!("Scheduler stopped");
    }
}

/// Runs a unit and records an escaping failure as a job error.
pub async fn execute_unit(ctx: &JobExecutionContext, unit: &WorkUnit) -> Result<UnitOutcome, JobError> {
    let job_id = unit.job_id();
    match unit.execute(ctx).await {
        Ok(outcome) => Ok(outcome),
        Err(cause) => {
            tracing::warn!(
                %job_id,
                kind = %unit.kind(),
                error = %cause,
                root_cause = %root_cause_message(&cause),
                "Work unit failed"
            );
            ctx.with_persistence(move |p| p.on_job_error(job_id, Vec::new(), &cause))
                .await?;
            Ok(UnitOutcome::Done)
        }
    }
}

enum Poll {
    Idle,
    Executed,
    // Lost a claim race: neither progress nor failure.
    Skipped,
}

struct Worker {
    id: usize,
    ctx: JobExecutionContext,
    settings: SchedulerSettings,
    terminate: TerminateHook,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) -> Result<(), JobError> {
        tracing::debug!(worker = self.id, "Worker started");
        match self.poll_loop().await {
            Ok(()) => {
                tracing::debug!(worker = self.id, "Worker stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(worker = self.id, error = %e, "FATAL WORKER LOOP FAILURE");
                (self.terminate)();
                Err(e)
            }
        }
    }

    async fn poll_loop(&mut self) -> Result<(), JobError> {
        let mut consecutive_failures = 0u32;

        while !self.stopping() {
            match self.poll_once().await {
                Ok(Poll::Executed) => consecutive_failures = 0,
                Ok(Poll::Skipped) => {}
                Ok(Poll::Idle) => self.pause(self.settings.idle_poll).await,
                Err(e) if is_retryable(&e) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        worker = self.id,
                        failures = consecutive_failures,
                        error = %e,
                        root_cause = %root_cause_message(&e),
                        "Retryable failure in worker loop"
                    );
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        return Err(JobError::CircuitOpen {
                            failures: consecutive_failures,
                            source: Box::new(e),
                        });
                    }
                    self.pause(self.settings.retry_sleep).await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn poll_once(&self) -> Result<Poll, JobError> {
        let selected = self
            .ctx
            .with_persistence(|p| p.select_next_work_unit())
            .await?;
        let Some(unit) = selected else {
            return Ok(Poll::Idle);
        };

        tracing::debug!(worker = self.id, job_id = %unit.job_id(), kind = %unit.kind(), "Executing work unit");
        match execute_unit(&self.ctx, &unit).await? {
            UnitOutcome::Done => Ok(Poll::Executed),
            UnitOutcome::ClaimLost => Ok(Poll::Skipped),
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    // Sleeps, waking early on shutdown.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            changed = self.shutdown.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }
}
