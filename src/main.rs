use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use extraction_jobs::cli::{Cli, Command};
use extraction_jobs::config::ExtractionConfig;
use extraction_jobs::flare::{DisabledCohortQuery, FlareClient};
use extraction_jobs::persistence::{JobFiles, JobPersistence, JobStore};
use extraction_jobs::scheduler::JobScheduler;
use extraction_jobs::simulation::DryRunExtract;
use extraction_jobs::state_machine::{Job, JobPriority};
use extraction_jobs::ui;
use extraction_jobs::work_unit::{CohortQueryService, JobExecutionContext};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = ExtractionConfig::load(cli.config.as_deref())?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    match cli.command {
        Command::Submit {
            crtdl,
            patients,
            high_priority,
        } => submit(&config, &crtdl, patients, high_priority),
        Command::Status { job_id } => status(&config, job_id),
        Command::Resume { job_id } => resume(&config, job_id),
        Command::Run { until_idle } => run(&config, until_idle).await,
        Command::Demo {
            patients,
            batch_size,
        } => demo(config, patients, batch_size).await,
    }
}

// RUST_LOG wins over --verbose.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(config: &ExtractionConfig) -> Result<JobStore> {
    JobStore::from_config(config)
        .with_context(|| format!("failed to open results dir {}", config.results_dir.display()))
}

fn submit(config: &ExtractionConfig, path: &Path, patients: Vec<String>, high_priority: bool) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read CRTDL {}", path.display()))?;
    let crtdl: Value = serde_json::from_str(&contents)
        .with_context(|| format!("CRTDL {} is not valid JSON", path.display()))?;
    if patients.is_empty() && crtdl.get("cohortDefinition").is_none() {
        bail!("CRTDL has no cohortDefinition and no --patient ids were given");
    }

    let priority = if high_priority {
        JobPriority::High
    } else {
        JobPriority::Normal
    };
    let store = open_store(config)?;
    let job_id = store.create_job(crtdl, patients, priority)?;
    println!("{job_id}");
    Ok(())
}

// Reads job files directly: listing never reconciles or rewrites jobs.
fn status(config: &ExtractionConfig, job_id: Option<Uuid>) -> Result<()> {
    let files = JobFiles::new(&config.results_dir);
    match job_id {
        Some(job_id) => {
            let job = files
                .load_job(job_id)
                .with_context(|| format!("job {job_id} not found"))?;
            ui::print_job_detail(&job);
        }
        None => {
            let mut jobs = files.load_all_jobs()?;
            jobs.sort_by_key(|job| job.started_at);
            ui::print_job_table(&jobs);
        }
    }
    Ok(())
}

fn resume(config: &ExtractionConfig, job_id: Uuid) -> Result<()> {
    let store = open_store(config)?;
    let Some(job) = store.resume_job(job_id)? else {
        bail!("job {job_id} not found");
    };
    ui::print_job_detail(&job);
    Ok(())
}

fn cohort_query(config: &ExtractionConfig) -> Result<Arc<dyn CohortQueryService>> {
    match &config.flare_url {
        Some(url) => {
            tracing::info!(%url, "Using FLARE for cohort queries");
            Ok(Arc::new(FlareClient::new(url.as_str())?))
        }
        None => {
            tracing::warn!("No FLARE url configured; only jobs with explicit patients can run");
            Ok(Arc::new(DisabledCohortQuery))
        }
    }
}

async fn run(config: &ExtractionConfig, until_idle: bool) -> Result<()> {
    let store = Arc::new(open_store(config)?);
    let ctx = JobExecutionContext::new(
        store.clone(),
        Arc::new(DryRunExtract::default()),
        cohort_query(config)?,
    );

    let mut scheduler = JobScheduler::new(config, ctx);
    scheduler.start();

    let check_every = config.idle_poll().max(Duration::from_millis(100));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Interrupted, shutting down");
                break;
            }
            _ = tokio::time::sleep(check_every) => {
                if until_idle && store.is_idle() {
                    tracing::info!("No work left, shutting down");
                    break;
                }
            }
        }
    }

    scheduler.shutdown().await;
    ui::print_job_table(&store.list_jobs());
    Ok(())
}

fn demo_crtdl() -> Value {
    json!({
        "version": "http://json-schema.org/to-be-done/schema#",
        "display": "Demo extraction",
        "cohortDefinition": {
            "version": "http://to_be_decided.com/draft-1/schema#",
            "inclusionCriteria": [[{"termCodes": [{"code": "E11", "system": "http://fhir.de/CodeSystem/bfarm/icd-10-gm"}]}]]
        },
        "dataExtraction": {"attributeGroups": [{"id": "diagnoses", "groupReference": "Condition"}]}
    })
}

async fn demo(mut config: ExtractionConfig, patients: usize, batch_size: usize) -> Result<()> {
    config.results_dir = std::env::temp_dir().join(format!("extraction-demo-{}", Uuid::new_v4()));
    config.batch_size = batch_size;
    config.idle_poll_ms = 20;

    let store = Arc::new(open_store(&config)?);
    let patient_ids: Vec<String> = (0..patients).map(|i| format!("patient-{i:04}")).collect();
    let job_id = store.create_job(demo_crtdl(), patient_ids, JobPriority::Normal)?;
    println!(
        "Demo job {job_id}: {patients} patients in batches of {}, results in {}",
        config.batch_size.max(1),
        config.results_dir.display()
    );

    let ctx = JobExecutionContext::new(
        store.clone(),
        Arc::new(DryRunExtract::new(Duration::from_millis(150))),
        Arc::new(DisabledCohortQuery),
    );
    let mut scheduler = JobScheduler::new(&config, ctx);
    scheduler.start();

    let snapshot = |store: &JobStore| -> Result<Job> {
        store
            .get_job(job_id)
            .with_context(|| format!("demo job {job_id} disappeared"))
    };

    let progress = ui::BatchProgress::start(&snapshot(&store)?);
    let job = loop {
        let job = snapshot(&store)?;
        progress.update(&job);
        if job.status.is_final() {
            break job;
        }
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break snapshot(&store)?;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    };

    progress.finish(&job);
    scheduler.shutdown().await;
    ui::print_job_detail(&job);
    Ok(())
}
