use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::state_machine::{Job, PatientBatch};

const JOB_FILE_NAME: &str = "job.json";
const BATCH_DIR_NAME: &str = "batches";
const CORE_DIR_NAME: &str = "core_batches";

/// On-disk layout of the results directory.
///
/// ```text
/// <base>/<job_id>/job.json
/// <base>/<job_id>/batches/<batch_id>.ndjson
/// <base>/<job_id>/core_batches/<batch_id>.json
/// ```
///
/// Every file is written to a `.tmp` sibling first and renamed into place, so
/// readers never see a partially written file.
#[derive(Debug, Clone)]
pub struct JobFiles {
    base_dir: PathBuf,
}

impl JobFiles {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn ensure_base_dir(&self) -> Result<(), JobError> {
        fs::create_dir_all(&self.base_dir)?;
        Ok(())
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.base_dir.join(job_id.to_string())
    }

    fn batch_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join(BATCH_DIR_NAME)
    }

    fn core_dir(&self, job_id: Uuid) -> PathBuf {
        self.job_dir(job_id).join(CORE_DIR_NAME)
    }

    pub fn ensure_job_dirs(&self, job_id: Uuid) -> Result<(), JobError> {
        fs::create_dir_all(self.batch_dir(job_id))?;
        fs::create_dir_all(self.core_dir(job_id))?;
        Ok(())
    }

    pub fn save_job(&self, job: &Job) -> Result<(), JobError> {
        self.ensure_job_dirs(job.id)?;
        let bytes = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.job_dir(job.id).join(JOB_FILE_NAME), &bytes)
    }

    pub fn load_job(&self, job_id: Uuid) -> Result<Job, JobError> {
        read_job(&self.job_dir(job_id))
    }

    /// Reads every `job.json` below the base directory. Directories without a
    /// readable job file are skipped.
    pub fn load_all_jobs(&self) -> Result<Vec<Job>, JobError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match read_job(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    tracing::warn!(dir = %path.display(), error = %e, "Skipping job directory");
                }
            }
        }
        Ok(jobs)
    }

    /// One patient id per line.
    pub fn save_batch(&self, job_id: Uuid, batch: &PatientBatch) -> Result<(), JobError> {
        self.ensure_job_dirs(job_id)?;
        let mut contents = String::new();
        for id in &batch.ids {
            contents.push_str(id);
            contents.push('\n');
        }
        let file = self
            .batch_dir(job_id)
            .join(format!("{}.ndjson", batch.batch_id));
        write_atomic(&file, contents.as_bytes())
    }

    pub fn load_batch(&self, job_id: Uuid, batch_id: Uuid) -> Result<PatientBatch, JobError> {
        let file = self.batch_dir(job_id).join(format!("{batch_id}.ndjson"));
        let contents = fs::read_to_string(&file).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Batch file missing or unreadable: {}: {e}", file.display()),
            )
        })?;
        let ids = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        Ok(PatientBatch::new(batch_id, ids))
    }

    pub fn save_core_part(&self, job_id: Uuid, batch_id: Uuid, part: &Value) -> Result<(), JobError> {
        self.ensure_job_dirs(job_id)?;
        let bytes = serde_json::to_vec(part)?;
        write_atomic(&self.core_dir(job_id).join(format!("{batch_id}.json")), &bytes)
    }

    /// All core parts of a job, ordered by batch id.
    pub fn load_core_parts(&self, job_id: Uuid) -> Result<Vec<Value>, JobError> {
        let dir = self.core_dir(job_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();

        files
            .iter()
            .map(|path| -> Result<Value, JobError> {
                let contents = fs::read(path)?;
                Ok(serde_json::from_slice(&contents)?)
            })
            .collect()
    }
}

fn read_job(dir: &Path) -> Result<Job, JobError> {
    let contents = fs::read(dir.join(JOB_FILE_NAME))?;
    Ok(serde_json::from_slice(&contents)?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), JobError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
