//! FLARE cohort query client.

mod client;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::JobError;
use crate::work_unit::CohortQueryService;

pub use client::FlareClient;

/// Stand-in when no FLARE url is configured: only jobs with explicit patient
/// ids can run, every other cohort query fails the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledCohortQuery;

#[async_trait]
impl CohortQueryService for DisabledCohortQuery {
    async fn run_cohort_query(&self, _crtdl: &Value) -> Result<Vec<String>, JobError> {
        Err(JobError::other(
            "No FLARE url configured; submit the job with explicit patient ids",
        ))
    }
}
