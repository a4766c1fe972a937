use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::error::JobError;
use crate::work_unit::CohortQueryService;

const EXECUTE_COHORT_PATH: &str = "/query/execute-cohort";
const STRUCTURED_QUERY_CONTENT_TYPE: &str = "application/sq+json";

/// Resolves a CRTDL's cohort definition to patient ids via FLARE.
pub struct FlareClient {
    client: Client,
    base_url: String,
}

impl FlareClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, JobError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Server errors and 404/429 surface as retryable `HttpStatus` errors,
    /// other non-success statuses as non-retryable ones.
    pub async fn execute_cohort(&self, crtdl: &Value) -> Result<Vec<String>, JobError> {
        let definition = crtdl
            .get("cohortDefinition")
            .ok_or_else(|| JobError::other("CRTDL has no cohortDefinition"))?;
        let body = serde_json::to_string(definition)?;

        let response = self
            .client
            .post(format!("{}{EXECUTE_COHORT_PATH}", self.base_url))
            .header("content-type", STRUCTURED_QUERY_CONTENT_TYPE)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(JobError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        let ids = response.json::<Vec<String>>().await?;
        tracing::debug!(patients = ids.len(), "FLARE cohort resolved");
        Ok(ids)
    }
}

#[async_trait]
impl CohortQueryService for FlareClient {
    async fn run_cohort_query(&self, crtdl: &Value) -> Result<Vec<String>, JobError> {
        self.execute_cohort(crtdl).await
    }
}
