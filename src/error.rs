use std::error::Error;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// HTTP client statuses that are worth retrying besides the whole 5xx range.
pub const RETRYABLE_CLIENT_STATUSES: &[u16] = &[404, 429];

#[derive(Debug, Error)]
pub enum JobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("transport failure: {0}")]
    Transport(TransportFailure),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Missing batch {batch_id} in job {job_id}")]
    MissingBatch { job_id: Uuid, batch_id: Uuid },

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("too many retryable failures ({failures}), escalating")]
    CircuitOpen {
        failures: u32,
        #[source]
        source: Box<JobError>,
    },

    #[error("{0}")]
    Other(String),
}

/// Low-level transport conditions reported by extraction collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    ConnectionReset,
    BrokenPipe,
    PrematureClose,
    ClosedChannel,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::ConnectionReset => write!(f, "connection reset"),
            TransportFailure::BrokenPipe => write!(f, "broken pipe"),
            TransportFailure::PrematureClose => write!(f, "premature close"),
            TransportFailure::ClosedChannel => write!(f, "closed channel"),
        }
    }
}

impl JobError {
    pub fn other(message: impl Into<String>) -> Self {
        JobError::Other(message.into())
    }
}

/// Whether an HTTP status signals a transient condition on the remote side.
pub fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status) || RETRYABLE_CLIENT_STATUSES.contains(&status)
}

/// Classifies a failure as retryable infrastructure trouble.
///
/// Every link of the `source()` chain is inspected; one retryable link is
/// enough. Everything else (validation, missing jobs, JSON, panics) is fatal
/// for the unit that raised it.
pub fn is_retryable(err: &(dyn Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if is_retryable_link(e) {
            return true;
        }
        current = e.source();
    }
    false
}

fn is_retryable_link(e: &(dyn Error + 'static)) -> bool {
    if e.is::<std::io::Error>() {
        return true;
    }
    if let Some(job_err) = e.downcast_ref::<JobError>() {
        return match job_err {
            JobError::Transport(_) => true,
            JobError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        };
    }
    if let Some(http) = e.downcast_ref::<reqwest::Error>() {
        if http.is_connect() || http.is_timeout() {
            return true;
        }
        return http
            .status()
            .is_some_and(|status| is_retryable_status(status.as_u16()));
    }
    false
}

/// Deepest error of the `source()` chain.
pub fn root_cause<'a>(err: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}

pub fn root_cause_message(err: &(dyn Error + 'static)) -> String {
    root_cause(err).to_string()
}
