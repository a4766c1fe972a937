use std::error::Error;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Success => write!(f, "SUCCESS"),
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Diagnostic attached to a job. Issues are only ever appended, never removed.
///
/// `diagnostics` holds an error summary, never a backtrace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub diagnostics: String,
}

impl Issue {
    pub fn new(severity: Severity, message: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn simple(severity: Severity, message: impl Into<String>) -> Self {
        Self::new(severity, message, "")
    }

    pub fn from_error(
        severity: Severity,
        message: impl Into<String>,
        err: &(dyn Error + 'static),
    ) -> Self {
        Self::new(severity, message, error_summary(err))
    }

    pub fn merge(a: &[Issue], b: &[Issue]) -> Vec<Issue> {
        a.iter().chain(b).cloned().collect()
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.diagnostics.is_empty() {
            write!(f, "[{}] {}", self.severity, self.message)
        } else {
            write!(f, "[{}] {} ({})", self.severity, self.message, self.diagnostics)
        }
    }
}

// "outer: inner: root", skipping links whose text the parent already repeats.
fn error_summary(err: &(dyn Error + 'static)) -> String {
    let mut summary = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if !summary.contains(&text) {
            summary.push_str(": ");
            summary.push_str(&text);
        }
        current = e.source();
    }
    summary
}
