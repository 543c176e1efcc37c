use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QualityViolation {
    pub check: String,
    pub column: String,
    pub value: Option<String>,
}

impl QualityViolation {
    pub fn new(check: &str, column: &str, value: Option<String>) -> Self {
        Self {
            check: check.to_string(),
            column: column.to_string(),
            value,
        }
    }
}

impl fmt::Display for QualityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) failed for value {}",
            self.check,
            self.column,
            self.value.as_deref().unwrap_or("<null>")
        )
    }
}

/// Failures a pipeline run surfaces to the operator. None of them are retried.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    #[error("upstream `{source_name}` is unavailable: {detail}")]
    UpstreamUnavailable { source_name: String, detail: String },
    #[error("data quality check failed for {} row(s):\n{}", .violations.len(), render_violations(.violations))]
    DataQualityViolation { violations: Vec<QualityViolation> },
}

impl PipelineError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn upstream(source_name: &str, detail: impl fmt::Display) -> Self {
        Self::UpstreamUnavailable {
            source_name: source_name.to_string(),
            detail: detail.to_string(),
        }
    }
}

fn render_violations(violations: &[QualityViolation]) -> String {
    violations
        .iter()
        .map(|violation| format!("  - {violation}"))
        .collect::<Vec<_>>()
        .join("\n")
}
