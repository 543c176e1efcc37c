use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{PipelineError, QualityViolation};
use crate::model::{EditRecord, WindowActivity, format_wiki_timestamp};

pub const CHECK_UNIQUE: &str = "unique";
pub const CHECK_NOT_NULL: &str = "not_null";

pub fn check_window_activity(rows: &[WindowActivity]) -> Vec<QualityViolation> {
    let mut violations = duplicate_values("window_start", rows.iter().map(|row| row.window_start));
    violations.extend(duplicate_values(
        "window_end",
        rows.iter().map(|row| row.window_end),
    ));
    violations
}

pub fn check_staged_timestamps(edits: &[EditRecord]) -> Vec<QualityViolation> {
    edits
        .iter()
        .filter(|edit| edit.timestamp.is_none())
        .map(|edit| {
            QualityViolation::new(
                CHECK_NOT_NULL,
                "timestamp",
                Some(format!("title={}", edit.title)),
            )
        })
        .collect()
}

pub fn ensure_clean(violations: Vec<QualityViolation>) -> Result<(), PipelineError> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::DataQualityViolation { violations })
    }
}

fn duplicate_values<I>(column: &str, values: I) -> Vec<QualityViolation>
where
    I: Iterator<Item = DateTime<Utc>>,
{
    let mut counts = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0usize) += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(value, _)| {
            QualityViolation::new(CHECK_UNIQUE, column, Some(format_wiki_timestamp(&value)))
        })
        .collect()
}
