use chrono::{NaiveDate, TimeDelta};

use crate::error::PipelineError;
use crate::model::SlidingWindow;

pub const TARGET_DATE_FORMAT: &str = "%Y-%m-%d";
pub const WINDOW_WIDTH_MINUTES: i64 = 30;
pub const WINDOW_STRIDE_MINUTES: i64 = 15;
pub const WINDOWS_PER_DAY: usize = 96;

pub fn parse_target_date(value: &str) -> Result<NaiveDate, PipelineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::invalid_argument(
            "target date is empty (expected YYYY-MM-DD)",
        ));
    }
    NaiveDate::parse_from_str(trimmed, TARGET_DATE_FORMAT).map_err(|error| {
        PipelineError::invalid_argument(format!(
            "target date `{trimmed}` is not a valid YYYY-MM-DD date: {error}"
        ))
    })
}

/// Builds the fixed catalog of overlapping windows for one UTC day.
///
/// Window `i` starts at midnight plus `i` strides and spans one width, so
/// consecutive windows share half of their range and the catalog reaches
/// 15 minutes past the end of the day.
pub fn generate_windows(target_date: NaiveDate) -> Result<Vec<SlidingWindow>, PipelineError> {
    let midnight = target_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| PipelineError::invalid_argument(format!("no midnight for {target_date}")))?
        .and_utc();
    let width = TimeDelta::minutes(WINDOW_WIDTH_MINUTES);
    let stride = TimeDelta::minutes(WINDOW_STRIDE_MINUTES);

    let mut windows = Vec::with_capacity(WINDOWS_PER_DAY);
    for index in 0..WINDOWS_PER_DAY {
        let offset = stride
            .checked_mul(index as i32)
            .ok_or_else(|| out_of_range(target_date))?;
        let window_start = midnight
            .checked_add_signed(offset)
            .ok_or_else(|| out_of_range(target_date))?;
        let window_end = window_start
            .checked_add_signed(width)
            .ok_or_else(|| out_of_range(target_date))?;
        windows.push(SlidingWindow {
            window_start,
            window_end,
        });
    }
    Ok(windows)
}

fn out_of_range(target_date: NaiveDate) -> PipelineError {
    PipelineError::invalid_argument(format!(
        "windows for {target_date} fall outside the representable time range"
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn date(value: &str) -> NaiveDate {
        parse_target_date(value).expect("valid date")
    }

    #[test]
    fn parse_target_date_accepts_iso_dates() {
        assert_eq!(
            date(" 2024-10-31 "),
            NaiveDate::from_ymd_opt(2024, 10, 31).unwrap()
        );
    }

    #[test]
    fn parse_target_date_rejects_malformed_input() {
        for input in ["", "   ", "2024-13-01", "2024-02-30", "31/10/2024", "yesterday"] {
            let error = parse_target_date(input).expect_err("must fail");
            assert!(
                matches!(error, PipelineError::InvalidArgument { .. }),
                "unexpected error for {input:?}: {error}"
            );
        }
    }

    #[test]
    fn generates_ninety_six_windows_from_midnight() {
        let windows = generate_windows(date("2024-10-31")).expect("windows");
        assert_eq!(windows.len(), WINDOWS_PER_DAY);
        assert_eq!(
            windows[0].window_start,
            Utc.with_ymd_and_hms(2024, 10, 31, 0, 0, 0).unwrap()
        );
        assert_eq!(
            windows[0].window_end,
            Utc.with_ymd_and_hms(2024, 10, 31, 0, 30, 0).unwrap()
        );
        let last = windows.last().expect("last window");
        assert_eq!(
            last.window_start,
            Utc.with_ymd_and_hms(2024, 10, 31, 23, 45, 0).unwrap()
        );
        assert_eq!(
            last.window_end,
            Utc.with_ymd_and_hms(2024, 11, 1, 0, 15, 0).unwrap()
        );
    }

    #[test]
    fn window_width_and_stride_hold_for_every_window() {
        for value in ["2024-10-31", "2024-02-29", "2023-12-31", "1970-01-01"] {
            let windows = generate_windows(date(value)).expect("windows");
            for window in &windows {
                assert_eq!(
                    window.window_end - window.window_start,
                    TimeDelta::minutes(30)
                );
            }
            for pair in windows.windows(2) {
                assert_eq!(
                    pair[1].window_start - pair[0].window_start,
                    TimeDelta::minutes(15)
                );
            }
        }
    }

    #[test]
    fn window_bounds_are_unique() {
        let windows = generate_windows(date("2024-10-31")).expect("windows");
        let starts = windows
            .iter()
            .map(|window| window.window_start)
            .collect::<BTreeSet<_>>();
        let ends = windows
            .iter()
            .map(|window| window.window_end)
            .collect::<BTreeSet<_>>();
        assert_eq!(starts.len(), WINDOWS_PER_DAY);
        assert_eq!(ends.len(), WINDOWS_PER_DAY);
    }

    #[test]
    fn last_representable_day_is_invalid() {
        let error = generate_windows(NaiveDate::MAX).expect_err("must overflow");
        assert!(matches!(error, PipelineError::InvalidArgument { .. }));
    }
}
