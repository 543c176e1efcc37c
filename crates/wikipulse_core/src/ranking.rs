use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::model::{EditRecord, SlidingWindow, WindowActivity, format_wiki_timestamp};

/// Counts edits and distinct editors per window and orders the result by
/// activity.
///
/// Every window yields exactly one row, including windows without edits.
/// Rows are ordered by `changes_count` descending; ties fall back to
/// `window_start` then `window_end` ascending. Edits without a timestamp
/// never match a window.
pub fn rank_windows(windows: &[SlidingWindow], edits: &[EditRecord]) -> Vec<WindowActivity> {
    let mut timeline = edits
        .iter()
        .filter_map(|edit| edit.timestamp.map(|timestamp| (timestamp, edit.user.as_deref())))
        .collect::<Vec<(DateTime<Utc>, Option<&str>)>>();
    timeline.sort_by_key(|(timestamp, _)| *timestamp);

    let mut ranked = windows
        .iter()
        .map(|window| {
            let first = timeline.partition_point(|(timestamp, _)| *timestamp < window.window_start);
            let last = timeline.partition_point(|(timestamp, _)| *timestamp < window.window_end);
            let matched = &timeline[first..last.max(first)];
            let users = matched
                .iter()
                .filter_map(|(_, user)| *user)
                .collect::<HashSet<_>>();
            WindowActivity {
                window_start: window.window_start,
                window_end: window.window_end,
                changes_count: matched.len() as u64,
                unique_users: users.len() as u64,
            }
        })
        .collect::<Vec<_>>();

    ranked.sort_by(|left, right| {
        right
            .changes_count
            .cmp(&left.changes_count)
            .then_with(|| left.window_start.cmp(&right.window_start))
            .then_with(|| left.window_end.cmp(&right.window_end))
    });
    ranked
}

/// SHA-256 over the canonical text rendering of ranked rows, in order.
pub fn output_digest(rows: &[WindowActivity]) -> String {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(
            format!(
                "{}|{}|{}|{}\n",
                format_wiki_timestamp(&row.window_start),
                format_wiki_timestamp(&row.window_end),
                row.changes_count,
                row.unique_users
            )
            .as_bytes(),
        );
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone};

    use super::*;
    use crate::model::ChangeType;
    use crate::windows::{WINDOWS_PER_DAY, generate_windows};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 31, hour, minute, 0).unwrap()
    }

    fn edit(user: Option<&str>, timestamp: Option<DateTime<Utc>>) -> EditRecord {
        EditRecord {
            change_type: ChangeType::Edit,
            title: "Example".to_string(),
            user: user.map(str::to_string),
            user_id: None,
            timestamp,
            comment: String::new(),
        }
    }

    fn day_windows() -> Vec<SlidingWindow> {
        generate_windows(NaiveDate::from_ymd_opt(2024, 10, 31).unwrap()).expect("windows")
    }

    fn row_for(rows: &[WindowActivity], start: DateTime<Utc>) -> &WindowActivity {
        rows.iter()
            .find(|row| row.window_start == start)
            .expect("window row present")
    }

    #[test]
    fn counts_edits_and_distinct_users_in_window() {
        let edits = vec![
            edit(Some("A"), Some(at(10, 0))),
            edit(Some("B"), Some(at(10, 5))),
            edit(Some("A"), Some(at(10, 20))),
            edit(Some("C"), Some(at(9, 59))),
        ];
        let window = SlidingWindow {
            window_start: at(10, 0),
            window_end: at(10, 30),
        };
        let rows = rank_windows(&[window], &edits);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].changes_count, 3);
        assert_eq!(rows[0].unique_users, 2);
    }

    #[test]
    fn every_window_yields_a_row_even_without_edits() {
        let rows = rank_windows(&day_windows(), &[]);
        assert_eq!(rows.len(), WINDOWS_PER_DAY);
        assert!(rows.iter().all(|row| row.changes_count == 0 && row.unique_users == 0));
    }

    #[test]
    fn edits_land_in_both_overlapping_windows() {
        let rows = rank_windows(&day_windows(), &[edit(Some("A"), Some(at(10, 20)))]);
        assert_eq!(rows.len(), WINDOWS_PER_DAY);
        assert_eq!(row_for(&rows, at(10, 0)).changes_count, 1);
        assert_eq!(row_for(&rows, at(10, 15)).changes_count, 1);
        assert_eq!(row_for(&rows, at(10, 30)).changes_count, 0);
        assert_eq!(row_for(&rows, at(9, 45)).changes_count, 0);
    }

    #[test]
    fn window_end_is_exclusive() {
        let rows = rank_windows(&day_windows(), &[edit(Some("A"), Some(at(10, 30)))]);
        assert_eq!(row_for(&rows, at(10, 0)).changes_count, 0);
        assert_eq!(row_for(&rows, at(10, 15)).changes_count, 1);
        assert_eq!(row_for(&rows, at(10, 30)).changes_count, 1);
    }

    #[test]
    fn anonymous_and_timestampless_edits() {
        let edits = vec![
            edit(None, Some(at(10, 1))),
            edit(None, Some(at(10, 2))),
            edit(Some("A"), Some(at(10, 3))),
            edit(Some("A"), None),
        ];
        let window = SlidingWindow {
            window_start: at(10, 0),
            window_end: at(10, 30),
        };
        let rows = rank_windows(&[window], &edits);
        assert_eq!(rows[0].changes_count, 3);
        assert_eq!(rows[0].unique_users, 1);
    }

    #[test]
    fn rows_are_ordered_by_count_then_window_start() {
        let edits = vec![
            edit(Some("A"), Some(at(3, 5))),
            edit(Some("B"), Some(at(12, 50))),
            edit(Some("C"), Some(at(12, 55))),
            edit(Some("D"), Some(at(1, 1))),
        ];
        let rows = rank_windows(&day_windows(), &edits);
        for pair in rows.windows(2) {
            assert!(pair[0].changes_count >= pair[1].changes_count);
            if pair[0].changes_count == pair[1].changes_count {
                assert!(pair[0].window_start < pair[1].window_start);
            }
        }
        assert_eq!(rows[0].window_start, at(12, 30));
        assert_eq!(rows[0].changes_count, 2);
        assert_eq!(rows[1].window_start, at(12, 45));
        assert_eq!(rows[2].window_start, at(0, 45));
        assert_eq!(rows[2].changes_count, 1);
    }

    #[test]
    fn ranking_is_idempotent_regardless_of_input_order() {
        let mut edits = vec![
            edit(Some("A"), Some(at(10, 0))),
            edit(Some("B"), Some(at(10, 5))),
            edit(Some("A"), Some(at(10, 20))),
            edit(Some("C"), Some(at(18, 40))),
        ];
        let first = rank_windows(&day_windows(), &edits);
        let second = rank_windows(&day_windows(), &edits);
        assert_eq!(first, second);
        assert_eq!(output_digest(&first), output_digest(&second));

        edits.reverse();
        let reversed = rank_windows(&day_windows(), &edits);
        assert_eq!(first, reversed);
    }

    #[test]
    fn digest_changes_with_content() {
        let windows = day_windows();
        let empty = output_digest(&rank_windows(&windows, &[]));
        let busy = output_digest(&rank_windows(&windows, &[edit(Some("A"), Some(at(1, 0)))]));
        assert_eq!(empty.len(), 64);
        assert_ne!(empty, busy);
    }
}
