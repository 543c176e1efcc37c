use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info};

use crate::config::IngestSettings;
use crate::error::PipelineError;
use crate::ingest::{IngestReport, RecentChangesApi, ingest_day};
use crate::migrate::migrate_connection;
use crate::quality::{check_staged_timestamps, check_window_activity, ensure_clean};
use crate::ranking::{output_digest, rank_windows};
use crate::runtime::ResolvedPaths;
use crate::staging::stage_edits;
use crate::store::{
    EDITS_TABLE, load_edits, open_connection, record_run, replace_window_activity, run_record,
    table_exists, validate_window_activity,
};
use crate::windows::generate_windows;

#[derive(Debug, Clone, Serialize)]
pub struct TransformReport {
    pub target_date: String,
    pub edits_loaded: usize,
    pub edits_staged: usize,
    pub windows: usize,
    pub rows_written: usize,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ingest: IngestReport,
    pub transform: TransformReport,
}

/// Recomputes the ranked window relation for `target_date` from the current
/// edit table and overwrites the persisted result.
pub fn transform(paths: &ResolvedPaths, target_date: NaiveDate) -> Result<TransformReport> {
    let windows = generate_windows(target_date)?;
    let mut connection = open_upstream(paths)?;
    migrate_connection(&connection)?;

    let raw = load_edits(&mut connection).map_err(|error| {
        error!(error = %format!("{error:#}"), "failed to read edit table");
        PipelineError::upstream(EDITS_TABLE, format!("{error:#}"))
    })?;
    let edits_loaded = raw.len();
    let staged = stage_edits(raw);
    info!(%target_date, edits_loaded, edits_staged = staged.len(), "staged edits");

    let ranked = rank_windows(&windows, &staged);
    let mut violations = check_staged_timestamps(&staged);
    violations.extend(check_window_activity(&ranked));
    ensure_clean(violations)?;

    let rows_written = replace_window_activity(&mut connection, target_date, &ranked)?;
    ensure_clean(validate_window_activity(&connection)?)?;

    let digest = output_digest(&ranked);
    record_run(
        &connection,
        &run_record("transform", target_date, rows_written, Some(digest.clone())),
    )?;
    info!(%target_date, rows_written, %digest, "window activity materialized");

    Ok(TransformReport {
        target_date: target_date.to_string(),
        edits_loaded,
        edits_staged: staged.len(),
        windows: windows.len(),
        rows_written,
        digest,
    })
}

/// Ingest followed by transform for the same day.
pub fn run<A: RecentChangesApi>(
    paths: &ResolvedPaths,
    api: &mut A,
    target_date: NaiveDate,
    settings: &IngestSettings,
) -> Result<RunReport> {
    let ingest = ingest_day(paths, api, target_date, settings)?;
    let transform = transform(paths, target_date)?;
    Ok(RunReport { ingest, transform })
}

fn open_upstream(paths: &ResolvedPaths) -> Result<Connection, PipelineError> {
    if !paths.db_path.exists() {
        return Err(PipelineError::upstream(
            EDITS_TABLE,
            format!("database {} does not exist", paths.db_path.display()),
        ));
    }
    let connection = open_connection(&paths.db_path)
        .map_err(|error| PipelineError::upstream(EDITS_TABLE, format!("{error:#}")))?;
    match table_exists(&connection, EDITS_TABLE) {
        Ok(true) => Ok(connection),
        Ok(false) => Err(PipelineError::upstream(
            EDITS_TABLE,
            format!("table is missing from {}", paths.db_path.display()),
        )),
        Err(error) => Err(PipelineError::upstream(EDITS_TABLE, format!("{error:#}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::ingest::{RecentChangesPage, RecentChangesQuery};
    use crate::model::{ChangeType, EditRecord};
    use crate::runtime::tests::paths;
    use crate::store::{last_runs, load_window_activity, open_store, replace_edits};
    use crate::windows::WINDOWS_PER_DAY;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, 31).unwrap()
    }

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

    fn seed(paths: &ResolvedPaths, edits: &[EditRecord]) {
        let mut connection = open_store(paths).expect("open store");
        replace_edits(&mut connection, edits).expect("seed edits");
    }

    fn upstream_error(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::UpstreamUnavailable { .. })
        )
    }

    #[test]
    fn transform_materializes_every_window() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        seed(
            &paths,
            &[
                edit(Some("A"), Some(at(10, 0))),
                edit(Some("B"), Some(at(10, 5))),
                edit(Some("A"), Some(at(10, 20))),
                edit(Some("C"), Some(at(9, 59))),
                edit(Some("D"), None),
            ],
        );

        let report = transform(&paths, day()).expect("transform");
        assert_eq!(report.edits_loaded, 5);
        assert_eq!(report.edits_staged, 4);
        assert_eq!(report.windows, WINDOWS_PER_DAY);
        assert_eq!(report.rows_written, WINDOWS_PER_DAY);

        let connection = open_store(&paths).expect("open store");
        let stored = load_window_activity(&connection)
            .expect("load")
            .expect("materialized");
        assert_eq!(stored.len(), WINDOWS_PER_DAY);
        let ten = stored
            .iter()
            .find(|row| row.activity.window_start == at(10, 0))
            .expect("10:00 window");
        assert_eq!(ten.activity.changes_count, 3);
        assert_eq!(ten.activity.unique_users, 2);
        for pair in stored.windows(2) {
            assert!(pair[0].activity.changes_count >= pair[1].activity.changes_count);
        }
        assert!(stored
            .iter()
            .any(|row| row.activity.changes_count == 0 && row.activity.unique_users == 0));
    }

    #[test]
    fn transform_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        seed(
            &paths,
            &[
                edit(Some("A"), Some(at(3, 0))),
                edit(Some("B"), Some(at(17, 44))),
            ],
        );

        let first = transform(&paths, day()).expect("first");
        let second = transform(&paths, day()).expect("second");
        assert_eq!(first.digest, second.digest);

        let connection = open_store(&paths).expect("open store");
        let runs = last_runs(&connection, 2).expect("runs");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].digest, runs[1].digest);
        let stored = load_window_activity(&connection)
            .expect("load")
            .expect("materialized");
        assert_eq!(stored.len(), WINDOWS_PER_DAY);
    }

    #[test]
    fn transform_without_database_is_upstream_unavailable() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        let error = transform(&paths, day()).expect_err("must fail");
        assert!(upstream_error(&error));
        assert!(!paths.db_path.exists());
    }

    #[test]
    fn transform_without_edit_table_is_upstream_unavailable() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        std::fs::create_dir_all(&paths.data_dir).expect("data dir");
        let connection = open_connection(&paths.db_path).expect("open");
        connection
            .execute_batch("CREATE TABLE unrelated (id INTEGER)")
            .expect("create");
        drop(connection);

        let error = transform(&paths, day()).expect_err("must fail");
        assert!(upstream_error(&error));
    }

    #[test]
    fn unreadable_edit_rows_abort_before_publishing() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        seed(&paths, &[edit(Some("A"), Some(at(1, 0)))]);
        transform(&paths, day()).expect("clean run");

        let connection = open_store(&paths).expect("open store");
        connection
            .execute(
                "INSERT INTO wiki_edits (change_type, title, timestamp) VALUES ('edit', 'Broken', 'garbage')",
                [],
            )
            .expect("insert");
        drop(connection);

        let error = transform(&paths, day()).expect_err("must fail");
        assert!(upstream_error(&error));

        let connection = open_store(&paths).expect("open store");
        let stored = load_window_activity(&connection)
            .expect("load")
            .expect("materialized");
        assert_eq!(stored[0].activity.changes_count, 1);
        assert_eq!(last_runs(&connection, 10).expect("runs").len(), 1);
    }

    struct SingleSliceApi {
        records: Vec<EditRecord>,
        requests: usize,
    }

    impl RecentChangesApi for SingleSliceApi {
        fn fetch_recent_changes(
            &mut self,
            _query: &RecentChangesQuery,
        ) -> anyhow::Result<RecentChangesPage> {
            self.requests += 1;
            Ok(RecentChangesPage {
                records: std::mem::take(&mut self.records),
                continue_token: None,
            })
        }

        fn request_count(&self) -> usize {
            self.requests
        }
    }

    #[test]
    fn run_ingests_then_transforms() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        let mut api = SingleSliceApi {
            records: vec![
                edit(Some("A"), Some(at(0, 1))),
                edit(None, Some(at(0, 2))),
            ],
            requests: 0,
        };
        let settings = IngestSettings {
            limit: 500,
            slice_secs: 86_400,
            fail_on_saturation: true,
        };

        let report = run(&paths, &mut api, day(), &settings).expect("run");
        assert_eq!(report.ingest.requests, 1);
        assert_eq!(report.ingest.rows, 2);
        assert_eq!(report.transform.rows_written, WINDOWS_PER_DAY);

        let connection = open_store(&paths).expect("open store");
        let stored = load_window_activity(&connection)
            .expect("load")
            .expect("materialized");
        assert_eq!(stored[0].activity.window_start, at(0, 0));
        assert_eq!(stored[0].activity.changes_count, 2);
        assert_eq!(stored[0].activity.unique_users, 1);
    }

    #[test]
    fn invalid_day_fails_before_touching_storage() {
        let temp = tempdir().expect("tempdir");
        let paths = paths(&temp.path().join("project"));
        let error = transform(&paths, NaiveDate::MAX).expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidArgument { .. })
        ));
        assert!(!paths.db_path.exists());
    }
}
