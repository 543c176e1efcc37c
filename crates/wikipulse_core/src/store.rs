use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::error::{PipelineError, QualityViolation};
use crate::migrate::{current_version, migrate_connection};
use crate::model::{
    ChangeType, EditRecord, WindowActivity, format_wiki_timestamp, parse_wiki_timestamp,
};
use crate::quality::{CHECK_NOT_NULL, CHECK_UNIQUE};
use crate::runtime::ResolvedPaths;
use crate::windows::TARGET_DATE_FORMAT;

pub const EDITS_TABLE: &str = "wiki_edits";
pub const ACTIVITY_TABLE: &str = "window_activity";
const WINDOW_BOUND_COLUMNS: [&str; 2] = ["window_start", "window_end"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredWindowActivity {
    pub target_date: String,
    pub rank: usize,
    #[serde(flatten)]
    pub activity: WindowActivity,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunRecord {
    pub stage: String,
    pub target_date: String,
    pub rows: usize,
    pub digest: Option<String>,
    pub finished_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub schema_version: u32,
    pub edit_rows: usize,
    pub edit_rows_without_timestamp: usize,
    pub activity_rows: usize,
    pub activity_target_date: Option<String>,
}

pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection =
        Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

/// Opens the database, creating it and applying pending migrations.
pub fn open_store(paths: &ResolvedPaths) -> Result<Connection> {
    ensure_db_parent(paths)?;
    let connection = open_connection(&paths.db_path)?;
    migrate_connection(&connection)?;
    Ok(connection)
}

pub fn ensure_db_parent(paths: &ResolvedPaths) -> Result<()> {
    let parent = paths
        .db_path
        .parent()
        .ok_or_else(|| anyhow!("db path has no parent: {}", paths.db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to inspect sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

/// Replaces the whole edit table with `edits` in one transaction.
pub fn replace_edits(connection: &mut Connection, edits: &[EditRecord]) -> Result<usize> {
    let transaction = connection
        .transaction()
        .context("failed to start wiki_edits reload transaction")?;
    transaction
        .execute("DELETE FROM wiki_edits", [])
        .context("failed to clear wiki_edits table")?;

    let mut statement = transaction
        .prepare(
            "INSERT INTO wiki_edits (
                change_type,
                title,
                user,
                user_id,
                timestamp,
                comment
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .context("failed to prepare wiki_edits insert")?;
    let mut inserted = 0usize;
    for edit in edits {
        statement
            .execute(params![
                edit.change_type.as_str(),
                edit.title,
                edit.user,
                edit.user_id,
                edit.timestamp.as_ref().map(format_wiki_timestamp),
                edit.comment,
            ])
            .with_context(|| format!("failed to insert edit for {}", edit.title))?;
        inserted += 1;
    }
    drop(statement);

    transaction
        .commit()
        .context("failed to commit wiki_edits reload transaction")?;
    Ok(inserted)
}

/// Reads every edit row inside a single read transaction so a concurrent
/// reload is never observed half-way.
pub fn load_edits(connection: &mut Connection) -> Result<Vec<EditRecord>> {
    let transaction = connection
        .transaction()
        .context("failed to start wiki_edits read transaction")?;
    let edits = {
        let mut statement = transaction
            .prepare(
                "SELECT change_type, title, user, user_id, timestamp, comment
                 FROM wiki_edits
                 ORDER BY rowid",
            )
            .context("failed to prepare wiki_edits query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("failed to query wiki_edits")?;

        let mut edits = Vec::new();
        for row in rows {
            let (change_type, title, user, user_id, timestamp, comment) =
                row.context("failed to decode wiki_edits row")?;
            let timestamp = match timestamp {
                Some(raw) => Some(parse_wiki_timestamp(&raw).ok_or_else(|| {
                    anyhow!("wiki_edits row for {title} has unreadable timestamp `{raw}`")
                })?),
                None => None,
            };
            edits.push(EditRecord {
                change_type: ChangeType::parse(&change_type),
                title,
                user,
                user_id,
                timestamp,
                comment: comment.unwrap_or_default(),
            });
        }
        edits
    };
    transaction
        .commit()
        .context("failed to close wiki_edits read transaction")?;
    Ok(edits)
}

/// Full refresh of the ranked relation. The SQL quality checks run on the
/// freshly written rows before commit; any violation rolls the refresh back.
pub fn replace_window_activity(
    connection: &mut Connection,
    target_date: NaiveDate,
    rows: &[WindowActivity],
) -> Result<usize> {
    let target_date = target_date.format(TARGET_DATE_FORMAT).to_string();
    let transaction = connection
        .transaction()
        .context("failed to start window_activity refresh transaction")?;
    transaction
        .execute("DELETE FROM window_activity", [])
        .context("failed to clear window_activity table")?;

    let mut statement = transaction
        .prepare(
            "INSERT INTO window_activity (
                target_date,
                rank,
                window_start,
                window_end,
                changes_count,
                unique_users
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .context("failed to prepare window_activity insert")?;
    for (index, row) in rows.iter().enumerate() {
        statement
            .execute(params![
                target_date,
                i64::try_from(index + 1).context("rank does not fit into i64")?,
                format_wiki_timestamp(&row.window_start),
                format_wiki_timestamp(&row.window_end),
                i64::try_from(row.changes_count).context("changes_count does not fit into i64")?,
                i64::try_from(row.unique_users).context("unique_users does not fit into i64")?,
            ])
            .with_context(|| {
                format!(
                    "failed to insert window {}",
                    format_wiki_timestamp(&row.window_start)
                )
            })?;
    }
    drop(statement);

    let violations = window_activity_violations(&transaction)?;
    if !violations.is_empty() {
        return Err(PipelineError::DataQualityViolation { violations }.into());
    }

    transaction
        .commit()
        .context("failed to commit window_activity refresh transaction")?;
    Ok(rows.len())
}

/// Returns `None` when the ranked relation has never been materialized.
pub fn load_window_activity(connection: &Connection) -> Result<Option<Vec<StoredWindowActivity>>> {
    if !table_exists(connection, ACTIVITY_TABLE)? {
        return Ok(None);
    }
    let mut statement = connection
        .prepare(
            "SELECT target_date, rank, window_start, window_end, changes_count, unique_users
             FROM window_activity
             ORDER BY rank",
        )
        .context("failed to prepare window_activity query")?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .context("failed to query window_activity")?;

    let mut output = Vec::new();
    for row in rows {
        let (target_date, rank, start, end, changes_count, unique_users) =
            row.context("failed to decode window_activity row")?;
        output.push(StoredWindowActivity {
            target_date,
            rank: usize::try_from(rank).context("rank does not fit into usize")?,
            activity: WindowActivity {
                window_start: decode_window_bound("window_start", rank, start)?,
                window_end: decode_window_bound("window_end", rank, end)?,
                changes_count: u64::try_from(changes_count)
                    .context("changes_count is negative")?,
                unique_users: u64::try_from(unique_users).context("unique_users is negative")?,
            },
        });
    }
    Ok(Some(output))
}

/// `not_null` and `unique` checks on both window bounds of the persisted
/// relation.
pub fn validate_window_activity(connection: &Connection) -> Result<Vec<QualityViolation>> {
    window_activity_violations(connection)
}

pub fn record_run(connection: &Connection, record: &RunRecord) -> Result<()> {
    connection
        .execute(
            "INSERT INTO pipeline_runs (stage, target_date, rows, digest, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.stage,
                record.target_date,
                i64::try_from(record.rows).context("row count does not fit into i64")?,
                record.digest,
                record.finished_at,
            ],
        )
        .with_context(|| format!("failed to record {} run", record.stage))?;
    Ok(())
}

pub fn run_record(stage: &str, target_date: NaiveDate, rows: usize, digest: Option<String>) -> RunRecord {
    RunRecord {
        stage: stage.to_string(),
        target_date: target_date.format(TARGET_DATE_FORMAT).to_string(),
        rows,
        digest,
        finished_at: format_wiki_timestamp(&Utc::now()),
    }
}

/// Most recent runs first.
pub fn last_runs(connection: &Connection, limit: usize) -> Result<Vec<RunRecord>> {
    if !table_exists(connection, "pipeline_runs")? {
        return Ok(Vec::new());
    }
    let mut statement = connection
        .prepare(
            "SELECT stage, target_date, rows, digest, finished_at
             FROM pipeline_runs
             ORDER BY id DESC
             LIMIT ?1",
        )
        .context("failed to prepare pipeline_runs query")?;
    let rows = statement
        .query_map(
            [i64::try_from(limit).context("limit does not fit into i64")?],
            |row| {
                Ok(RunRecord {
                    stage: row.get(0)?,
                    target_date: row.get(1)?,
                    rows: usize::try_from(row.get::<_, i64>(2)?).unwrap_or_default(),
                    digest: row.get(3)?,
                    finished_at: row.get(4)?,
                })
            },
        )
        .context("failed to query pipeline_runs")?;
    let mut output = Vec::new();
    for row in rows {
        output.push(row.context("failed to decode pipeline_runs row")?);
    }
    Ok(output)
}

/// Returns `None` when the database file does not exist yet.
pub fn store_stats(paths: &ResolvedPaths) -> Result<Option<StoreStats>> {
    if !paths.db_path.exists() {
        return Ok(None);
    }
    let connection = open_connection(&paths.db_path)?;
    let schema_version = if table_exists(&connection, "schema_migrations")? {
        current_version(&connection)?
    } else {
        0
    };

    let (edit_rows, edit_rows_without_timestamp) = if table_exists(&connection, EDITS_TABLE)? {
        (
            count_rows(&connection, "SELECT COUNT(*) FROM wiki_edits")?,
            count_rows(
                &connection,
                "SELECT COUNT(*) FROM wiki_edits WHERE timestamp IS NULL",
            )?,
        )
    } else {
        (0, 0)
    };

    let (activity_rows, activity_target_date) = if table_exists(&connection, ACTIVITY_TABLE)? {
        let target_date = connection
            .query_row(
                "SELECT target_date FROM window_activity ORDER BY rank LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read window_activity target date")?;
        (
            count_rows(&connection, "SELECT COUNT(*) FROM window_activity")?,
            target_date,
        )
    } else {
        (0, None)
    };

    Ok(Some(StoreStats {
        schema_version,
        edit_rows,
        edit_rows_without_timestamp,
        activity_rows,
        activity_target_date,
    }))
}

fn window_activity_violations(connection: &Connection) -> Result<Vec<QualityViolation>> {
    let mut violations = Vec::new();
    for column in WINDOW_BOUND_COLUMNS {
        let mut null_statement = connection
            .prepare(&format!(
                "SELECT rank FROM window_activity WHERE {column} IS NULL ORDER BY rank"
            ))
            .with_context(|| format!("failed to prepare not_null check for {column}"))?;
        let null_ranks = null_statement
            .query_map([], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run not_null check for {column}"))?;
        for rank in null_ranks {
            let rank = rank.context("failed to decode not_null check row")?;
            violations.push(QualityViolation::new(
                CHECK_NOT_NULL,
                column,
                Some(format!("rank={rank}")),
            ));
        }

        let mut unique_statement = connection
            .prepare(&format!(
                "SELECT {column} FROM window_activity
                 WHERE {column} IS NOT NULL
                 GROUP BY {column}
                 HAVING COUNT(*) > 1
                 ORDER BY {column}"
            ))
            .with_context(|| format!("failed to prepare unique check for {column}"))?;
        let duplicates = unique_statement
            .query_map([], |row| row.get::<_, String>(0))
            .with_context(|| format!("failed to run unique check for {column}"))?;
        for value in duplicates {
            let value = value.context("failed to decode unique check row")?;
            violations.push(QualityViolation::new(CHECK_UNIQUE, column, Some(value)));
        }
    }
    Ok(violations)
}

fn decode_window_bound(
    column: &str,
    rank: i64,
    value: Option<String>,
) -> Result<chrono::DateTime<Utc>> {
    let raw = value.ok_or_else(|| anyhow!("window_activity rank {rank} has null {column}"))?;
    parse_wiki_timestamp(&raw)
        .ok_or_else(|| anyhow!("window_activity rank {rank} has unreadable {column} `{raw}`"))
}

fn count_rows(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run `{sql}`"))?;
    usize::try_from(count).context("row count does not fit into usize")
}
