use std::env;
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{IngestSettings, PulseConfig};
use crate::error::PipelineError;
use crate::model::{ChangeType, EditRecord, format_wiki_timestamp, parse_wiki_timestamp};
use crate::runtime::ResolvedPaths;
use crate::store::{open_store, record_run, replace_edits, run_record};

pub const RECENT_CHANGES_PROPS: &str = "title|timestamp|userid|user|comment|flags|sizes";

/// One request against `list=recentchanges`. Both bounds are inclusive and
/// the API walks from `newest` back to `oldest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentChangesQuery {
    pub newest: DateTime<Utc>,
    pub oldest: DateTime<Utc>,
    pub limit: usize,
    pub continue_token: Option<String>,
}

impl RecentChangesQuery {
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("action", "query".to_string()),
            ("list", "recentchanges".to_string()),
            ("rcstart", format_wiki_timestamp(&self.newest)),
            ("rcend", format_wiki_timestamp(&self.oldest)),
            ("rclimit", self.limit.to_string()),
            ("rcprop", RECENT_CHANGES_PROPS.to_string()),
        ];
        if let Some(token) = &self.continue_token {
            params.push(("rccontinue", token.clone()));
        }
        params
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecentChangesPage {
    pub records: Vec<EditRecord>,
    pub continue_token: Option<String>,
}

pub trait RecentChangesApi {
    fn fetch_recent_changes(&mut self, query: &RecentChangesQuery) -> Result<RecentChangesPage>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            api_url: config.api_url(),
            user_agent: config.user_agent(),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        Url::parse(&config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", config.api_url))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }
        debug!(params = ?pairs, "requesting MediaWiki API");

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            warn!(%status, attempt, "retrying MediaWiki API request");
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        warn!(%error, attempt, "retrying MediaWiki API request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_read_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl RecentChangesApi for MediaWikiClient {
    fn fetch_recent_changes(&mut self, query: &RecentChangesQuery) -> Result<RecentChangesPage> {
        let response = self.request_json_get(&query.params())?;
        parse_recent_changes_response(response)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

pub fn parse_recent_changes_response(response: Value) -> Result<RecentChangesPage> {
    let parsed: QueryResponse = serde_json::from_value(response)
        .context("failed to decode recentchanges API response")?;
    let records = parsed
        .query
        .recentchanges
        .into_iter()
        .map(RecentChangeItem::into_record)
        .collect();
    Ok(RecentChangesPage {
        records,
        continue_token: parsed.continuation.and_then(|cont| cont.rccontinue),
    })
}

/// Tumbling `[oldest, newest]` slices covering one UTC day, oldest first.
/// The last slice is clamped to 23:59:59.
pub fn day_slices(
    target_date: NaiveDate,
    slice_secs: u32,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, PipelineError> {
    if slice_secs == 0 {
        return Err(PipelineError::invalid_argument(
            "slice length must be at least one second",
        ));
    }
    let day_start = target_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| PipelineError::invalid_argument(format!("no midnight for {target_date}")))?
        .and_utc();
    let day_end = day_start
        .checked_add_signed(TimeDelta::days(1) - TimeDelta::seconds(1))
        .ok_or_else(|| {
            PipelineError::invalid_argument(format!("{target_date} is outside the supported range"))
        })?;
    let step = TimeDelta::seconds(i64::from(slice_secs));

    let mut slices = Vec::new();
    let mut cursor = day_start;
    while cursor < day_end {
        let next = cursor + step;
        let newest = (next - TimeDelta::seconds(1)).min(day_end);
        slices.push((cursor, newest));
        cursor = next;
    }
    Ok(slices)
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub target_date: String,
    pub slices: usize,
    pub requests: usize,
    pub rows: usize,
    pub rows_missing_timestamp: usize,
}

/// Walks the day slice by slice, following continuation inside each slice.
pub fn collect_day<A: RecentChangesApi>(
    api: &mut A,
    target_date: NaiveDate,
    settings: &IngestSettings,
) -> Result<(Vec<EditRecord>, usize)> {
    let slices = day_slices(target_date, settings.slice_secs)?;
    let slice_count = slices.len();
    let mut records = Vec::new();

    for (index, (oldest, newest)) in slices.into_iter().enumerate() {
        let mut query = RecentChangesQuery {
            newest,
            oldest,
            limit: settings.limit,
            continue_token: None,
        };
        let mut slice_rows = 0usize;
        loop {
            let page = api.fetch_recent_changes(&query).with_context(|| {
                format!(
                    "failed to fetch recent changes for {} .. {}",
                    format_wiki_timestamp(&oldest),
                    format_wiki_timestamp(&newest)
                )
            })?;
            if page.records.len() >= settings.limit {
                if settings.fail_on_saturation {
                    bail!(
                        "slice {} .. {} returned {} records (limit {}); reduce api.slice_secs",
                        format_wiki_timestamp(&oldest),
                        format_wiki_timestamp(&newest),
                        page.records.len(),
                        settings.limit
                    );
                }
                warn!(
                    oldest = %format_wiki_timestamp(&oldest),
                    newest = %format_wiki_timestamp(&newest),
                    limit = settings.limit,
                    "slice saturated the request limit; following continuation"
                );
            }
            slice_rows += page.records.len();
            records.extend(page.records);
            match page.continue_token {
                Some(token) => query.continue_token = Some(token),
                None => break,
            }
        }
        debug!(
            slice = index + 1,
            of = slice_count,
            oldest = %format_wiki_timestamp(&oldest),
            rows = slice_rows,
            total = records.len(),
            "slice collected"
        );
    }

    Ok((records, slice_count))
}

/// Extracts one day of recent changes and reloads `wiki_edits` with it.
/// The table is only touched once every request has succeeded.
pub fn ingest_day<A: RecentChangesApi>(
    paths: &ResolvedPaths,
    api: &mut A,
    target_date: NaiveDate,
    settings: &IngestSettings,
) -> Result<IngestReport> {
    info!(%target_date, slice_secs = settings.slice_secs, limit = settings.limit, "ingestion started");
    let (records, slices) = collect_day(api, target_date, settings)?;
    let rows_missing_timestamp = records
        .iter()
        .filter(|record| record.timestamp.is_none())
        .count();

    let mut connection = open_store(paths)?;
    let rows = replace_edits(&mut connection, &records)?;
    record_run(&connection, &run_record("ingest", target_date, rows, None))?;
    info!(%target_date, rows, rows_missing_timestamp, requests = api.request_count(), "ingestion finished");

    Ok(IngestReport {
        target_date: target_date.to_string(),
        slices,
        requests: api.request_count(),
        rows,
        rows_missing_timestamp,
    })
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    recentchanges: Vec<RecentChangeItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    rccontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentChangeItem {
    #[serde(rename = "type")]
    change_type: Option<String>,
    #[serde(default)]
    title: String,
    user: Option<String>,
    userid: Option<Value>,
    timestamp: Option<String>,
    comment: Option<String>,
}

impl RecentChangeItem {
    fn into_record(self) -> EditRecord {
        let timestamp = self.timestamp.as_deref().and_then(|raw| {
            let parsed = parse_wiki_timestamp(raw);
            if parsed.is_none() {
                warn!(title = %self.title, raw, "dropping unreadable recentchanges timestamp");
            }
            parsed
        });
        EditRecord {
            change_type: ChangeType::parse(self.change_type.as_deref().unwrap_or_default()),
            user_id: self.userid.and_then(opaque_id),
            user: self.user,
            title: self.title,
            timestamp,
            comment: self.comment.unwrap_or_default(),
        }
    }
}

fn opaque_id(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}
