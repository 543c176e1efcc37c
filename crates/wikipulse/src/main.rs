use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use wikipulse_core::config::{PulseConfig, load_config};
use wikipulse_core::ingest::{IngestReport, MediaWikiClient, MediaWikiClientConfig, ingest_day};
use wikipulse_core::migrate::{pending_migration_count, run_migrations};
use wikipulse_core::pipeline::{TransformReport, run, transform};
use wikipulse_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_initialized,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use wikipulse_core::store::{
    ACTIVITY_TABLE, StoreStats, last_runs, load_window_activity, open_connection, store_stats,
    validate_window_activity,
};
use wikipulse_core::{PipelineError, model::format_wiki_timestamp};

const DEFAULT_LOG_FILTER: &str = "wikipulse=info,wikipulse_core=info";

#[derive(Debug, Parser)]
#[command(
    name = "wikipulse",
    version,
    about = "Extract a day of wiki recent changes and rank 30-minute sliding windows by activity"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout, config and database schema")]
    Init(InitArgs),
    #[command(about = "Extract one UTC day of recent changes into wiki_edits")]
    Ingest(DateArgs),
    #[command(about = "Rebuild the ranked window_activity table from wiki_edits")]
    Transform(DateArgs),
    #[command(about = "Ingest and transform in one go")]
    Run(DateArgs),
    #[command(about = "Print the ranked windows")]
    Report(ReportArgs),
    #[command(about = "Run data-quality checks on the materialized windows")]
    Validate,
    Status,
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DateArgs {
    #[arg(long, value_name = "YYYY-MM-DD", help = "Target day (UTC)")]
    date: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long, value_name = "N", help = "Only print the top N windows")]
    limit: Option<usize>,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };

    let paths = resolve_runtime_paths(&runtime)?;
    init_logging(&paths)?;

    let result = match command {
        Commands::Init(args) => run_init(&runtime, &paths, args),
        Commands::Ingest(args) => run_ingest(&runtime, &paths, args),
        Commands::Transform(args) => run_transform(&runtime, &paths, args),
        Commands::Run(args) => run_pipeline(&runtime, &paths, args),
        Commands::Report(args) => run_report(&paths, args),
        Commands::Validate => run_validate(&paths),
        Commands::Status => run_status(&runtime, &paths),
        Commands::Db(DbArgs { command }) => match command {
            DbSubcommand::Stats => run_db_stats(&paths),
            DbSubcommand::Migrate => run_db_migrate(&paths),
        },
    };
    if let Err(error) = &result {
        tracing::error!(error = %format!("{error:#}"), "command failed");
    }
    result
}

fn init_logging(paths: &ResolvedPaths) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let file_layer = if paths.logs_dir.is_dir() {
        let file = File::create(&paths.log_path)
            .with_context(|| format!("failed to truncate {}", paths.log_path.display()))?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn run_init(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: InitArgs) -> Result<()> {
    let report = init_layout(
        paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let migrations = run_migrations(paths)?;

    println!("Initialized wikipulse runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("log_path: {}", normalize_path(&paths.log_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("migrations.applied: {}", migrations.applied.len());
    println!("schema_version: {}", migrations.current_version);
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_ingest(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: DateArgs) -> Result<()> {
    let status = inspect_runtime(paths)?;
    ensure_runtime_initialized(paths, &status)?;
    let config = load_config(&paths.config_path)?;
    let target_date = config.target_date(args.date.as_deref())?;
    let settings = config.ingest_settings()?;
    let mut client = build_client(&config)?;

    let report = ingest_day(paths, &mut client, target_date, &settings)?;

    println!("ingest");
    println!("api_url: {}", config.api_url());
    print_ingest_report(&report);
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_transform(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: DateArgs) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let target_date = config.target_date(args.date.as_deref())?;

    let report = transform(paths, target_date)?;

    println!("transform");
    println!("db_path: {}", normalize_path(&paths.db_path));
    print_transform_report(&report);
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_pipeline(runtime: &RuntimeOptions, paths: &ResolvedPaths, args: DateArgs) -> Result<()> {
    let status = inspect_runtime(paths)?;
    ensure_runtime_initialized(paths, &status)?;
    let config = load_config(&paths.config_path)?;
    let target_date = config.target_date(args.date.as_deref())?;
    let settings = config.ingest_settings()?;
    let mut client = build_client(&config)?;

    let report = run(paths, &mut client, target_date, &settings)?;

    println!("run");
    println!("api_url: {}", config.api_url());
    print_ingest_report(&report.ingest);
    print_transform_report(&report.transform);
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_report(paths: &ResolvedPaths, args: ReportArgs) -> Result<()> {
    if !paths.db_path.exists() {
        return Err(PipelineError::upstream(
            ACTIVITY_TABLE,
            "database is missing (run `wikipulse run` first)",
        )
        .into());
    }
    let connection = open_connection(&paths.db_path)?;
    let Some(rows) = load_window_activity(&connection)? else {
        println!("window_activity: <not built> (run `wikipulse transform`)");
        return Ok(());
    };
    let limit = args.limit.unwrap_or(rows.len());
    let rows = rows.into_iter().take(limit).collect::<Vec<_>>();

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        OutputFormat::Text => {
            println!("window activity");
            match rows.first() {
                Some(first) => println!("target_date: {}", first.target_date),
                None => println!("rows: <none>"),
            }
            for row in &rows {
                println!(
                    "{:>3}. {} .. {}  changes={} unique_users={}",
                    row.rank,
                    format_wiki_timestamp(&row.activity.window_start),
                    format_wiki_timestamp(&row.activity.window_end),
                    row.activity.changes_count,
                    row.activity.unique_users
                );
            }
        }
    }
    Ok(())
}

fn run_validate(paths: &ResolvedPaths) -> Result<()> {
    if !paths.db_path.exists() {
        return Err(PipelineError::upstream(ACTIVITY_TABLE, "database is missing").into());
    }
    let connection = open_connection(&paths.db_path)?;
    if load_window_activity(&connection)?.is_none() {
        return Err(
            PipelineError::upstream(ACTIVITY_TABLE, "table has not been materialized").into(),
        );
    }
    let violations = validate_window_activity(&connection)?;

    println!("validate");
    println!(
        "checks: not_null(window_start), unique(window_start), not_null(window_end), unique(window_end)"
    );
    println!("violations: {}", violations.len());
    for violation in &violations {
        println!("  - {violation}");
    }
    if !violations.is_empty() {
        return Err(PipelineError::DataQualityViolation { violations }.into());
    }
    println!("result: pass");
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, paths: &ResolvedPaths) -> Result<()> {
    let status = inspect_runtime(paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.db_exists {
        let connection = open_connection(&paths.db_path)?;
        let runs = last_runs(&connection, 5)?;
        if runs.is_empty() {
            println!("runs: <none>");
        }
        for record in runs {
            println!(
                "run.{}: target_date={} rows={} finished_at={}{}",
                record.stage,
                record.target_date,
                record.rows,
                record.finished_at,
                record
                    .digest
                    .map(|digest| format!(" digest={digest}"))
                    .unwrap_or_default()
            );
        }
    }
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_db_stats(paths: &ResolvedPaths) -> Result<()> {
    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    match store_stats(paths)? {
        Some(stats) => print_store_stats(&stats),
        None => println!("db.storage: <not built> (run `wikipulse init`)"),
    }
    println!("migrations.pending: {}", pending_migration_count(paths)?);
    Ok(())
}

fn run_db_migrate(paths: &ResolvedPaths) -> Result<()> {
    let report = run_migrations(paths)?;
    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("schema_version: {}", report.current_version);
    Ok(())
}

fn build_client(config: &PulseConfig) -> Result<MediaWikiClient> {
    MediaWikiClient::new(MediaWikiClientConfig::from_config(config))
}

fn print_ingest_report(report: &IngestReport) {
    println!("target_date: {}", report.target_date);
    println!("ingest.slices: {}", report.slices);
    println!("ingest.requests: {}", report.requests);
    println!("ingest.rows: {}", report.rows);
    println!(
        "ingest.rows_missing_timestamp: {}",
        report.rows_missing_timestamp
    );
}

fn print_transform_report(report: &TransformReport) {
    println!("target_date: {}", report.target_date);
    println!("transform.edits_loaded: {}", report.edits_loaded);
    println!("transform.edits_staged: {}", report.edits_staged);
    println!("transform.windows: {}", report.windows);
    println!("transform.rows_written: {}", report.rows_written);
    println!("transform.digest: {}", report.digest);
}

fn print_store_stats(stats: &StoreStats) {
    println!("db.schema_version: {}", stats.schema_version);
    println!("db.wiki_edits.rows: {}", stats.edit_rows);
    println!(
        "db.wiki_edits.rows_without_timestamp: {}",
        stats.edit_rows_without_timestamp
    );
    println!("db.window_activity.rows: {}", stats.activity_rows);
    println!(
        "db.window_activity.target_date: {}",
        stats.activity_target_date.as_deref().unwrap_or("<none>")
    );
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
