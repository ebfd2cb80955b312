use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use aces_ingest_core::{
    ingest_file, verify, CancellationToken, IngestConfig, IngestError, IngestRequest, RunFailure,
    RunHooks, RunRecord, RunState, RunSummary, VehicleReferenceRule,
};
use aces_ingest_store_sqlite::{SchemaStatus, SqliteStore};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "aces.cli.v1";

const EXIT_FAILURE: u8 = 1;
const EXIT_VERIFICATION_ISSUES: u8 = 2;
const EXIT_ABORTED: u8 = 3;
const EXIT_BAD_INPUT: u8 = 4;

#[derive(Debug, Parser)]
#[command(name = "aces")]
#[command(about = "ACES XML ingestion CLI")]
struct Cli {
    #[arg(long, env = "ACES_DB", default_value = "./aces.sqlite3", global = true)]
    db: PathBuf,

    /// YAML run options; command-line flags override file values.
    #[arg(long, env = "ACES_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Stream one ACES document into the store.
    Ingest(Box<IngestArgs>),
    /// Audit a previously ingested `source_file` scope.
    Verify(VerifyArgs),
    /// Delete a `source_file` scope and its run record.
    Purge(PurgeArgs),
    /// List recorded runs.
    Runs,
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct IngestArgs {
    path: PathBuf,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    strict: Option<bool>,
    #[arg(long)]
    verify: Option<bool>,
    /// Scope name recorded on every row. Defaults to the input file name.
    #[arg(long)]
    source_file: Option<String>,
    /// Purge an existing scope of the same name inside the run transaction.
    #[arg(long, default_value_t = false)]
    replace: bool,
    /// Land records that only miss required columns. Implies `--strict false`.
    #[arg(long, default_value_t = false)]
    keep_incomplete: bool,
    #[arg(long)]
    transactional: Option<bool>,
    #[arg(long)]
    progress_every: Option<u64>,
    #[arg(long, value_enum)]
    vehicle_reference_rule: Option<VehicleReferenceRuleArg>,
    #[arg(long)]
    top_unmapped: Option<usize>,
    /// Append one NDJSON line describing the run outcome.
    #[arg(long)]
    run_log: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long)]
    source_file: String,
    #[arg(long)]
    top_unmapped: Option<usize>,
}

#[derive(Debug, Args)]
struct PurgeArgs {
    #[arg(long)]
    source_file: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VehicleReferenceRuleArg {
    FirstClaimWins,
    PreferBaseVehicle,
    PreferYearMakeModel,
    KeepAll,
}

impl VehicleReferenceRuleArg {
    fn into_rule(self) -> VehicleReferenceRule {
        match self {
            Self::FirstClaimWins => VehicleReferenceRule::FirstClaimWins,
            Self::PreferBaseVehicle => VehicleReferenceRule::PreferBaseVehicle,
            Self::PreferYearMakeModel => VehicleReferenceRule::PreferYearMakeModel,
            Self::KeepAll => VehicleReferenceRule::KeepAll,
        }
    }
}

/// Every stdout document names the contract and the command that produced it.
#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    contract_version: &'static str,
    command: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

fn emit<T: Serialize>(command: &str, body: &T) -> Result<()> {
    let envelope = Envelope { contract_version: CLI_CONTRACT_VERSION, command, body };
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &envelope)
        .with_context(|| format!("failed to write {command} output"))?;
    writeln!(stdout).context("failed to write to stdout")?;
    Ok(())
}

#[derive(Serialize)]
struct AbortedRun<'a> {
    source_file: &'a str,
    state: RunState,
    failure: &'a RunFailure,
}

#[derive(Serialize)]
struct RunListing {
    runs: Vec<RunRecord>,
}

/// Schema position plus what the recorded scopes look like once the tables exist.
#[derive(Serialize)]
struct StoreReport {
    #[serde(flatten)]
    schema: SchemaStatus,
    ready_for_ingest: bool,
    runs_by_status: Option<BTreeMap<String, u64>>,
    applications_recorded: Option<u64>,
}

#[derive(Serialize)]
struct MigrationReport {
    dry_run: bool,
    from_version: i64,
    to_version: i64,
    /// Applied versions, or the ones a dry run would apply.
    versions: Vec<i64>,
    ready_for_ingest: bool,
}

fn init_tracing() {
    // Logs go to stderr so stdout stays machine-readable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Ingest(args) => {
            let config = load_config(cli.config.as_deref())?;
            let mut store = open_migrated(&cli.db)?;
            run_ingest(&args, config, &mut store)
        }
        Command::Verify(args) => {
            let config = load_config(cli.config.as_deref())?;
            let store = open_migrated(&cli.db)?;
            run_verify(&args, &config, &store)
        }
        Command::Purge(args) => {
            let mut store = open_migrated(&cli.db)?;
            let summary = store.purge_source_file(&args.source_file)?;
            emit("purge", &summary)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Runs => {
            let store = open_migrated(&cli.db)?;
            emit("runs", &RunListing { runs: store.list_runs()? })?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(&command, &mut store)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_migrated(path: &Path) -> Result<SqliteStore> {
    let mut store = SqliteStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn load_config(path: Option<&Path>) -> Result<IngestConfig> {
    match path {
        Some(path) => IngestConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(IngestConfig::default()),
    }
}

fn apply_overrides(mut config: IngestConfig, args: &IngestArgs) -> Result<IngestConfig> {
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.keep_incomplete {
        config.keep_incomplete = true;
        config.strict = false;
    }
    if let Some(strict) = args.strict {
        config.strict = strict;
    }
    if let Some(verify) = args.verify {
        config.verify = verify;
    }
    if let Some(transactional) = args.transactional {
        config.transactional = transactional;
    }
    if let Some(progress_every) = args.progress_every {
        config.progress_every = progress_every;
    }
    if let Some(rule) = args.vehicle_reference_rule {
        config.vehicle_reference_rule = rule.into_rule();
    }
    if let Some(top_unmapped) = args.top_unmapped {
        config.top_unmapped = top_unmapped;
    }
    config.validate().context("invalid ingest options")?;
    Ok(config)
}

fn run_ingest(args: &IngestArgs, config: IngestConfig, store: &mut SqliteStore) -> Result<ExitCode> {
    let config = apply_overrides(config, args)?;
    if !config.transactional {
        tracing::warn!("non-transactional run: an abort leaves landed rows behind");
    }
    let request =
        IngestRequest::for_path(&args.path, args.source_file.as_deref()).replace(args.replace);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("failed to install Ctrl-C handler")?;
    let hooks = RunHooks { cancel, progress: None };

    match ingest_file(&args.path, store, &request, &config, &hooks) {
        Ok(summary) => {
            append_run_log(args.run_log.as_deref(), &committed_entry(&summary)?)?;
            emit("ingest", &summary)?;
            Ok(summary_exit_code(&summary))
        }
        Err(IngestError::Run(failure)) => {
            append_run_log(
                args.run_log.as_deref(),
                &serde_json::json!({
                    "logged_at": now_rfc3339()?,
                    "source_file": &*request.source_file,
                    "outcome": "aborted",
                    "state": failure.state,
                    "failure": failure,
                }),
            )?;
            emit(
                "ingest",
                &AbortedRun { source_file: &request.source_file, state: failure.state, failure: &failure },
            )?;
            eprintln!("ingest aborted: {failure}");
            Ok(ExitCode::from(EXIT_ABORTED))
        }
        Err(err @ IngestError::Input { .. }) => {
            eprintln!("error: {err}");
            Ok(ExitCode::from(EXIT_BAD_INPUT))
        }
        Err(err @ IngestError::Config(_)) => Err(err.into()),
    }
}

fn summary_exit_code(summary: &RunSummary) -> ExitCode {
    if summary.verification_error.is_some() {
        return ExitCode::from(EXIT_FAILURE);
    }
    match &summary.verification {
        Some(report) if !report.is_clean() => ExitCode::from(EXIT_VERIFICATION_ISSUES),
        _ => ExitCode::SUCCESS,
    }
}

fn committed_entry(summary: &RunSummary) -> Result<Value> {
    Ok(serde_json::json!({
        "logged_at": now_rfc3339()?,
        "source_file": summary.source_file,
        "outcome": "committed",
        "run_id": summary.run_id,
        "applications_ingested": summary.applications_ingested,
        "applications_skipped": summary.applications_skipped,
        "batches_flushed": summary.batches_flushed,
        "source_sha256": summary.source_sha256,
        "verification_issues": summary.verification.as_ref().map(|report| report.issues.len()),
    }))
}

fn append_run_log(path: Option<&Path>, entry: &Value) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open run log {}", path.display()))?;
    let line = serde_json::to_string(entry).context("failed to serialize run log entry")?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

fn run_verify(args: &VerifyArgs, config: &IngestConfig, store: &SqliteStore) -> Result<ExitCode> {
    let top_unmapped = args.top_unmapped.unwrap_or(config.top_unmapped);
    let report = verify(store, &args.source_file, top_unmapped)?;
    let code = if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_VERIFICATION_ISSUES)
    };
    emit("verify", &report)?;
    Ok(code)
}

fn run_db(command: &DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn store_report(store: &SqliteStore) -> Result<StoreReport> {
    let schema = store.schema_status()?;
    let ready_for_ingest = schema.pending_versions.is_empty();
    if !ready_for_ingest {
        return Ok(StoreReport { schema, ready_for_ingest, runs_by_status: None, applications_recorded: None });
    }

    let mut runs_by_status = BTreeMap::new();
    let mut applications_recorded = 0_u64;
    for run in store.list_runs()? {
        *runs_by_status.entry(run.status.to_string()).or_insert(0_u64) += 1;
        applications_recorded += run.applications_ingested;
    }
    Ok(StoreReport {
        schema,
        ready_for_ingest,
        runs_by_status: Some(runs_by_status),
        applications_recorded: Some(applications_recorded),
    })
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    emit("db schema-version", &store_report(store)?)
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    let report = if args.dry_run {
        MigrationReport {
            dry_run: true,
            from_version: before.current_version,
            to_version: before.target_version,
            ready_for_ingest: before.pending_versions.is_empty(),
            versions: before.pending_versions,
        }
    } else {
        store.migrate()?;
        let after = store.schema_status()?;
        tracing::info!(from = before.current_version, to = after.current_version, "aces store migrated");
        MigrationReport {
            dry_run: false,
            from_version: before.current_version,
            to_version: after.current_version,
            versions: before.pending_versions,
            ready_for_ingest: after.pending_versions.is_empty(),
        }
    };
    emit("db migrate", &report)
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    emit("db integrity-check", &store.integrity_check()?)
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
