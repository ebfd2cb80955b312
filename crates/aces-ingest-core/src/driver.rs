//! Run orchestration: parser, normaliser, batcher, store, verifier.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::batch::Batcher;
use crate::config::IngestConfig;
use crate::error::{FailureClass, IngestError, RunFailure};
use crate::model::RecordLocator;
use crate::normalize::{normalize_app, NormalizeOptions, RecordIssue};
use crate::parser::{AcesReader, DigestReader, ParseError};
use crate::store::{AuditStore, IngestStore, RunCompletion, RunContext};
use crate::verify::{verify, VerificationReport};

const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Cooperative cancellation, checked between applications.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestProgress {
    pub applications: u64,
    pub skipped: u64,
    pub batches_flushed: u64,
    pub byte_offset: u64,
    pub elapsed_ms: u64,
    pub applications_per_sec: f64,
}

pub type ProgressCallback = Box<dyn Fn(&IngestProgress) + Send + Sync>;

#[derive(Default)]
pub struct RunHooks {
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Opened,
    Streaming,
    Flushing,
    Committed,
    Verified,
    Aborted,
}

impl RunState {
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use RunState::{Aborted, Committed, Flushing, Idle, Opened, Streaming, Verified};
        match (self, next) {
            (Idle, Opened)
            | (Opened, Streaming)
            | (Streaming, Flushing)
            | (Flushing, Streaming)
            | (Flushing, Committed)
            | (Streaming, Committed)
            | (Committed, Verified) => true,
            (Committed | Verified | Aborted, Aborted) => false,
            (_, Aborted) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct StateMachine {
    state: RunState,
}

impl StateMachine {
    fn advance(&mut self, next: RunState) -> Result<(), RunFailure> {
        if !self.state.can_transition_to(next) {
            return Err(RunFailure::new(
                FailureClass::Internal,
                format!("illegal run state transition {:?} -> {next:?}", self.state),
                RecordLocator::default(),
            ));
        }
        tracing::debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
        Ok(())
    }

    /// Move to `Aborted` where that is still legal and stamp the resulting state on `failure`.
    fn fail(&mut self, mut failure: RunFailure) -> RunFailure {
        if let Err(illegal) = self.advance(RunState::Aborted) {
            tracing::error!(state = ?self.state, %illegal, "run cannot be marked aborted");
        }
        failure.state = self.state;
        failure
    }
}

/// Which scope a run writes to.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IngestRequest {
    pub source_file: Arc<str>,
    pub replace_existing: bool,
}

impl IngestRequest {
    /// `source_file` defaults to the input's file name.
    #[must_use]
    pub fn for_path(path: &Path, source_file: Option<&str>) -> Self {
        let source_file = source_file.map_or_else(
            || {
                path.file_name()
                    .map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().into_owned())
            },
            str::to_string,
        );
        Self { source_file: Arc::from(source_file), replace_existing: false }
    }

    #[must_use]
    pub fn replace(mut self, replace_existing: bool) -> Self {
        self.replace_existing = replace_existing;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source_file: String,
    pub state: RunState,
    pub aces_version: Option<String>,
    pub applications_seen: u64,
    pub applications_ingested: u64,
    pub applications_skipped: u64,
    pub batches_flushed: u64,
    pub footer_record_count: Option<u64>,
    pub source_sha256: String,
    pub bytes_read: u64,
    pub skipped_elements: BTreeMap<String, u64>,
    /// Counts of non-fatal record issues by kind.
    pub record_issues: BTreeMap<String, u64>,
    pub elapsed_ms: u64,
    pub verification: Option<VerificationReport>,
    pub verification_error: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    ingested: u64,
    skipped: u64,
    record_issues: BTreeMap<String, u64>,
}

impl Counters {
    fn note_issues(&mut self, issues: &[RecordIssue]) {
        for issue in issues {
            let key = match issue {
                RecordIssue::MissingPartNumber => "missing_part_number",
                RecordIssue::MissingPartType => "missing_part_type",
                RecordIssue::NoVehicleReference => "no_vehicle_reference",
                RecordIssue::UncoercibleValue { .. } => "uncoercible_value",
            };
            *self.record_issues.entry(key.to_string()).or_default() += 1;
        }
    }
}

/// Ingest one file into `store`.
///
/// # Errors
/// Returns [`IngestError::Input`] when the file cannot be opened and
/// [`IngestError::Run`] when the run was rolled back.
pub fn ingest_file<S: IngestStore + AuditStore + ?Sized>(
    path: &Path,
    store: &mut S,
    request: &IngestRequest,
    config: &IngestConfig,
    hooks: &RunHooks,
) -> Result<RunSummary, IngestError> {
    let input_error = |source| IngestError::Input { path: path.display().to_string(), source };
    let metadata = fs::metadata(path).map_err(input_error)?;
    if !metadata.is_file() {
        return Err(input_error(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file")));
    }
    let file = File::open(path).map_err(input_error)?;
    Ok(ingest(file, store, request, config, hooks)?)
}

/// Ingest one ACES document read from `input`.
///
/// The whole run is committed or nothing is: any failure rolls the store back and is
/// returned as a [`RunFailure`]. Verification runs after commit when configured; its
/// findings are reported in the summary and never undo the commit.
///
/// # Errors
/// Returns [`RunFailure`] describing the first fatal problem.
pub fn ingest<R: Read, S: IngestStore + AuditStore + ?Sized>(
    input: R,
    store: &mut S,
    request: &IngestRequest,
    config: &IngestConfig,
    hooks: &RunHooks,
) -> Result<RunSummary, RunFailure> {
    let mut machine = StateMachine { state: RunState::Idle };
    config.validate().map_err(|err| {
        machine.fail(RunFailure::new(FailureClass::Internal, err.to_string(), RecordLocator::default()))
    })?;

    let started = Instant::now();
    let run_id = Ulid::new();
    let mut reader = AcesReader::new(BufReader::with_capacity(READ_BUFFER_BYTES, DigestReader::new(input)))
        .map_err(|err| machine.fail(RunFailure::from_parse(err)))?;

    let context = RunContext {
        run_id,
        source_file: Arc::clone(&request.source_file),
        header: reader.header().clone(),
        started_at: now_rfc3339(),
        transactional: config.transactional,
        replace_existing: request.replace_existing,
    };
    tracing::info!(
        run_id = %run_id,
        source_file = %request.source_file,
        aces_version = ?context.header.aces_version,
        batch_size = config.batch_size,
        transactional = config.transactional,
        strict = config.strict,
        "starting ingest run"
    );
    store
        .begin_run(&context)
        .map_err(|err| machine.fail(RunFailure::from_store(err, RecordLocator::default())))?;
    if let Err(failure) =
        machine.advance(RunState::Opened).and_then(|()| machine.advance(RunState::Streaming))
    {
        return Err(abort(store, &mut machine, failure));
    }

    let mut pipeline = Pipeline {
        store: &mut *store,
        batcher: Batcher::new(config.batch_size),
        machine,
        counters: Counters::default(),
        request,
        config,
        options: NormalizeOptions { vehicle_reference_rule: config.vehicle_reference_rule },
        hooks,
        started,
    };
    let streamed = pipeline.stream(&mut reader).and_then(|()| pipeline.flush(RecordLocator::default()));
    let Pipeline { batcher, mut machine, counters, .. } = pipeline;
    if let Err(failure) = streamed {
        return Err(abort(store, &mut machine, failure.after_batch(batcher.flushes())));
    }

    let footer_record_count = reader.footer().and_then(|footer| footer.record_count);
    let skipped_elements = reader.skipped_elements().clone();
    let applications_seen = reader.apps_seen();
    let (source_sha256, bytes_read) = match reader.into_inner().into_inner().finish() {
        Ok(digest) => digest,
        Err(err) => {
            let failure = RunFailure::new(FailureClass::ParseFatal, format!("failed to read input: {err}"), RecordLocator::default())
                .after_batch(batcher.flushes());
            return Err(abort(store, &mut machine, failure));
        }
    };

    let completion = RunCompletion {
        applications_ingested: counters.ingested,
        applications_skipped: counters.skipped,
        batches_flushed: batcher.flushes(),
        footer_record_count,
        source_sha256: Some(source_sha256.clone()),
        finished_at: now_rfc3339(),
    };
    if let Err(err) = store.commit_run(&completion) {
        let failure = RunFailure::from_store(err, RecordLocator::default()).after_batch(batcher.flushes());
        return Err(abort(store, &mut machine, failure));
    }
    if let Err(failure) = machine.advance(RunState::Committed) {
        return Err(machine.fail(failure));
    }
    tracing::info!(
        run_id = %run_id,
        applications = counters.ingested,
        skipped = counters.skipped,
        batches = batcher.flushes(),
        elapsed_ms = elapsed_ms(started),
        "ingest run committed"
    );

    let mut summary = RunSummary {
        run_id: run_id.to_string(),
        source_file: request.source_file.to_string(),
        state: machine.state,
        aces_version: context.header.aces_version.clone(),
        applications_seen,
        applications_ingested: counters.ingested,
        applications_skipped: counters.skipped,
        batches_flushed: batcher.flushes(),
        footer_record_count,
        source_sha256,
        bytes_read,
        skipped_elements,
        record_issues: counters.record_issues,
        elapsed_ms: elapsed_ms(started),
        verification: None,
        verification_error: None,
    };

    if config.verify {
        match verify(&*store, &request.source_file, config.top_unmapped) {
            Ok(report) => {
                if let Err(failure) = machine.advance(RunState::Verified) {
                    return Err(machine.fail(failure));
                }
                summary.state = machine.state;
                summary.verification = Some(report);
            }
            Err(err) => {
                tracing::error!(run_id = %run_id, %err, "verification could not read the store");
                summary.verification_error = Some(err.to_string());
            }
        }
    }
    Ok(summary)
}

struct Pipeline<'a, S: ?Sized> {
    store: &'a mut S,
    batcher: Batcher,
    machine: StateMachine,
    counters: Counters,
    request: &'a IngestRequest,
    config: &'a IngestConfig,
    options: NormalizeOptions,
    hooks: &'a RunHooks,
    started: Instant,
}

impl<S: IngestStore + ?Sized> Pipeline<'_, S> {
    fn stream<R: BufRead>(&mut self, reader: &mut AcesReader<R>) -> Result<(), RunFailure> {
        while let Some(item) = reader.next() {
            if self.hooks.cancel.is_cancelled() {
                return Err(RunFailure::new(
                    FailureClass::Cancelled,
                    "ingest cancelled",
                    RecordLocator { app_id: None, byte_offset: Some(AcesReader::position(reader)) },
                ));
            }

            let record = match item {
                Ok(record) => record,
                Err(ParseError::Record { offset, app_id, reason }) if !self.config.strict => {
                    tracing::warn!(offset, ?app_id, reason = %reason, "skipping invalid application");
                    self.counters.skipped += 1;
                    continue;
                }
                Err(err) => return Err(RunFailure::from_parse(err)),
            };
            let locator = RecordLocator { app_id: Some(record.app_id), byte_offset: Some(record.byte_offset) };

            let rows = match normalize_app(&record, &self.request.source_file, &self.options) {
                Ok(rows) => rows,
                Err(err) if self.config.strict => {
                    return Err(RunFailure::new(FailureClass::RecordInvalid, err.to_string(), locator));
                }
                Err(err) => {
                    tracing::warn!(%locator, %err, "skipping invalid application");
                    self.counters.skipped += 1;
                    continue;
                }
            };
            drop(record);

            if rows.missing_required() {
                let reasons = rows
                    .issues
                    .iter()
                    .filter(|issue| issue.is_missing_required())
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                if self.config.strict {
                    return Err(RunFailure::new(FailureClass::RecordInvalid, reasons, locator));
                }
                if !self.config.keep_incomplete {
                    tracing::warn!(%locator, reasons = %reasons, "skipping incomplete application");
                    self.counters.skipped += 1;
                    continue;
                }
                tracing::warn!(%locator, reasons = %reasons, "landing incomplete application");
            }

            self.counters.note_issues(&rows.issues);
            self.batcher.push(rows);
            self.counters.ingested += 1;

            if self.batcher.should_flush() {
                self.flush(locator)?;
            }
            if self.counters.ingested % self.config.progress_every == 0 {
                self.report_progress(AcesReader::position(reader));
            }
        }
        Ok(())
    }

    /// Flush whatever is buffered. Empty buffers do not count as a batch.
    fn flush(&mut self, locator: RecordLocator) -> Result<(), RunFailure> {
        if self.batcher.is_empty() {
            return Ok(());
        }
        self.machine.advance(RunState::Flushing)?;
        let flushed = self.batcher.flush(&mut *self.store);
        if let Err(err) = flushed {
            return Err(RunFailure::from_store(err, locator));
        }
        self.machine.advance(RunState::Streaming)
    }

    fn report_progress(&self, byte_offset: u64) {
        let seconds = self.started.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let applications_per_sec =
            if seconds > 0.0 { self.counters.ingested as f64 / seconds } else { 0.0 };
        let progress = IngestProgress {
            applications: self.counters.ingested,
            skipped: self.counters.skipped,
            batches_flushed: self.batcher.flushes(),
            byte_offset,
            elapsed_ms: elapsed_ms(self.started),
            applications_per_sec,
        };
        tracing::info!(
            applications = progress.applications,
            skipped = progress.skipped,
            batches = progress.batches_flushed,
            applications_per_sec,
            "ingest progress"
        );
        if let Some(callback) = &self.hooks.progress {
            callback(&progress);
        }
    }
}

fn abort<S: IngestStore + ?Sized>(
    store: &mut S,
    machine: &mut StateMachine,
    failure: RunFailure,
) -> RunFailure {
    let failure = machine.fail(failure);
    tracing::error!(class = %failure.class, locator = %failure.locator, message = %failure.message, "aborting ingest run");
    if let Err(err) = store.abort_run(&failure.to_string()) {
        tracing::error!(%err, "rollback failed");
    }
    failure
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}
