//! Store contract: typed row buffers in, one atomic commit out.
//!
//! The driver only talks to these traits. `aces-ingest-store-sqlite` is the production
//! implementation.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{
    ApplicationRow, DocumentHeader, QualifierRow, RawAttributeRow, VehicleFitmentRow,
    VehicleTypeRow,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// Lock contention or similar; retrying the whole run may succeed.
    Transient,
    Fatal,
}

impl StoreErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{} store error: {message}", .kind.as_str())]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Fatal, message: message.into() }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: StoreErrorKind::Transient, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Committed,
    Aborted,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "committed" => Some(Self::Committed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the store needs to know when a run opens.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RunContext {
    pub run_id: Ulid,
    pub source_file: Arc<str>,
    pub header: DocumentHeader,
    pub started_at: String,
    /// One outer transaction for the whole run. When false every insert call commits.
    pub transactional: bool,
    /// Purge the existing `source_file` scope before the first insert.
    pub replace_existing: bool,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RunCompletion {
    pub applications_ingested: u64,
    pub applications_skipped: u64,
    pub batches_flushed: u64,
    pub footer_record_count: Option<u64>,
    pub source_sha256: Option<String>,
    pub finished_at: String,
}

pub trait IngestStore {
    /// Open the run: start the outer transaction (when transactional), purge the scope
    /// when asked, and record the run row.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the scope is not empty and replacement was not requested,
    /// or on any store failure.
    fn begin_run(&mut self, run: &RunContext) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn insert_applications(&mut self, rows: &[ApplicationRow]) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn insert_fitments(&mut self, rows: &[VehicleFitmentRow]) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn insert_qualifiers(&mut self, rows: &[QualifierRow]) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn insert_vehicle_types(&mut self, rows: &[VehicleTypeRow]) -> Result<(), StoreError>;

    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn insert_raw_attributes(&mut self, rows: &[RawAttributeRow]) -> Result<(), StoreError>;

    /// Record completion counters and commit.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the commit fails; the run must then be aborted.
    fn commit_run(&mut self, completion: &RunCompletion) -> Result<(), StoreError>;

    /// Roll back the open run. Without an outer transaction, landed rows stay and the run
    /// row is marked aborted.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the rollback itself fails.
    fn abort_run(&mut self, reason: &str) -> Result<(), StoreError>;
}

/// Bookkeeping row for one ingested `source_file` scope.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub source_file: String,
    pub status: RunStatus,
    pub aces_version: Option<String>,
    pub header: DocumentHeader,
    pub source_sha256: Option<String>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub applications_ingested: u64,
    pub applications_skipped: u64,
    pub batches_flushed: u64,
    pub footer_record_count: Option<u64>,
    pub failure: Option<String>,
}

/// Landed-row counters for one scope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditCounts {
    pub applications: u64,
    pub applications_with_fitment: u64,
    pub applications_with_part_number: u64,
    pub applications_with_part_type: u64,
    pub fitments_without_vehicle_reference: u64,
    pub qualifiers: u64,
    pub applications_with_qualifiers: u64,
    pub notes: u64,
    pub applications_with_notes: u64,
    pub vehicle_types: u64,
    pub raw_attributes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UnmappedCount {
    pub attr_name: String,
    pub count: u64,
}

/// Read side used by the verifier.
pub trait AuditStore {
    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn run_record(&self, source_file: &str) -> Result<Option<RunRecord>, StoreError>;

    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn audit_counts(&self, source_file: &str) -> Result<AuditCounts, StoreError>;

    /// Non-note raw attribute names by descending count, ties by name.
    ///
    /// # Errors
    /// Returns [`StoreError`] on any store failure.
    fn unmapped_histogram(&self, source_file: &str, limit: usize) -> Result<Vec<UnmappedCount>, StoreError>;
}
