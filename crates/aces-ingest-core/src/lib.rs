//! ACES XML ingestion core.
//!
//! Streams an ACES document one `<App>` at a time, normalises each application into a
//! primary row plus side tables, lands the rows through an [`IngestStore`] in batches
//! under one transaction, and audits the result with [`verify`].

pub mod batch;
pub mod config;
pub mod driver;
pub mod error;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod schema_map;
pub mod store;
pub mod tree;
pub mod verify;

pub use batch::{Batcher, FlushStats, DEFAULT_BATCH_SIZE};
pub use config::IngestConfig;
pub use driver::{
    ingest, ingest_file, CancellationToken, IngestProgress, IngestRequest, ProgressCallback,
    RunHooks, RunState, RunSummary,
};
pub use error::{ConfigError, FailureClass, IngestError, RunFailure};
pub use model::{
    AppAction, ApplicationRow, DocumentFooter, DocumentHeader, QualifierRow, RawAttributeRow,
    RawKind, RecordLocator, Value, VehicleFitmentRow, VehicleTypeRow,
};
pub use normalize::{
    normalize_app, NormalizeError, NormalizeOptions, RecordIssue, RowSet, VehicleReferenceRule,
};
pub use parser::{AcesReader, AppRecord, ParseError};
pub use store::{
    AuditCounts, AuditStore, IngestStore, RunCompletion, RunContext, RunRecord, RunStatus,
    StoreError, StoreErrorKind, UnmappedCount,
};
pub use tree::XmlNode;
pub use verify::{verify, VerificationReport};
