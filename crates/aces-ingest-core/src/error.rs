use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::driver::RunState;
use crate::model::RecordLocator;
use crate::parser::ParseError;
use crate::store::{StoreError, StoreErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a run did not commit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum FailureClass {
    ParseFatal,
    RecordInvalid,
    StoreTransient,
    StoreFatal,
    Cancelled,
    /// The driver attempted an illegal state transition.
    Internal,
}

impl FailureClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseFatal => "ParseFatal",
            Self::RecordInvalid => "RecordInvalid",
            Self::StoreTransient => "StoreTransient",
            Self::StoreFatal => "StoreFatal",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        }
    }
}

impl Display for FailureClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StoreErrorKind> for FailureClass {
    fn from(kind: StoreErrorKind) -> Self {
        match kind {
            StoreErrorKind::Transient => Self::StoreTransient,
            StoreErrorKind::Fatal => Self::StoreFatal,
        }
    }
}

/// A rolled-back run. `Display` is the single diagnostic line shown to operators.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, Eq, PartialEq)]
#[error("{class}: {message} [{locator}; last successful batch {last_successful_batch}]")]
pub struct RunFailure {
    pub class: FailureClass,
    pub message: String,
    pub locator: RecordLocator,
    pub last_successful_batch: u64,
    /// Where the run state machine stopped; `Aborted` once the driver has rolled back.
    pub state: RunState,
}

impl RunFailure {
    #[must_use]
    pub fn new(class: FailureClass, message: impl Into<String>, locator: RecordLocator) -> Self {
        Self { class, message: message.into(), locator, last_successful_batch: 0, state: RunState::Idle }
    }

    #[must_use]
    pub fn from_parse(err: ParseError) -> Self {
        match err {
            ParseError::Fatal { offset, message } => Self::new(
                FailureClass::ParseFatal,
                message,
                RecordLocator { app_id: None, byte_offset: Some(offset) },
            ),
            ParseError::Record { offset, app_id, reason } => Self::new(
                FailureClass::RecordInvalid,
                reason,
                RecordLocator { app_id, byte_offset: Some(offset) },
            ),
        }
    }

    #[must_use]
    pub fn from_store(err: StoreError, locator: RecordLocator) -> Self {
        Self::new(err.kind.into(), err.message, locator)
    }

    #[must_use]
    pub fn after_batch(mut self, batch: u64) -> Self {
        self.last_successful_batch = batch;
        self
    }
}

/// Failure of a whole ingest request, including problems before the run could start.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("cannot read input {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Run(#[from] RunFailure),
}
