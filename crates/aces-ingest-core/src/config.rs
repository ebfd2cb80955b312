use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::error::ConfigError;
use crate::normalize::VehicleReferenceRule;

pub const DEFAULT_PROGRESS_EVERY: u64 = 10_000;
pub const DEFAULT_TOP_UNMAPPED: usize = 20;

/// Run options. Loaded from YAML, then overridden field by field from the command line.
///
/// ```yaml
/// batch_size: 10000
/// strict: false
/// keep_incomplete: true
/// vehicle_reference_rule: prefer-base-vehicle
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub transactional: bool,
    pub strict: bool,
    /// Land records that only miss required columns instead of skipping them. Lenient only.
    pub keep_incomplete: bool,
    pub progress_every: u64,
    pub vehicle_reference_rule: VehicleReferenceRule,
    pub verify: bool,
    pub top_unmapped: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            transactional: true,
            strict: true,
            keep_incomplete: false,
            progress_every: DEFAULT_PROGRESS_EVERY,
            vehicle_reference_rule: VehicleReferenceRule::default(),
            verify: true,
            top_unmapped: DEFAULT_TOP_UNMAPPED,
        }
    }
}

impl IngestConfig {
    /// # Errors
    /// Returns [`ConfigError`] for unreadable files, malformed YAML, unknown keys, or
    /// values rejected by [`IngestConfig::validate`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
        Self::from_yaml(&raw)
    }

    /// # Errors
    /// Returns [`ConfigError`] for malformed YAML, unknown keys, or invalid values.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config = if raw.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str::<Self>(raw).map_err(ConfigError::Parse)?
        };
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] when a value is out of range or options conflict.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.progress_every == 0 {
            return Err(ConfigError::Invalid("progress_every must be at least 1".to_string()));
        }
        if self.keep_incomplete && self.strict {
            return Err(ConfigError::Invalid(
                "keep_incomplete requires strict to be false".to_string(),
            ));
        }
        Ok(())
    }
}
