//! Per-table row buffers with threshold flushing.

use crate::model::{ApplicationRow, QualifierRow, RawAttributeRow, VehicleFitmentRow, VehicleTypeRow};
use crate::normalize::RowSet;
use crate::schema_map::{Entity, FLUSH_ORDER};
use crate::store::{IngestStore, StoreError};

pub const DEFAULT_BATCH_SIZE: usize = 5_000;

/// Rows written by one flush, per table.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FlushStats {
    pub applications: usize,
    pub fitments: usize,
    pub qualifiers: usize,
    pub vehicle_types: usize,
    pub raw_attributes: usize,
}

impl FlushStats {
    #[must_use]
    pub fn total(&self) -> usize {
        self.applications + self.fitments + self.qualifiers + self.vehicle_types + self.raw_attributes
    }
}

#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    applications: Vec<ApplicationRow>,
    fitments: Vec<VehicleFitmentRow>,
    qualifiers: Vec<QualifierRow>,
    vehicle_types: Vec<VehicleTypeRow>,
    raw_attributes: Vec<RawAttributeRow>,
    flushes: u64,
}

impl Batcher {
    #[must_use]
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            applications: Vec::with_capacity(batch_size),
            fitments: Vec::with_capacity(batch_size),
            qualifiers: Vec::new(),
            vehicle_types: Vec::new(),
            raw_attributes: Vec::new(),
            flushes: 0,
        }
    }

    pub fn push(&mut self, rows: RowSet) {
        self.applications.push(rows.application);
        self.fitments.push(rows.fitment);
        self.qualifiers.extend(rows.qualifiers);
        self.vehicle_types.extend(rows.vehicle_types);
        self.raw_attributes.extend(rows.raw_attributes);
    }

    /// True once any single buffer has reached the batch size.
    #[must_use]
    pub fn should_flush(&self) -> bool {
        [
            self.applications.len(),
            self.fitments.len(),
            self.qualifiers.len(),
            self.vehicle_types.len(),
            self.raw_attributes.len(),
        ]
        .into_iter()
        .any(|len| len >= self.batch_size)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
            && self.fitments.is_empty()
            && self.qualifiers.is_empty()
            && self.vehicle_types.is_empty()
            && self.raw_attributes.is_empty()
    }

    /// Number of non-empty flushes so far.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Write every buffer in parent-first order. An empty flush is a no-op and not counted.
    ///
    /// # Errors
    /// Returns the first [`StoreError`]; the buffers are left as they were at that point.
    pub fn flush<S: IngestStore + ?Sized>(&mut self, store: &mut S) -> Result<Option<FlushStats>, StoreError> {
        if self.is_empty() {
            return Ok(None);
        }
        let mut stats = FlushStats::default();
        for entity in FLUSH_ORDER {
            match entity {
                Entity::Application if !self.applications.is_empty() => {
                    store.insert_applications(&self.applications)?;
                    stats.applications = self.applications.len();
                    self.applications.clear();
                }
                Entity::VehicleFitment if !self.fitments.is_empty() => {
                    store.insert_fitments(&self.fitments)?;
                    stats.fitments = self.fitments.len();
                    self.fitments.clear();
                }
                Entity::Qualifier if !self.qualifiers.is_empty() => {
                    store.insert_qualifiers(&self.qualifiers)?;
                    stats.qualifiers = self.qualifiers.len();
                    self.qualifiers.clear();
                }
                Entity::VehicleType if !self.vehicle_types.is_empty() => {
                    store.insert_vehicle_types(&self.vehicle_types)?;
                    stats.vehicle_types = self.vehicle_types.len();
                    self.vehicle_types.clear();
                }
                Entity::RawAttribute if !self.raw_attributes.is_empty() => {
                    store.insert_raw_attributes(&self.raw_attributes)?;
                    stats.raw_attributes = self.raw_attributes.len();
                    self.raw_attributes.clear();
                }
                _ => {}
            }
        }
        self.flushes += 1;
        tracing::debug!(flush = self.flushes, rows = stats.total(), "flushed batch");
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::model::RawKind;
    use crate::store::memory::MemoryStore;

    fn row_set(app_id: i64, notes: usize) -> RowSet {
        let source: Arc<str> = Arc::from("batch.xml");
        RowSet {
            application: ApplicationRow::new(Arc::clone(&source), app_id),
            fitment: VehicleFitmentRow::new(Arc::clone(&source), app_id),
            qualifiers: Vec::new(),
            vehicle_types: Vec::new(),
            raw_attributes: (0..notes)
                .map(|idx| RawAttributeRow {
                    source_file: Arc::clone(&source),
                    app_id,
                    idx: u32::try_from(idx).unwrap_or(u32::MAX),
                    attr_kind: RawKind::Element,
                    attr_name: "note".into(),
                    attr_id: None,
                    attr_value: Some(format!("note {idx}")),
                })
                .collect(),
            issues: Vec::new(),
        }
    }

    #[test]
    fn flush_triggers_at_threshold_of_any_buffer() {
        let mut batcher = Batcher::new(3);
        batcher.push(row_set(1, 0));
        batcher.push(row_set(2, 0));
        assert!(!batcher.should_flush());
        batcher.push(row_set(3, 0));
        assert!(batcher.should_flush());

        let mut notes_heavy = Batcher::new(3);
        notes_heavy.push(row_set(1, 3));
        assert!(notes_heavy.should_flush());
    }

    #[test]
    fn flush_writes_parents_first_and_counts_only_non_empty() -> Result<(), StoreError> {
        let mut store = MemoryStore::default();
        let mut batcher = Batcher::new(10);
        batcher.push(row_set(1, 2));
        batcher.push(row_set(2, 0));

        let stats = batcher.flush(&mut store)?;
        assert_eq!(
            stats,
            Some(FlushStats { applications: 2, fitments: 2, qualifiers: 0, vehicle_types: 0, raw_attributes: 2 })
        );
        assert_eq!(store.insert_calls, 3);
        assert!(batcher.is_empty());
        assert_eq!(batcher.flush(&mut store)?, None);
        assert_eq!(batcher.flushes(), 1);
        assert_eq!(store.tables.applications.iter().map(|row| row.app_id).collect::<Vec<_>>(), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn failed_flush_surfaces_the_store_error() {
        let mut store = MemoryStore::default();
        store.fail_insert = Some((2, StoreError::transient("database is locked")));
        let mut batcher = Batcher::new(10);
        batcher.push(row_set(1, 0));
        let result = batcher.flush(&mut store);
        assert_eq!(result, Err(StoreError::transient("database is locked")));
        assert_eq!(batcher.flushes(), 0);
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let mut batcher = Batcher::new(0);
        batcher.push(row_set(1, 0));
        assert!(batcher.should_flush());
    }
}
