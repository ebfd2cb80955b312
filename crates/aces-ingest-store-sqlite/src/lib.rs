use std::path::Path;

use aces_ingest_core::schema_map::{FITMENT_COLUMNS, NOTE_ATTR_NAME};
use aces_ingest_core::{
    AppAction, ApplicationRow, AuditCounts, AuditStore, DocumentHeader, IngestStore, QualifierRow,
    RawAttributeRow, RunCompletion, RunContext, RunRecord, RunStatus, StoreError, UnmappedCount,
    VehicleFitmentRow, VehicleTypeRow,
};
use anyhow::{anyhow, bail, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS ingest_runs (
  source_file TEXT PRIMARY KEY,
  run_id TEXT NOT NULL UNIQUE,
  status TEXT NOT NULL CHECK (status IN ('running','committed','aborted')),
  aces_version TEXT,
  header_json TEXT NOT NULL,
  source_sha256 TEXT,
  started_at TEXT NOT NULL,
  finished_at TEXT,
  applications_ingested INTEGER NOT NULL DEFAULT 0 CHECK (applications_ingested >= 0),
  applications_skipped INTEGER NOT NULL DEFAULT 0 CHECK (applications_skipped >= 0),
  batches_flushed INTEGER NOT NULL DEFAULT 0 CHECK (batches_flushed >= 0),
  footer_record_count INTEGER,
  failure TEXT
);

CREATE TABLE IF NOT EXISTS aces_applications (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_file TEXT NOT NULL,
  app_id INTEGER NOT NULL,
  action TEXT CHECK (action IS NULL OR action IN ('A','D')),
  validate TEXT,
  part_number TEXT,
  part_type_id INTEGER,
  quantity INTEGER,
  position_id INTEGER,
  brand_aaiaid TEXT,
  subbrand_aaiaid TEXT,
  mfr_label TEXT,
  display_order INTEGER,
  asset_name TEXT,
  asset_item_order INTEGER,
  asset_item_ref TEXT,
  UNIQUE(app_id, source_file),
  FOREIGN KEY (source_file) REFERENCES ingest_runs(source_file) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS aces_vehicle_fitments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_file TEXT NOT NULL,
  app_id INTEGER NOT NULL,
  has_vehicle_reference INTEGER NOT NULL CHECK (has_vehicle_reference IN (0,1)),
  base_vehicle_id INTEGER,
  year_from INTEGER,
  year_to INTEGER,
  make_id INTEGER,
  model_id INTEGER,
  submodel_id INTEGER,
  engine_base_id INTEGER,
  engine_block_id INTEGER,
  engine_config_id INTEGER,
  engine_designation_id INTEGER,
  engine_vin_id INTEGER,
  engine_version_id INTEGER,
  engine_mfr_id INTEGER,
  fuel_type_id INTEGER,
  fuel_delivery_type_id INTEGER,
  fuel_delivery_subtype_id INTEGER,
  fuel_system_control_type_id INTEGER,
  fuel_system_design_id INTEGER,
  aspiration_id INTEGER,
  cylinder_head_type_id INTEGER,
  ignition_system_type_id INTEGER,
  power_output_id INTEGER,
  body_type_id INTEGER,
  body_num_doors_id INTEGER,
  drive_type_id INTEGER,
  mfr_body_code_id INTEGER,
  wheel_base_id INTEGER,
  bed_length_id INTEGER,
  bed_type_id INTEGER,
  brake_abs_id INTEGER,
  brake_system_id INTEGER,
  front_brake_type_id INTEGER,
  rear_brake_type_id INTEGER,
  front_spring_type_id INTEGER,
  rear_spring_type_id INTEGER,
  steering_system_id INTEGER,
  steering_type_id INTEGER,
  transmission_id INTEGER,
  transmission_base_id INTEGER,
  transmission_type_id INTEGER,
  transmission_control_type_id INTEGER,
  transmission_num_speeds_id INTEGER,
  trans_elec_controlled_id INTEGER,
  transmission_mfr_code_id INTEGER,
  transmission_mfr_id INTEGER,
  region_id INTEGER,
  UNIQUE(app_id, source_file),
  FOREIGN KEY (app_id, source_file)
    REFERENCES aces_applications(app_id, source_file) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS aces_qualifiers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_file TEXT NOT NULL,
  app_id INTEGER NOT NULL,
  idx INTEGER NOT NULL CHECK (idx >= 0),
  qual_id INTEGER,
  qual_text TEXT,
  param_1 TEXT,
  param_2 TEXT,
  param_3 TEXT,
  UNIQUE(app_id, source_file, idx),
  FOREIGN KEY (app_id, source_file)
    REFERENCES aces_applications(app_id, source_file) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS aces_vehicle_types (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_file TEXT NOT NULL,
  app_id INTEGER NOT NULL,
  idx INTEGER NOT NULL CHECK (idx >= 0),
  vehicle_type_id INTEGER NOT NULL,
  UNIQUE(app_id, source_file, idx),
  FOREIGN KEY (app_id, source_file)
    REFERENCES aces_applications(app_id, source_file) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS aces_raw_attributes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source_file TEXT NOT NULL,
  app_id INTEGER NOT NULL,
  idx INTEGER NOT NULL CHECK (idx >= 0),
  attr_kind TEXT NOT NULL CHECK (attr_kind IN ('element','attribute')),
  attr_name TEXT NOT NULL,
  attr_id TEXT,
  attr_value TEXT,
  UNIQUE(app_id, source_file, attr_name, idx),
  FOREIGN KEY (app_id, source_file)
    REFERENCES aces_applications(app_id, source_file) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_aces_applications_source_file
  ON aces_applications(source_file);
CREATE INDEX IF NOT EXISTS idx_aces_vehicle_fitments_source_file
  ON aces_vehicle_fitments(source_file);
CREATE INDEX IF NOT EXISTS idx_aces_qualifiers_source_file ON aces_qualifiers(source_file);
CREATE INDEX IF NOT EXISTS idx_aces_vehicle_types_source_file
  ON aces_vehicle_types(source_file);
CREATE INDEX IF NOT EXISTS idx_aces_raw_attributes_source_name
  ON aces_raw_attributes(source_file, attr_name);
";

const INSERT_APPLICATION_SQL: &str = r"
INSERT INTO aces_applications(
  source_file, app_id, action, validate, part_number, part_type_id, quantity, position_id,
  brand_aaiaid, subbrand_aaiaid, mfr_label, display_order, asset_name, asset_item_order,
  asset_item_ref
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
";

const INSERT_QUALIFIER_SQL: &str = r"
INSERT INTO aces_qualifiers(
  source_file, app_id, idx, qual_id, qual_text, param_1, param_2, param_3
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
";

const INSERT_VEHICLE_TYPE_SQL: &str = r"
INSERT INTO aces_vehicle_types(source_file, app_id, idx, vehicle_type_id)
VALUES (?1, ?2, ?3, ?4)
";

const INSERT_RAW_ATTRIBUTE_SQL: &str = r"
INSERT INTO aces_raw_attributes(
  source_file, app_id, idx, attr_kind, attr_name, attr_id, attr_value
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
";

const SELECT_RUN_SQL: &str = r"
SELECT run_id, source_file, status, aces_version, header_json, source_sha256, started_at,
       finished_at, applications_ingested, applications_skipped, batches_flushed,
       footer_record_count, failure
FROM ingest_runs
";

/// Leading columns of the fitment insert that precede [`FITMENT_COLUMNS`].
const FITMENT_KEY_COLUMNS: [&str; 3] = ["source_file", "app_id", "has_vehicle_reference"];

pub struct SqliteStore {
    conn: Connection,
    open_run: Option<OpenRun>,
}

#[derive(Debug, Clone)]
struct OpenRun {
    run_id: String,
    source_file: String,
    transactional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PurgeSummary {
    pub source_file: String,
    /// The run that owned the scope, if one was recorded.
    pub run_id: Option<String>,
    pub applications_removed: u64,
}

impl SqliteStore {
    /// Open a SQLite-backed ACES store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, open_run: None })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "aces_applications")? {
            apply_migration_1(&self.conn)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "aces_applications", "app_id")? {
            // Tables exist from an earlier bootstrap that never recorded its version.
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: aces_applications has no app_id column"))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Delete one `source_file` scope: its run row, applications, and every side row.
    ///
    /// # Errors
    /// Returns an error when a run is open on this connection or the delete fails.
    pub fn purge_source_file(&mut self, source_file: &str) -> Result<PurgeSummary> {
        if let Some(open) = &self.open_run {
            bail!("cannot purge while run {} is open on this connection", open.run_id);
        }
        let tx = self.conn.transaction().context("failed to start purge transaction")?;
        let run_id = tx
            .query_row(
                "SELECT run_id FROM ingest_runs WHERE source_file = ?1",
                params![source_file],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up run for {source_file}"))?;
        let applications_removed = purge_scope(&tx, source_file)?;
        tx.commit().context("failed to commit purge transaction")?;

        tracing::info!(source_file, applications_removed, "purged source_file scope");
        Ok(PurgeSummary { source_file: source_file.to_string(), run_id, applications_removed })
    }

    /// Every recorded run, oldest first.
    ///
    /// # Errors
    /// Returns an error when the run table cannot be read or a row is malformed.
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_RUN_SQL} ORDER BY started_at ASC, source_file ASC"))
            .context("failed to prepare run listing")?;
        let rows = stmt.query_map([], RawRunRow::from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_record()?);
        }
        Ok(runs)
    }

    fn open_scope(&self, run: &RunContext) -> Result<()> {
        let source_file = &*run.source_file;
        let existing = self
            .conn
            .query_row(
                "SELECT run_id, status FROM ingest_runs WHERE source_file = ?1",
                params![source_file],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to look up existing run for {source_file}"))?;

        if let Some((run_id, status)) = existing {
            if !run.replace_existing {
                bail!(
                    "source_file {source_file} already ingested by run {run_id} ({status}); \
                     request replacement to overwrite it"
                );
            }
            let removed = purge_scope(&self.conn, source_file)?;
            tracing::info!(source_file, previous_run = %run_id, removed, "replacing scope");
        }

        let header_json =
            serde_json::to_string(&run.header).context("failed to serialize document header")?;
        self.conn
            .execute(
                "INSERT INTO ingest_runs(
                    source_file, run_id, status, aces_version, header_json, started_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    source_file,
                    run.run_id.to_string(),
                    RunStatus::Running.as_str(),
                    run.header.aces_version,
                    header_json,
                    run.started_at,
                ],
            )
            .with_context(|| format!("failed to record ingest run for {source_file}"))?;
        Ok(())
    }

    fn begin(&mut self, run: &RunContext) -> Result<()> {
        if let Some(open) = &self.open_run {
            bail!("run {} is already open on this connection", open.run_id);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE").context("failed to begin ingest transaction")?;
        if let Err(err) = self.open_scope(run) {
            rollback(&self.conn);
            return Err(err);
        }
        if !run.transactional {
            self.conn.execute_batch("COMMIT").context("failed to commit ingest run row")?;
        }
        self.open_run = Some(OpenRun {
            run_id: run.run_id.to_string(),
            source_file: run.source_file.to_string(),
            transactional: run.transactional,
        });
        Ok(())
    }

    /// Run `write` inside the outer transaction, or inside its own when the run is not
    /// transactional.
    fn write_batch<F>(&mut self, table: &str, rows: usize, write: F) -> Result<(), StoreError>
    where
        F: FnOnce(&Connection) -> Result<()>,
    {
        let transactional = match &self.open_run {
            Some(open) => open.transactional,
            None => return Err(StoreError::fatal(format!("no open ingest run for {table} insert"))),
        };
        let result = if transactional {
            write(&self.conn)
        } else {
            autocommit(&mut self.conn, write)
        };
        result
            .with_context(|| format!("failed to insert {rows} rows into {table}"))
            .map_err(|err| classify(&err))?;
        tracing::debug!(table, rows, "inserted batch");
        Ok(())
    }

    fn finish(&self, open: &OpenRun, completion: &RunCompletion) -> Result<()> {
        self.conn
            .execute(
                "UPDATE ingest_runs SET
                    status = ?2,
                    finished_at = ?3,
                    applications_ingested = ?4,
                    applications_skipped = ?5,
                    batches_flushed = ?6,
                    footer_record_count = ?7,
                    source_sha256 = ?8
                 WHERE run_id = ?1",
                params![
                    open.run_id,
                    RunStatus::Committed.as_str(),
                    completion.finished_at,
                    to_sql_count(completion.applications_ingested)?,
                    to_sql_count(completion.applications_skipped)?,
                    to_sql_count(completion.batches_flushed)?,
                    completion.footer_record_count.map(to_sql_count).transpose()?,
                    completion.source_sha256,
                ],
            )
            .with_context(|| format!("failed to record completion of run {}", open.run_id))?;
        if open.transactional {
            self.conn.execute_batch("COMMIT").context("failed to commit ingest transaction")?;
        }
        Ok(())
    }

    fn rollback_or_mark(&self, open: &OpenRun, reason: &str) -> Result<()> {
        if open.transactional {
            // SQLite may already have rolled back on errors such as SQLITE_FULL.
            if !self.conn.is_autocommit() {
                self.conn.execute_batch("ROLLBACK").context("failed to roll back ingest run")?;
            }
            return Ok(());
        }
        self.conn
            .execute(
                "UPDATE ingest_runs SET status = ?2, failure = ?3, finished_at = ?4
                 WHERE run_id = ?1",
                params![open.run_id, RunStatus::Aborted.as_str(), reason, now_rfc3339()?],
            )
            .with_context(|| format!("failed to mark run {} aborted", open.run_id))?;
        Ok(())
    }

    fn count(&self, sql: &str, source_file: &str) -> Result<u64> {
        let value = self
            .conn
            .query_row(sql, params![source_file], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run audit query for {source_file}"))?;
        from_sql_count(value)
    }

    fn counts(&self, source_file: &str) -> Result<AuditCounts> {
        Ok(AuditCounts {
            applications: self
                .count("SELECT COUNT(*) FROM aces_applications WHERE source_file = ?1", source_file)?,
            applications_with_fitment: self.count(
                "SELECT COUNT(*) FROM aces_applications a
                 JOIN aces_vehicle_fitments f
                   ON f.app_id = a.app_id AND f.source_file = a.source_file
                 WHERE a.source_file = ?1",
                source_file,
            )?,
            applications_with_part_number: self.count(
                "SELECT COUNT(*) FROM aces_applications
                 WHERE source_file = ?1 AND part_number IS NOT NULL AND TRIM(part_number) <> ''",
                source_file,
            )?,
            applications_with_part_type: self.count(
                "SELECT COUNT(*) FROM aces_applications
                 WHERE source_file = ?1 AND part_type_id IS NOT NULL",
                source_file,
            )?,
            fitments_without_vehicle_reference: self.count(
                "SELECT COUNT(*) FROM aces_vehicle_fitments
                 WHERE source_file = ?1 AND has_vehicle_reference = 0",
                source_file,
            )?,
            qualifiers: self
                .count("SELECT COUNT(*) FROM aces_qualifiers WHERE source_file = ?1", source_file)?,
            applications_with_qualifiers: self.count(
                "SELECT COUNT(DISTINCT app_id) FROM aces_qualifiers WHERE source_file = ?1",
                source_file,
            )?,
            notes: self.count(
                &format!(
                    "SELECT COUNT(*) FROM aces_raw_attributes
                     WHERE source_file = ?1 AND attr_name = '{NOTE_ATTR_NAME}'"
                ),
                source_file,
            )?,
            applications_with_notes: self.count(
                &format!(
                    "SELECT COUNT(DISTINCT app_id) FROM aces_raw_attributes
                     WHERE source_file = ?1 AND attr_name = '{NOTE_ATTR_NAME}'"
                ),
                source_file,
            )?,
            vehicle_types: self.count(
                "SELECT COUNT(*) FROM aces_vehicle_types WHERE source_file = ?1",
                source_file,
            )?,
            raw_attributes: self.count(
                "SELECT COUNT(*) FROM aces_raw_attributes WHERE source_file = ?1",
                source_file,
            )?,
        })
    }

    fn histogram(&self, source_file: &str, limit: usize) -> Result<Vec<UnmappedCount>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT attr_name, COUNT(*) AS occurrences FROM aces_raw_attributes
                 WHERE source_file = ?1 AND attr_name <> ?2
                 GROUP BY attr_name
                 ORDER BY occurrences DESC, attr_name ASC
                 LIMIT ?3",
            )
            .context("failed to prepare unmapped histogram query")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![source_file, NOTE_ATTR_NAME, limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut histogram = Vec::new();
        for row in rows {
            let (attr_name, count) = row?;
            histogram.push(UnmappedCount { attr_name, count: from_sql_count(count)? });
        }
        Ok(histogram)
    }

    fn run(&self, source_file: &str) -> Result<Option<RunRecord>> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_RUN_SQL} WHERE source_file = ?1"),
                params![source_file],
                RawRunRow::from_row,
            )
            .optional()
            .with_context(|| format!("failed to read run for {source_file}"))?;
        raw.map(RawRunRow::into_record).transpose()
    }
}

impl IngestStore for SqliteStore {
    fn begin_run(&mut self, run: &RunContext) -> Result<(), StoreError> {
        self.begin(run).map_err(|err| classify(&err))?;
        tracing::debug!(
            run_id = %run.run_id,
            source_file = %run.source_file,
            transactional = run.transactional,
            "opened ingest run"
        );
        Ok(())
    }

    fn insert_applications(&mut self, rows: &[ApplicationRow]) -> Result<(), StoreError> {
        self.write_batch("aces_applications", rows.len(), |conn| insert_applications(conn, rows))
    }

    fn insert_fitments(&mut self, rows: &[VehicleFitmentRow]) -> Result<(), StoreError> {
        self.write_batch("aces_vehicle_fitments", rows.len(), |conn| insert_fitments(conn, rows))
    }

    fn insert_qualifiers(&mut self, rows: &[QualifierRow]) -> Result<(), StoreError> {
        self.write_batch("aces_qualifiers", rows.len(), |conn| insert_qualifiers(conn, rows))
    }

    fn insert_vehicle_types(&mut self, rows: &[VehicleTypeRow]) -> Result<(), StoreError> {
        self.write_batch("aces_vehicle_types", rows.len(), |conn| insert_vehicle_types(conn, rows))
    }

    fn insert_raw_attributes(&mut self, rows: &[RawAttributeRow]) -> Result<(), StoreError> {
        self.write_batch("aces_raw_attributes", rows.len(), |conn| {
            insert_raw_attributes(conn, rows)
        })
    }

    fn commit_run(&mut self, completion: &RunCompletion) -> Result<(), StoreError> {
        let open = self.open_run.clone().ok_or_else(|| StoreError::fatal("no open ingest run"))?;
        self.finish(&open, completion).map_err(|err| classify(&err))?;
        self.open_run = None;
        tracing::debug!(run_id = %open.run_id, source_file = %open.source_file, "committed run");
        Ok(())
    }

    fn abort_run(&mut self, reason: &str) -> Result<(), StoreError> {
        let Some(open) = self.open_run.take() else {
            return Ok(());
        };
        self.rollback_or_mark(&open, reason).map_err(|err| classify(&err))?;
        tracing::debug!(run_id = %open.run_id, source_file = %open.source_file, "rolled back run");
        Ok(())
    }
}

impl AuditStore for SqliteStore {
    fn run_record(&self, source_file: &str) -> Result<Option<RunRecord>, StoreError> {
        self.run(source_file).map_err(|err| classify(&err))
    }

    fn audit_counts(&self, source_file: &str) -> Result<AuditCounts, StoreError> {
        self.counts(source_file).map_err(|err| classify(&err))
    }

    fn unmapped_histogram(
        &self,
        source_file: &str,
        limit: usize,
    ) -> Result<Vec<UnmappedCount>, StoreError> {
        self.histogram(source_file, limit).map_err(|err| classify(&err))
    }
}

/// Column-typed copy of an `ingest_runs` row, decoded before leaving the rusqlite closure.
struct RawRunRow {
    run_id: String,
    source_file: String,
    status: String,
    aces_version: Option<String>,
    header_json: String,
    source_sha256: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    applications_ingested: i64,
    applications_skipped: i64,
    batches_flushed: i64,
    footer_record_count: Option<i64>,
    failure: Option<String>,
}

impl RawRunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            source_file: row.get(1)?,
            status: row.get(2)?,
            aces_version: row.get(3)?,
            header_json: row.get(4)?,
            source_sha256: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            applications_ingested: row.get(8)?,
            applications_skipped: row.get(9)?,
            batches_flushed: row.get(10)?,
            footer_record_count: row.get(11)?,
            failure: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        let status = RunStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("unknown run status `{}` for {}", self.status, self.run_id))?;
        let header = serde_json::from_str::<DocumentHeader>(&self.header_json)
            .with_context(|| format!("invalid header_json for run {}", self.run_id))?;
        Ok(RunRecord {
            run_id: self.run_id,
            source_file: self.source_file,
            status,
            aces_version: self.aces_version,
            header,
            source_sha256: self.source_sha256,
            started_at: self.started_at,
            finished_at: self.finished_at,
            applications_ingested: from_sql_count(self.applications_ingested)?,
            applications_skipped: from_sql_count(self.applications_skipped)?,
            batches_flushed: from_sql_count(self.batches_flushed)?,
            footer_record_count: self.footer_record_count.map(from_sql_count).transpose()?,
            failure: self.failure,
        })
    }
}

fn insert_applications(conn: &Connection, rows: &[ApplicationRow]) -> Result<()> {
    let mut stmt =
        conn.prepare_cached(INSERT_APPLICATION_SQL).context("failed to prepare application insert")?;
    for row in rows {
        stmt.execute(params![
            &*row.source_file,
            row.app_id,
            row.action.map(AppAction::as_str),
            row.validate,
            row.part_number,
            row.part_type_id,
            row.quantity,
            row.position_id,
            row.brand_aaiaid,
            row.subbrand_aaiaid,
            row.mfr_label,
            row.display_order,
            row.asset_name,
            row.asset_item_order,
            row.asset_item_ref,
        ])
        .with_context(|| format!("failed to insert application app_id={}", row.app_id))?;
    }
    Ok(())
}

fn fitment_insert_sql() -> String {
    let columns = FITMENT_KEY_COLUMNS
        .iter()
        .chain(FITMENT_COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len()).map(|n| format!("?{n}")).collect::<Vec<_>>();
    format!(
        "INSERT INTO aces_vehicle_fitments({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn insert_fitments(conn: &Connection, rows: &[VehicleFitmentRow]) -> Result<()> {
    let mut stmt =
        conn.prepare_cached(&fitment_insert_sql()).context("failed to prepare fitment insert")?;
    for row in rows {
        if let Some(column) = row.values.keys().find(|column| !FITMENT_COLUMNS.contains(*column)) {
            bail!("fitment for app_id={} carries unknown column {column}", row.app_id);
        }
        let mut values = Vec::with_capacity(FITMENT_KEY_COLUMNS.len() + FITMENT_COLUMNS.len());
        values.push(SqlValue::Text(row.source_file.to_string()));
        values.push(SqlValue::Integer(row.app_id));
        values.push(SqlValue::Integer(i64::from(row.has_vehicle_reference())));
        values.extend(
            FITMENT_COLUMNS.iter().map(|column| row.get(column).map_or(SqlValue::Null, SqlValue::Integer)),
        );
        stmt.execute(params_from_iter(values))
            .with_context(|| format!("failed to insert fitment app_id={}", row.app_id))?;
    }
    Ok(())
}

fn insert_qualifiers(conn: &Connection, rows: &[QualifierRow]) -> Result<()> {
    let mut stmt =
        conn.prepare_cached(INSERT_QUALIFIER_SQL).context("failed to prepare qualifier insert")?;
    for row in rows {
        stmt.execute(params![
            &*row.source_file,
            row.app_id,
            i64::from(row.idx),
            row.qual_id,
            row.qual_text,
            row.param_1,
            row.param_2,
            row.param_3,
        ])
        .with_context(|| format!("failed to insert qualifier app_id={} idx={}", row.app_id, row.idx))?;
    }
    Ok(())
}

fn insert_vehicle_types(conn: &Connection, rows: &[VehicleTypeRow]) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(INSERT_VEHICLE_TYPE_SQL)
        .context("failed to prepare vehicle type insert")?;
    for row in rows {
        stmt.execute(params![&*row.source_file, row.app_id, i64::from(row.idx), row.vehicle_type_id])
            .with_context(|| {
                format!("failed to insert vehicle type app_id={} idx={}", row.app_id, row.idx)
            })?;
    }
    Ok(())
}

fn insert_raw_attributes(conn: &Connection, rows: &[RawAttributeRow]) -> Result<()> {
    let mut stmt = conn
        .prepare_cached(INSERT_RAW_ATTRIBUTE_SQL)
        .context("failed to prepare raw attribute insert")?;
    for row in rows {
        stmt.execute(params![
            &*row.source_file,
            row.app_id,
            i64::from(row.idx),
            row.attr_kind.as_str(),
            row.attr_name,
            row.attr_id,
            row.attr_value,
        ])
        .with_context(|| {
            format!(
                "failed to insert raw attribute {} app_id={} idx={}",
                row.attr_name, row.app_id, row.idx
            )
        })?;
    }
    Ok(())
}

fn autocommit<F>(conn: &mut Connection, write: F) -> Result<()>
where
    F: FnOnce(&Connection) -> Result<()>,
{
    let tx = conn.transaction().context("failed to start batch transaction")?;
    write(&tx)?;
    tx.commit().context("failed to commit batch transaction")
}

fn rollback(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        tracing::warn!(error = %err, "rollback after failed run open did not complete");
    }
}

/// Remove a scope. Applications and side rows go through `ON DELETE CASCADE`.
fn purge_scope(conn: &Connection, source_file: &str) -> Result<u64> {
    let applications = conn
        .query_row(
            "SELECT COUNT(*) FROM aces_applications WHERE source_file = ?1",
            params![source_file],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to count applications for {source_file}"))?;
    conn.execute("DELETE FROM ingest_runs WHERE source_file = ?1", params![source_file])
        .with_context(|| format!("failed to purge scope {source_file}"))?;
    from_sql_count(applications)
}

/// Busy and locked databases are worth retrying; everything else is not.
fn classify(err: &anyhow::Error) -> StoreError {
    let message = format!("{err:#}");
    let transient = err
        .chain()
        .filter_map(|cause| cause.downcast_ref::<rusqlite::Error>())
        .any(|cause| {
            matches!(
                cause.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            )
        });
    if transient {
        StoreError::transient(message)
    } else {
        StoreError::fatal(message)
    }
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("count {value} does not fit in an sqlite integer"))
}

fn from_sql_count(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("negative count {value} in store"))
}

fn apply_migration_1(conn: &Connection) -> Result<()> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 001")?;
    record_schema_version(conn, 1)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }
    Ok(table_columns(conn, table)?.iter().any(|name| name == column))
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if table_has_column(conn, "aces_applications", "app_id")? {
        return Ok((1, true));
    }

    Ok((0, false))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
