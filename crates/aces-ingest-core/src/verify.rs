//! Post-commit audit of one `source_file` scope.
//!
//! The verifier only reads. It can run right after an ingest or later against any scope
//! that is still in the store.

use serde::{Deserialize, Serialize};

use crate::store::{AuditCounts, AuditStore, RunStatus, StoreError, UnmappedCount};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerificationReport {
    pub source_file: String,
    pub run_id: Option<String>,
    pub run_status: Option<RunStatus>,
    pub counts: AuditCounts,
    /// Most frequent raw attribute names other than notes. Informational only.
    pub top_unmapped: Vec<UnmappedCount>,
    pub issues: Vec<String>,
}

impl VerificationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// # Errors
/// Returns [`StoreError`] when the store cannot be read.
pub fn verify<S: AuditStore + ?Sized>(
    store: &S,
    source_file: &str,
    top_unmapped: usize,
) -> Result<VerificationReport, StoreError> {
    let run = store.run_record(source_file)?;
    let counts = store.audit_counts(source_file)?;
    let top_unmapped = store.unmapped_histogram(source_file, top_unmapped)?;
    let mut issues = Vec::new();

    match &run {
        None => issues.push(format!("no ingest run recorded for source_file {source_file}")),
        Some(run) => {
            if run.status != RunStatus::Committed {
                issues.push(format!("run {} has status {}, expected committed", run.run_id, run.status));
            }
            if run.applications_ingested != counts.applications {
                issues.push(format!(
                    "store holds {} applications but the run recorded {} ingested",
                    counts.applications, run.applications_ingested
                ));
            }
            if let Some(expected) = run.footer_record_count {
                if expected != counts.applications {
                    issues.push(format!(
                        "footer RecordCount is {expected} but {} applications landed",
                        counts.applications
                    ));
                }
            }
        }
    }

    let gap = |have: u64| counts.applications.saturating_sub(have);
    let missing_fitment = gap(counts.applications_with_fitment);
    if missing_fitment > 0 {
        issues.push(format!("{missing_fitment} applications have no vehicle fitment row"));
    }
    let missing_part_number = gap(counts.applications_with_part_number);
    if missing_part_number > 0 {
        issues.push(format!("{missing_part_number} applications have no part_number"));
    }
    let missing_part_type = gap(counts.applications_with_part_type);
    if missing_part_type > 0 {
        issues.push(format!("{missing_part_type} applications have no part_type_id"));
    }
    if counts.fitments_without_vehicle_reference > 0 {
        issues.push(format!(
            "{} vehicle fitments carry no vehicle reference",
            counts.fitments_without_vehicle_reference
        ));
    }

    for issue in &issues {
        tracing::warn!(source_file, issue = %issue, "verification issue");
    }
    tracing::info!(
        source_file,
        applications = counts.applications,
        issues = issues.len(),
        "verification finished"
    );

    Ok(VerificationReport {
        source_file: source_file.to_string(),
        run_id: run.as_ref().map(|run| run.run_id.clone()),
        run_status: run.as_ref().map(|run| run.status),
        counts,
        top_unmapped,
        issues,
    })
}
