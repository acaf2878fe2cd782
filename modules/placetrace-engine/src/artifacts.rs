//! Job-directory layout and tabular artifact I/O.
//!
//! Every artifact of a job lives directly under its working directory;
//! concurrent jobs are isolated by operating on disjoint directories.
//! Readers here never fail on individual bad rows: a row that cannot be
//! parsed is skipped with a warning, per the engine's availability-first
//! contract.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use placetrace_common::{ExtractionRow, RejectReason, RejectedRow};

pub const RAW_TERMS_CSV: &str = "terms.csv";
pub const REJECTED_TERMS_CSV: &str = "terms_rejected.csv";
pub const ACTIVE_TERMS_CSV: &str = "terms_active.csv";
pub const OVERRIDES_JSON: &str = "overrides.json";
pub const GEOCACHE_JSON: &str = "geocache.json";
pub const PROGRESS_JSON: &str = "geocode_progress.json";
pub const PLACES_GEOJSON: &str = "places.geojson";
pub const GEOCODE_REJECTS_CSV: &str = "geocode_rejects.csv";
pub const LOOKUP_DEBUG_JSON: &str = "lookup_debug_last.json";

/// Handle on one job's working directory.
#[derive(Debug, Clone)]
pub struct JobDir {
    root: PathBuf,
}

impl JobDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_terms_path(&self) -> PathBuf {
        self.root.join(RAW_TERMS_CSV)
    }

    pub fn rejected_terms_path(&self) -> PathBuf {
        self.root.join(REJECTED_TERMS_CSV)
    }

    pub fn active_terms_path(&self) -> PathBuf {
        self.root.join(ACTIVE_TERMS_CSV)
    }

    pub fn overrides_path(&self) -> PathBuf {
        self.root.join(OVERRIDES_JSON)
    }

    pub fn geocache_path(&self) -> PathBuf {
        self.root.join(GEOCACHE_JSON)
    }

    pub fn progress_path(&self) -> PathBuf {
        self.root.join(PROGRESS_JSON)
    }

    pub fn places_path(&self) -> PathBuf {
        self.root.join(PLACES_GEOJSON)
    }

    pub fn geocode_rejects_path(&self) -> PathBuf {
        self.root.join(GEOCODE_REJECTS_CSV)
    }

    pub fn lookup_debug_path(&self) -> PathBuf {
        self.root.join(LOOKUP_DEBUG_JSON)
    }

    /// The term list the batch driver should consume: the materialized
    /// active set when present, otherwise the raw extraction artifact.
    pub fn active_input_path(&self) -> PathBuf {
        let filtered = self.active_terms_path();
        if filtered.exists() {
            filtered
        } else {
            self.raw_terms_path()
        }
    }

    /// Read the raw extraction artifact. A missing file yields an empty
    /// set, so reconciliation stays available before extraction has run.
    pub fn read_raw_rows(&self) -> Result<Vec<ExtractionRow>> {
        read_term_rows(&self.raw_terms_path())
    }

    /// Read the auto-rejected artifact (missing file yields empty).
    pub fn read_rejected_rows(&self) -> Result<Vec<RejectedRow>> {
        let path = self.rejected_terms_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut rows = Vec::new();
        let mut rdr = csv_reader(&path)?;
        for record in rdr.deserialize::<RejectedRecord>() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed rejected row");
                    continue;
                }
            };
            let Some(page) = parse_page(&record.page, &path) else {
                continue;
            };
            if record.term.trim().is_empty() {
                continue;
            }
            rows.push(RejectedRow {
                page,
                year: record.year.trim().to_string(),
                doc_id: record.doc_id.trim().to_string(),
                term: record.term.trim().to_string(),
                stage: record.stage.trim().to_string(),
                reason: record.reason.trim().to_string(),
            });
        }
        Ok(rows)
    }

    /// Write the active term list: one row per page with at least one
    /// included term, `terms` semicolon-joined.
    pub fn write_active_rows(&self, rows: &[ExtractionRow]) -> Result<PathBuf> {
        let path = self.active_terms_path();
        let mut wtr = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        wtr.write_record(["page", "year", "doc_id", "terms"])?;
        for row in rows {
            wtr.write_record([
                row.page.to_string().as_str(),
                &row.year,
                &row.doc_id,
                &row.terms.join(";"),
            ])?;
        }
        wtr.flush()?;
        Ok(path)
    }

    /// Write the per-term geocoding reject list.
    pub fn write_reject_rows(&self, rejects: &[(String, RejectReason)]) -> Result<PathBuf> {
        let path = self.geocode_rejects_path();
        let mut wtr = csv::Writer::from_path(&path)
            .with_context(|| format!("creating {}", path.display()))?;
        wtr.write_record(["term", "reason"])?;
        for (term, reason) in rejects {
            wtr.write_record([term.as_str(), reason.as_str()])?;
        }
        wtr.flush()?;
        Ok(path)
    }
}

/// Read any `page,year,doc_id,terms` artifact (raw or active).
pub fn read_term_rows(path: &Path) -> Result<Vec<ExtractionRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut rows = Vec::new();
    let mut rdr = csv_reader(path)?;
    for record in rdr.deserialize::<TermRecord>() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping malformed term row");
                continue;
            }
        };
        let Some(page) = parse_page(&record.page, path) else {
            continue;
        };
        rows.push(ExtractionRow {
            page,
            year: record.year.trim().to_string(),
            doc_id: record.doc_id.trim().to_string(),
            terms: split_terms(&record.terms),
        });
    }
    Ok(rows)
}

/// Split a semicolon-joined term field, dropping empty fragments.
pub fn split_terms(field: &str) -> Vec<String> {
    field
        .split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn csv_reader(path: &Path) -> Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))
}

fn parse_page(label: &str, path: &Path) -> Option<u32> {
    match label.trim().parse() {
        Ok(page) => Some(page),
        Err(_) => {
            warn!(path = %path.display(), label, "Skipping row with non-numeric page label");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct TermRecord {
    page: String,
    #[serde(default)]
    year: String,
    #[serde(default)]
    doc_id: String,
    #[serde(default)]
    terms: String,
}

#[derive(Debug, Deserialize)]
struct RejectedRecord {
    page: String,
    #[serde(default)]
    year: String,
    #[serde(default)]
    doc_id: String,
    #[serde(default)]
    term: String,
    #[serde(default)]
    stage: String,
    #[serde(default)]
    reason: String,
}
