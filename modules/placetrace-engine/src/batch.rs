//! Batch geocoding driver.
//!
//! Iterates the distinct terms of the active set in a stable order, drives
//! the cache/resolver, and assembles the final feature collection plus the
//! reject list. A single term's failure never aborts the batch; only a
//! fatal failure before the loop (an unreadable term list) aborts the run.
//!
//! One batch per job at a time. The run is not restartable mid-flight; the
//! cache's persistence is what makes a subsequent full rerun cheap.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use placetrace_common::{
    normalize, EngineError, IncludedTerm, Progress, RejectReason,
};

use crate::artifacts::{self, JobDir};
use crate::cache::GeocodeCache;
use crate::geocode::{Gazetteer, GeocodeResolver};

// ---------------------------------------------------------------------------
// Progress artifact
// ---------------------------------------------------------------------------

/// Polling-friendly progress record, read-then-fully-rewritten. Exactly
/// one writer (the batch task) is expected at a time per job.
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    pub fn new(job: &JobDir) -> Self {
        Self {
            path: job.progress_path(),
        }
    }

    pub fn write(&self, progress: &Progress) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(progress)?)
            .with_context(|| format!("writing {}", self.path.display()))
    }

    pub fn read(&self) -> Option<Progress> {
        let raw = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

// ---------------------------------------------------------------------------
// The batch loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub total_terms: usize,
    pub features: usize,
    pub rejects: usize,
}

/// Run one batch to completion: read the active term list, resolve every
/// distinct term through the cache, write the feature collection, the
/// reject list, and the terminal progress record.
pub async fn run_batch<G: Gazetteer>(
    job: &JobDir,
    resolver: &GeocodeResolver<G>,
) -> Result<BatchOutcome> {
    let progress = ProgressFile::new(job);
    progress.write(&Progress::starting())?;

    let input = job.active_input_path();
    if !input.exists() {
        return Err(EngineError::InputMissing(input).into());
    }

    let terms = collect_occurrences(&input)?;
    let total = terms.len();
    info!(input = %input.display(), total, "Batch geocoding started");

    let mut cache = GeocodeCache::load(job);
    let mut features: Vec<serde_json::Value> = Vec::new();
    let mut rejects: Vec<(String, RejectReason)> = Vec::new();

    for (done, term) in terms.values().enumerate() {
        if let Err(e) =
            progress.write(&Progress::running(done, total, Some(term.display.clone())))
        {
            warn!(error = %e, "Failed to update progress record");
        }

        match cache.get_or_resolve(&term.display, resolver).await? {
            Ok(candidate) => {
                features.push(json!({
                    "type": "Feature",
                    "geometry": candidate.geometry,
                    "properties": {
                        "pages": term.pages.iter().collect::<Vec<_>>(),
                        "mention_count": term.pages.len(),
                        "term": term.display,
                        "display_name": candidate.display_name,
                        "class": candidate.class_tag,
                        "type": candidate.type_tag,
                        "geometry_source": candidate.geometry_source,
                        "admin_level": candidate.admin_level,
                    },
                }));
            }
            Err(reason) => {
                rejects.push((term.display.clone(), reason));
            }
        }
    }

    let feature_count = features.len();
    let collection = json!({ "type": "FeatureCollection", "features": features });
    fs::write(
        job.places_path(),
        serde_json::to_string_pretty(&collection)?,
    )
    .with_context(|| format!("writing {}", job.places_path().display()))?;

    if !rejects.is_empty() {
        job.write_reject_rows(&rejects)?;
    }

    progress.write(&Progress::done(total))?;
    info!(
        total,
        features = feature_count,
        rejects = rejects.len(),
        "Batch geocoding finished"
    );

    Ok(BatchOutcome {
        total_terms: total,
        features: feature_count,
        rejects: rejects.len(),
    })
}

/// Group the active rows by term key: shortest display wins, pages merged.
/// BTreeMap keying gives the stable iteration order the driver relies on.
fn collect_occurrences(input: &std::path::Path) -> Result<BTreeMap<String, IncludedTerm>> {
    let rows = artifacts::read_term_rows(input)?;
    let mut terms: BTreeMap<String, IncludedTerm> = BTreeMap::new();
    for row in &rows {
        for term in &row.terms {
            let key = normalize(term);
            if key.is_empty() {
                continue;
            }
            let entry = terms.entry(key).or_insert_with(|| IncludedTerm {
                display: term.clone(),
                pages: Default::default(),
            });
            if term.chars().count() < entry.display.chars().count() {
                entry.display = term.clone();
            }
            entry.pages.insert(row.page);
        }
    }
    Ok(terms)
}

// ---------------------------------------------------------------------------
// Single-flight job supervision
// ---------------------------------------------------------------------------

/// Supervises the one background geocoding task a job is allowed.
pub struct JobRunner {
    job: JobDir,
    in_flight: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(job: JobDir) -> Self {
        Self {
            job,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current progress, if any run has ever written one.
    pub fn progress(&self) -> Option<Progress> {
        ProgressFile::new(&self.job).read()
    }

    /// Start the background batch task. Refused while a prior batch is
    /// `starting` or `running`, and when the input term list is missing.
    pub fn start<G: Gazetteer + 'static>(
        &self,
        resolver: GeocodeResolver<G>,
    ) -> Result<JoinHandle<()>, EngineError> {
        if let Some(prior) = self.progress() {
            if prior.status.is_in_flight() {
                return Err(EngineError::BatchInFlight);
            }
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(EngineError::BatchInFlight);
        }

        let input = self.job.active_input_path();
        if !input.exists() {
            self.in_flight.store(false, Ordering::SeqCst);
            return Err(EngineError::InputMissing(input));
        }

        let progress = ProgressFile::new(&self.job);
        if let Err(e) = progress.write(&Progress::starting()) {
            self.in_flight.store(false, Ordering::SeqCst);
            return Err(EngineError::Anyhow(e));
        }

        let job = self.job.clone();
        let flag = Arc::clone(&self.in_flight);
        let handle = tokio::spawn(async move {
            if let Err(e) = run_batch(&job, &resolver).await {
                warn!(error = %e, "Batch geocoding run failed");
                let _ = ProgressFile::new(&job).write(&Progress::failed(e.to_string()));
            }
            flag.store(false, Ordering::SeqCst);
        });
        Ok(handle)
    }
}
