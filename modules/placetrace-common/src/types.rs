//! Shared data model for the reconciliation and geocoding pipeline.
//!
//! A *term* is identified by its normalized key (see [`crate::normalize`]);
//! an *occurrence* is a `(key, page)` pair. The override state is the only
//! user-authored entity; everything else is derived from the extraction
//! artifacts plus the overrides.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::normalize;

/// Discard-stage label of auto-rejected rows eligible for forced re-inclusion.
pub const PRE_FILTER_STAGE: &str = "pre_filter";

// ---------------------------------------------------------------------------
// Extraction artifacts (read-only inputs)
// ---------------------------------------------------------------------------

/// One row of the raw extraction artifact: the accepted terms found on a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRow {
    pub page: u32,
    pub year: String,
    pub doc_id: String,
    /// Accepted candidate terms, in document order.
    pub terms: Vec<String>,
}

/// One row of the auto-rejected artifact: a term the ingestion step discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    pub page: u32,
    pub year: String,
    pub doc_id: String,
    pub term: String,
    /// Discard-stage label. Only `pre_filter` rows are override-eligible.
    pub stage: String,
    pub reason: String,
}

impl RejectedRow {
    pub fn is_pre_filter(&self) -> bool {
        self.stage.trim().eq_ignore_ascii_case(PRE_FILTER_STAGE)
    }
}

/// Per-page metadata carried through to the active-set artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMeta {
    pub year: String,
    pub doc_id: String,
}

// ---------------------------------------------------------------------------
// Override state (the curator's decisions)
// ---------------------------------------------------------------------------

/// A per-occurrence exclusion: drop this term from this page only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOverride {
    pub key: String,
    pub page: u32,
}

/// A per-occurrence forced inclusion. Beats global and page-level exclusion
/// and reinstates pre_filter auto-rejections, for this occurrence only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForcedInclude {
    pub key: String,
    pub page: u32,
    /// Raw display form captured when the curator reinstated the term,
    /// so a term absent from the raw set still has something to show.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_display: Option<String>,
}

/// The persisted curator decisions. Three independent collections that may
/// contradict each other pairwise; the resolver defines precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideState {
    /// Term keys excluded on every page.
    #[serde(default)]
    pub exclude_global: Vec<String>,
    /// Occurrences excluded on one page only.
    #[serde(default)]
    pub exclude_pages: Vec<PageOverride>,
    /// Occurrences forcibly included.
    #[serde(default)]
    pub include_pages: Vec<ForcedInclude>,
}

impl OverrideState {
    /// Normalized global-exclusion key set.
    pub fn global_keys(&self) -> BTreeSet<String> {
        self.exclude_global
            .iter()
            .map(|t| normalize(t))
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Normalized `(key, page)` page-exclusion pairs.
    pub fn exclude_pairs(&self) -> BTreeSet<(String, u32)> {
        self.exclude_pages
            .iter()
            .map(|r| (normalize(&r.key), r.page))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    /// Normalized `(key, page)` forced-inclusion pairs.
    pub fn include_pairs(&self) -> BTreeSet<(String, u32)> {
        self.include_pages
            .iter()
            .map(|r| (normalize(&r.key), r.page))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Resolved model (derived, never the source of truth)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IncludedTerm {
    pub display: String,
    pub pages: BTreeSet<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExcludedTerm {
    pub display: String,
    pub is_global: bool,
    pub pages: BTreeSet<u32>,
}

/// Output of the reconciliation resolver. Recomputed on demand; a pure
/// function of (raw set, auto-rejected set, override state).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedModel {
    pub included: BTreeMap<String, IncludedTerm>,
    pub excluded: BTreeMap<String, ExcludedTerm>,
}

// ---------------------------------------------------------------------------
// Geocoding outcomes
// ---------------------------------------------------------------------------

/// Where a candidate's geometry came from. Downstream consumers must not
/// assume point geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometrySource {
    Polygon,
    Centroid,
}

/// Normalized external-lookup result. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoCandidate {
    pub lat: f64,
    pub lon: f64,
    pub display_name: String,
    #[serde(rename = "class")]
    pub class_tag: Option<String>,
    #[serde(rename = "type")]
    pub type_tag: Option<String>,
    pub importance: Option<f64>,
    pub osm_id: Option<i64>,
    pub osm_type: Option<String>,
    /// The display form that was queried.
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_level: Option<u32>,
    /// GeoJSON geometry: the supplied polygon when available, else a
    /// synthesized point.
    pub geometry: serde_json::Value,
    pub geometry_source: GeometrySource,
}

/// Why a term could not be resolved to a geographic candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// No lookup variant returned any result.
    NoResults,
    /// Results came back but nothing ranked above the reject tier.
    NoAcceptedCandidate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NoResults => "no_results",
            RejectReason::NoAcceptedCandidate => "no_accepted_candidate",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving one term.
pub type ResolveResult = Result<GeoCandidate, RejectReason>;

/// Persisted cache entry: either a successful candidate or a stored
/// rejection. Write-once per key within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<GeoCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

impl CacheEntry {
    pub fn hit(data: GeoCandidate) -> Self {
        Self {
            ok: true,
            data: Some(data),
            reason: None,
        }
    }

    pub fn miss(reason: RejectReason) -> Self {
        Self {
            ok: false,
            data: None,
            reason: Some(reason),
        }
    }

    /// Interpret the entry as a resolve outcome. `None` for entries whose
    /// flag and payload disagree (a malformed or legacy record).
    pub fn as_result(&self) -> Option<ResolveResult> {
        if self.ok {
            self.data.clone().map(Ok)
        } else {
            self.reason.map(Err)
        }
    }
}

impl From<&ResolveResult> for CacheEntry {
    fn from(outcome: &ResolveResult) -> Self {
        match outcome {
            Ok(data) => CacheEntry::hit(data.clone()),
            Err(reason) => CacheEntry::miss(*reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// A batch in this state blocks a new one from starting.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Starting | JobStatus::Running)
    }
}

/// Polling-friendly progress record for one batch geocoding run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub status: JobStatus,
    pub done: usize,
    pub total: usize,
    pub current: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    pub fn starting() -> Self {
        Self::new(JobStatus::Starting, 0, 0, None, None)
    }

    pub fn running(done: usize, total: usize, current: Option<String>) -> Self {
        Self::new(JobStatus::Running, done, total, current, None)
    }

    pub fn done(total: usize) -> Self {
        Self::new(JobStatus::Done, total, total, None, None)
    }

    pub fn failed(message: String) -> Self {
        Self::new(JobStatus::Error, 0, 0, None, Some(message))
    }

    fn new(
        status: JobStatus,
        done: usize,
        total: usize,
        current: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            status,
            done,
            total,
            current,
            error,
            updated_at: Utc::now(),
        }
    }
}
