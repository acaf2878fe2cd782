//! Persistence and mutation of the curator's override decisions.
//!
//! Loading never fails the caller: a missing, corrupt, or legacy-shaped
//! file yields an empty-but-valid state, keeping the reconciliation
//! pipeline available. Saving normalizes keys, collapses duplicate
//! occurrence records, and replaces the file atomically so a concurrent
//! reader never observes a half-written state.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use placetrace_common::{normalize, ForcedInclude, OverrideState, PageOverride};

use crate::artifacts::JobDir;

pub struct OverrideStore {
    path: PathBuf,
}

/// Accepts both the current shape and the legacy one that carried only a
/// flat `excluded` list of global exclusions.
#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct WireState {
    #[serde(default)]
    exclude_global: Vec<String>,
    #[serde(default)]
    exclude_pages: Vec<PageOverride>,
    #[serde(default)]
    include_pages: Vec<ForcedInclude>,
    #[serde(default, rename = "excluded")]
    legacy_excluded: Vec<String>,
}

impl OverrideStore {
    pub fn new(job: &JobDir) -> Self {
        Self {
            path: job.overrides_path(),
        }
    }

    /// Load the override state. Failure is absorbed, not propagated.
    pub fn load(&self) -> OverrideState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return OverrideState::default(),
        };
        let wire: WireState = match serde_json::from_str(&raw) {
            Ok(wire) => wire,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e,
                    "Corrupt override state, starting from empty");
                return OverrideState::default();
            }
        };

        let mut state = OverrideState {
            exclude_global: wire.exclude_global,
            exclude_pages: wire.exclude_pages,
            include_pages: wire.include_pages,
        };
        if state.exclude_global.is_empty() && !wire.legacy_excluded.is_empty() {
            debug!(path = %self.path.display(), "Reading legacy flat exclusion list");
            state.exclude_global = wire.legacy_excluded;
        }
        normalized(state)
    }

    /// Persist the state: normalize, dedupe, write-to-temp, atomic replace.
    pub fn save(&self, state: &OverrideState) -> Result<()> {
        let clean = normalized(state.clone());
        let dir = self
            .path
            .parent()
            .context("override state path has no parent directory")?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(&clean)?.as_bytes())?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    /// Exclude a term on every page. Purges any forced-include records for
    /// the term; the new decision supersedes them.
    pub fn exclude_global(&self, term: &str) -> Result<OverrideState> {
        let key = normalize(term);
        let mut state = self.load();
        if !key.is_empty() && !state.exclude_global.iter().any(|t| normalize(t) == key) {
            state.exclude_global.push(key.clone());
        }
        state.include_pages.retain(|r| normalize(&r.key) != key);
        self.save(&state)?;
        Ok(state)
    }

    /// Exclude a single occurrence. Purges a forced include for the same
    /// occurrence, otherwise the exclusion would be a silent no-op.
    pub fn exclude_page(&self, term: &str, page: u32) -> Result<OverrideState> {
        let key = normalize(term);
        if key.is_empty() {
            return Ok(self.load());
        }
        let mut state = self.load();
        state
            .include_pages
            .retain(|r| !(normalize(&r.key) == key && r.page == page));
        if !state
            .exclude_pages
            .iter()
            .any(|r| normalize(&r.key) == key && r.page == page)
        {
            state.exclude_pages.push(PageOverride {
                key: key.clone(),
                page,
            });
        }
        self.save(&state)?;
        Ok(state)
    }

    /// Re-include a term globally: removes the global exclusion and every
    /// page-specific exclusion for the term, so the resolved model cannot
    /// retain stale negative records. Adds no forced-include records.
    pub fn include_global(&self, term: &str) -> Result<OverrideState> {
        let key = normalize(term);
        let mut state = self.load();
        state.exclude_global.retain(|t| normalize(t) != key);
        state.exclude_pages.retain(|r| normalize(&r.key) != key);
        self.save(&state)?;
        Ok(state)
    }

    /// Force-include a single occurrence, reinstating a pre_filter
    /// auto-rejection or overriding an exclusion for that page only.
    pub fn include_page(&self, term: &str, page: u32) -> Result<OverrideState> {
        let key = normalize(term);
        if key.is_empty() {
            return Ok(self.load());
        }
        let mut state = self.load();
        state
            .exclude_pages
            .retain(|r| !(normalize(&r.key) == key && r.page == page));
        if !state
            .include_pages
            .iter()
            .any(|r| normalize(&r.key) == key && r.page == page)
        {
            state.include_pages.push(ForcedInclude {
                key,
                page,
                raw_display: Some(term.trim().to_string()),
            });
        }
        self.save(&state)?;
        Ok(state)
    }
}

/// Normalize keys, drop empties, collapse duplicates keeping the first
/// occurrence of each key / (key, page) pair.
fn normalized(state: OverrideState) -> OverrideState {
    let mut exclude_global = Vec::new();
    let mut seen_global = BTreeSet::new();
    for term in state.exclude_global {
        let key = normalize(&term);
        if !key.is_empty() && seen_global.insert(key.clone()) {
            exclude_global.push(key);
        }
    }

    let mut exclude_pages = Vec::new();
    let mut seen_excl = BTreeSet::new();
    for rec in state.exclude_pages {
        let key = normalize(&rec.key);
        if !key.is_empty() && seen_excl.insert((key.clone(), rec.page)) {
            exclude_pages.push(PageOverride {
                key,
                page: rec.page,
            });
        }
    }

    let mut include_pages = Vec::new();
    let mut seen_incl = BTreeSet::new();
    for rec in state.include_pages {
        let key = normalize(&rec.key);
        if !key.is_empty() && seen_incl.insert((key.clone(), rec.page)) {
            include_pages.push(ForcedInclude {
                key,
                page: rec.page,
                raw_display: rec
                    .raw_display
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty()),
            });
        }
    }

    OverrideState {
        exclude_global,
        exclude_pages,
        include_pages,
    }
}
