//! Disk-backed geocoding cache.
//!
//! One outcome per distinct term key for the lifetime of a job, including
//! stored rejections, which are not retried so known-bad terms never
//! hammer the external service. The map is persisted after
//! every miss, so an aborted batch run resumes without re-querying terms
//! it already resolved.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use placetrace_common::{normalize, CacheEntry, ResolveResult};

use crate::artifacts::JobDir;
use crate::geocode::{Gazetteer, GeocodeResolver};

pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
}

impl GeocodeCache {
    /// Load the cache for a job. A missing or corrupt file yields an empty
    /// cache; individually malformed entries are dropped.
    pub fn load(job: &JobDir) -> Self {
        let path = job.geocache_path();
        let mut entries = BTreeMap::new();

        if let Ok(raw) = fs::read_to_string(&path) {
            match serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&raw) {
                Ok(map) => {
                    for (key, value) in map {
                        match serde_json::from_value::<CacheEntry>(value) {
                            Ok(entry) if entry.as_result().is_some() => {
                                entries.insert(key, entry);
                            }
                            _ => {
                                warn!(key = key.as_str(), "Dropping malformed cache entry");
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e,
                        "Corrupt geocode cache, starting from empty");
                }
            }
        }

        Self { path, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, term: &str) -> Option<ResolveResult> {
        self.entries.get(&normalize(term)).and_then(CacheEntry::as_result)
    }

    /// Return the stored outcome for a term, resolving and persisting it
    /// first on a miss. At most one external resolution per distinct key.
    pub async fn get_or_resolve<G: Gazetteer>(
        &mut self,
        term: &str,
        resolver: &GeocodeResolver<G>,
    ) -> Result<ResolveResult> {
        let key = normalize(term);
        if let Some(outcome) = self.entries.get(&key).and_then(CacheEntry::as_result) {
            debug!(term, "Geocode cache hit");
            return Ok(outcome);
        }

        let outcome = resolver.resolve(term).await;
        self.entries.insert(key, CacheEntry::from(&outcome));
        self.persist()?;
        Ok(outcome)
    }

    fn persist(&self) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}
