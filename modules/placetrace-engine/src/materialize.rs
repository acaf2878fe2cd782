//! Active-set materializer: serializes the resolved model into the
//! canonical final-term-list-per-page artifact consumed by the batch
//! geocoding driver.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use placetrace_common::{ExtractionRow, PageMeta, ResolvedModel};

use crate::artifacts::JobDir;

/// Build the active rows: one per page that still has at least one
/// included term, pages ascending, terms deduped and sorted
/// case-insensitively by display.
pub fn active_rows(
    model: &ResolvedModel,
    meta: &BTreeMap<u32, PageMeta>,
) -> Vec<ExtractionRow> {
    let mut page_terms: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for term in model.included.values() {
        for page in &term.pages {
            page_terms.entry(*page).or_default().push(term.display.clone());
        }
    }

    page_terms
        .into_iter()
        .map(|(page, mut terms)| {
            terms.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()));
            terms.dedup();
            let meta = meta.get(&page).cloned().unwrap_or_default();
            ExtractionRow {
                page,
                year: meta.year,
                doc_id: meta.doc_id,
                terms,
            }
        })
        .collect()
}

/// Recompute and write the active artifact for a job.
pub fn write_active(
    job: &JobDir,
    model: &ResolvedModel,
    meta: &BTreeMap<u32, PageMeta>,
) -> Result<PathBuf> {
    let rows = active_rows(model, meta);
    let path = job.write_active_rows(&rows)?;
    info!(path = %path.display(), pages = rows.len(), "Active term list written");
    Ok(path)
}
