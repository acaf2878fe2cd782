//! The reconciliation resolver.
//!
//! Combines the raw extraction set, the auto-rejected set, and the
//! curator's override state into the final included/excluded term sets per
//! page. Pure and deterministic: identical inputs yield identical output,
//! independent of any storage iteration order.
//!
//! Precedence, highest wins:
//! per-occurrence forced inclusion > global exclusion > per-occurrence
//! exclusion > raw/auto-detected default.
//!
//! The asymmetry is deliberate: a global exclusion collapses a term's
//! included pages to exactly the force-included ones, while a page-level
//! exclusion removes only its own page. Collapsing the override signals
//! into a single list would change observable behavior.

use std::collections::{BTreeMap, BTreeSet};

use placetrace_common::{
    ExcludedTerm, ExtractionRow, IncludedTerm, OverrideState, PageMeta, RejectedRow, ResolvedModel,
    normalize,
};

/// Compute the resolved model from its three inputs.
pub fn resolve_model(
    raw: &[ExtractionRow],
    rejected: &[RejectedRow],
    overrides: &OverrideState,
) -> ResolvedModel {
    // Pages per key from the raw set, plus the shortest display observed
    // anywhere (raw first, then auto-rejected, then forced-include raw
    // forms; first-seen order breaks length ties).
    let mut raw_pages: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    let mut displays: BTreeMap<String, String> = BTreeMap::new();

    for row in raw {
        for term in &row.terms {
            let key = normalize(term);
            if key.is_empty() {
                continue;
            }
            raw_pages.entry(key.clone()).or_default().insert(row.page);
            note_display(&mut displays, &key, term);
        }
    }

    // Pre_filter pages per key: the only auto-rejected rows that count
    // toward the excluded page sets. Displays are noted for every stage so
    // a term known only from the rejected artifact still has a label.
    let mut prefilter_pages: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for row in rejected {
        let key = normalize(&row.term);
        if key.is_empty() {
            continue;
        }
        note_display(&mut displays, &key, &row.term);
        if row.is_pre_filter() {
            prefilter_pages.entry(key).or_default().insert(row.page);
        }
    }

    for rec in &overrides.include_pages {
        let key = normalize(&rec.key);
        if let Some(raw_form) = rec.raw_display.as_deref() {
            if !key.is_empty() && !raw_form.trim().is_empty() {
                note_display(&mut displays, &key, raw_form.trim());
            }
        }
    }

    let global_excl = overrides.global_keys();
    let excl_pairs = overrides.exclude_pairs();
    let incl_pairs = overrides.include_pairs();

    // Every key any source mentions gets considered exactly once.
    let mut all_keys: BTreeSet<String> = BTreeSet::new();
    all_keys.extend(raw_pages.keys().cloned());
    all_keys.extend(prefilter_pages.keys().cloned());
    all_keys.extend(displays.keys().cloned());
    all_keys.extend(global_excl.iter().cloned());
    all_keys.extend(excl_pairs.iter().map(|(k, _)| k.clone()));
    all_keys.extend(incl_pairs.iter().map(|(k, _)| k.clone()));

    let mut model = ResolvedModel::default();

    for key in all_keys {
        let display = displays.get(&key).cloned().unwrap_or_else(|| key.clone());

        let forced: BTreeSet<u32> = incl_pairs
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, p)| *p)
            .collect();

        // 1. Raw default.
        let mut pages_inc: BTreeSet<u32> =
            raw_pages.get(&key).cloned().unwrap_or_default();

        // 2. Forced inclusion always adds.
        pages_inc.extend(forced.iter().copied());

        // 3. Page-level exclusion removes, unless force-included.
        for (k, p) in &excl_pairs {
            if *k == key && !forced.contains(p) {
                pages_inc.remove(p);
            }
        }

        // 4. Global exclusion collapses to the forced pages only.
        let is_global = global_excl.contains(&key);
        if is_global {
            pages_inc = forced.clone();
        }

        // 5. Excluded pages: raw pages that did not survive, plus
        //    pre_filter rejections that were not reinstated.
        let mut pages_exc: BTreeSet<u32> = BTreeSet::new();
        if let Some(pages) = raw_pages.get(&key) {
            pages_exc.extend(pages.iter().filter(|p| !pages_inc.contains(p)));
        }
        if let Some(pages) = prefilter_pages.get(&key) {
            pages_exc.extend(
                pages
                    .iter()
                    .filter(|p| !forced.contains(p) && !pages_inc.contains(p)),
            );
        }

        if !pages_inc.is_empty() {
            model.included.insert(
                key.clone(),
                IncludedTerm {
                    display: display.clone(),
                    pages: pages_inc,
                },
            );
        }
        if is_global || !pages_exc.is_empty() {
            model.excluded.insert(
                key,
                ExcludedTerm {
                    display,
                    is_global,
                    pages: pages_exc,
                },
            );
        }
    }

    model
}

/// Per-page metadata for the materializer: auto-rejected rows first, then
/// raw rows, so the raw artifact wins where both mention a page but a page
/// known only from the rejected artifact still gets its year and doc id.
pub fn page_meta(raw: &[ExtractionRow], rejected: &[RejectedRow]) -> BTreeMap<u32, PageMeta> {
    let mut meta = BTreeMap::new();
    for row in rejected {
        meta.entry(row.page).or_insert_with(|| PageMeta {
            year: row.year.clone(),
            doc_id: row.doc_id.clone(),
        });
    }
    for row in raw {
        meta.insert(
            row.page,
            PageMeta {
                year: row.year.clone(),
                doc_id: row.doc_id.clone(),
            },
        );
    }
    meta
}

/// Included terms with mention counts, sorted case-insensitively by
/// display. The curator-facing summary list.
pub fn included_summary(model: &ResolvedModel) -> Vec<(String, usize)> {
    let mut items: Vec<(String, usize)> = model
        .included
        .values()
        .map(|t| (t.display.clone(), t.pages.len()))
        .collect();
    items.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
    items
}

/// Keep the shortest display form (in characters), first-seen breaking ties.
fn note_display(displays: &mut BTreeMap<String, String>, key: &str, candidate: &str) {
    match displays.get_mut(key) {
        Some(current) => {
            if candidate.chars().count() < current.chars().count() {
                *current = candidate.to_string();
            }
        }
        None => {
            displays.insert(key.to_string(), candidate.to_string());
        }
    }
}
