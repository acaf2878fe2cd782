//! Geocode resolver and cache behavior against a scripted gazetteer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use placetrace_common::{GeocodeConfig, GeometrySource, RejectReason};
use placetrace_engine::{Gazetteer, GazetteerHit, GeocodeCache, GeocodeResolver, JobDir};

// ---------------------------------------------------------------------------
// Scripted gazetteer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedGazetteer {
    responses: HashMap<String, Vec<GazetteerHit>>,
    calls: AtomicUsize,
}

impl ScriptedGazetteer {
    fn respond(mut self, query: &str, hits: Vec<GazetteerHit>) -> Self {
        self.responses.insert(query.to_string(), hits);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Gazetteer for ScriptedGazetteer {
    async fn search(&self, query: &str, _countrycodes: Option<&str>) -> Result<Vec<GazetteerHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.responses.get(query).cloned().unwrap_or_default())
    }
}

fn test_config() -> GeocodeConfig {
    GeocodeConfig {
        delay: Duration::ZERO,
        ..Default::default()
    }
}

fn global_only_config() -> GeocodeConfig {
    GeocodeConfig {
        delay: Duration::ZERO,
        home_country: None,
        ..Default::default()
    }
}

fn named_hit(name: &str, class: &str, typ: &str, osm_id: i64, importance: f64) -> GazetteerHit {
    let mut details = serde_json::Map::new();
    details.insert("name".to_string(), json!(name));
    GazetteerHit {
        lat: Some("41.26".to_string()),
        lon: Some("15.89".to_string()),
        display_name: Some(format!("{name}, Italia")),
        class_tag: Some(class.to_string()),
        type_tag: Some(typ.to_string()),
        importance: Some(importance),
        osm_id: Some(osm_id),
        osm_type: Some("relation".to_string()),
        namedetails: Some(details),
        ..Default::default()
    }
}

fn resolver(gazetteer: Arc<ScriptedGazetteer>, config: GeocodeConfig) -> GeocodeResolver<Arc<ScriptedGazetteer>> {
    GeocodeResolver::new(gazetteer, config)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolves_a_town_through_the_home_bias_variant() {
    let gazetteer = Arc::new(
        ScriptedGazetteer::default()
            .respond("Cerignola", vec![named_hit("Cerignola", "place", "town", 1, 0.6)]),
    );
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    let candidate = resolver.resolve("Cerignola").await.unwrap();
    assert_eq!(candidate.display_name, "Cerignola, Italia");
    assert_eq!(candidate.raw, "Cerignola");
    assert_eq!(candidate.geometry_source, GeometrySource::Centroid);
    // home bias, country suffix, global; no exonym for this term.
    assert_eq!(gazetteer.calls(), 3);
}

#[tokio::test]
async fn empty_responses_reject_with_no_results() {
    let gazetteer = Arc::new(ScriptedGazetteer::default());
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    assert_eq!(
        resolver.resolve("Atlantide").await.unwrap_err(),
        RejectReason::NoResults
    );
}

#[tokio::test]
async fn unrecognized_category_without_coordinates_is_rejected() {
    let junk = GazetteerHit {
        class_tag: Some("shop".to_string()),
        type_tag: Some("bakery".to_string()),
        osm_id: Some(9),
        osm_type: Some("node".to_string()),
        ..Default::default()
    };
    let gazetteer =
        Arc::new(ScriptedGazetteer::default().respond("Fornaio", vec![junk]));
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    assert_eq!(
        resolver.resolve("Fornaio").await.unwrap_err(),
        RejectReason::NoAcceptedCandidate
    );
}

#[tokio::test]
async fn exonym_variant_rescues_a_foreign_name() {
    // "Parigi" finds nothing under its Italian spelling; the exonym
    // variant queries "paris" and must win.
    let gazetteer = Arc::new(
        ScriptedGazetteer::default()
            .respond("paris", vec![named_hit("Paris", "place", "city", 71525, 0.94)]),
    );
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    let candidate = resolver.resolve("Parigi").await.unwrap();
    assert_eq!(candidate.display_name, "Paris, Italia");
    // home bias, country suffix, global, exonym.
    assert_eq!(gazetteer.calls(), 4);
}

#[tokio::test]
async fn lower_tier_beats_higher_importance() {
    let mut boundary = named_hit("Lucera", "boundary", "administrative", 2, 0.9);
    let mut tags = serde_json::Map::new();
    tags.insert("admin_level".to_string(), json!("6"));
    boundary.extratags = Some(tags);
    let town = named_hit("Lucera", "place", "town", 1, 0.3);

    let forward = Arc::new(
        ScriptedGazetteer::default().respond("Lucera", vec![boundary.clone(), town.clone()]),
    );
    let reversed =
        Arc::new(ScriptedGazetteer::default().respond("Lucera", vec![town, boundary]));

    let a = resolver(forward, global_only_config())
        .resolve("Lucera")
        .await
        .unwrap();
    let b = resolver(reversed, global_only_config())
        .resolve("Lucera")
        .await
        .unwrap();

    // Same winner regardless of result order: the tier-0 populated place.
    assert_eq!(a.osm_id, Some(1));
    assert_eq!(b.osm_id, Some(1));
}

#[tokio::test]
async fn exact_name_match_beats_importance_within_a_tier() {
    let exact = named_hit("Troia", "place", "village", 1, 0.2);
    let partial = named_hit("Troia Vecchia", "place", "village", 2, 0.9);
    let gazetteer = Arc::new(
        ScriptedGazetteer::default().respond("Troia", vec![partial, exact]),
    );

    let candidate = resolver(gazetteer, global_only_config())
        .resolve("Troia")
        .await
        .unwrap();
    assert_eq!(candidate.osm_id, Some(1));
}

#[tokio::test]
async fn polygon_geometry_is_carried_through() {
    let mut hit = named_hit("Cerignola", "place", "town", 1, 0.6);
    hit.geojson = Some(json!({
        "type": "Polygon",
        "coordinates": [[[15.8, 41.2], [15.9, 41.2], [15.9, 41.3], [15.8, 41.2]]]
    }));
    let gazetteer = Arc::new(ScriptedGazetteer::default().respond("Cerignola", vec![hit]));

    let candidate = resolver(gazetteer, test_config())
        .resolve("Cerignola")
        .await
        .unwrap();
    assert_eq!(candidate.geometry_source, GeometrySource::Polygon);
    assert_eq!(candidate.geometry["type"], "Polygon");
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cache_resolves_each_term_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDir::new(dir.path());
    let gazetteer = Arc::new(
        ScriptedGazetteer::default()
            .respond("Cerignola", vec![named_hit("Cerignola", "place", "town", 1, 0.6)]),
    );
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    let mut cache = GeocodeCache::load(&job);
    let first = cache.get_or_resolve("Cerignola", &resolver).await.unwrap();
    let calls_after_first = gazetteer.calls();
    let second = cache.get_or_resolve("Cerignola", &resolver).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(gazetteer.calls(), calls_after_first);
}

#[tokio::test]
async fn cached_rejection_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDir::new(dir.path());
    let gazetteer = Arc::new(ScriptedGazetteer::default());
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    let mut cache = GeocodeCache::load(&job);
    let first = cache.get_or_resolve("Atlantide", &resolver).await.unwrap();
    assert_eq!(first, Err(RejectReason::NoResults));

    let calls_after_first = gazetteer.calls();
    let second = cache.get_or_resolve("Atlantide", &resolver).await.unwrap();
    assert_eq!(second, Err(RejectReason::NoResults));
    assert_eq!(gazetteer.calls(), calls_after_first);
}

#[tokio::test]
async fn cache_persists_across_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDir::new(dir.path());
    let gazetteer = Arc::new(
        ScriptedGazetteer::default()
            .respond("Cerignola", vec![named_hit("Cerignola", "place", "town", 1, 0.6)]),
    );
    let resolver = resolver(Arc::clone(&gazetteer), test_config());

    {
        let mut cache = GeocodeCache::load(&job);
        cache.get_or_resolve("Cerignola", &resolver).await.unwrap();
    }

    // A fresh cache instance serves the stored outcome with no lookup.
    let reloaded = GeocodeCache::load(&job);
    assert_eq!(reloaded.len(), 1);
    let outcome = reloaded.get("cerignola").unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn corrupt_cache_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDir::new(dir.path());
    std::fs::write(job.geocache_path(), "{broken").unwrap();

    let cache = GeocodeCache::load(&job);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn malformed_cache_entries_are_dropped_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDir::new(dir.path());
    std::fs::write(
        job.geocache_path(),
        r#"{
            "cerignola": {"ok": true},
            "atlantide": {"ok": false, "reason": "no_results"}
        }"#,
    )
    .unwrap();

    let cache = GeocodeCache::load(&job);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get("atlantide"), Some(Err(RejectReason::NoResults)));
}
