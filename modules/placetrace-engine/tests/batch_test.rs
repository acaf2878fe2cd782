//! Batch geocoding driver: artifacts, progress lifecycle, single-flight.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use placetrace_common::{EngineError, GeocodeConfig, JobStatus, Progress};
use placetrace_engine::{
    run_batch, BatchOutcome, Gazetteer, GazetteerHit, GeocodeResolver, JobDir, JobRunner,
};

#[derive(Default)]
struct ScriptedGazetteer {
    responses: HashMap<String, Vec<GazetteerHit>>,
}

impl ScriptedGazetteer {
    fn respond(mut self, query: &str, hits: Vec<GazetteerHit>) -> Self {
        self.responses.insert(query.to_string(), hits);
        self
    }
}

#[async_trait]
impl Gazetteer for ScriptedGazetteer {
    async fn search(&self, query: &str, _countrycodes: Option<&str>) -> Result<Vec<GazetteerHit>> {
        Ok(self.responses.get(query).cloned().unwrap_or_default())
    }
}

fn town(name: &str, osm_id: i64) -> GazetteerHit {
    let mut details = serde_json::Map::new();
    details.insert("name".to_string(), json!(name));
    GazetteerHit {
        lat: Some("41.26".to_string()),
        lon: Some("15.89".to_string()),
        display_name: Some(format!("{name}, Italia")),
        class_tag: Some("place".to_string()),
        type_tag: Some("town".to_string()),
        importance: Some(0.6),
        osm_id: Some(osm_id),
        osm_type: Some("relation".to_string()),
        namedetails: Some(details),
        ..Default::default()
    }
}

fn resolver(gazetteer: ScriptedGazetteer) -> GeocodeResolver<ScriptedGazetteer> {
    let config = GeocodeConfig {
        delay: Duration::ZERO,
        ..Default::default()
    };
    GeocodeResolver::new(gazetteer, config)
}

fn scratch_job() -> (tempfile::TempDir, JobDir) {
    let dir = tempfile::tempdir().unwrap();
    let job = JobDir::new(dir.path());
    (dir, job)
}

fn write_raw_terms(job: &JobDir, rows: &[(&str, &str)]) {
    let mut body = String::from("page,year,doc_id,terms\n");
    for (page, terms) in rows {
        body.push_str(&format!("{page},1937,doc/{page},{terms}\n"));
    }
    fs::write(job.raw_terms_path(), body).unwrap();
}

// ---------------------------------------------------------------------------
// run_batch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_writes_features_rejects_and_terminal_progress() {
    let (_dir, job) = scratch_job();
    write_raw_terms(&job, &[("52", "Cerignola;Bari"), ("53", "Cerignola")]);

    let resolver = resolver(
        ScriptedGazetteer::default().respond("Cerignola", vec![town("Cerignola", 1)]),
    );
    let outcome = run_batch(&job, &resolver).await.unwrap();
    assert_eq!(
        outcome,
        BatchOutcome {
            total_terms: 2,
            features: 1,
            rejects: 1,
        }
    );

    let places: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(job.places_path()).unwrap()).unwrap();
    assert_eq!(places["type"], "FeatureCollection");
    let features = places["features"].as_array().unwrap();
    assert_eq!(features.len(), 1);
    let props = &features[0]["properties"];
    assert_eq!(props["term"], "Cerignola");
    assert_eq!(props["pages"], json!([52, 53]));
    assert_eq!(props["mention_count"], 2);
    assert_eq!(props["geometry_source"], "centroid");

    let rejects = fs::read_to_string(job.geocode_rejects_path()).unwrap();
    assert!(rejects.contains("Bari,no_results"));

    let progress: Progress =
        serde_json::from_str(&fs::read_to_string(job.progress_path()).unwrap()).unwrap();
    assert_eq!(progress.status, JobStatus::Done);
    assert_eq!(progress.done, 2);
    assert_eq!(progress.total, 2);

    // Both outcomes were cached, the rejection included.
    let cache: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(job.geocache_path()).unwrap()).unwrap();
    assert_eq!(cache["cerignola"]["ok"], true);
    assert_eq!(cache["bari"]["ok"], false);
}

#[tokio::test]
async fn batch_with_no_rejects_writes_no_reject_file() {
    let (_dir, job) = scratch_job();
    write_raw_terms(&job, &[("52", "Cerignola")]);

    let resolver = resolver(
        ScriptedGazetteer::default().respond("Cerignola", vec![town("Cerignola", 1)]),
    );
    let outcome = run_batch(&job, &resolver).await.unwrap();
    assert_eq!(outcome.rejects, 0);
    assert!(!job.geocode_rejects_path().exists());
}

#[tokio::test]
async fn batch_prefers_the_materialized_active_set() {
    let (_dir, job) = scratch_job();
    write_raw_terms(&job, &[("52", "Cerignola;Bari")]);
    fs::write(
        job.active_terms_path(),
        "page,year,doc_id,terms\n52,1937,doc/52,Cerignola\n",
    )
    .unwrap();

    let resolver = resolver(
        ScriptedGazetteer::default().respond("Cerignola", vec![town("Cerignola", 1)]),
    );
    let outcome = run_batch(&job, &resolver).await.unwrap();

    // Bari exists only in the raw artifact and must not be queried.
    assert_eq!(outcome.total_terms, 1);
    assert_eq!(outcome.rejects, 0);
}

#[tokio::test]
async fn batch_fails_fast_when_no_input_exists() {
    let (_dir, job) = scratch_job();
    let resolver = resolver(ScriptedGazetteer::default());

    let err = run_batch(&job, &resolver).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InputMissing(_))
    ));
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

#[tokio::test]
async fn runner_completes_a_batch_in_the_background() {
    let (_dir, job) = scratch_job();
    write_raw_terms(&job, &[("52", "Cerignola")]);

    let runner = JobRunner::new(job.clone());
    let resolver = resolver(
        ScriptedGazetteer::default().respond("Cerignola", vec![town("Cerignola", 1)]),
    );
    let handle = runner.start(resolver).unwrap();
    handle.await.unwrap();

    let progress = runner.progress().unwrap();
    assert_eq!(progress.status, JobStatus::Done);
    assert!(job.places_path().exists());
}

#[tokio::test]
async fn runner_refuses_while_a_prior_batch_is_in_flight() {
    let (_dir, job) = scratch_job();
    write_raw_terms(&job, &[("52", "Cerignola")]);
    fs::write(
        job.progress_path(),
        serde_json::to_string(&Progress::running(1, 5, None)).unwrap(),
    )
    .unwrap();

    let runner = JobRunner::new(job);
    let err = runner.start(resolver(ScriptedGazetteer::default())).unwrap_err();
    assert!(matches!(err, EngineError::BatchInFlight));
}

#[tokio::test]
async fn runner_refuses_without_an_input_term_list() {
    let (_dir, job) = scratch_job();
    let runner = JobRunner::new(job);

    let err = runner.start(resolver(ScriptedGazetteer::default())).unwrap_err();
    assert!(matches!(err, EngineError::InputMissing(_)));
}

#[tokio::test]
async fn runner_records_a_done_run_and_allows_the_next() {
    let (_dir, job) = scratch_job();
    write_raw_terms(&job, &[("52", "Cerignola")]);

    let runner = JobRunner::new(job);
    let handle = runner
        .start(resolver(
            ScriptedGazetteer::default().respond("Cerignola", vec![town("Cerignola", 1)]),
        ))
        .unwrap();
    handle.await.unwrap();

    // Terminal progress does not block a rerun.
    let handle = runner
        .start(resolver(
            ScriptedGazetteer::default().respond("Cerignola", vec![town("Cerignola", 1)]),
        ))
        .unwrap();
    handle.await.unwrap();
    assert_eq!(runner.progress().unwrap().status, JobStatus::Done);
}
