//! Toponym reconciliation and geocoding-resolution engine.
//!
//! The engine operates on one job working directory at a time: it combines
//! the raw extraction artifacts with the curator's override decisions into
//! an active term set per page, then resolves each distinct term to a
//! geographic candidate through a rate-limited external gazetteer with a
//! disk-backed cache.
//!
//! Reconciliation is synchronous and pure, safe to recompute on demand.
//! Batch geocoding runs as a single background task per job, observable
//! through a polling-friendly progress artifact.

pub mod artifacts;
pub mod batch;
pub mod cache;
pub mod geocode;
pub mod materialize;
pub mod overrides;
pub mod reconcile;

pub use artifacts::JobDir;
pub use batch::{run_batch, BatchOutcome, JobRunner};
pub use cache::GeocodeCache;
pub use geocode::{Gazetteer, GazetteerHit, GeocodeResolver, NominatimClient};
pub use overrides::OverrideStore;
pub use reconcile::{page_meta, resolve_model};
