//! External place lookup: variant search, ranking, candidate normalization.
//!
//! The resolver issues up to four phrasings of a term against a
//! Nominatim-compatible service, dedupes the hits by source identifier,
//! ranks them by (tier, name-match strength, importance), and returns the
//! single best candidate or a typed rejection. Transport failures on one
//! variant degrade to "no results from that variant", never to an error.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use placetrace_common::{
    normalize, GeoCandidate, GeocodeConfig, GeometrySource, RejectReason, ResolveResult,
};

use crate::artifacts::JobDir;

// ---------------------------------------------------------------------------
// Category tables
// ---------------------------------------------------------------------------

const PRIMARY_PLACE_TYPES: &[&str] = &[
    "city",
    "town",
    "village",
    "hamlet",
    "municipality",
    "city_district",
    "borough",
    "quarter",
    "suburb",
    "neighbourhood",
    "neighborhood",
    "locality",
];

const SECONDARY_PLACE_TYPES: &[&str] = &[
    "county",
    "province",
    "region",
    "state",
    "country",
    "island",
    "archipelago",
    "state_district",
    "department",
];

const POI_TYPES: &[(&str, &str)] = &[
    ("railway", "station"),
    ("aeroway", "aerodrome"),
    ("aeroway", "airport"),
    ("tourism", "attraction"),
    ("natural", "peak"),
    ("natural", "bay"),
];

/// Minimal Italian → English exonym table for terms the home-language
/// lookup cannot find under their local spelling.
const EXONYMS: &[(&str, &str)] = &[
    ("parigi", "paris"),
    ("berna", "bern"),
    ("francia", "france"),
    ("spagna", "spain"),
    ("brasile", "brazil"),
    ("svizzera", "switzerland"),
    ("libia", "libya"),
    ("puglie", "puglia"),
    ("regno unito", "united kingdom"),
    ("stati uniti", "united states"),
    ("paesi bassi", "netherlands"),
];

fn exonym_for(key: &str) -> Option<&'static str> {
    EXONYMS
        .iter()
        .find(|(from, _)| *from == key)
        .map(|(_, to)| *to)
}

// ---------------------------------------------------------------------------
// Gazetteer seam
// ---------------------------------------------------------------------------

/// One raw hit from the lookup service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GazetteerHit {
    #[serde(default)]
    pub lat: Option<String>,
    #[serde(default)]
    pub lon: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, rename = "class")]
    pub class_tag: Option<String>,
    #[serde(default, rename = "type")]
    pub type_tag: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub osm_id: Option<i64>,
    #[serde(default)]
    pub osm_type: Option<String>,
    #[serde(default)]
    pub admin_level: Option<serde_json::Value>,
    #[serde(default)]
    pub address: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub namedetails: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub extratags: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub geojson: Option<serde_json::Value>,
}

/// The external lookup seam. Production uses [`NominatimClient`]; tests
/// substitute a scripted in-memory gazetteer.
#[async_trait]
pub trait Gazetteer: Send + Sync {
    /// One raw lookup. Transport-level failures are `Err`; the resolver
    /// treats them as an empty variant, not an aborting error.
    async fn search(
        &self,
        query: &str,
        countrycodes: Option<&str>,
    ) -> Result<Vec<GazetteerHit>>;
}

// Lets tests share the gazetteer handle for call-count assertions.
#[async_trait]
impl<G: Gazetteer + ?Sized> Gazetteer for std::sync::Arc<G> {
    async fn search(
        &self,
        query: &str,
        countrycodes: Option<&str>,
    ) -> Result<Vec<GazetteerHit>> {
        (**self).search(query, countrycodes).await
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

fn admin_level(hit: &GazetteerHit) -> u32 {
    let from_value = |v: &serde_json::Value| -> Option<u32> {
        match v {
            serde_json::Value::Number(n) => n.as_u64().map(|n| n as u32),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    };
    if let Some(tags) = &hit.extratags {
        if let Some(level) = tags.get("admin_level").and_then(from_value) {
            return level;
        }
    }
    hit.admin_level.as_ref().and_then(from_value).unwrap_or(0)
}

/// Quality bucket, lower is better.
///
/// 0 = populated place or national/regional admin boundary,
/// 1 = provincial/municipal admin boundary,
/// 2 = province/region-as-place or other admin boundary,
/// 3 = whitelisted POI (stations, airports, landmarks),
/// 8 = has coordinates but no recognized category,
/// 9 = rejected.
pub fn rank_tier(hit: &GazetteerHit) -> u8 {
    let class = hit.class_tag.as_deref().unwrap_or("").to_lowercase();
    let typ = hit.type_tag.as_deref().unwrap_or("").to_lowercase();

    if class == "place" && PRIMARY_PLACE_TYPES.contains(&typ.as_str()) {
        return 0;
    }

    if class == "boundary" && typ == "administrative" {
        let level = admin_level(hit);
        if (1..=4).contains(&level) {
            return 0;
        }
        if (5..=6).contains(&level) {
            return 1;
        }
        return 2;
    }

    if class == "place" && SECONDARY_PLACE_TYPES.contains(&typ.as_str()) {
        return 2;
    }

    if POI_TYPES.contains(&(class.as_str(), typ.as_str())) {
        return 3;
    }

    if hit.lat.is_some() && hit.lon.is_some() {
        return 8;
    }

    9
}

/// Every name variant worth comparing the query against, normalized.
fn collect_names(hit: &GazetteerHit) -> BTreeSet<String> {
    let mut names = BTreeSet::new();

    if let Some(details) = &hit.namedetails {
        for field in ["name", "official_name", "short_name"] {
            if let Some(v) = details.get(field).and_then(|v| v.as_str()) {
                names.insert(normalize(v));
            }
        }
        // Multi-valued OSM tags are semicolon-joined.
        for field in ["alt_name", "old_name", "loc_name"] {
            if let Some(v) = details.get(field).and_then(|v| v.as_str()) {
                for part in v.split(';') {
                    let part = part.trim();
                    if !part.is_empty() {
                        names.insert(normalize(part));
                    }
                }
            }
        }
        // Localized names (name:xx).
        for (k, v) in details {
            if k.starts_with("name:") {
                if let Some(v) = v.as_str() {
                    names.insert(normalize(v));
                }
            }
        }
    }

    if let Some(display) = &hit.display_name {
        if let Some(head) = display.split(',').next() {
            names.insert(normalize(head));
        }
    }

    names.retain(|n| !n.is_empty());
    names
}

/// 2 = exact match against a name variant, 1 = strong partial match in a
/// name or address field, 0 = nothing convincing.
pub fn name_match_strength(query_key: &str, hit: &GazetteerHit) -> u8 {
    let names = collect_names(hit);
    if names.contains(query_key) {
        return 2;
    }

    let long_enough = query_key.len() >= 4;
    if long_enough {
        for name in &names {
            if name.contains(query_key) || query_key.contains(name.as_str()) {
                return 1;
            }
        }
        if let Some(address) = &hit.address {
            for field in [
                "country", "state", "region", "province", "county", "city", "town", "village",
            ] {
                if let Some(v) = address.get(field).and_then(|v| v.as_str()) {
                    if normalize(v).contains(query_key) {
                        return 1;
                    }
                }
            }
        }
    }

    0
}

struct Ranked {
    tier: u8,
    strength: u8,
    importance: f64,
    hit: GazetteerHit,
}

/// Pick the best hit: ascending tier, descending name-match strength,
/// descending importance, source id as the final tie-break so the result
/// is independent of input order.
fn best_hit(hits: Vec<GazetteerHit>, query_key: &str) -> Option<Ranked> {
    let mut ranked: Vec<Ranked> = hits
        .into_iter()
        .map(|hit| Ranked {
            tier: rank_tier(&hit),
            strength: name_match_strength(query_key, &hit),
            importance: hit.importance.unwrap_or(0.0),
            hit,
        })
        .collect();

    ranked.sort_by(|a, b| {
        a.tier
            .cmp(&b.tier)
            .then(b.strength.cmp(&a.strength))
            .then(b.importance.total_cmp(&a.importance))
            .then_with(|| source_id(&a.hit).cmp(&source_id(&b.hit)))
    });

    ranked.into_iter().next()
}

fn source_id(hit: &GazetteerHit) -> (Option<String>, Option<i64>) {
    (hit.osm_type.clone(), hit.osm_id)
}

fn parse_coord(value: Option<&String>) -> f64 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(0.0)
}

/// Normalize a winning hit into the immutable cached candidate.
fn candidate_from_hit(hit: &GazetteerHit, raw_name: &str) -> GeoCandidate {
    let lat = parse_coord(hit.lat.as_ref());
    let lon = parse_coord(hit.lon.as_ref());

    let (geometry, geometry_source) = match &hit.geojson {
        Some(geom) if geom.is_object() => (geom.clone(), GeometrySource::Polygon),
        _ => (
            json!({ "type": "Point", "coordinates": [lon, lat] }),
            GeometrySource::Centroid,
        ),
    };

    let level = admin_level(hit);
    GeoCandidate {
        lat,
        lon,
        display_name: hit
            .display_name
            .clone()
            .unwrap_or_else(|| raw_name.to_string()),
        class_tag: hit.class_tag.clone(),
        type_tag: hit.type_tag.clone(),
        importance: hit.importance,
        osm_id: hit.osm_id,
        osm_type: hit.osm_type.clone(),
        raw: raw_name.to_string(),
        admin_level: (level > 0).then_some(level),
        geometry,
        geometry_source,
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct GeocodeResolver<G> {
    gazetteer: G,
    config: GeocodeConfig,
}

impl<G: Gazetteer> GeocodeResolver<G> {
    pub fn new(gazetteer: G, config: GeocodeConfig) -> Self {
        Self { gazetteer, config }
    }

    /// Resolve one term to its best geographic candidate.
    ///
    /// Variants, in order: home-country biased, explicit country suffix,
    /// unrestricted global, exonym translation when the table has one.
    /// A fixed delay separates the external calls.
    pub async fn resolve(&self, name: &str) -> ResolveResult {
        let query_key = normalize(name);

        let mut variants: Vec<(&'static str, String, Option<String>)> = Vec::new();
        if let Some(cc) = &self.config.home_country {
            variants.push(("home_bias", name.to_string(), Some(cc.clone())));
            variants.push((
                "country_suffix",
                format!("{}, {}", name, self.config.country_suffix),
                Some(cc.clone()),
            ));
        }
        variants.push(("global", name.to_string(), None));
        if let Some(alias) = exonym_for(&query_key) {
            if normalize(alias) != query_key {
                variants.push(("exonym", alias.to_string(), None));
            }
        }

        let mut hits: Vec<GazetteerHit> = Vec::new();
        let mut seen: BTreeSet<(Option<String>, Option<i64>)> = BTreeSet::new();

        for (label, query, countrycodes) in &variants {
            match self.gazetteer.search(query, countrycodes.as_deref()).await {
                Ok(batch) => {
                    debug!(label, query = query.as_str(), hits = batch.len(), "Lookup variant done");
                    for hit in batch {
                        if seen.insert(source_id(&hit)) {
                            hits.push(hit);
                        }
                    }
                }
                Err(e) => {
                    warn!(label, query = query.as_str(), error = %e, "Lookup variant failed");
                }
            }
            if !self.config.delay.is_zero() {
                tokio::time::sleep(self.config.delay).await;
            }
        }

        let Some(best) = best_hit(hits, &query_key) else {
            return Err(RejectReason::NoResults);
        };
        if best.tier >= 9 {
            return Err(RejectReason::NoAcceptedCandidate);
        }

        Ok(candidate_from_hit(&best.hit, name))
    }
}

// ---------------------------------------------------------------------------
// Nominatim client (production)
// ---------------------------------------------------------------------------

pub struct NominatimClient {
    http: reqwest::Client,
    config: GeocodeConfig,
    debug_path: PathBuf,
}

impl NominatimClient {
    pub fn new(config: GeocodeConfig, job: &JobDir) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            debug_path: job.lookup_debug_path(),
        })
    }

    /// Write-only diagnostic side-channel for the raw last call. Failures
    /// are ignored; this never participates in control flow.
    fn dump_debug(&self, payload: serde_json::Value) {
        let _ = std::fs::write(
            &self.debug_path,
            serde_json::to_string_pretty(&payload).unwrap_or_default(),
        );
    }
}

#[async_trait]
impl Gazetteer for NominatimClient {
    async fn search(
        &self,
        query: &str,
        countrycodes: Option<&str>,
    ) -> Result<Vec<GazetteerHit>> {
        let url = format!("{}/search", self.config.base_url.trim_end_matches('/'));
        let limit = self.config.limit.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("q", query),
            ("format", "jsonv2"),
            ("limit", &limit),
            ("addressdetails", "1"),
            ("namedetails", "1"),
            ("extratags", "1"),
            ("polygon_geojson", "1"),
            ("polygon_threshold", "0.005"),
            ("accept-language", &self.config.accept_language),
            ("dedupe", "1"),
        ];
        if let Some(cc) = countrycodes {
            params.push(("countrycodes", cc));
        }

        let response = match self
            .http
            .get(&url)
            .query(&params)
            .header(
                "User-Agent",
                format!("placetrace/0.1 ({})", self.config.contact),
            )
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.dump_debug(json!({
                    "stage": "network_error",
                    "query": query,
                    "error": e.to_string(),
                }));
                bail!("network error querying gazetteer: {e}");
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.dump_debug(json!({
                "stage": "http_error",
                "status": status.as_u16(),
                "query": query,
                "body": body.chars().take(8000).collect::<String>(),
            }));
            bail!("gazetteer returned {status} for {query:?}");
        }

        match response.json::<Vec<GazetteerHit>>().await {
            Ok(hits) => Ok(hits),
            Err(e) => {
                self.dump_debug(json!({
                    "stage": "bad_payload",
                    "query": query,
                    "error": e.to_string(),
                }));
                bail!("gazetteer returned an unparsable payload for {query:?}: {e}");
            }
        }
    }
}
