use std::env;
use std::time::Duration;

/// Geocoder configuration, loaded from environment variables with
/// defaults suitable for the public Nominatim instance.
#[derive(Debug, Clone)]
pub struct GeocodeConfig {
    /// Base URL of the Nominatim-compatible service.
    pub base_url: String,
    /// Contact address embedded in the User-Agent, per the service's usage policy.
    pub contact: String,
    /// ISO country code biasing the first lookup variant (None disables the bias).
    pub home_country: Option<String>,
    /// Country name appended in the suffixed lookup variant ("Cerignola, Italia").
    pub country_suffix: String,
    /// Preferred language for display names.
    pub accept_language: String,
    /// Maximum results requested per lookup variant.
    pub limit: u32,
    /// Fixed delay between external calls. Fair-use throttle, not tunable for speed.
    pub delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            contact: "placetrace@example.org".to_string(),
            home_country: Some("it".to_string()),
            country_suffix: "Italia".to_string(),
            accept_language: "it".to_string(),
            limit: 15,
            delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(25),
        }
    }
}

impl GeocodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env::var("NOMINATIM_BASE_URL").unwrap_or(defaults.base_url),
            contact: env::var("NOMINATIM_CONTACT").unwrap_or(defaults.contact),
            home_country: match env::var("GEOCODE_COUNTRY") {
                Ok(cc) if cc.trim().is_empty() => None,
                Ok(cc) => Some(cc),
                Err(_) => defaults.home_country,
            },
            country_suffix: env::var("GEOCODE_COUNTRY_SUFFIX").unwrap_or(defaults.country_suffix),
            accept_language: env::var("GEOCODE_ACCEPT_LANGUAGE")
                .unwrap_or(defaults.accept_language),
            limit: parse_env("GEOCODE_RESULT_LIMIT", defaults.limit),
            delay: Duration::from_millis(parse_env(
                "GEOCODE_SLEEP_MS",
                defaults.delay.as_millis() as u64,
            )),
            timeout: Duration::from_secs(parse_env(
                "GEOCODE_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
