//! Configuration loading and resolution
//!
//! Bootstrap configuration comes from a TOML file (`<config_dir>/ppm/ppm.toml`
//! unless a path is given). Individual settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! A missing config file is not an error: compiled defaults are used and a
//! warning is logged. A config file that exists but does not parse or
//! validate is an error.

use crate::db::models::EntityKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const ENV_DATABASE_PATH: &str = "PPM_DATABASE_PATH";
pub const ENV_BIND_ADDRESS: &str = "PPM_BIND_ADDRESS";
pub const ENV_STORE_BACKEND: &str = "PPM_STORE_BACKEND";
pub const ENV_POSTGRES_URL: &str = "PPM_POSTGRES_URL";
pub const ENV_LOG_LEVEL: &str = "PPM_LOG_LEVEL";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// SQLite database holding entities, observations, status and (by default) the aggregate
    pub database_path: Option<PathBuf>,
    /// HTTP listen address; each service has its own compiled default
    pub bind_address: Option<String>,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub refresh: RefreshConfig,
    pub aggregation: AggregationConfig,
    pub read: ReadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    Postgres,
}

impl std::str::FromStr for StoreBackend {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StoreBackend::Sqlite),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(Error::Config(format!("unknown store backend '{}'", other))),
        }
    }
}

/// Where the aggregate is materialized
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub postgres_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// `source_name` of the collection status row
    pub job_name: String,
    /// Run the periodic scheduler
    pub enabled: bool,
    pub interval_secs: u64,
    /// Scheduled cycles are skipped while the last success is younger than this
    pub min_refresh_age_secs: u64,
    pub timeout_secs: u64,
    /// Status reports `needs_refresh` once the last success is older than this
    pub stale_after_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            job_name: "master_data_refresh".to_string(),
            enabled: true,
            interval_secs: 3600,
            min_refresh_age_secs: 3600,
            timeout_secs: 300,
            stale_after_secs: 25 * 3600,
        }
    }
}

impl RefreshConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_refresh_age(&self) -> Duration {
        Duration::from_secs(self.min_refresh_age_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Completeness tiers; must satisfy floor <= baseline <= high_priority <= full
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletenessTiers {
    pub full: f64,
    pub high_priority: f64,
    pub baseline: f64,
    pub floor: f64,
}

impl Default for CompletenessTiers {
    fn default() -> Self {
        Self {
            full: 1.0,
            high_priority: 0.8,
            baseline: 0.6,
            floor: 0.2,
        }
    }
}

/// Composite score weights (all >= 0)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeWeights {
    pub prediction_weight: f64,
    pub sentiment_weight: f64,
    pub volume_weight: f64,
    /// Visitor count at which the volume term saturates to 1.0
    pub volume_saturation: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            prediction_weight: 0.6,
            sentiment_weight: 0.3,
            volume_weight: 0.1,
            volume_saturation: 1000.0,
        }
    }
}

/// Maps an entity's provider to a `data_source_type` tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRule {
    pub tag: String,
    /// Restrict the rule to one entity kind
    #[serde(default)]
    pub kind: Option<EntityKind>,
    /// Exact provider names (case-insensitive)
    #[serde(default)]
    pub providers: Vec<String>,
    /// Provider substrings (case-insensitive)
    #[serde(default)]
    pub provider_contains: Vec<String>,
}

impl ProvenanceRule {
    pub fn matches(&self, kind: EntityKind, provider: &str) -> bool {
        if self.kind.is_some_and(|k| k != kind) {
            return false;
        }
        let provider = provider.to_ascii_lowercase();
        self.providers.iter().any(|p| p.eq_ignore_ascii_case(&provider))
            || self
                .provider_contains
                .iter()
                .any(|needle| provider.contains(&needle.to_ascii_lowercase()))
    }
}

fn default_provenance_rules() -> Vec<ProvenanceRule> {
    let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        ProvenanceRule {
            tag: "api_places".to_string(),
            kind: Some(EntityKind::Venue),
            providers: vec![],
            provider_contains: names(&["google", "places"]),
        },
        ProvenanceRule {
            tag: "api_events".to_string(),
            kind: Some(EntityKind::Event),
            providers: vec![],
            provider_contains: names(&["predicthq"]),
        },
        ProvenanceRule {
            tag: "scraped_static".to_string(),
            kind: Some(EntityKind::Venue),
            providers: names(&[
                "tmobile_center",
                "uptown_theater",
                "kauffman_center",
                "starlight_theatre",
                "midland_theatre",
                "knuckleheads",
                "azura_amphitheater",
            ]),
            provider_contains: vec![],
        },
        ProvenanceRule {
            tag: "scraped_dynamic".to_string(),
            kind: None,
            providers: names(&["visitkc", "do816", "thepitchkc", "aura"]),
            provider_contains: vec![],
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub weather_radius_km: f64,
    /// Area name matched (exact, then prefix) against economic observations
    pub economic_area: String,
    /// Completeness at or above which an entity counts as healthy
    pub healthy_completeness: f64,
    pub completeness: CompletenessTiers,
    pub composite: CompositeWeights,
    /// First matching rule wins
    pub provenance: Vec<ProvenanceRule>,
    pub default_provenance: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            weather_radius_km: 5.0,
            economic_area: "Kansas City".to_string(),
            healthy_completeness: 0.6,
            completeness: CompletenessTiers::default(),
            composite: CompositeWeights::default(),
            provenance: default_provenance_rules(),
            default_provenance: "scraped_local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Ranked-read cache lifetime; 0 disables caching
    pub cache_ttl_secs: u64,
    pub default_limit: i64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            default_limit: 500,
        }
    }
}

impl ReadConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)))
    }
}

fn check_non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Config(format!("{} must be a finite value >= 0, got {}", name, value)))
    }
}

impl TomlConfig {
    /// Parse and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TomlConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or the platform default location), falling back to
    /// compiled defaults when the file does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) => p,
                None => {
                    warn!("Could not determine config directory, using compiled defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            warn!("Config file {} not found, using compiled defaults", path.display());
            return Ok(Self::default());
        }

        info!("Loading configuration from {}", path.display());
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<()> {
        let tiers = &self.aggregation.completeness;
        for (name, value) in [
            ("completeness.full", tiers.full),
            ("completeness.high_priority", tiers.high_priority),
            ("completeness.baseline", tiers.baseline),
            ("completeness.floor", tiers.floor),
        ] {
            check_unit(name, value)?;
        }
        if !(tiers.floor <= tiers.baseline && tiers.baseline <= tiers.high_priority && tiers.high_priority <= tiers.full) {
            return Err(Error::Config(format!(
                "completeness tiers must be non-decreasing (floor {} <= baseline {} <= high_priority {} <= full {})",
                tiers.floor, tiers.baseline, tiers.high_priority, tiers.full
            )));
        }

        let weights = &self.aggregation.composite;
        check_non_negative("composite.prediction_weight", weights.prediction_weight)?;
        check_non_negative("composite.sentiment_weight", weights.sentiment_weight)?;
        check_non_negative("composite.volume_weight", weights.volume_weight)?;
        if !(weights.volume_saturation.is_finite() && weights.volume_saturation > 0.0) {
            return Err(Error::Config(format!(
                "composite.volume_saturation must be > 0, got {}",
                weights.volume_saturation
            )));
        }

        check_unit("aggregation.healthy_completeness", self.aggregation.healthy_completeness)?;
        check_non_negative("aggregation.weather_radius_km", self.aggregation.weather_radius_km)?;
        if self.aggregation.economic_area.trim().is_empty() {
            return Err(Error::Config("aggregation.economic_area must not be empty".to_string()));
        }
        if self.aggregation.provenance.iter().any(|rule| rule.tag.trim().is_empty()) {
            return Err(Error::Config("provenance rules need a non-empty tag".to_string()));
        }

        if self.refresh.job_name.trim().is_empty() {
            return Err(Error::Config("refresh.job_name must not be empty".to_string()));
        }
        if self.refresh.interval_secs == 0 || self.refresh.timeout_secs == 0 {
            return Err(Error::Config(
                "refresh.interval_secs and refresh.timeout_secs must be > 0".to_string(),
            ));
        }
        if self.read.default_limit <= 0 {
            return Err(Error::Config("read.default_limit must be > 0".to_string()));
        }

        Ok(())
    }

    /// Apply environment overrides for the store section and log level
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var(ENV_STORE_BACKEND) {
            self.store.backend = backend.parse()?;
        }
        if let Ok(url) = std::env::var(ENV_POSTGRES_URL) {
            self.store.postgres_url = Some(url);
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        Ok(())
    }
}

/// `<config_dir>/ppm/ppm.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ppm").join("ppm.toml"))
}

/// `<data_local_dir>/ppm/ppm.db`, or `./ppm.db` when no data directory is known
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("ppm").join("ppm.db"))
        .unwrap_or_else(|| PathBuf::from("ppm.db"))
}

/// Database path: CLI > `PPM_DATABASE_PATH` > TOML > platform default
pub fn resolve_database_path(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = &config.database_path {
        return path.clone();
    }
    default_database_path()
}

/// Listen address: CLI > `PPM_BIND_ADDRESS` > TOML > service default
pub fn resolve_bind_address(cli_arg: Option<&str>, config: &TomlConfig, service_default: &str) -> String {
    if let Some(addr) = cli_arg {
        return addr.to_string();
    }
    if let Ok(addr) = std::env::var(ENV_BIND_ADDRESS) {
        if !addr.trim().is_empty() {
            return addr;
        }
    }
    config
        .bind_address
        .clone()
        .unwrap_or_else(|| service_default.to_string())
}
