use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::extract::BatchOrder;
use crate::feed::Category;

/// Top-level configuration for the pitwall monitor.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upstream API configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Number of entities a complete snapshot must contain.
    /// Default: the size of the roster fetched at startup.
    #[serde(default)]
    pub expected_entities: Option<usize>,

    /// How long a category may fail to reach completeness before its
    /// entities are flagged stale. Default: 30s.
    #[serde(default = "default_max_incomplete_window", with = "humantime_serde")]
    pub max_incomplete_window: Duration,

    /// Attempts at the initial roster fetch before startup aborts. Default: 3.
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// Number of race-control messages retained for display. Default: 8.
    #[serde(default = "default_race_control_log_size")]
    pub race_control_log_size: usize,

    /// Per-category polling configuration.
    #[serde(default)]
    pub categories: CategoriesConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Terminal table output configuration.
    #[serde(default)]
    pub render: RenderConfig,
}

/// Upstream API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the timing API. Default: "https://api.openf1.org/v1".
    #[serde(default = "default_api_endpoint")]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Session to monitor. Default: "latest".
    #[serde(default = "default_session_key")]
    pub session_key: String,

    /// Order of records within a response. Default: oldest_first.
    #[serde(default)]
    pub batch_order: BatchOrder,
}

/// Polling settings for one category.
#[derive(Debug, Clone, Copy)]
pub struct CategoryConfig {
    /// Poll this category. Default: true.
    pub enabled: bool,

    /// Polling cadence; also the backoff after a failed cycle.
    /// Default: the category's built-in cadence.
    pub interval: Duration,
}

impl CategoryConfig {
    const fn every(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval,
        }
    }
}

/// Per-category polling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "CategoryOverrides")]
pub struct CategoriesConfig {
    pub drivers: CategoryConfig,
    pub position: CategoryConfig,
    pub intervals: CategoryConfig,
    pub laps: CategoryConfig,
    pub stints: CategoryConfig,
    pub pit: CategoryConfig,
    pub race_control: CategoryConfig,
}

/// Category settings as written in the file. Omitted fields keep the
/// built-in value for that category.
#[derive(Debug, Default, Deserialize)]
struct CategoryOverride {
    enabled: Option<bool>,

    #[serde(default, with = "humantime_serde")]
    interval: Option<Duration>,
}

impl CategoryOverride {
    fn apply(self, base: CategoryConfig) -> CategoryConfig {
        CategoryConfig {
            enabled: self.enabled.unwrap_or(base.enabled),
            interval: self.interval.unwrap_or(base.interval),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CategoryOverrides {
    drivers: CategoryOverride,
    position: CategoryOverride,
    intervals: CategoryOverride,
    laps: CategoryOverride,
    stints: CategoryOverride,
    pit: CategoryOverride,
    race_control: CategoryOverride,
}

impl From<CategoryOverrides> for CategoriesConfig {
    fn from(raw: CategoryOverrides) -> Self {
        Self {
            drivers: raw.drivers.apply(default_drivers()),
            position: raw.position.apply(default_position()),
            intervals: raw.intervals.apply(default_intervals()),
            laps: raw.laps.apply(default_laps()),
            stints: raw.stints.apply(default_stints()),
            pit: raw.pit.apply(default_pit()),
            race_control: raw.race_control.apply(default_race_control()),
        }
    }
}

impl CategoriesConfig {
    /// Settings for a single category.
    pub fn get(&self, category: Category) -> CategoryConfig {
        match category {
            Category::Drivers => self.drivers,
            Category::Position => self.position,
            Category::Intervals => self.intervals,
            Category::Laps => self.laps,
            Category::Stints => self.stints,
            Category::Pit => self.pit,
            Category::RaceControl => self.race_control,
        }
    }

    /// Enabled categories with their polling interval, in priority order.
    pub fn enabled(&self) -> Vec<(Category, Duration)> {
        Category::all()
            .iter()
            .map(|&c| (c, self.get(c)))
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(c, cfg)| (c, cfg.interval))
            .collect()
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Terminal table output configuration.
#[derive(Debug, Deserialize)]
pub struct RenderConfig {
    /// Print the standings table. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Minimum time between redraws. Default: 1s.
    #[serde(default = "default_render_interval", with = "humantime_serde")]
    pub interval: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_endpoint() -> String {
    "https://api.openf1.org/v1".to_string()
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_session_key() -> String {
    "latest".to_string()
}

fn default_max_incomplete_window() -> Duration {
    Duration::from_secs(30)
}

fn default_startup_attempts() -> u32 {
    3
}

fn default_race_control_log_size() -> usize {
    8
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_render_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_drivers() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(60))
}

fn default_position() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(4))
}

fn default_intervals() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(4))
}

fn default_laps() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(5))
}

fn default_stints() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(15))
}

fn default_pit() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(5))
}

fn default_race_control() -> CategoryConfig {
    CategoryConfig::every(Duration::from_secs(5))
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api: ApiConfig::default(),
            expected_entities: None,
            max_incomplete_window: default_max_incomplete_window(),
            startup_attempts: default_startup_attempts(),
            race_control_log_size: default_race_control_log_size(),
            categories: CategoriesConfig::default(),
            health: HealthConfig::default(),
            render: RenderConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_api_endpoint(),
            timeout: default_api_timeout(),
            session_key: default_session_key(),
            batch_order: BatchOrder::default(),
        }
    }
}

impl Default for CategoriesConfig {
    fn default() -> Self {
        Self {
            drivers: default_drivers(),
            position: default_position(),
            intervals: default_intervals(),
            laps: default_laps(),
            stints: default_stints(),
            pit: default_pit(),
            race_control: default_race_control(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_render_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.api.endpoint.is_empty() {
            bail!("api.endpoint is required");
        }

        if self.api.session_key.is_empty() {
            bail!("api.session_key is required");
        }

        if self.api.timeout.is_zero() {
            bail!("api.timeout must be positive");
        }

        if self.expected_entities == Some(0) {
            bail!("expected_entities must be at least 1 when set");
        }

        if self.max_incomplete_window.is_zero() {
            bail!("max_incomplete_window must be positive");
        }

        if self.startup_attempts == 0 {
            bail!("startup_attempts must be at least 1");
        }

        if self.race_control_log_size == 0 {
            bail!("race_control_log_size must be positive");
        }

        for &category in Category::all() {
            let cat = self.categories.get(category);
            if cat.enabled && cat.interval.is_zero() {
                bail!("categories.{category}.interval must be positive");
            }
        }

        if self.render.enabled && self.render.interval.is_zero() {
            bail!("render.interval must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.api.endpoint, "https://api.openf1.org/v1");
        assert_eq!(cfg.api.session_key, "latest");
        assert_eq!(cfg.api.batch_order, BatchOrder::OldestFirst);
        assert_eq!(cfg.max_incomplete_window, Duration::from_secs(30));
        assert_eq!(cfg.categories.position.interval, Duration::from_secs(4));
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_overrides() {
        let yaml = r#"
api:
  endpoint: http://localhost:8080/v1
  timeout: 2s
  session_key: "9590"
  batch_order: newest_first
expected_entities: 20
max_incomplete_window: 1m
categories:
  position:
    interval: 500ms
  race_control:
    enabled: false
    interval: 5s
render:
  enabled: false
"#;

        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.api.timeout, Duration::from_secs(2));
        assert_eq!(cfg.api.batch_order, BatchOrder::NewestFirst);
        assert_eq!(cfg.expected_entities, Some(20));
        assert_eq!(cfg.max_incomplete_window, Duration::from_secs(60));
        assert_eq!(cfg.categories.position.interval, Duration::from_millis(500));
        assert!(cfg.categories.position.enabled);
        assert!(!cfg.render.enabled);

        let enabled: Vec<Category> = cfg.categories.enabled().iter().map(|(c, _)| *c).collect();
        assert!(!enabled.contains(&Category::RaceControl));
        assert_eq!(enabled.first(), Some(&Category::Drivers));
    }

    #[test]
    fn test_category_override_keeps_builtin_interval() {
        let yaml = r#"
categories:
  pit:
    enabled: false
  laps:
    interval: 2s
"#;

        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        assert!(cfg.validate().is_ok());

        assert!(!cfg.categories.pit.enabled);
        assert_eq!(cfg.categories.pit.interval, Duration::from_secs(5));
        assert!(cfg.categories.laps.enabled);
        assert_eq!(cfg.categories.laps.interval, Duration::from_secs(2));
        assert_eq!(cfg.categories.position.interval, Duration::from_secs(4));
        assert_eq!(cfg.categories.drivers.interval, Duration::from_secs(60));

        let enabled: Vec<Category> = cfg.categories.enabled().iter().map(|(c, _)| *c).collect();
        assert!(!enabled.contains(&Category::Pit));
        assert_eq!(enabled.len(), Category::all().len() - 1);
    }

    #[test]
    fn test_validation_zero_expected_entities() {
        let cfg = Config {
            expected_entities: Some(0),
            ..Default::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("expected_entities"));
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut cfg = Config::default();
        cfg.categories.laps.interval = Duration::ZERO;
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("categories.laps.interval"));

        cfg.categories.laps.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_endpoint() {
        let cfg = Config {
            api: ApiConfig {
                endpoint: String::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().expect_err("should fail");
        assert!(err.to_string().contains("api.endpoint"));
    }

    #[test]
    fn test_validation_startup_attempts() {
        let cfg = Config {
            startup_attempts: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
