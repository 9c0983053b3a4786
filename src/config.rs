//! TOML configuration for the matrixwatch analyzer.
//!
//! Layered model: compiled-in defaults per section, an optional TOML file
//! (explicit path, then `MATRIXWATCH_CONFIG`, then the system location), and
//! load-time validation that replaces each invalid value with its default
//! instead of refusing to start.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MATRIXWATCH_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/matrixwatch/matrixwatch.toml";

/// A single rejected configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field}: window size {value} must be at least {min}")]
    WindowTooSmall { field: String, value: usize, min: usize },
    #[error("{field}: threshold {value} must be finite and > 0")]
    InvalidThreshold { field: String, value: f64 },
    #[error("{field}: duration {value} must be finite and > 0")]
    InvalidDuration { field: String, value: f64 },
    #[error("{field}: value {value} must lie in (0, 1]")]
    OutOfUnitRange { field: String, value: f64 },
    #[error("{field}: value must be > 0")]
    Zero { field: String },
    #[error("{field}: invalid cron expression '{expr}': {reason}")]
    InvalidCron { field: String, expr: String, reason: String },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the analyzer process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file at `path` and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded matrixwatch configuration");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: Self = toml::from_str(content)?;
        Ok(raw.validated())
    }

    /// Try, in order: an explicit path, `MATRIXWATCH_CONFIG`, the system
    /// location, then compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(env_path));
        }
        let system_path = PathBuf::from(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            candidates.push(system_path);
        }

        for path in candidates {
            match Self::load(&path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "config file could not be loaded, trying fallback"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Validate every section, logging each rejected value and replacing it
    /// with the documented default.
    pub fn validated(self) -> Self {
        let (cfg, errors) = self.validate();
        for e in &errors {
            warn!(error = %e, "invalid configuration value, falling back to default");
        }
        cfg
    }

    /// Pure validation: returns the corrected config and every rejection.
    pub fn validate(mut self) -> (Self, Vec<ConfigError>) {
        let mut errors = Vec::new();
        self.detector.validate(&mut errors);
        self.cluster.validate(&mut errors);
        self.index.validate(&mut errors);
        self.patterns.validate(&mut errors);
        self.offline.validate(&mut errors);
        let bus = BusConfig::default();
        check_nonzero("bus.capacity", &mut self.bus.capacity, bus.capacity, &mut errors);
        check_nonzero("bus.poll_interval_secs", &mut self.bus.poll_interval_secs, bus.poll_interval_secs, &mut errors);
        check_nonzero("bus.tick_ms", &mut self.bus.tick_ms, bus.tick_ms, &mut errors);
        self.storage.validate(&mut errors);
        (self, errors)
    }
}

fn check_threshold(field: &str, value: &mut f64, default: f64, errors: &mut Vec<ConfigError>) {
    if !value.is_finite() || *value <= 0.0 {
        errors.push(ConfigError::InvalidThreshold { field: field.into(), value: *value });
        *value = default;
    }
}

fn check_duration(field: &str, value: &mut f64, default: f64, errors: &mut Vec<ConfigError>) {
    if !value.is_finite() || *value <= 0.0 {
        errors.push(ConfigError::InvalidDuration { field: field.into(), value: *value });
        *value = default;
    }
}

fn check_unit(field: &str, value: &mut f64, default: f64, errors: &mut Vec<ConfigError>) {
    if !value.is_finite() || *value <= 0.0 || *value > 1.0 {
        errors.push(ConfigError::OutOfUnitRange { field: field.into(), value: *value });
        *value = default;
    }
}

fn check_nonzero<T: PartialEq + Default + Copy>(
    field: &str,
    value: &mut T,
    default: T,
    errors: &mut Vec<ConfigError>,
) {
    if *value == T::default() {
        errors.push(ConfigError::Zero { field: field.into() });
        *value = default;
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Online anomaly detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Default sliding window length per parameter.
    pub window_size: usize,
    /// Default `|z|` threshold.
    pub z_threshold: f64,
    /// Minimum window occupancy before any anomaly may be emitted.
    pub min_history: usize,
    /// Per-parameter overrides, keyed by `source.field` or bare `field`.
    pub overrides: HashMap<String, ParameterOverride>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            z_threshold: 4.0,
            min_history: 10,
            overrides: HashMap::new(),
        }
    }
}

/// Optional per-parameter tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterOverride {
    pub window_size: Option<usize>,
    pub z_threshold: Option<f64>,
}

impl DetectorConfig {
    fn validate(&mut self, errors: &mut Vec<ConfigError>) {
        let defaults = Self::default();
        check_nonzero("detector.min_history", &mut self.min_history, defaults.min_history, errors);
        if self.window_size < self.min_history {
            errors.push(ConfigError::WindowTooSmall {
                field: "detector.window_size".into(),
                value: self.window_size,
                min: self.min_history,
            });
            self.window_size = defaults.window_size.max(self.min_history);
        }
        check_threshold("detector.z_threshold", &mut self.z_threshold, defaults.z_threshold, errors);

        let min_history = self.min_history;
        for (name, ov) in self.overrides.iter_mut() {
            if let Some(size) = ov.window_size {
                if size < min_history {
                    errors.push(ConfigError::WindowTooSmall {
                        field: format!("detector.overrides.{name}.window_size"),
                        value: size,
                        min: min_history,
                    });
                    ov.window_size = None;
                }
            }
            if let Some(z) = ov.z_threshold {
                if !z.is_finite() || z <= 0.0 {
                    errors.push(ConfigError::InvalidThreshold {
                        field: format!("detector.overrides.{name}.z_threshold"),
                        value: z,
                    });
                    ov.z_threshold = None;
                }
            }
        }
    }

    /// Resolve the `(window_size, z_threshold)` pair for a parameter.
    /// A `source.field` override wins over a bare `field` override.
    pub fn resolve(&self, source: &str, field: &str) -> (usize, f64) {
        let qualified = format!("{source}.{field}");
        let ov = self
            .overrides
            .get(&qualified)
            .or_else(|| self.overrides.get(field));
        match ov {
            Some(ov) => (
                ov.window_size.unwrap_or(self.window_size),
                ov.z_threshold.unwrap_or(self.z_threshold),
            ),
            None => (self.window_size, self.z_threshold),
        }
    }
}

// ---------------------------------------------------------------------------
// Live clustering
// ---------------------------------------------------------------------------

/// Live-path cluster detector settings.
///
/// `live_window_secs` is the proximity window used by the real-time pipeline
/// only; the retrospective analyzer uses `offline.cluster_window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub live_window_secs: f64,
    /// Clusters below this level are learned from but never surfaced.
    pub min_significant_level: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            live_window_secs: 30.0,
            min_significant_level: 3,
        }
    }
}

impl ClusterConfig {
    fn validate(&mut self, errors: &mut Vec<ConfigError>) {
        let d = Self::default();
        check_duration("cluster.live_window_secs", &mut self.live_window_secs, d.live_window_secs, errors);
        check_nonzero(
            "cluster.min_significant_level",
            &mut self.min_significant_level,
            d.min_significant_level,
            errors,
        );
    }
}

// ---------------------------------------------------------------------------
// Composite index
// ---------------------------------------------------------------------------

/// Composite anomaly index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Seconds between persisted index snapshots.
    pub interval_secs: u64,
    /// Anomalies younger than this feed the current score.
    pub recent_window_secs: f64,
    /// Trailing window for the baseline rolling mean.
    pub baseline_lookback_hours: f64,
    /// Per-source weight overrides (points at full magnitude).
    pub weights: BTreeMap<String, f64>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            recent_window_secs: 3600.0,
            baseline_lookback_hours: 24.0,
            weights: BTreeMap::new(),
        }
    }
}

impl IndexConfig {
    fn validate(&mut self, errors: &mut Vec<ConfigError>) {
        let d = Self::default();
        check_nonzero("index.interval_secs", &mut self.interval_secs, d.interval_secs, errors);
        check_duration("index.recent_window_secs", &mut self.recent_window_secs, d.recent_window_secs, errors);
        check_duration(
            "index.baseline_lookback_hours",
            &mut self.baseline_lookback_hours,
            d.baseline_lookback_hours,
            errors,
        );
        self.weights.retain(|source, w| {
            if w.is_finite() && *w >= 0.0 {
                true
            } else {
                errors.push(ConfigError::InvalidThreshold {
                    field: format!("index.weights.{source}"),
                    value: *w,
                });
                false
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Pattern tracker
// ---------------------------------------------------------------------------

/// Historical pattern tracker and prediction honesty rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Statistical reliability floor for serving.
    pub min_sample_size: u64,
    /// Events later than this after a condition are not matched to it.
    pub lookahead_hours: f64,
    /// Predictions must start at least this far in the future.
    pub min_lead_minutes: f64,
    /// Widest admissible window for window-sensitive categories.
    pub max_window_hours: f64,
    pub window_sensitive_categories: Vec<String>,
    pub denylisted_event_types: Vec<String>,
    pub denylisted_categories: Vec<String>,
    /// Learned but never served.
    pub hidden_categories: Vec<String>,
    pub prediction_ttl_hours: f64,
    pub refresh_interval_secs: u64,
    /// Observations a temporal pattern needs before it replaces the base one.
    pub temporal_min_observations: u64,
    pub max_recent_conditions: usize,
    pub max_offsets_per_entry: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 10,
            lookahead_hours: 72.0,
            min_lead_minutes: 30.0,
            max_window_hours: 12.0,
            window_sensitive_categories: vec!["earthquake".into()],
            denylisted_event_types: vec!["earthquake_moderate".into()],
            denylisted_categories: Vec::new(),
            hidden_categories: vec!["other".into()],
            prediction_ttl_hours: 24.0,
            refresh_interval_secs: 300,
            temporal_min_observations: 50,
            max_recent_conditions: 5000,
            max_offsets_per_entry: 1000,
        }
    }
}

impl PatternConfig {
    fn validate(&mut self, errors: &mut Vec<ConfigError>) {
        let d = Self::default();
        check_nonzero("patterns.min_sample_size", &mut self.min_sample_size, d.min_sample_size, errors);
        check_duration("patterns.lookahead_hours", &mut self.lookahead_hours, d.lookahead_hours, errors);
        if !self.min_lead_minutes.is_finite() || self.min_lead_minutes < 0.0 {
            errors.push(ConfigError::InvalidDuration {
                field: "patterns.min_lead_minutes".into(),
                value: self.min_lead_minutes,
            });
            self.min_lead_minutes = d.min_lead_minutes;
        }
        check_duration("patterns.max_window_hours", &mut self.max_window_hours, d.max_window_hours, errors);
        check_duration(
            "patterns.prediction_ttl_hours",
            &mut self.prediction_ttl_hours,
            d.prediction_ttl_hours,
            errors,
        );
        check_nonzero(
            "patterns.refresh_interval_secs",
            &mut self.refresh_interval_secs,
            d.refresh_interval_secs,
            errors,
        );
        check_nonzero(
            "patterns.max_recent_conditions",
            &mut self.max_recent_conditions,
            d.max_recent_conditions,
            errors,
        );
        check_nonzero(
            "patterns.max_offsets_per_entry",
            &mut self.max_offsets_per_entry,
            d.max_offsets_per_entry,
            errors,
        );
    }
}

// ---------------------------------------------------------------------------
// Offline family
// ---------------------------------------------------------------------------

/// Batch analyzer settings.
///
/// `cluster_window_secs` is the retrospective graph window, deliberately
/// finer than `cluster.live_window_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub cluster_window_secs: f64,
    pub multi_source_threshold: usize,
    pub correlation_threshold: f64,
    pub min_samples: usize,
    pub max_lag_secs: i64,
    pub causal_lag_secs: i64,
    pub min_lag_correlation: f64,
    pub precursor_windows: Vec<u64>,
    pub precursor_min_frequency: f64,
    pub precursor_z_threshold: f64,
    pub mi_bins: usize,
    pub mi_threshold: f64,
    /// Cron expression (seconds resolution) for scheduled batch runs.
    pub schedule: String,
    /// How much history a scheduled run reads.
    pub lookback_hours: f64,
    /// Resampling resolution of the parameter frame.
    pub bucket_secs: f64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            cluster_window_secs: 3.0,
            multi_source_threshold: 3,
            correlation_threshold: 0.7,
            min_samples: 30,
            max_lag_secs: 60,
            causal_lag_secs: 5,
            min_lag_correlation: 0.5,
            precursor_windows: vec![5, 10, 30],
            precursor_min_frequency: 0.3,
            precursor_z_threshold: 2.0,
            mi_bins: 20,
            mi_threshold: 0.1,
            schedule: "0 0 * * * *".into(),
            lookback_hours: 24.0,
            bucket_secs: 1.0,
        }
    }
}

impl OfflineConfig {
    fn validate(&mut self, errors: &mut Vec<ConfigError>) {
        let d = Self::default();
        check_duration(
            "offline.cluster_window_secs",
            &mut self.cluster_window_secs,
            d.cluster_window_secs,
            errors,
        );
        check_unit(
            "offline.correlation_threshold",
            &mut self.correlation_threshold,
            d.correlation_threshold,
            errors,
        );
        check_unit(
            "offline.min_lag_correlation",
            &mut self.min_lag_correlation,
            d.min_lag_correlation,
            errors,
        );
        check_unit(
            "offline.precursor_min_frequency",
            &mut self.precursor_min_frequency,
            d.precursor_min_frequency,
            errors,
        );
        check_threshold(
            "offline.precursor_z_threshold",
            &mut self.precursor_z_threshold,
            d.precursor_z_threshold,
            errors,
        );
        check_nonzero("offline.min_samples", &mut self.min_samples, d.min_samples, errors);
        check_nonzero("offline.max_lag_secs", &mut self.max_lag_secs, d.max_lag_secs, errors);
        if self.mi_bins < 2 {
            errors.push(ConfigError::WindowTooSmall {
                field: "offline.mi_bins".into(),
                value: self.mi_bins,
                min: 2,
            });
            self.mi_bins = d.mi_bins;
        }
        if self.precursor_windows.iter().any(|w| *w == 0) || self.precursor_windows.is_empty() {
            errors.push(ConfigError::Zero { field: "offline.precursor_windows".into() });
            self.precursor_windows = d.precursor_windows.clone();
        }
        check_duration("offline.lookback_hours", &mut self.lookback_hours, d.lookback_hours, errors);
        check_duration("offline.bucket_secs", &mut self.bucket_secs, d.bucket_secs, errors);
        if let Err(e) = cron::Schedule::from_str(&self.schedule) {
            errors.push(ConfigError::InvalidCron {
                field: "offline.schedule".into(),
                expr: self.schedule.clone(),
                reason: e.to_string(),
            });
            self.schedule = d.schedule;
        }
    }
}

// ---------------------------------------------------------------------------
// Bus, storage, notify, api, logging
// ---------------------------------------------------------------------------

/// Reading fan-out channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Pending items per subscriber before the oldest are dropped.
    pub capacity: usize,
    /// How often built-in sensors are polled.
    pub poll_interval_secs: u64,
    /// Wall-clock period of the live stage's maintenance tick.
    pub tick_ms: u64,
    /// Poll the host's own load and memory as the `system` source.
    pub system_sensor: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            poll_interval_secs: 10,
            tick_ms: 1000,
            system_sensor: true,
        }
    }
}

/// Durable store location and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Maximum writes held in memory while the store is unavailable.
    pub retry_capacity: usize,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/matrixwatch.db"),
            retry_capacity: 256,
            retry_base_ms: 500,
            retry_max_ms: 60_000,
        }
    }
}

impl StorageConfig {
    fn validate(&mut self, errors: &mut Vec<ConfigError>) {
        let d = Self::default();
        check_nonzero("storage.retry_capacity", &mut self.retry_capacity, d.retry_capacity, errors);
        check_nonzero("storage.retry_base_ms", &mut self.retry_base_ms, d.retry_base_ms, errors);
        if self.retry_max_ms < self.retry_base_ms {
            errors.push(ConfigError::InvalidDuration {
                field: "storage.retry_max_ms".into(),
                value: self.retry_max_ms as f64,
            });
            self.retry_max_ms = d.retry_max_ms.max(self.retry_base_ms);
        }
    }
}

/// Outbound notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// When unset, notifications go to the log only.
    pub webhook_url: Option<String>,
    /// Minimum cluster level that triggers a notification.
    pub min_level: usize,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            min_level: 3,
            timeout_secs: 10,
        }
    }
}

/// Status surface listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Tracing output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();

        assert_eq!(cfg.detector.window_size, 100);
        assert_eq!(cfg.detector.z_threshold, 4.0);
        assert_eq!(cfg.detector.min_history, 10);

        assert_eq!(cfg.cluster.live_window_secs, 30.0);
        assert_eq!(cfg.cluster.min_significant_level, 3);
        assert_eq!(cfg.offline.cluster_window_secs, 3.0);

        assert_eq!(cfg.index.interval_secs, 60);
        assert_eq!(cfg.index.baseline_lookback_hours, 24.0);

        assert_eq!(cfg.patterns.min_lead_minutes, 30.0);
        assert_eq!(cfg.patterns.max_window_hours, 12.0);
        assert_eq!(cfg.patterns.denylisted_event_types, vec!["earthquake_moderate"]);

        assert_eq!(cfg.bus.capacity, 1000);

        let (_, errors) = cfg.validate();
        assert!(errors.is_empty(), "defaults must validate: {errors:?}");
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[detector]
window_size = 200
z_threshold = 3.5

[detector.overrides."crypto.btc_price"]
z_threshold = 5.0

[detector.overrides.kp_index]
window_size = 50

[cluster]
live_window_secs = 20.0

[patterns]
min_sample_size = 25
denylisted_categories = ["blockchain"]

[offline]
max_lag_secs = 30
schedule = "0 */15 * * * *"

[logging]
level = "debug"
json = true
"#;

        let cfg = Config::from_toml(toml_str).unwrap();
        assert_eq!(cfg.detector.window_size, 200);
        assert_eq!(cfg.detector.resolve("crypto", "btc_price"), (200, 5.0));
        assert_eq!(cfg.detector.resolve("space_weather", "kp_index"), (50, 3.5));
        assert_eq!(cfg.detector.resolve("news", "count"), (200, 3.5));
        assert_eq!(cfg.cluster.live_window_secs, 20.0);
        assert_eq!(cfg.patterns.min_sample_size, 25);
        assert_eq!(cfg.patterns.denylisted_categories, vec!["blockchain"]);
        assert_eq!(cfg.offline.max_lag_secs, 30);
        assert_eq!(cfg.offline.schedule, "0 */15 * * * *");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg = Config::from_toml("[bus]\ncapacity = 64\n").unwrap();
        assert_eq!(cfg.bus.capacity, 64);
        assert_eq!(cfg.detector.window_size, 100);
        assert_eq!(cfg.patterns.prediction_ttl_hours, 24.0);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let mut cfg = Config::default();
        cfg.detector.window_size = 3;
        cfg.detector.z_threshold = -1.0;
        cfg.cluster.live_window_secs = f64::NAN;
        cfg.offline.correlation_threshold = 1.5;
        cfg.offline.schedule = "not a cron".into();
        cfg.bus.capacity = 0;

        let (fixed, errors) = cfg.validate();
        assert_eq!(errors.len(), 6, "{errors:?}");
        assert_eq!(fixed.detector.window_size, 100);
        assert_eq!(fixed.detector.z_threshold, 4.0);
        assert_eq!(fixed.cluster.live_window_secs, 30.0);
        assert_eq!(fixed.offline.correlation_threshold, 0.7);
        assert_eq!(fixed.offline.schedule, "0 0 * * * *");
        assert_eq!(fixed.bus.capacity, 1000);
    }

    #[test]
    fn test_bad_override_is_dropped_not_fatal() {
        let toml_str = r#"
[detector.overrides.latency_ms]
window_size = 2
z_threshold = 6.0
"#;
        let raw: Config = toml::from_str(toml_str).unwrap();
        let (fixed, errors) = raw.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("latency_ms.window_size"));
        assert_eq!(fixed.detector.resolve("network", "latency_ms"), (100, 6.0));
    }
}
