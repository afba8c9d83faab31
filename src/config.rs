//! Engine configuration: every tunable threshold as a TOML value.
//!
//! ## Loading order
//!
//! 1. `SAFEPATH_CONFIG` environment variable (path to a TOML file)
//! 2. `safepath.toml` in the current working directory
//! 3. Built-in defaults
//!
//! After the file is read, `SAFEPATH_PORT`, `SAFEPATH_DATABASE_URL` and
//! `SAFEPATH_REQUEST_TIMEOUT_MS` override the server section. The result is
//! validated; an invalid configuration is a startup error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::aggregation::WeightTable;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Rolling window bounds
    #[serde(default)]
    pub window: WindowConfig,

    /// Per-factor evaluator thresholds
    #[serde(default)]
    pub factors: FactorConfig,

    /// Factor weights and level thresholds used by the aggregator
    #[serde(default)]
    pub weights: WeightTable,

    /// Decision policy and episode tuning
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: String,
    /// Upper bound for one mutating request, including the wait for the
    /// journey's lock and every persistence write.
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "sqlite:safepath.db?mode=rwc".to_string(),
            request_timeout_ms: 2_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Maximum number of points kept per journey.
    pub max_points: usize,
    /// Points older than this (relative to the newest point) are stored but
    /// left out of window-based factor computations.
    pub retention_horizon_secs: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_points: 256,
            retention_horizon_secs: 1_800,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorConfig {
    pub night: NightConfig,
    pub battery: BatteryConfig,
    pub isolation: IsolationConfig,
    pub route: RouteConfig,
    pub speed: SpeedConfig,
}

/// High-risk band of local hours, `[start_hour, end_hour)`, wrapping midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NightConfig {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for NightConfig {
    fn default() -> Self {
        Self {
            start_hour: 21,
            end_hour: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    /// Battery below this percentage is a risk factor.
    pub low_battery_percent: u8,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            low_battery_percent: 10,
        }
    }
}

/// A circular zone on the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub lat: f64,
    pub lng: f64,
    pub radius_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Distance from the nearest safe zone edge beyond which a location counts
    /// as isolated.
    pub isolation_radius_m: f64,
    pub safe_zones: Vec<Zone>,
    pub unsafe_zones: Vec<Zone>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            isolation_radius_m: 2_000.0,
            safe_zones: Vec::new(),
            unsafe_zones: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Corridor half-width floor in meters.
    pub min_corridor_m: f64,
    /// Corridor half-width as a fraction of the distance traveled so far.
    pub corridor_ratio: f64,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            min_corridor_m: 250.0,
            corridor_ratio: 0.25,
        }
    }
}

/// Plausible top speeds per movement state, in meters per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    pub walking_max_mps: f64,
    pub running_max_mps: f64,
    pub cycling_max_mps: f64,
    pub driving_max_mps: f64,
    pub stationary_max_mps: f64,
    /// Multiplier applied to the limits before a reading counts as anomalous.
    pub tolerance: f64,
    /// Below this speed a driving/cycling reading counts as stalled.
    pub stall_speed_mps: f64,
    /// How long a stall must last before it is anomalous.
    pub stall_span_secs: i64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            walking_max_mps: 2.5,
            running_max_mps: 7.0,
            cycling_max_mps: 15.0,
            driving_max_mps: 45.0,
            stationary_max_mps: 0.5,
            tolerance: 1.25,
            stall_speed_mps: 0.3,
            stall_span_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// MEDIUM assessments below this confidence stay silent.
    pub medium_confidence: f64,
    /// CRITICAL assessments at or above this confidence escalate immediately;
    /// below it they are handled as HIGH.
    pub critical_confidence: f64,
    /// Consecutive HIGH ticks that open an escalation episode.
    pub sustained_high_ticks: u32,
    /// Consecutive LOW/MEDIUM ticks that close an open episode.
    pub cooldown_ticks: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            medium_confidence: 0.5,
            critical_confidence: 0.8,
            sustained_high_ticks: 3,
            cooldown_ticks: 3,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error ({shown}): {source}", shown = .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config parse error ({shown}): {source}", shown = .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid environment override {name}={value}")]
    Env { name: &'static str, value: String },

    #[error("config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl EngineConfig {
    /// Load configuration using the standard search order, apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("SAFEPATH_CONFIG") {
            Ok(path) => {
                let config = Self::load_from_file(Path::new(&path))?;
                info!(path = %path, "Loaded config from SAFEPATH_CONFIG");
                config
            }
            Err(_) => {
                let local = PathBuf::from("safepath.toml");
                if local.exists() {
                    let config = Self::load_from_file(&local)?;
                    info!("Loaded config from ./safepath.toml");
                    config
                } else {
                    info!("No safepath.toml found, using built-in defaults");
                    Self::default()
                }
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("SAFEPATH_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::Env {
                name: "SAFEPATH_PORT",
                value: port.clone(),
            })?;
        }
        if let Ok(url) = std::env::var("SAFEPATH_DATABASE_URL") {
            self.server.database_url = url;
        }
        if let Ok(ms) = std::env::var("SAFEPATH_REQUEST_TIMEOUT_MS") {
            self.server.request_timeout_ms = ms.parse().map_err(|_| ConfigError::Env {
                name: "SAFEPATH_REQUEST_TIMEOUT_MS",
                value: ms.clone(),
            })?;
        }
        Ok(())
    }

    /// Check cross-field invariants. Collects every problem instead of
    /// stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.server.request_timeout_ms == 0 {
            errors.push("server.request_timeout_ms must be > 0".to_string());
        }
        if self.window.max_points == 0 {
            errors.push("window.max_points must be > 0".to_string());
        }
        if self.window.retention_horizon_secs <= 0 {
            errors.push("window.retention_horizon_secs must be > 0".to_string());
        }

        let night = &self.factors.night;
        if night.start_hour > 23 || night.end_hour > 23 {
            errors.push("factors.night hours must be within 0..=23".to_string());
        }
        if self.factors.battery.low_battery_percent > 100 {
            errors.push("factors.battery.low_battery_percent must be <= 100".to_string());
        }

        let isolation = &self.factors.isolation;
        if !isolation.isolation_radius_m.is_finite() || isolation.isolation_radius_m <= 0.0 {
            errors.push("factors.isolation.isolation_radius_m must be > 0".to_string());
        }
        for zone in isolation.safe_zones.iter().chain(&isolation.unsafe_zones) {
            if !(-90.0..=90.0).contains(&zone.lat)
                || !(-180.0..=180.0).contains(&zone.lng)
                || !zone.radius_m.is_finite()
                || zone.radius_m < 0.0
            {
                errors.push(format!(
                    "zone ({}, {}, r={}) is out of range",
                    zone.lat, zone.lng, zone.radius_m
                ));
            }
        }

        let route = &self.factors.route;
        if !route.min_corridor_m.is_finite()
            || !route.corridor_ratio.is_finite()
            || route.min_corridor_m <= 0.0
            || route.corridor_ratio < 0.0
        {
            errors.push("factors.route corridor settings must be positive".to_string());
        }

        let speed = &self.factors.speed;
        let limits = [
            speed.walking_max_mps,
            speed.running_max_mps,
            speed.cycling_max_mps,
            speed.driving_max_mps,
            speed.stationary_max_mps,
        ];
        if limits.iter().any(|l| !l.is_finite() || *l <= 0.0)
            || !speed.tolerance.is_finite()
            || speed.tolerance < 1.0
        {
            errors.push(
                "factors.speed limits must be > 0 and tolerance must be >= 1".to_string(),
            );
        }
        if !speed.stall_speed_mps.is_finite() || speed.stall_speed_mps < 0.0 {
            errors.push("factors.speed.stall_speed_mps must be >= 0".to_string());
        }
        if speed.stall_span_secs <= 0 {
            errors.push("factors.speed.stall_span_secs must be > 0".to_string());
        }

        errors.extend(self.weights.problems());

        let policy = &self.policy;
        for (name, value) in [
            ("medium_confidence", policy.medium_confidence),
            ("critical_confidence", policy.critical_confidence),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                errors.push(format!("policy.{name} must be within [0, 1]"));
            }
        }
        if policy.sustained_high_ticks == 0 || policy.cooldown_ticks == 0 {
            errors.push("policy tick spans must be >= 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [policy]
            sustained_high_ticks = 5

            [factors.isolation]
            safe_zones = [{ lat = 23.02, lng = 72.57, radius_m = 1000.0 }]
            "#,
        )
        .unwrap();

        assert_eq!(config.policy.sustained_high_ticks, 5);
        assert_eq!(config.policy.cooldown_ticks, 3);
        assert_eq!(config.factors.isolation.safe_zones.len(), 1);
        assert_eq!(config.factors.night.start_hour, 21);
        assert_eq!(config.window.max_points, 256);
    }

    #[test]
    fn test_example_file_parses() {
        let config =
            EngineConfig::from_toml_str(include_str!("../safepath.example.toml")).unwrap();
        config.validate().unwrap();

        assert_eq!(config.factors.isolation.safe_zones.len(), 3);
        assert_eq!(config.factors.isolation.unsafe_zones.len(), 1);
        assert_eq!(config.weights, crate::aggregation::WeightTable::default());
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = EngineConfig::default();
        config.window.max_points = 0;
        config.policy.cooldown_ticks = 0;
        config.factors.night.start_hour = 24;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_non_finite_numbers_are_rejected() {
        let mut config = EngineConfig::default();
        config.factors.speed.tolerance = f64::NAN;
        config.factors.isolation.isolation_radius_m = f64::NAN;
        config.factors.route.corridor_ratio = f64::INFINITY;
        config.factors.speed.stall_speed_mps = f64::NAN;
        config.policy.critical_confidence = f64::NAN;
        config.weights.thresholds.critical = f64::INFINITY;

        match config.validate() {
            Err(ConfigError::Validation(errors)) => assert_eq!(errors.len(), 6, "{errors:?}"),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_weight_problems_surface() {
        let mut config = EngineConfig::default();
        config.weights.thresholds.high = 0.1;

        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }
}
