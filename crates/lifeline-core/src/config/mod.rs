//! Configuration parsing and management.
//!
//! The daemon reads a single TOML file. Every section and every key is
//! optional; omitted values take the defaults below.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:8080"
//!
//! [store]
//! backend = "sqlite"
//! sqlite_path = "/var/lib/lifeline/lifeline.db"
//!
//! [emergency_defaults]
//! max_helpers = 5
//!
//! [timeouts]
//! geo_ms = 800
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{DEFAULT_BASE_RADIUS_METERS, MAX_SEARCH_RADIUS_METERS, SearchRadiusPolicy};
use crate::emergency::{EmergencySettings, MAX_HELPERS_LIMIT};
use crate::rate_limit::RateLimitConfig;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LifelineConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerConfig,

    /// Record store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Search-radius limits.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Settings snapshotted into new emergencies when the request leaves
    /// them unset.
    #[serde(default)]
    pub emergency_defaults: EmergencyDefaultsConfig,

    /// Per-call I/O budgets.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Per-client request limiting.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Optimistic-concurrency retries.
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    /// Background sweeps.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl LifelineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Like [`from_file`](Self::from_file), but a missing file yields the
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed or
    /// validated.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            },
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.emergency_defaults;
        if d.max_helpers == 0 || d.max_helpers > MAX_HELPERS_LIMIT {
            return Err(ConfigError::Validation(format!(
                "emergency_defaults.max_helpers must be between 1 and {MAX_HELPERS_LIMIT}"
            )));
        }
        if d.timeout_minutes == 0 {
            return Err(ConfigError::Validation(
                "emergency_defaults.timeout_minutes must be positive".to_string(),
            ));
        }
        if self.dispatch.max_radius_meters == 0
            || self.dispatch.max_radius_meters > MAX_SEARCH_RADIUS_METERS
        {
            return Err(ConfigError::Validation(format!(
                "dispatch.max_radius_meters must be between 1 and {MAX_SEARCH_RADIUS_METERS}"
            )));
        }
        if d.search_radius_meters == 0 || d.search_radius_meters > self.dispatch.max_radius_meters
        {
            return Err(ConfigError::Validation(
                "emergency_defaults.search_radius_meters must be positive and at most \
                 dispatch.max_radius_meters"
                    .to_string(),
            ));
        }
        if self.timeouts.store_ms == 0 || self.timeouts.geo_ms == 0 || self.timeouts.notify_ms == 0
        {
            return Err(ConfigError::Validation(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.rate_limit.enabled
            && (self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0)
        {
            return Err(ConfigError::Validation(
                "rate_limit.max_requests and rate_limit.window_secs must be positive".to_string(),
            ));
        }
        if self.maintenance.enabled && self.maintenance.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "maintenance.sweep_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub listen_addr: String,
    /// Serve `GET /metrics`.
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Which store implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; lost on restart.
    Memory,
    /// `SQLite` file.
    #[default]
    Sqlite,
}

/// Record store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Backend.
    pub backend: StoreBackend,
    /// Database file for the `sqlite` backend.
    pub sqlite_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: PathBuf::from("lifeline.db"),
        }
    }
}

/// Search-radius limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// Cap on any dispatch or nearby-search radius.
    pub max_radius_meters: u32,
    /// Radius of `GET /emergency/nearby/search` when none is given.
    pub nearby_default_radius_meters: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_radius_meters: MAX_SEARCH_RADIUS_METERS,
            nearby_default_radius_meters: DEFAULT_BASE_RADIUS_METERS,
        }
    }
}

impl DispatchConfig {
    /// Radius policy for an emergency whose base radius is `base_meters`.
    #[must_use]
    pub const fn policy(&self, base_meters: u32) -> SearchRadiusPolicy {
        SearchRadiusPolicy {
            base_meters,
            max_meters: self.max_radius_meters,
        }
    }
}

/// The `[emergency_defaults]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmergencyDefaultsConfig {
    /// Dispatch helpers right after an SOS.
    pub auto_assign_helpers: bool,
    /// Maximum helpers requested per dispatch round.
    pub max_helpers: u32,
    /// Base search radius in meters.
    pub search_radius_meters: u32,
    /// Minutes without an acceptance before the stale sweep closes it.
    pub timeout_minutes: u32,
    /// Notify the reporter's guardians on SOS.
    pub notify_guardians: bool,
}

impl Default for EmergencyDefaultsConfig {
    fn default() -> Self {
        let d = EmergencySettings::default();
        Self {
            auto_assign_helpers: d.auto_assign_helpers,
            max_helpers: d.max_helpers,
            search_radius_meters: d.search_radius_meters,
            timeout_minutes: d.timeout_minutes,
            notify_guardians: d.notify_guardians,
        }
    }
}

impl EmergencyDefaultsConfig {
    /// Settings snapshotted into an emergency that leaves them unset.
    #[must_use]
    pub const fn settings(&self) -> EmergencySettings {
        EmergencySettings {
            auto_assign_helpers: self.auto_assign_helpers,
            max_helpers: self.max_helpers,
            search_radius_meters: self.search_radius_meters,
            timeout_minutes: self.timeout_minutes,
            notify_guardians: self.notify_guardians,
        }
    }
}

/// I/O budgets in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Each store call.
    pub store_ms: u64,
    /// Each geo index query.
    pub geo_ms: u64,
    /// Each notification send.
    pub notify_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            store_ms: 2_000,
            geo_ms: 1_500,
            notify_ms: 1_000,
        }
    }
}

impl TimeoutsConfig {
    /// Store budget.
    #[must_use]
    pub const fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }

    /// Geo budget.
    #[must_use]
    pub const fn geo(&self) -> Duration {
        Duration::from_millis(self.geo_ms)
    }

    /// Notification budget.
    #[must_use]
    pub const fn notify(&self) -> Duration {
        Duration::from_millis(self.notify_ms)
    }
}

/// Optimistic-concurrency settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Reload-and-reapply attempts after a version conflict.
    pub max_conflict_retries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
        }
    }
}

/// Background sweep settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Run the sweeps.
    pub enabled: bool,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 60,
        }
    }
}

impl MaintenanceConfig {
    /// Sweep period.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config = LifelineConfig::from_toml("").unwrap();
        assert_eq!(config, LifelineConfig::default());
        assert_eq!(config.emergency_defaults.max_helpers, 3);
        assert_eq!(config.emergency_defaults.search_radius_meters, 5_000);
        assert_eq!(config.emergency_defaults.timeout_minutes, 30);
        assert!(config.emergency_defaults.auto_assign_helpers);
        assert!(config.emergency_defaults.notify_guardians);
        assert_eq!(config.concurrency.max_conflict_retries, 3);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen_addr = "0.0.0.0:9000"
            metrics_enabled = false

            [store]
            backend = "memory"

            [dispatch]
            max_radius_meters = 20000

            [emergency_defaults]
            max_helpers = 5
            auto_assign_helpers = false

            [timeouts]
            geo_ms = 250

            [rate_limit]
            max_requests = 10

            [concurrency]
            max_conflict_retries = 5

            [maintenance]
            sweep_interval_secs = 15
        "#;
        let config = LifelineConfig::from_toml(toml).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert!(!config.server.metrics_enabled);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.dispatch.policy(5_000).max_meters, 20_000);
        assert_eq!(config.emergency_defaults.max_helpers, 5);
        assert!(!config.emergency_defaults.auto_assign_helpers);
        assert_eq!(config.emergency_defaults.timeout_minutes, 30);
        assert_eq!(config.timeouts.geo(), Duration::from_millis(250));
        assert_eq!(config.timeouts.store_ms, 2_000);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.concurrency.max_conflict_retries, 5);
        assert_eq!(config.maintenance.interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        for toml in [
            "[emergency_defaults]\nmax_helpers = 0",
            "[emergency_defaults]\ntimeout_minutes = 0",
            "[dispatch]\nmax_radius_meters = 60000",
            "[dispatch]\nmax_radius_meters = 1000",
            "[timeouts]\nstore_ms = 0",
            "[maintenance]\nsweep_interval_secs = 0",
        ] {
            let err = LifelineConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Validation(_)), "{toml}: {err}");
        }
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let err = LifelineConfig::from_toml("[store]\nbackend = \"postgres\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        for toml in [
            "[emergency_defaults]\nmaxHelpers = 5",
            "[timeouts]\ngeo_millis = 5",
            "[rate_limit]\nmax_request = 5",
            "[emergancy_defaults]\nmax_helpers = 5",
        ] {
            let err = LifelineConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Parse(_)), "{toml}: {err}");
        }
    }

    #[test]
    fn test_emergency_defaults_map_to_settings() {
        let toml = r#"
            [emergency_defaults]
            max_helpers = 7
            search_radius_meters = 1200
            notify_guardians = false
        "#;
        let config = LifelineConfig::from_toml(toml).unwrap();
        let settings = config.emergency_defaults.settings();
        assert_eq!(settings.max_helpers, 7);
        assert_eq!(settings.search_radius_meters, 1_200);
        assert!(!settings.notify_guardians);
        assert!(settings.auto_assign_helpers);
        assert_eq!(
            LifelineConfig::default().emergency_defaults.settings(),
            EmergencySettings::default()
        );
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = LifelineConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(LifelineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LifelineConfig::from_file_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, LifelineConfig::default());

        let path = dir.path().join("lifeline.toml");
        std::fs::write(&path, "[server]\nlisten_addr = \"127.0.0.1:1\"").unwrap();
        let config = LifelineConfig::from_file(&path).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:1");
    }
}
