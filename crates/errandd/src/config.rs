//! Daemon configuration.
//!
//! Configuration for `errandd`, including:
//! - Log output format
//! - Marketplace tuning (see [`MarketConfig`])
//! - Runners seeded into the in-memory directory at startup

use std::path::Path;

use errand_market::{Coordinate, MarketConfig, MarketError, UserId};
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// A runner registered at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerSeed {
    /// Runner id.
    pub id: String,
    /// Last known latitude.
    pub latitude: f64,
    /// Last known longitude.
    pub longitude: f64,
}

impl RunnerSeed {
    /// Runner id as a [`UserId`].
    pub fn user_id(&self) -> UserId {
        UserId::new(self.id.clone())
    }

    /// Last known location.
    pub const fn location(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Marketplace configuration.
    #[serde(default)]
    pub market: MarketConfig,
    /// Runners seeded at startup.
    #[serde(default)]
    pub runners: Vec<RunnerSeed>,
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MarketError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            MarketError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, MarketError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MarketError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, MarketError> {
        toml::to_string_pretty(self)
            .map_err(|e| MarketError::Config(format!("failed to serialize config: {e}")))
    }

    /// Write configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MarketError> {
        let content = self.to_toml()?;
        std::fs::write(path.as_ref(), content).map_err(|e| {
            MarketError::Config(format!(
                "failed to write config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<(), MarketError> {
        self.market.validate()?;

        let mut seen = std::collections::HashSet::new();
        for runner in &self.runners {
            if runner.id.trim().is_empty() {
                return Err(MarketError::Config("runner id cannot be empty".to_string()));
            }
            if !seen.insert(runner.id.as_str()) {
                return Err(MarketError::Config(format!(
                    "duplicate runner id '{}'",
                    runner.id
                )));
            }
            if !runner.location().is_valid() {
                return Err(MarketError::Config(format!(
                    "runner '{}' has an invalid location",
                    runner.id
                )));
            }
        }

        Ok(())
    }

    /// A sample configuration with a few runners around central London.
    pub fn sample() -> Self {
        let runners = [
            ("runner-westminster", 51.4995, -0.1248),
            ("runner-soho", 51.5136, -0.1365),
            ("runner-southbank", 51.5055, -0.1160),
        ]
        .into_iter()
        .map(|(id, latitude, longitude)| RunnerSeed {
            id: id.to_string(),
            latitude,
            longitude,
        })
        .collect();

        Self {
            log_format: LogFormat::Text,
            market: MarketConfig::default(),
            runners,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use errand_market::MatchStrategy;

    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.market.strategy, MatchStrategy::Broadcast);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            log_format = "json"

            [market]
            offer_ttl_ms = 30000
            errand_ttl_secs = 600
            strategy = "sequential"
            broadcast_limit = 3
            sweep_interval_ms = 1000

            [market.retry]
            max_attempts = 5
            backoff_ms = 50

            [market.pricing]
            service_fee_bps = 1500
            distance_rate_per_km = 300

            [[runners]]
            id = "r1"
            latitude = 51.5
            longitude = -0.12
        "#;

        let config = DaemonConfig::from_toml(toml).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.market.strategy, MatchStrategy::Sequential);
        assert_eq!(config.market.offer_ttl_ms, 30_000);
        assert_eq!(config.market.retry.max_attempts, 5);
        assert_eq!(config.market.pricing.distance_rate_per_km, 300);
        assert_eq!(config.runners.len(), 1);
        assert_eq!(config.runners[0].user_id(), UserId::new("r1"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[market]\nbroadcast_limit = 4").unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.market.broadcast_limit, 4);
    }

    #[test]
    fn test_file_not_found() {
        let err = DaemonConfig::from_file("/nonexistent/errandd.toml").unwrap_err();
        assert!(matches!(err, MarketError::Config(_)));
    }

    #[test]
    fn test_invalid_market_values_rejected() {
        let err = DaemonConfig::from_toml("[market]\noffer_ttl_ms = 0").unwrap_err();
        assert!(err.to_string().contains("offer_ttl_ms"));
    }

    #[test]
    fn test_oversized_ttls_rejected() {
        let err = DaemonConfig::from_toml("[market]\nerrand_ttl_secs = 9223372036854775807")
            .unwrap_err();
        assert!(matches!(err, MarketError::Config(_)));
        assert!(err.to_string().contains("errand_ttl_secs"));

        let err = DaemonConfig::from_toml("[market]\noffer_ttl_ms = 9223372036854775807")
            .unwrap_err();
        assert!(err.to_string().contains("offer_ttl_ms"));
    }

    #[test]
    fn test_duplicate_runner_rejected() {
        let toml = r#"
            [[runners]]
            id = "r1"
            latitude = 0.0
            longitude = 0.0

            [[runners]]
            id = "r1"
            latitude = 1.0
            longitude = 1.0
        "#;
        let err = DaemonConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_invalid_runner_location_rejected() {
        let toml = r#"
            [[runners]]
            id = "r1"
            latitude = 91.0
            longitude = 0.0
        "#;
        assert!(DaemonConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(DaemonConfig::from_toml("this is not = = toml").is_err());
    }

    #[test]
    fn test_sample_saves_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errandd.toml");

        let sample = DaemonConfig::sample();
        sample.save(&path).unwrap();

        let loaded = DaemonConfig::from_file(&path).unwrap();
        assert_eq!(loaded, sample);
    }
}
