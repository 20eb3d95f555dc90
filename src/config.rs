//! Configuration Module
//!
//! Cache configuration with serde defaults, validation, and YAML loading.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{CacheError, Result};

fn default_page_sizes() -> Vec<u64> {
    // Two segments, 64 MiB each: a probationary page and a hot page.
    vec![64 * 1024 * 1024, 64 * 1024 * 1024]
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_lifecheck_period_ms() -> u64 {
    1_000
}

fn default_populate_on_miss() -> bool {
    true
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Per-page byte budgets, coldest first; the length determines the
    /// number of SLRU levels and the sum is the overall cache budget.
    #[serde(default = "default_page_sizes")]
    pub page_sizes: Vec<u64>,

    /// Default sync deadline for writes that do not specify one.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,

    /// Lower bound on the lifecycle loop wake frequency.
    #[serde(default = "default_lifecheck_period_ms")]
    pub lifecheck_period_ms: u64,

    /// When false, every miss surfaces as NotFound instead of consulting
    /// the backend.
    #[serde(default = "default_populate_on_miss")]
    pub populate_on_miss: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_sizes: default_page_sizes(),
            sync_interval_ms: default_sync_interval_ms(),
            lifecheck_period_ms: default_lifecheck_period_ms(),
            populate_on_miss: default_populate_on_miss(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CacheError::Config(format!("failed to read config file: {}", e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: CacheConfig = serde_yaml::from_str(contents)
            .map_err(|e| CacheError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.page_sizes.is_empty() {
            return Err(CacheError::Config(
                "page_sizes must name at least one page".to_string(),
            ));
        }
        if let Some(level) = self.page_sizes.iter().position(|&size| size == 0) {
            return Err(CacheError::Config(format!(
                "page {} has a zero byte budget",
                level
            )));
        }
        if self.lifecheck_period_ms == 0 {
            return Err(CacheError::Config(
                "lifecheck_period_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn lifecheck_period(&self) -> Duration {
        Duration::from_millis(self.lifecheck_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_sizes.len(), 2);
        assert!(config.populate_on_miss);
    }

    #[test]
    fn test_empty_pages_rejected() {
        let config = CacheConfig {
            page_sizes: vec![],
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_zero_page_budget_rejected() {
        let config = CacheConfig {
            page_sizes: vec![1024, 0],
            ..CacheConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CacheError::Config(msg) if msg.contains("page 1")));
    }

    #[test]
    fn test_zero_lifecheck_period_rejected() {
        let config = CacheConfig {
            lifecheck_period_ms: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_yaml_round_trip_with_defaults() {
        let config = CacheConfig::from_yaml_str("page_sizes: [100, 200]\n").unwrap();
        assert_eq!(config.page_sizes, vec![100, 200]);
        assert_eq!(config.sync_interval_ms, default_sync_interval_ms());
        assert!(config.populate_on_miss);
    }

    #[test]
    fn test_yaml_file_loading() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "page_sizes: [4096]").unwrap();
        writeln!(file, "sync_interval_ms: 250").unwrap();
        file.flush().unwrap();

        let config = CacheConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.page_sizes, vec![4096]);
        assert_eq!(config.sync_interval_ms, 250);
        assert_eq!(config.lifecheck_period_ms, default_lifecheck_period_ms());
    }

    #[test]
    fn test_yaml_file_missing_surfaces_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CacheConfig::from_yaml_file(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn test_yaml_invalid_config_surfaces_validation_error() {
        assert!(CacheConfig::from_yaml_str("page_sizes: []\n").is_err());
    }
}
