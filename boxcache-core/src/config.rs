//! Cache configuration, loadable from JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::sample::ticks_from_duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Create a cache manager per track. When off every lookup goes
    /// straight to the adapter.
    pub enabled: bool,
    /// Target time span of one cache window.
    pub read_ahead_ms: u64,
    /// Records requested while the block size is still unknown.
    pub inference_len: u32,
    /// Keep a checkpoint index for append-only tracks.
    pub random_access: bool,
    /// Sample headers parsed per `request_more_container_metadata` call.
    pub need_more_budget: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_ahead_ms: 2_000,
            inference_len: 8,
            random_access: true,
            need_more_budget: 64,
        }
    }
}

impl CacheConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig =
            serde_json::from_str(json).map_err(|e| CacheError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.read_ahead_ms == 0 {
            return Err(CacheError::Config("read_ahead_ms must be > 0".into()));
        }
        if self.inference_len < 2 {
            return Err(CacheError::Config("inference_len must be at least 2".into()));
        }
        if self.need_more_budget <= 0 {
            return Err(CacheError::Config("need_more_budget must be > 0".into()));
        }
        Ok(())
    }

    pub fn read_ahead(&self) -> Duration {
        Duration::from_millis(self.read_ahead_ms)
    }

    /// Read-ahead span in 100 ns ticks.
    pub fn read_ahead_extent(&self) -> u64 {
        ticks_from_duration(self.read_ahead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.read_ahead_extent(), 20_000_000);
        assert_eq!(config.inference_len, 8);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = CacheConfig::from_json_str(r#"{ "read_ahead_ms": 200 }"#).unwrap();
        assert_eq!(config.read_ahead_extent(), 2_000_000);
        assert!(config.random_access);
        assert_eq!(config.need_more_budget, 64);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "read_ahead_ms": 0 }"#),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "inference_len": 1 }"#),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_json_str("not json"),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "enabled": false, "random_access": false }}"#).unwrap();

        let config = CacheConfig::from_json_file(file.path()).unwrap();
        assert!(!config.enabled);
        assert!(!config.random_access);
        assert_eq!(config.read_ahead_ms, 2_000);
    }
}
