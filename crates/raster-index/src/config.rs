//! Configuration for the index engine.

use crate::overview::Resampling;
use serde::{Deserialize, Serialize};

/// Default processing window edge, in pixels.
pub const DEFAULT_TILE_SIZE: usize = 2048;

/// Internal block edge of the output raster (web-serving friendly).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Default overview ladder.
pub const DEFAULT_OVERVIEW_FACTORS: [u32; 5] = [2, 4, 8, 16, 32];

/// Configuration for the index engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Edge length of the processing windows read from the inputs.
    pub tile_size: usize,

    /// Edge length of the internal output blocks.
    pub block_size: usize,

    /// Deflate level for output blocks (1-9).
    pub deflate_level: u32,

    /// Memory budget for decoded input chunks in megabytes.
    pub chunk_cache_size_mb: usize,

    /// Log progress every this many tiles.
    pub progress_every: usize,

    /// Overview pyramid settings.
    pub overviews: OverviewConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            deflate_level: 6,
            chunk_cache_size_mb: 64,
            progress_every: 100,
            overviews: OverviewConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("INDEX_TILE_SIZE") {
            if let Ok(size) = val.parse() {
                config.tile_size = size;
            }
        }

        if let Ok(val) = std::env::var("INDEX_BLOCK_SIZE") {
            if let Ok(size) = val.parse() {
                config.block_size = size;
            }
        }

        if let Ok(val) = std::env::var("INDEX_DEFLATE_LEVEL") {
            if let Ok(level) = val.parse() {
                config.deflate_level = level;
            }
        }

        if let Ok(val) = std::env::var("CHUNK_CACHE_SIZE_MB") {
            if let Ok(size) = val.parse() {
                config.chunk_cache_size_mb = size;
            }
        }

        if let Ok(val) = std::env::var("INDEX_PROGRESS_EVERY") {
            if let Ok(every) = val.parse() {
                config.progress_every = every;
            }
        }

        config.overviews = OverviewConfig::from_env();
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.tile_size == 0 {
            return Err("tile_size must be > 0".to_string());
        }

        // TIFF requires tile dimensions to be multiples of 16.
        if self.block_size == 0 || self.block_size % 16 != 0 {
            return Err("block_size must be a positive multiple of 16".to_string());
        }

        if self.deflate_level == 0 || self.deflate_level > 9 {
            return Err("deflate_level must be 1-9".to_string());
        }

        if self.progress_every == 0 {
            return Err("progress_every must be > 0".to_string());
        }

        self.overviews.validate()
    }

    /// Get the chunk cache size in bytes.
    pub fn chunk_cache_size_bytes(&self) -> usize {
        self.chunk_cache_size_mb * 1024 * 1024
    }
}

// ============================================================================
// Overview Configuration
// ============================================================================

/// Configuration for the overview pyramid attached to finished rasters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverviewConfig {
    /// Whether the pipeline builds overviews after writing.
    pub enabled: bool,

    /// Downsample factors relative to full resolution.
    pub factors: Vec<u32>,

    /// Resampling used when building levels.
    pub resampling: Resampling,
}

impl Default for OverviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            factors: DEFAULT_OVERVIEW_FACTORS.to_vec(),
            resampling: Resampling::Average,
        }
    }
}

impl OverviewConfig {
    /// Load overview configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OVERVIEW_ENABLED") {
            config.enabled = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("OVERVIEW_FACTORS") {
            let parsed: Result<Vec<u32>, _> =
                val.split(',').map(|f| f.trim().parse::<u32>()).collect();
            if let Ok(factors) = parsed {
                config.factors = factors;
            }
        }

        if let Ok(val) = std::env::var("OVERVIEW_RESAMPLING") {
            config.resampling = Resampling::from_str(&val);
        }

        config
    }

    /// Validate the overview ladder.
    pub fn validate(&self) -> Result<(), String> {
        validate_factors(&self.factors)
    }
}

/// Check an overview ladder: powers of two, at least 2, strictly increasing.
pub fn validate_factors(factors: &[u32]) -> Result<(), String> {
    if factors.is_empty() {
        return Err("overview factors must not be empty".to_string());
    }

    for factor in factors {
        if *factor < 2 || !factor.is_power_of_two() {
            return Err(format!("overview factor {} is not a power of two >= 2", factor));
        }
    }

    if factors.windows(2).any(|pair| pair[1] <= pair[0]) {
        return Err("overview factors must be strictly increasing".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.tile_size, 2048);
        assert_eq!(config.block_size, 512);
        assert_eq!(config.deflate_level, 6);
        assert!(config.overviews.enabled);
        assert_eq!(config.overviews.factors, vec![2, 4, 8, 16, 32]);
        assert_eq!(config.overviews.resampling, Resampling::Average);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.tile_size = 0;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.block_size = 500;
        assert!(config.validate().is_err());

        config = EngineConfig::default();
        config.deflate_level = 0;
        assert!(config.validate().is_err());

        config.deflate_level = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overview_factor_validation() {
        let mut config = OverviewConfig::default();
        assert!(config.validate().is_ok());

        config.factors = vec![2, 3];
        assert!(config.validate().is_err());

        config.factors = vec![4, 2];
        assert!(config.validate().is_err());

        config.factors = vec![1, 2];
        assert!(config.validate().is_err());

        config.factors = vec![];
        assert!(config.validate().is_err());

        config.factors = vec![2, 8, 64];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"tile_size": 1024, "overviews": {"factors": [2, 4]}}"#)
                .unwrap();
        assert_eq!(config.tile_size, 1024);
        assert_eq!(config.block_size, 512);
        assert_eq!(config.overviews.factors, vec![2, 4]);
        assert!(config.overviews.enabled);
    }
}
