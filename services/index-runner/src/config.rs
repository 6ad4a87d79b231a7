//! Runner configuration.
//!
//! Loaded from environment variables, or from a YAML file that may use
//! `${VAR}` and `${VAR:-default}` substitution.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};

use raster_index::EngineConfig;

/// Top-level runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Directory holding raw orthophotos
    #[serde(default = "default_raw_path")]
    pub raw_path: PathBuf,

    /// Directory receiving computed layers
    #[serde(default = "default_processed_path")]
    pub processed_path: PathBuf,

    /// JSON file backing the layer catalog
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Area name used in file names and entity ids
    #[serde(default = "default_area")]
    pub area: String,

    /// Acquisition year used in file names and entity ids
    #[serde(default = "default_year")]
    pub year: i32,

    /// Catalog id of the NDVI layer read by `predict`
    #[serde(default)]
    pub ndvi_entity_id: Option<String>,

    /// Catalog id of the NDWI layer read by `predict`
    #[serde(default)]
    pub ndwi_entity_id: Option<String>,

    /// Attempts for catalog lookups
    #[serde(default = "default_catalog_retries")]
    pub catalog_retries: u32,

    /// Initial delay between catalog attempts (doubles each retry)
    #[serde(default = "default_catalog_retry_delay_ms")]
    pub catalog_retry_delay_ms: u64,

    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_raw_path() -> PathBuf {
    PathBuf::from("/data/raw")
}

fn default_processed_path() -> PathBuf {
    PathBuf::from("/data/processed")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("/data/catalog.json")
}

fn default_area() -> String {
    "brussels".to_string()
}

fn default_year() -> i32 {
    Utc::now().year()
}

fn default_catalog_retries() -> u32 {
    3
}

fn default_catalog_retry_delay_ms() -> u64 {
    500
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            raw_path: default_raw_path(),
            processed_path: default_processed_path(),
            catalog_path: default_catalog_path(),
            area: default_area(),
            year: default_year(),
            ndvi_entity_id: None,
            ndwi_entity_id: None,
            catalog_retries: default_catalog_retries(),
            catalog_retry_delay_ms: default_catalog_retry_delay_ms(),
            engine: EngineConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            engine: EngineConfig::from_env(),
            ..Self::default()
        };

        if let Ok(val) = env::var("DATA_RAW_PATH") {
            config.raw_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("DATA_PROCESSED_PATH") {
            config.processed_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("CATALOG_PATH") {
            config.catalog_path = PathBuf::from(val);
        }
        if let Ok(val) = env::var("AREA") {
            config.area = val;
        }
        if let Ok(val) = env::var("YEAR") {
            config.year = val
                .parse()
                .with_context(|| format!("YEAR must be an integer, got {:?}", val))?;
        }
        config.ndvi_entity_id = env::var("NDVI_ENTITY_ID").ok();
        config.ndwi_entity_id = env::var("NDWI_ENTITY_ID").ok();

        config.validate()?;
        Ok(config)
    }

    /// Load and parse a YAML file with environment variable substitution.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read runner config from {:?}", path.as_ref()))?;

        let expanded = expand_env_vars(&content)?;

        let config: RunnerConfig = serde_yaml::from_str(&expanded)
            .with_context(|| format!("Failed to parse runner config from {:?}", path.as_ref()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.area.trim().is_empty(), "area cannot be empty");
        anyhow::ensure!(
            !self.area.contains(['/', '\\', ':']),
            "area must not contain path or id separators: {}",
            self.area
        );
        anyhow::ensure!(self.catalog_retries > 0, "catalog_retries must be > 0");
        self.engine
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid engine config: {}", e))?;
        Ok(())
    }

    /// Catalog id of the NDVI layer.
    pub fn ndvi_id(&self) -> String {
        self.ndvi_entity_id
            .clone()
            .unwrap_or_else(|| layer_entity_id("NDVI", &self.area, self.year))
    }

    /// Catalog id of the NDWI layer.
    pub fn ndwi_id(&self) -> String {
        self.ndwi_entity_id
            .clone()
            .unwrap_or_else(|| layer_entity_id("NDWI", &self.area, self.year))
    }

    /// Catalog id of the heat map produced by `predict`.
    pub fn heat_map_id(&self) -> String {
        format!("urn:ngsi-ld:UHIHeatMap:{}:{}", self.area, self.year)
    }

    /// `<processed>/<prefix>_<area>_<year>.tif`
    pub fn output_path(&self, prefix: &str) -> PathBuf {
        self.processed_path
            .join(format!("{}_{}_{}.tif", prefix, self.area, self.year))
    }

    /// Initial catalog retry delay.
    pub fn catalog_retry_delay(&self) -> Duration {
        Duration::from_millis(self.catalog_retry_delay_ms)
    }
}

/// Catalog id of a spectral or derived layer.
pub fn layer_entity_id(layer_type: &str, area: &str, year: i32) -> String {
    format!("urn:ngsi-ld:GeoSpatialLayer:{}:{}:{}", layer_type, area, year)
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in YAML content
/// Supports ${VAR} and ${VAR:-default} syntax
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::new();
    let mut chars = content.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'

            let mut var_expr = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => var_expr.push(c),
                    None => anyhow::bail!("Unclosed variable substitution: ${{{}", var_expr),
                }
            }

            result.push_str(&resolve_var_expr(&var_expr)?);
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

/// Resolve variable expression (supports VAR and VAR:-default syntax)
fn resolve_var_expr(expr: &str) -> Result<String> {
    if let Some((var_name, default)) = expr.split_once(":-") {
        match env::var(var_name.trim()) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Ok(default.to_string()),
        }
    } else {
        env::var(expr.trim()).with_context(|| format!("Environment variable {} not set", expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_with_default() {
        env::remove_var("INDEX_RUNNER_TEST_UNSET");
        let result = expand_env_vars("area: ${INDEX_RUNNER_TEST_UNSET:-ghent}").unwrap();
        assert_eq!(result, "area: ghent");
    }

    #[test]
    fn test_expand_env_vars_simple() {
        env::set_var("INDEX_RUNNER_TEST_AREA", "liege");
        let result = expand_env_vars("prefix_${INDEX_RUNNER_TEST_AREA}_suffix").unwrap();
        assert_eq!(result, "prefix_liege_suffix");
    }

    #[test]
    fn test_expand_env_vars_missing_required() {
        env::remove_var("INDEX_RUNNER_TEST_REQUIRED");
        assert!(expand_env_vars("${INDEX_RUNNER_TEST_REQUIRED}").is_err());
        assert!(expand_env_vars("${UNCLOSED").is_err());
    }

    #[test]
    fn test_from_yaml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        fs::write(
            &path,
            r#"
processed_path: /srv/processed
area: antwerp
year: 2023
engine:
  tile_size: 1024
  overviews:
    factors: [2, 4]
"#,
        )
        .unwrap();

        let config = RunnerConfig::from_yaml(&path).unwrap();
        assert_eq!(config.processed_path, PathBuf::from("/srv/processed"));
        assert_eq!(config.raw_path, PathBuf::from("/data/raw"));
        assert_eq!(config.engine.tile_size, 1024);
        assert_eq!(config.engine.block_size, 512);
        assert_eq!(config.engine.overviews.factors, vec![2, 4]);
        assert_eq!(
            config.output_path("ndvi"),
            PathBuf::from("/srv/processed/ndvi_antwerp_2023.tif")
        );
    }

    #[test]
    fn test_from_yaml_rejects_bad_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.yaml");
        fs::write(&path, "engine:\n  overviews:\n    factors: [3]\n").unwrap();
        assert!(RunnerConfig::from_yaml(&path).is_err());
    }

    #[test]
    fn test_entity_ids() {
        let config = RunnerConfig {
            area: "brussels".to_string(),
            year: 2024,
            ..Default::default()
        };
        assert_eq!(config.ndvi_id(), "urn:ngsi-ld:GeoSpatialLayer:NDVI:brussels:2024");
        assert_eq!(config.ndwi_id(), "urn:ngsi-ld:GeoSpatialLayer:NDWI:brussels:2024");
        assert_eq!(config.heat_map_id(), "urn:ngsi-ld:UHIHeatMap:brussels:2024");

        let overridden = RunnerConfig {
            ndvi_entity_id: Some("custom:ndvi".to_string()),
            ..config
        };
        assert_eq!(overridden.ndvi_id(), "custom:ndvi");
    }
}
