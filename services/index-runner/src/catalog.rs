//! Layer catalog.
//!
//! Every artifact the runner produces is registered here under a stable id
//! so downstream jobs can find it without knowing file names. The default
//! backend is a JSON file replaced atomically on every write.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Catalog entity type of spectral and index layers.
pub const GEOSPATIAL_LAYER: &str = "GeoSpatialLayer";

/// Catalog entity type of heat-risk predictions.
pub const HEAT_MAP: &str = "UHIHeatMap";

/// Catalog errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("layer not found in catalog: {0}")]
    NotFound(String),

    #[error("layer {id} points at missing file {path}")]
    MissingFile { id: String, path: PathBuf },

    #[error("catalog I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CatalogError {
    /// Whether retrying the same lookup could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Range and meaning of a layer's decoded values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRangeRecord {
    pub min: f32,
    pub max: f32,
    pub description: String,
}

/// One registered layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRecord {
    pub id: String,
    /// `GeoSpatialLayer` or `UHIHeatMap`
    pub entity_type: String,
    /// RGB, NIR, NDVI, NDWI, UHI_PREDICTION
    pub layer_type: String,
    pub name: String,
    pub file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectral_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_range: Option<ValueRangeRecord>,
    /// Ids of the layers this one was computed from
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_layers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    /// `[min_x, min_y, max_x, max_y]` in the raster's own CRS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsg: Option<u16>,
    pub generated_at: DateTime<Utc>,
}

impl LayerRecord {
    /// A spectral or index layer.
    pub fn layer(
        id: impl Into<String>,
        layer_type: impl Into<String>,
        name: impl Into<String>,
        file_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type: GEOSPATIAL_LAYER.to_string(),
            layer_type: layer_type.into(),
            name: name.into(),
            file_path: file_path.into(),
            spectral_range: None,
            value_range: None,
            input_layers: Vec::new(),
            model_version: None,
            bounds: None,
            epsg: None,
            generated_at: Utc::now(),
        }
    }
}

/// Storage for layer records.
#[async_trait]
pub trait LayerCatalog: Send + Sync {
    /// Look up a record by id.
    async fn get(&self, id: &str) -> Result<Option<LayerRecord>, CatalogError>;

    /// Insert or replace a record.
    async fn upsert(&self, record: LayerRecord) -> Result<(), CatalogError>;

    /// All records, ordered by id.
    async fn list(&self) -> Result<Vec<LayerRecord>, CatalogError>;

    /// File path of a record that must exist both in the catalog and on disk.
    async fn resolve_path(&self, id: &str) -> Result<PathBuf, CatalogError> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;

        if !record.file_path.exists() {
            return Err(CatalogError::MissingFile {
                id: id.to_string(),
                path: record.file_path,
            });
        }
        Ok(record.file_path)
    }
}

/// Catalog persisted as a pretty-printed JSON map keyed by id.
pub struct FileCatalog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, LayerRecord>, CatalogError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => {
                return Err(CatalogError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| CatalogError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Write to a sibling temp file, then rename over the catalog.
    async fn store(&self, records: &BTreeMap<String, LayerRecord>) -> Result<(), CatalogError> {
        let io_err = |source: std::io::Error| CatalogError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
        }

        let json = serde_json::to_vec_pretty(records).map_err(|source| CatalogError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

#[async_trait]
impl LayerCatalog for FileCatalog {
    async fn get(&self, id: &str) -> Result<Option<LayerRecord>, CatalogError> {
        Ok(self.load().await?.remove(id))
    }

    async fn upsert(&self, record: LayerRecord) -> Result<(), CatalogError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let id = record.id.clone();
        let replaced = records.insert(id.clone(), record).is_some();
        self.store(&records).await?;

        info!(id = %id, replaced = replaced, "Registered layer");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<LayerRecord>, CatalogError> {
        Ok(self.load().await?.into_values().collect())
    }
}

/// Retry `op` with exponential backoff while it fails transiently.
///
/// `NotFound` and `MissingFile` are returned immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    initial_delay: Duration,
    mut op: F,
) -> Result<T, CatalogError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CatalogError>>,
{
    let attempts = attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Catalog lookup failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                debug!(attempt = attempt, error = %e, "Catalog lookup failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_upsert_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("nested/catalog.json"));

        assert!(catalog.get("missing").await.unwrap().is_none());

        let record = LayerRecord::layer("layer:1", "NDVI", "NDVI Test", "/tmp/ndvi.tif");
        catalog.upsert(record.clone()).await.unwrap();
        assert_eq!(catalog.get("layer:1").await.unwrap(), Some(record));

        let mut updated = LayerRecord::layer("layer:1", "NDVI", "NDVI Test v2", "/tmp/ndvi.tif");
        updated.input_layers = vec!["layer:0".to_string()];
        catalog.upsert(updated.clone()).await.unwrap();

        let all = catalog.list().await.unwrap();
        assert_eq!(all, vec![updated]);
        assert!(!dir.path().join("nested/catalog.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_catalog_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        FileCatalog::new(&path)
            .upsert(LayerRecord::layer("b", "NIR", "NIR", "/tmp/nir.tif"))
            .await
            .unwrap();
        FileCatalog::new(&path)
            .upsert(LayerRecord::layer("a", "RGB", "RGB", "/tmp/rgb.tif"))
            .await
            .unwrap();

        let ids: Vec<String> = FileCatalog::new(&path)
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(json.contains("\"layerType\": \"RGB\""));
    }

    #[tokio::test]
    async fn test_resolve_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = FileCatalog::new(dir.path().join("catalog.json"));

        assert!(matches!(
            catalog.resolve_path("nope").await,
            Err(CatalogError::NotFound(_))
        ));

        let gone = dir.path().join("gone.tif");
        catalog
            .upsert(LayerRecord::layer("gone", "NDVI", "NDVI", &gone))
            .await
            .unwrap();
        assert!(matches!(
            catalog.resolve_path("gone").await,
            Err(CatalogError::MissingFile { .. })
        ));

        std::fs::write(&gone, b"x").unwrap();
        assert_eq!(catalog.resolve_path("gone").await.unwrap(), gone);
    }

    #[tokio::test]
    async fn test_corrupt_catalog_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let err = FileCatalog::new(&path).get("x").await.unwrap_err();
        assert!(matches!(err, CatalogError::Corrupt { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_retry_with_backoff_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CatalogError::Io {
                        path: PathBuf::from("/x"),
                        source: std::io::Error::new(std::io::ErrorKind::Interrupted, "busy"),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_stops_on_not_found() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CatalogError::NotFound("x".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(CatalogError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
