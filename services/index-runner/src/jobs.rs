//! Jobs that drive the index engine.
//!
//! - `ingest`: RGB + NIR orthophotos to NDVI and NDWI layers
//! - `predict`: NDVI layer to a heat-risk map
//! - `overviews`: attach a pyramid to an existing 8-bit raster
//! - `compute`: any built-in formula over explicit band sources
//!
//! Engine runs are synchronous and CPU bound, so they happen on the blocking
//! pool. Layers are registered only after their run is done.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use raster_index::{
    BandSource, FormulaKind, HeatRisk, IndexPipeline, IndexRequest, OverviewBuilder, OverviewOutcome, PipelineOutcome,
    RasterIndexError, Resampling, TiffBandReader,
};
use walkdir::WalkDir;

use crate::catalog::{retry_with_backoff, LayerCatalog, LayerRecord, ValueRangeRecord, HEAT_MAP};
use crate::config::{layer_entity_id, RunnerConfig};
use crate::gate::{GateOutcome, RunGate};

/// What `ingest` produced.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    /// Catalog ids registered, in order.
    pub layers: Vec<String>,
    pub ndvi: PipelineOutcome,
    pub ndwi: PipelineOutcome,
}

/// What `predict` produced.
#[derive(Debug, Clone, Serialize)]
pub struct PredictReport {
    pub entity_id: String,
    pub input_layers: Vec<String>,
    pub outcome: PipelineOutcome,
}

/// Shared state for all jobs.
#[derive(Clone)]
pub struct Runner {
    config: RunnerConfig,
    catalog: Arc<dyn LayerCatalog>,
    pipeline: IndexPipeline,
    gate: RunGate,
}

impl Runner {
    pub fn new(config: RunnerConfig, catalog: Arc<dyn LayerCatalog>) -> Self {
        let pipeline = IndexPipeline::new(config.engine.clone());
        Self {
            config,
            catalog,
            pipeline,
            gate: RunGate::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn LayerCatalog> {
        &self.catalog
    }

    pub fn gate(&self) -> &RunGate {
        &self.gate
    }

    /// Build overviews on the raw orthophotos, compute NDVI and NDWI from
    /// them and register all four layers.
    #[instrument(skip(self, rgb, nir), fields(rgb = %rgb.display(), nir = %nir.display()))]
    pub async fn ingest(&self, rgb: &Path, nir: &Path) -> Result<IngestReport> {
        tokio::fs::create_dir_all(&self.config.processed_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create processed directory {:?}",
                    self.config.processed_path
                )
            })?;

        if self.config.engine.overviews.enabled {
            for raw in [rgb, nir] {
                self.raw_overviews(raw).await?;
            }
        }

        let ndvi_path = self.config.output_path("ndvi");
        let ndwi_path = self.config.output_path("ndwi");

        let ndvi = self
            .run_engine(IndexRequest::ndvi(rgb, nir, &ndvi_path))
            .await?;
        info!(output = %ndvi_path.display(), "NDVI calculated");

        let ndwi = self
            .run_engine(IndexRequest::ndwi(rgb, nir, &ndwi_path))
            .await?;
        info!(output = %ndwi_path.display(), "NDWI calculated");

        let (area, year) = (&self.config.area, self.config.year);
        let mut records = Vec::with_capacity(4);
        for (layer_type, path) in [("RGB", rgb), ("NIR", nir)] {
            let mut record = LayerRecord::layer(
                layer_entity_id(layer_type, area, year),
                layer_type,
                display_name(layer_type, area, year),
                path,
            );
            record.spectral_range = Some(layer_type.to_string());
            records.push(record);
        }
        for outcome in [&ndvi, &ndwi] {
            let layer_type = outcome.layer_type.as_str();
            let mut record = LayerRecord::layer(
                layer_entity_id(layer_type, area, year),
                layer_type,
                display_name(layer_type, area, year),
                &outcome.output,
            );
            record.spectral_range = Some("computed".to_string());
            record.value_range = Some(ValueRangeRecord {
                min: -1.0,
                max: 1.0,
                description: format!("{} index, uint8 encoded, 255=nodata", layer_type),
            });
            record.input_layers = vec![
                layer_entity_id("RGB", area, year),
                layer_entity_id("NIR", area, year),
            ];
            records.push(record);
        }

        let mut layers = Vec::with_capacity(records.len());
        for mut record in records {
            let (bounds, epsg) = raster_extent(&record.file_path).await;
            record.bounds = bounds;
            record.epsg = epsg;

            let id = record.id.clone();
            self.catalog
                .upsert(record)
                .await
                .with_context(|| format!("Failed to register {}", id))?;
            layers.push(id);
        }

        info!(layers = ?layers, "Ingestion completed");
        Ok(IngestReport { layers, ndvi, ndwi })
    }

    /// Compute the heat-risk map from the catalogued NDVI layer.
    #[instrument(skip(self))]
    pub async fn predict(&self) -> Result<PredictReport> {
        let ndvi_id = self.config.ndvi_id();
        let ndwi_id = self.config.ndwi_id();

        let ndvi_path = self
            .lookup(&ndvi_id)
            .await
            .with_context(|| format!("Required NDVI layer {} is not available", ndvi_id))?;
        info!(id = %ndvi_id, path = %ndvi_path.display(), "Resolved NDVI layer");

        // The current model reads NDVI only; NDWI is recorded as an input when present.
        let mut input_layers = vec![ndvi_id];
        match self.lookup(&ndwi_id).await {
            Ok(path) => {
                info!(id = %ndwi_id, path = %path.display(), "Resolved NDWI layer");
                input_layers.push(ndwi_id);
            }
            Err(e) => warn!(id = %ndwi_id, error = %e, "NDWI layer unavailable, continuing without it"),
        }

        tokio::fs::create_dir_all(&self.config.processed_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create processed directory {:?}",
                    self.config.processed_path
                )
            })?;

        let output = self.config.output_path("uhi_prediction");
        let outcome = self
            .run_engine(IndexRequest::heat_risk(&ndvi_path, &output))
            .await?;

        let entity_id = self.config.heat_map_id();
        let (bounds, epsg) = raster_extent(&output).await;
        let record = LayerRecord {
            id: entity_id.clone(),
            entity_type: HEAT_MAP.to_string(),
            layer_type: outcome.layer_type.clone(),
            name: format!(
                "UHI Prediction {} {}",
                title_case(&self.config.area),
                self.config.year
            ),
            file_path: output,
            spectral_range: None,
            value_range: Some(ValueRangeRecord {
                min: 0.0,
                max: 1.0,
                description: "0=cool, 1=hot".to_string(),
            }),
            input_layers: input_layers.clone(),
            model_version: Some(HeatRisk::MODEL_VERSION.to_string()),
            bounds,
            epsg,
            generated_at: Utc::now(),
        };
        self.catalog
            .upsert(record)
            .await
            .with_context(|| format!("Failed to register {}", entity_id))?;

        info!(entity_id = %entity_id, "Prediction completed");
        Ok(PredictReport {
            entity_id,
            input_layers,
            outcome,
        })
    }

    /// Build overviews on an existing 8-bit raster.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn overviews(&self, path: &Path, resampling: Resampling) -> Result<OverviewOutcome> {
        let builder = OverviewBuilder::new(&self.config.engine);
        let target = path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || builder.build(&target, resampling))
            .await
            .context("Overview task panicked")?
            .with_context(|| format!("Failed to build overviews for {:?}", path))?;

        info!(outcome = ?outcome, "Overviews finished");
        Ok(outcome)
    }

    /// Overviews on a raw input. Rasters the builder cannot reduce (not
    /// 8-bit, band-separate) are left as they are.
    async fn raw_overviews(&self, path: &Path) -> Result<()> {
        let builder = OverviewBuilder::new(&self.config.engine);
        let resampling = self.config.engine.overviews.resampling;
        let target = path.to_path_buf();

        match tokio::task::spawn_blocking(move || builder.build(&target, resampling))
            .await
            .context("Overview task panicked")?
        {
            Ok(outcome) => info!(path = %path.display(), outcome = ?outcome, "Raw input overviews ready"),
            Err(RasterIndexError::UnsupportedLayout(reason)) => {
                warn!(path = %path.display(), reason = %reason, "Skipping overviews on raw input")
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to build overviews for {:?}", path))
            }
        }
        Ok(())
    }

    /// Run a built-in formula over explicit inputs, without touching the catalog.
    #[instrument(skip(self, inputs, output), fields(formula = %kind, output = %output.display()))]
    pub async fn compute(
        &self,
        kind: FormulaKind,
        inputs: Vec<BandSource>,
        output: &Path,
    ) -> Result<PipelineOutcome> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create output directory {:?}", parent))?;
        }
        self.run_engine(IndexRequest::new(inputs, output, kind.build()))
            .await
    }

    /// Run `predict` unless another run holds the gate.
    pub async fn trigger_predict(&self) -> GateOutcome<Result<PredictReport>> {
        self.gate.try_run("predict", self.predict()).await
    }

    /// Run `predict`, waiting for any active run first.
    pub async fn run_predict(&self) -> Result<PredictReport> {
        self.gate.run_blocking("predict", self.predict()).await
    }

    /// Run `ingest`, waiting for any active run first.
    pub async fn run_ingest(&self, rgb: &Path, nir: &Path) -> Result<IngestReport> {
        self.gate.run_blocking("ingest", self.ingest(rgb, nir)).await
    }

    async fn lookup(&self, id: &str) -> Result<PathBuf> {
        let catalog = self.catalog.as_ref();
        let path = retry_with_backoff(
            self.config.catalog_retries,
            self.config.catalog_retry_delay(),
            move || catalog.resolve_path(id),
        )
        .await?;
        Ok(path)
    }

    async fn run_engine(&self, request: IndexRequest) -> Result<PipelineOutcome> {
        let pipeline = self.pipeline.clone();
        let layer = request.formula.layer_type().to_string();

        let outcome = tokio::task::spawn_blocking(move || pipeline.run(&request))
            .await
            .context("Engine task panicked")?
            .with_context(|| format!("{} computation failed", layer))?;
        Ok(outcome)
    }
}

/// Shallowest GeoTIFF under `<raw>/<name>`, searched recursively.
pub fn discover_input(raw: &Path, name: &str) -> Result<PathBuf> {
    let dir = raw.join(name);
    find_tiff(&dir)?.with_context(|| format!("No GeoTIFF found under {:?}", dir))
}

/// Shallowest `.tif`/`.tiff` file under `dir`; ties go to the first in
/// name order.
fn find_tiff(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<walkdir::DirEntry> = None;

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to list {:?}", dir))?;
        if !entry.file_type().is_file() || !is_tiff(entry.path()) {
            continue;
        }
        if best.as_ref().map_or(true, |b| entry.depth() < b.depth()) {
            best = Some(entry);
        }
    }

    Ok(best.map(|entry| entry.into_path()))
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        .unwrap_or(false)
}

/// Parse `PATH` or `PATH:BAND` (1-based band, default 1).
pub fn parse_band_source(s: &str) -> Result<BandSource> {
    if let Some((path, band)) = s.rsplit_once(':') {
        if let Ok(band) = band.parse::<usize>() {
            anyhow::ensure!(band >= 1, "band numbers start at 1: {}", s);
            anyhow::ensure!(!path.is_empty(), "missing path: {}", s);
            return Ok(BandSource::new(path, band));
        }
    }
    anyhow::ensure!(!s.is_empty(), "empty input");
    Ok(BandSource::new(s, 1))
}

/// "NDVI Brussels 2024"
fn display_name(layer_type: &str, area: &str, year: i32) -> String {
    format!("{} {} {}", layer_type, title_case(area), year)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Native-CRS bounds and EPSG code of a raster, read on the blocking pool.
async fn raster_extent(path: &Path) -> (Option<[f64; 4]>, Option<u16>) {
    let target = path.to_path_buf();
    match tokio::task::spawn_blocking(move || read_extent(&target)).await {
        Ok(extent) => extent,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Extent task failed");
            (None, None)
        }
    }
}

/// Native-CRS bounds and EPSG code of a raster, when it is georeferenced.
fn read_extent(path: &Path) -> (Option<[f64; 4]>, Option<u16>) {
    let reader = match TiffBandReader::open(path, 1) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read raster extent");
            return (None, None);
        }
    };

    let profile = reader.profile();
    let bounds = profile.georef.geo_transform().map(|gt| {
        let x1 = gt[0] + gt[1] * profile.width as f64;
        let y1 = gt[3] + gt[5] * profile.height as f64;
        [gt[0].min(x1), gt[3].min(y1), gt[0].max(x1), gt[3].max(y1)]
    });
    (bounds, profile.georef.epsg())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("NDVI", "brussels", 2024), "NDVI Brussels 2024");
        assert_eq!(title_case(""), "");
    }

    #[test]
    fn test_discover_input_prefers_shallow_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("rgb/tiles/a");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("deep.tif"), b"").unwrap();
        std::fs::write(dir.path().join("rgb/readme.txt"), b"").unwrap();
        std::fs::write(dir.path().join("rgb/ortho_b.TIFF"), b"").unwrap();
        std::fs::write(dir.path().join("rgb/ortho_a.tif"), b"").unwrap();

        let found = discover_input(dir.path(), "rgb").unwrap();
        assert_eq!(found, dir.path().join("rgb/ortho_a.tif"));

        std::fs::create_dir_all(dir.path().join("nir/sub")).unwrap();
        std::fs::write(dir.path().join("nir/sub/x.tiff"), b"").unwrap();
        assert_eq!(
            discover_input(dir.path(), "nir").unwrap(),
            dir.path().join("nir/sub/x.tiff")
        );

        assert!(discover_input(dir.path(), "missing").is_err());
    }

    #[test]
    fn test_parse_band_source() {
        assert_eq!(
            parse_band_source("/data/rgb.tif:2").unwrap(),
            BandSource::new("/data/rgb.tif", 2)
        );
        assert_eq!(
            parse_band_source("/data/nir.tif").unwrap(),
            BandSource::new("/data/nir.tif", 1)
        );
        assert_eq!(
            parse_band_source("C:/x.tif").unwrap(),
            BandSource::new("C:/x.tif", 1)
        );
        assert!(parse_band_source("/data/rgb.tif:0").is_err());
        assert!(parse_band_source(":3").is_err());
        assert!(parse_band_source("").is_err());
    }

    #[tokio::test]
    async fn test_raster_extent_of_missing_file() {
        assert_eq!(raster_extent(Path::new("/nonexistent/x.tif")).await, (None, None));
    }

    #[test]
    fn test_discover_input_prefers_shallow_over_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rgb/a")).unwrap();
        std::fs::write(dir.path().join("rgb/a/first.tif"), b"").unwrap();
        std::fs::write(dir.path().join("rgb/z.tif"), b"").unwrap();

        assert_eq!(
            discover_input(dir.path(), "rgb").unwrap(),
            dir.path().join("rgb/z.tif")
        );
    }
}
