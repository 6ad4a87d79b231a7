//! End-to-end index computation: open inputs, compute every tile, tag the
//! output and attach overviews.
//!
//! ```text
//! Opening ──► Computing ──► FinalizingTags ──► BuildingOverviews ──► Done
//!    │            │               │                    │
//!    └────────────┴───────────────┴────────────────────┴──► Failed
//! ```
//!
//! Runs are strictly sequential: windows are visited in [`TileGrid`] order,
//! one window per input band is held at a time, and the writer flushes
//! blocks as soon as they are covered.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::container::GdalMetadata;
use crate::error::{RasterIndexError, Result};
use crate::formula::{HeatRisk, IndexFormula, InputEncoding, NormalizedDifference};
use crate::grid::{TileGrid, Window};
use crate::overview::{OverviewBuilder, OverviewOutcome};
use crate::quantize::{Quantizer, SENTINEL};
use crate::reader::{common_extent, BandReader, TiffBandReader};
use crate::writer::{CogWriter, OutputProfile};

/// One band of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandSource {
    pub path: PathBuf,
    /// 1-based band index.
    pub band: usize,
}

impl BandSource {
    pub fn new(path: impl Into<PathBuf>, band: usize) -> Self {
        Self {
            path: path.into(),
            band,
        }
    }
}

/// Everything needed for one pipeline run.
#[derive(Clone)]
pub struct IndexRequest {
    /// Inputs in the order of the formula's roles.
    pub inputs: Vec<BandSource>,
    pub output: PathBuf,
    pub formula: Arc<dyn IndexFormula>,
    /// Processing window edge; the engine's `tile_size` when `None`.
    pub tile_size: Option<usize>,
    /// Timestamp for `GENERATED_AT`; the current time when `None`.
    pub generated_at: Option<DateTime<Utc>>,
}

impl IndexRequest {
    pub fn new(
        inputs: Vec<BandSource>,
        output: impl Into<PathBuf>,
        formula: Arc<dyn IndexFormula>,
    ) -> Self {
        Self {
            inputs,
            output: output.into(),
            formula,
            tile_size: None,
            generated_at: None,
        }
    }

    /// NDVI from the red band (1) of the RGB image and band 1 of the NIR image.
    pub fn ndvi(rgb: impl AsRef<Path>, nir: impl AsRef<Path>, output: impl Into<PathBuf>) -> Self {
        Self::new(
            vec![
                BandSource::new(nir.as_ref(), 1),
                BandSource::new(rgb.as_ref(), 1),
            ],
            output,
            Arc::new(NormalizedDifference::ndvi()),
        )
    }

    /// NDWI from the green band (2) of the RGB image and band 1 of the NIR image.
    pub fn ndwi(rgb: impl AsRef<Path>, nir: impl AsRef<Path>, output: impl Into<PathBuf>) -> Self {
        Self::new(
            vec![
                BandSource::new(rgb.as_ref(), 2),
                BandSource::new(nir.as_ref(), 1),
            ],
            output,
            Arc::new(NormalizedDifference::ndwi()),
        )
    }

    /// Heat risk from a vegetation index raster.
    pub fn heat_risk(index: impl AsRef<Path>, output: impl Into<PathBuf>) -> Self {
        Self::new(
            vec![BandSource::new(index.as_ref(), 1)],
            output,
            Arc::new(HeatRisk),
        )
    }

    pub fn with_tile_size(mut self, tile_size: usize) -> Self {
        self.tile_size = Some(tile_size);
        self
    }

    /// Pin `GENERATED_AT` so reruns are byte-identical.
    pub fn with_generated_at(mut self, generated_at: DateTime<Utc>) -> Self {
        self.generated_at = Some(generated_at);
        self
    }
}

impl std::fmt::Debug for IndexRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexRequest")
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("formula", &self.formula.layer_type())
            .field("tile_size", &self.tile_size)
            .field("generated_at", &self.generated_at)
            .finish()
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Opening,
    Computing,
    FinalizingTags,
    BuildingOverviews,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Computing => "computing",
            Self::FinalizingTags => "finalizing_tags",
            Self::BuildingOverviews => "building_overviews",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    /// Whether the output file may exist in a partial state.
    fn has_output(&self) -> bool {
        matches!(
            self,
            Self::Computing | Self::FinalizingTags | Self::BuildingOverviews
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub output: PathBuf,
    pub layer_type: String,
    pub width: usize,
    pub height: usize,
    pub tiles_written: usize,
    /// Output pixels written as the no-data code.
    pub nodata_pixels: u64,
    /// Inputs had different extents and were cropped to the common one.
    pub dimension_mismatch: bool,
    /// `None` when overviews are disabled.
    pub overviews: Option<OverviewOutcome>,
    pub tags: GdalMetadata,
    pub elapsed_ms: u64,
}

impl PipelineOutcome {
    /// Serialize for logs and job reports.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Counters from the compute phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeStats {
    pub tiles: usize,
    pub nodata_pixels: u64,
}

/// Runs index computations with a fixed engine configuration.
#[derive(Debug, Clone, Default)]
pub struct IndexPipeline {
    config: EngineConfig,
}

impl IndexPipeline {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run a request to completion.
    ///
    /// On failure the partially written output is removed and the error is
    /// returned as-is; nothing is retried.
    #[instrument(skip(self, request), fields(layer = %request.formula.layer_type(), output = %request.output.display()))]
    pub fn run(&self, request: &IndexRequest) -> Result<PipelineOutcome> {
        let started = Instant::now();
        let mut state = PipelineState::Opening;
        info!(state = %state, "Pipeline state");

        match self.execute(request, &mut state, started) {
            Ok(outcome) => {
                info!(
                    state = %PipelineState::Done,
                    width = outcome.width,
                    height = outcome.height,
                    tiles = outcome.tiles_written,
                    nodata_pixels = outcome.nodata_pixels,
                    elapsed_ms = outcome.elapsed_ms,
                    "Pipeline state"
                );
                Ok(outcome)
            }
            Err(err) => {
                error!(state = %PipelineState::Failed, failed_in = %state, error = %err, "Pipeline state");
                if state.has_output() {
                    remove_partial_output(&request.output);
                }
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        request: &IndexRequest,
        state: &mut PipelineState,
        started: Instant,
    ) -> Result<PipelineOutcome> {
        let formula = request.formula.as_ref();

        // Opening
        self.config.validate().map_err(RasterIndexError::Config)?;
        if request.inputs.len() != formula.arity() {
            return Err(RasterIndexError::Formula(format!(
                "{} takes {} input(s), {} given",
                formula.layer_type(),
                formula.arity(),
                request.inputs.len()
            )));
        }

        let cache_bytes = self.config.chunk_cache_size_bytes() / request.inputs.len().max(1);
        let mut readers = Vec::with_capacity(request.inputs.len());
        for source in &request.inputs {
            readers.push(TiffBandReader::open_with_cache(
                &source.path,
                source.band,
                cache_bytes,
            )?);
        }

        let Some(first) = readers.first() else {
            return Err(RasterIndexError::Formula(format!(
                "{} declares no inputs",
                formula.layer_type()
            )));
        };
        let template = first.profile().clone();
        let (mut width, mut height) = first.shape();
        let mut dimension_mismatch = false;
        for reader in &readers[1..] {
            let (w, h, mismatch) = common_extent((width, height), reader.shape());
            width = w;
            height = h;
            dimension_mismatch |= mismatch;
        }
        if dimension_mismatch {
            let shapes: Vec<String> = readers
                .iter()
                .map(|r| format!("{}x{}", r.shape().0, r.shape().1))
                .collect();
            warn!(
                inputs = ?shapes,
                width = width,
                height = height,
                "Input extents differ, cropping to the common extent"
            );
        }

        let tile_size = request.tile_size.unwrap_or(self.config.tile_size);
        let grid = TileGrid::new(height, width, tile_size)?;
        if grid.is_empty() {
            return Err(RasterIndexError::invalid_data(format!(
                "common extent {}x{} is empty",
                width, height
            )));
        }

        // Computing
        *state = PipelineState::Computing;
        info!(state = %state, width = width, height = height, tiles = grid.len(), "Pipeline state");

        let profile = OutputProfile::from_template(&template, width, height);
        let mut writer = CogWriter::create(&request.output, profile, &self.config)?;
        let stats = compute_tiles(
            &mut readers,
            formula,
            &grid,
            &mut writer,
            self.config.progress_every,
        )?;
        drop(readers);

        // FinalizingTags
        *state = PipelineState::FinalizingTags;
        info!(state = %state, "Pipeline state");

        let tags = provenance_tags(request);
        writer.set_tags(tags.clone());
        writer.finish()?;

        // BuildingOverviews
        let overviews = if self.config.overviews.enabled {
            *state = PipelineState::BuildingOverviews;
            info!(state = %state, "Pipeline state");
            Some(
                OverviewBuilder::new(&self.config)
                    .build(&request.output, self.config.overviews.resampling)?,
            )
        } else {
            None
        };

        Ok(PipelineOutcome {
            output: request.output.clone(),
            layer_type: formula.layer_type().to_string(),
            width,
            height,
            tiles_written: stats.tiles,
            nodata_pixels: stats.nodata_pixels,
            dimension_mismatch,
            overviews,
            tags,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Compute every window of `grid` and hand the codes to `writer`.
///
/// An output pixel is the sentinel wherever any input pixel is no-data:
/// equal to the input's declared no-data value, NaN, or a 255 code on a
/// quantized 8-bit input.
pub fn compute_tiles<R: BandReader>(
    readers: &mut [R],
    formula: &dyn IndexFormula,
    grid: &TileGrid,
    writer: &mut CogWriter,
    progress_every: usize,
) -> Result<ComputeStats> {
    let quantizer = Quantizer::new(formula.value_range());
    let total = grid.len();
    let mut stats = ComputeStats::default();

    for window in grid {
        let (inputs, mask) = read_inputs(readers, formula, &window)?;
        let slices: Vec<&[f32]> = inputs.iter().map(|v| v.as_slice()).collect();

        let mut values = vec![0.0f32; window.pixel_count()];
        formula.apply(&slices, &mut values);

        let mut codes = vec![SENTINEL; window.pixel_count()];
        quantizer.encode_block(&values, &mut codes);
        for (code, &masked) in codes.iter_mut().zip(&mask) {
            if masked {
                *code = SENTINEL;
            }
            if *code == SENTINEL {
                stats.nodata_pixels += 1;
            }
        }

        writer.write_window(&window, &codes)?;
        stats.tiles += 1;

        if progress_every > 0 && stats.tiles % progress_every == 0 {
            info!(tiles = stats.tiles, total = total, "Progress");
        }
    }

    Ok(stats)
}

/// Read one window of every input, decoded for the formula, plus the
/// combined no-data mask. Masked pixels are zeroed.
fn read_inputs<R: BandReader>(
    readers: &mut [R],
    formula: &dyn IndexFormula,
    window: &Window,
) -> Result<(Vec<Vec<f32>>, Vec<bool>)> {
    let mut mask = vec![false; window.pixel_count()];
    let mut inputs = Vec::with_capacity(readers.len());

    for (index, reader) in readers.iter_mut().enumerate() {
        let mut values = reader.read_window(window)?;

        match formula.input_encoding(index) {
            InputEncoding::QuantizedIfU8(range) if reader.sample_type().is_u8() => {
                let quantizer = range.quantizer();
                for (value, masked) in values.iter_mut().zip(mask.iter_mut()) {
                    match quantizer.decode(*value as u8) {
                        Some(decoded) => *value = decoded,
                        None => {
                            *masked = true;
                            *value = 0.0;
                        }
                    }
                }
            }
            _ => {
                let nodata = reader.nodata().map(|v| v as f32);
                for (value, masked) in values.iter_mut().zip(mask.iter_mut()) {
                    if value.is_nan() || Some(*value) == nodata {
                        *masked = true;
                        *value = 0.0;
                    }
                }
            }
        }

        inputs.push(values);
    }

    Ok((inputs, mask))
}

/// Dataset tags describing how the output was produced.
fn provenance_tags(request: &IndexRequest) -> GdalMetadata {
    let formula = request.formula.as_ref();
    let quantizer = Quantizer::new(formula.value_range());

    let mut tags = GdalMetadata::new();
    tags.set("LAYER_TYPE", formula.layer_type());
    tags.set("FORMULA", formula.expression());
    for (role, source) in formula.input_roles().iter().zip(&request.inputs) {
        tags.set(
            format!("SOURCE_{}", role.to_uppercase()),
            source.path.display().to_string(),
        );
    }
    tags.set("VALUE_RANGE", formula.value_range().to_string());
    tags.set("ENCODING", quantizer.encoding_description());
    tags.set("DECODE_FORMULA", quantizer.decode_formula());
    tags.set("ENCODE_FORMULA", quantizer.encode_formula());
    for (name, value) in formula.provenance() {
        tags.set(name, value);
    }

    let generated_at = request.generated_at.unwrap_or_else(Utc::now);
    tags.set(
        "GENERATED_AT",
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    tags
}

fn remove_partial_output(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %path.display(), error = %e, "Failed to remove partial output"),
    }
}
