//! Windowed raster index engine with tiled GeoTIFF output
//!
//! This crate computes per-pixel indices (NDVI, NDWI, heat risk) over
//! large GeoTIFF inputs without ever holding a full band in memory:
//!
//! - **Windowed reads**: inputs are decoded strip by strip or tile by tile
//! - **8-bit outputs**: values are quantized onto `0..=254`, 255 is no-data
//! - **Cloud-friendly files**: deflate + predictor 512×512 tiles, GDAL tags
//! - **Overviews**: an idempotent average-resampled pyramid
//!
//! # Architecture
//!
//! ```text
//! IndexRequest
//!      │
//!      ▼
//! IndexPipeline::run()
//!      │
//!      ├─► TiffBandReader per input (ChunkCache)
//!      │
//!      ├─► TileGrid windows, row-major
//!      │         │
//!      │         ├─► IndexFormula::apply
//!      │         │
//!      │         └─► Quantizer::encode_block ─► CogWriter::write_window
//!      │
//!      ├─► GDAL_METADATA provenance tags ─► CogWriter::finish
//!      │
//!      └─► OverviewBuilder::build (factors 2..32)
//!               │
//!               ▼
//!          PipelineOutcome
//! ```
//!
//! # Example
//!
//! ```ignore
//! use raster_index::{EngineConfig, IndexPipeline, IndexRequest};
//!
//! let pipeline = IndexPipeline::new(EngineConfig::from_env());
//! let request = IndexRequest::ndvi("raw/rgb.tif", "raw/nir.tif", "out/ndvi.tif");
//! let outcome = pipeline.run(&request)?;
//! println!("{} tiles, {} no-data pixels", outcome.tiles_written, outcome.nodata_pixels);
//! ```

pub mod cache;
pub mod config;
pub mod container;
pub mod error;
pub mod formula;
pub mod grid;
pub mod overview;
pub mod pipeline;
pub mod quantize;
pub mod reader;
pub mod types;
pub mod writer;

// Re-export commonly used types at crate root
pub use cache::{ChunkCache, ChunkKey};
pub use config::{EngineConfig, OverviewConfig};
pub use container::{read_dataset_tags, GdalMetadata};
pub use error::{RasterIndexError, Result};
pub use formula::{
    normalized_difference, FnFormula, FormulaKind, HeatRisk, IndexFormula, InputEncoding,
    NormalizedDifference, QuantizedRange,
};
pub use grid::{TileGrid, Window};
pub use overview::{OverviewBuilder, OverviewOutcome, Resampling, OVERVIEW_DOMAIN};
pub use pipeline::{
    compute_tiles, BandSource, IndexPipeline, IndexRequest, PipelineOutcome, PipelineState,
};
pub use quantize::{Quantizer, ValueRange, SENTINEL};
pub use reader::{common_extent, BandReader, MemoryBandReader, TiffBandReader};
pub use types::{CacheStats, GeoReference, RasterProfile, SampleType};
pub use writer::{CogWriter, OutputProfile, WriteSummary};
