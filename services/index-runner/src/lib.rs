//! Orchestration around the raster index engine.
//!
//! The runner owns everything the engine deliberately does not: where inputs
//! come from, where outputs go, which layers exist, and making sure only one
//! engine run is active at a time.

pub mod catalog;
pub mod config;
pub mod gate;
pub mod jobs;

pub use catalog::{
    retry_with_backoff, CatalogError, FileCatalog, LayerCatalog, LayerRecord, ValueRangeRecord,
};
pub use config::{layer_entity_id, RunnerConfig};
pub use gate::{GateOutcome, RunGate};
pub use jobs::{discover_input, parse_band_source, IngestReport, PredictReport, Runner};
