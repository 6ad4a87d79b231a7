//! Tiled GeoTIFF writer for quantized index rasters.
//!
//! Outputs are always single-band 8-bit, deflate compressed with horizontal
//! differencing, tiled in square blocks and tagged with no-data 255.

mod cog_writer;

pub use cog_writer::{CogWriter, OutputProfile, WriteSummary};

pub(crate) use cog_writer::BlockLayout;
