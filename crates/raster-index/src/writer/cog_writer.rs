//! Block-scattering GeoTIFF writer.
//!
//! Windows may arrive in any order. Their pixels are scattered into the
//! blocks they overlap and each block is compressed and flushed the moment
//! it is fully covered, so only blocks straddling the current window row
//! are held in memory.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::container::{
    self, compression, predictor, tag, GdalMetadata, IfdEntry, TiffFlavor,
    PHOTOMETRIC_BLACK_IS_ZERO, SAMPLE_FORMAT_UINT,
};
use crate::error::{RasterIndexError, Result};
use crate::grid::Window;
use crate::quantize::SENTINEL;
use crate::reader::check_window;
use crate::types::{GeoReference, RasterProfile};

/// Slack per block for deflate framing when sizing the file up front.
const BLOCK_OVERHEAD_ESTIMATE: u64 = 1024;

/// Write-side description of an output raster.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputProfile {
    pub width: usize,
    pub height: usize,
    /// Georeferencing copied verbatim from the template input.
    pub georef: GeoReference,
}

impl OutputProfile {
    /// An ungeoreferenced output.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            georef: GeoReference::default(),
        }
    }

    /// Derive the output profile from an input: georeferencing is kept,
    /// everything else is replaced by the 8-bit tiled encoding.
    pub fn from_template(template: &RasterProfile, width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            georef: template.georef.clone(),
        }
    }

    /// Upper bound on the file size including a full overview pyramid.
    fn estimated_size(&self, block_size: usize) -> u64 {
        let pixels = (self.width * self.height) as u64;
        let blocks =
            (self.width.div_ceil(block_size) * self.height.div_ceil(block_size)) as u64;
        (pixels + blocks * BLOCK_OVERHEAD_ESTIMATE) * 4 / 3 + (1 << 20)
    }
}

/// What `finish` wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteSummary {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub block_size: usize,
    /// Total number of blocks in the file.
    pub tiles: usize,
    /// Blocks flushed at `finish` with padding for pixels never written.
    pub padded_tiles: usize,
    /// File size in bytes.
    pub bytes: u64,
    pub big_tiff: bool,
}

/// A block still receiving pixels.
struct PendingBlock {
    data: Vec<u8>,
    covered: usize,
}

/// Streaming writer for single-band 8-bit tiled GeoTIFFs.
pub struct CogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    flavor: TiffFlavor,
    profile: OutputProfile,
    block_size: usize,
    deflate_level: u32,
    tags: GdalMetadata,
    pending: BTreeMap<usize, PendingBlock>,
    /// `(offset, byte_count)` of every flushed block.
    tiles: Vec<Option<(u64, u64)>>,
    position: u64,
}

impl CogWriter {
    /// Create the output file, replacing anything already at `path`.
    pub fn create(path: impl AsRef<Path>, profile: OutputProfile, config: &EngineConfig) -> Result<Self> {
        let path = path.as_ref();
        if profile.width == 0 || profile.height == 0 {
            return Err(RasterIndexError::invalid_data(format!(
                "cannot write an empty {}x{} raster",
                profile.width, profile.height
            )));
        }
        if u32::try_from(profile.width).is_err() || u32::try_from(profile.height).is_err() {
            return Err(RasterIndexError::invalid_data("raster dimensions exceed TIFF limits"));
        }
        config.validate().map_err(RasterIndexError::Config)?;

        let block_size = config.block_size;
        let flavor = TiffFlavor::for_estimated_size(profile.estimated_size(block_size));

        let file = File::create(path).map_err(|e| {
            RasterIndexError::write_failure(format!("{}: {}", path.display(), e))
        })?;
        let mut file = BufWriter::new(file);
        container::write_header(&mut file, flavor)?;

        let blocks = profile.width.div_ceil(block_size) * profile.height.div_ceil(block_size);

        debug!(
            path = %path.display(),
            width = profile.width,
            height = profile.height,
            blocks = blocks,
            big_tiff = flavor == TiffFlavor::Big,
            "Created output raster"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            flavor,
            profile,
            block_size,
            deflate_level: config.deflate_level,
            tags: GdalMetadata::new(),
            pending: BTreeMap::new(),
            tiles: vec![None; blocks],
            position: flavor.header_len(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn profile(&self) -> &OutputProfile {
        &self.profile
    }

    /// Number of blocks held in memory.
    pub fn pending_blocks(&self) -> usize {
        self.pending.len()
    }

    fn blocks_across(&self) -> usize {
        self.profile.width.div_ceil(self.block_size)
    }

    /// Image region covered by block `(block_col, block_row)`.
    fn block_window(&self, block_col: usize, block_row: usize) -> Window {
        let col_off = block_col * self.block_size;
        let row_off = block_row * self.block_size;
        Window::new(
            col_off,
            row_off,
            self.block_size.min(self.profile.width - col_off),
            self.block_size.min(self.profile.height - row_off),
        )
    }

    /// Write the codes of one window. Windows must not overlap.
    pub fn write_window(&mut self, window: &Window, data: &[u8]) -> Result<()> {
        check_window(window, self.profile.width, self.profile.height)?;
        if data.len() != window.pixel_count() {
            return Err(RasterIndexError::invalid_data(format!(
                "window {} needs {} bytes, got {}",
                window,
                window.pixel_count(),
                data.len()
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let bs = self.block_size;
        let across = self.blocks_across();
        let first_col = window.col_off / bs;
        let last_col = (window.col_end() - 1) / bs;
        let first_row = window.row_off / bs;
        let last_row = (window.row_end() - 1) / bs;

        for block_row in first_row..=last_row {
            for block_col in first_col..=last_col {
                let region = self.block_window(block_col, block_row);
                let Some(overlap) = region.intersection(window) else {
                    continue;
                };
                let index = block_row * across + block_col;
                if self.tiles[index].is_some() {
                    return Err(RasterIndexError::invalid_data(format!(
                        "window {} overlaps block {} which is already written",
                        window, index
                    )));
                }

                let complete = {
                    let block = self.pending.entry(index).or_insert_with(|| PendingBlock {
                        data: vec![SENTINEL; bs * bs],
                        covered: 0,
                    });
                    for row in overlap.row_off..overlap.row_end() {
                        let src = (row - window.row_off) * window.width
                            + (overlap.col_off - window.col_off);
                        let dst = (row - region.row_off) * bs + (overlap.col_off - region.col_off);
                        block.data[dst..dst + overlap.width]
                            .copy_from_slice(&data[src..src + overlap.width]);
                    }
                    block.covered += overlap.pixel_count();
                    block.covered >= region.pixel_count()
                };

                if complete {
                    if let Some(block) = self.pending.remove(&index) {
                        self.flush_block(index, &block.data)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn flush_block(&mut self, index: usize, data: &[u8]) -> Result<()> {
        let encoded = container::encode_block(data, self.block_size, 1, self.deflate_level)?;
        self.file.write_all(&encoded)?;
        self.tiles[index] = Some((self.position, encoded.len() as u64));
        self.position += encoded.len() as u64;
        Ok(())
    }

    /// Replace the dataset metadata written at `finish`.
    pub fn set_tags(&mut self, tags: GdalMetadata) {
        self.tags = tags;
    }

    pub fn tags(&self) -> &GdalMetadata {
        &self.tags
    }

    /// Flush every remaining block, write the directory and close the file.
    pub fn finish(mut self) -> Result<WriteSummary> {
        let mut padded_tiles = 0;

        let pending = std::mem::take(&mut self.pending);
        for (index, block) in pending {
            self.flush_block(index, &block.data)?;
            padded_tiles += 1;
        }

        let empty_block = vec![SENTINEL; self.block_size * self.block_size];
        for index in 0..self.tiles.len() {
            if self.tiles[index].is_none() {
                self.flush_block(index, &empty_block)?;
                padded_tiles += 1;
            }
        }

        let (offsets, counts): (Vec<u64>, Vec<u64>) = self.tiles.iter().flatten().copied().unzip();

        let mut entries = BlockLayout::gray(self.profile.width, self.profile.height, self.block_size)
            .entries(&offsets, &counts, self.flavor)?;
        entries.extend(georef_entries(&self.profile.georef));
        if !self.tags.is_empty() {
            entries.push(IfdEntry::ascii(tag::GDAL_METADATA, &self.tags.to_xml()));
        }

        let ifd_offset = container::write_ifd(&mut self.file, self.flavor, &entries, 0)?;
        container::patch_first_ifd(&mut self.file, self.flavor, ifd_offset)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        let bytes = self.file.get_ref().metadata()?.len();

        info!(
            path = %self.path.display(),
            tiles = self.tiles.len(),
            padded_tiles = padded_tiles,
            bytes = bytes,
            "Finished output raster"
        );

        Ok(WriteSummary {
            path: self.path.clone(),
            width: self.profile.width,
            height: self.profile.height,
            block_size: self.block_size,
            tiles: self.tiles.len(),
            padded_tiles,
            bytes,
            big_tiff: self.flavor == TiffFlavor::Big,
        })
    }
}

/// Tiled 8-bit layout of one image written by the engine.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BlockLayout {
    pub width: usize,
    pub height: usize,
    pub block_size: usize,
    /// Chunky samples per pixel.
    pub samples: u16,
    pub photometric: u16,
    pub nodata: Option<u8>,
}

impl BlockLayout {
    /// Single-band index layout with the sentinel as no-data.
    pub fn gray(width: usize, height: usize, block_size: usize) -> Self {
        Self {
            width,
            height,
            block_size,
            samples: 1,
            photometric: PHOTOMETRIC_BLACK_IS_ZERO,
            nodata: Some(SENTINEL),
        }
    }

    /// Directory entries describing this layout and its blocks.
    pub fn entries(&self, offsets: &[u64], counts: &[u64], flavor: TiffFlavor) -> Result<Vec<IfdEntry>> {
        let dimension = |value: usize| {
            u32::try_from(value)
                .map_err(|_| RasterIndexError::invalid_data(format!("dimension {} too large", value)))
        };
        let per_sample = |value: u16| vec![value; self.samples as usize];

        let mut entries = vec![
            IfdEntry::long(tag::IMAGE_WIDTH, dimension(self.width)?),
            IfdEntry::long(tag::IMAGE_LENGTH, dimension(self.height)?),
            IfdEntry::shorts(tag::BITS_PER_SAMPLE, &per_sample(8)),
            IfdEntry::short(tag::COMPRESSION, compression::DEFLATE),
            IfdEntry::short(tag::PHOTOMETRIC, self.photometric),
            IfdEntry::short(tag::SAMPLES_PER_PIXEL, self.samples),
            IfdEntry::short(tag::PLANAR_CONFIGURATION, 1),
            IfdEntry::short(tag::PREDICTOR, predictor::HORIZONTAL),
            IfdEntry::long(tag::TILE_WIDTH, dimension(self.block_size)?),
            IfdEntry::long(tag::TILE_LENGTH, dimension(self.block_size)?),
            IfdEntry::offsets(tag::TILE_OFFSETS, offsets, flavor)?,
            IfdEntry::offsets(tag::TILE_BYTE_COUNTS, counts, flavor)?,
            IfdEntry::shorts(tag::SAMPLE_FORMAT, &per_sample(SAMPLE_FORMAT_UINT)),
        ];
        if let Some(nodata) = self.nodata {
            entries.push(IfdEntry::ascii(tag::GDAL_NODATA, &nodata.to_string()));
        }
        Ok(entries)
    }
}

/// GeoTIFF tags reproducing `georef`.
fn georef_entries(georef: &GeoReference) -> Vec<IfdEntry> {
    let mut entries = Vec::new();
    if let Some(scale) = &georef.pixel_scale {
        entries.push(IfdEntry::doubles(tag::MODEL_PIXEL_SCALE, scale));
    }
    if let Some(tiepoints) = &georef.tiepoints {
        entries.push(IfdEntry::doubles(tag::MODEL_TIEPOINT, tiepoints));
    }
    if let Some(matrix) = &georef.transformation {
        entries.push(IfdEntry::doubles(tag::MODEL_TRANSFORMATION, matrix));
    }
    if let Some(keys) = &georef.geo_keys {
        entries.push(IfdEntry::shorts(tag::GEO_KEY_DIRECTORY, keys));
    }
    if let Some(doubles) = &georef.geo_doubles {
        entries.push(IfdEntry::doubles(tag::GEO_DOUBLE_PARAMS, doubles));
    }
    if let Some(ascii) = &georef.geo_ascii {
        entries.push(IfdEntry::ascii(tag::GEO_ASCII_PARAMS, ascii));
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiff::decoder::{Decoder, DecodingResult};

    fn small_config() -> EngineConfig {
        EngineConfig {
            block_size: 16,
            ..Default::default()
        }
    }

    fn read_back(path: &Path) -> (u32, u32, Vec<u8>) {
        let mut decoder = Decoder::new(File::open(path).unwrap()).unwrap();
        let (w, h) = decoder.dimensions().unwrap();
        match decoder.read_image().unwrap() {
            DecodingResult::U8(data) => (w, h, data),
            _ => panic!("expected u8 output"),
        }
    }

    #[test]
    fn test_windows_in_any_order_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tif");
        let (width, height) = (40, 21);
        let expected: Vec<u8> = (0..width * height).map(|i| (i % 250) as u8).collect();

        let mut writer =
            CogWriter::create(&path, OutputProfile::new(width, height), &small_config()).unwrap();

        // Column-major window order with 7x7 windows.
        for col in (0..width).step_by(7) {
            for row in (0..height).step_by(7) {
                let window = Window::new(col, row, 7.min(width - col), 7.min(height - row));
                let mut data = Vec::with_capacity(window.pixel_count());
                for r in window.row_off..window.row_end() {
                    data.extend_from_slice(&expected[r * width + col..r * width + window.col_end()]);
                }
                writer.write_window(&window, &data).unwrap();
            }
        }
        assert_eq!(writer.pending_blocks(), 0);

        let summary = writer.finish().unwrap();
        assert_eq!(summary.tiles, 3 * 2);
        assert_eq!(summary.padded_tiles, 0);
        assert!(!summary.big_tiff);

        let (w, h, data) = read_back(&path);
        assert_eq!((w as usize, h as usize), (width, height));
        assert_eq!(data, expected);
    }

    #[test]
    fn test_unwritten_pixels_are_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.tif");

        let mut writer =
            CogWriter::create(&path, OutputProfile::new(20, 20), &small_config()).unwrap();
        writer.write_window(&Window::new(0, 0, 4, 4), &[9u8; 16]).unwrap();
        let summary = writer.finish().unwrap();
        assert_eq!(summary.padded_tiles, 4);

        let (_, _, data) = read_back(&path);
        assert_eq!(data[0], 9);
        assert_eq!(data[3 * 20 + 3], 9);
        assert_eq!(data[4], SENTINEL);
        assert_eq!(data[19 * 20 + 19], SENTINEL);
    }

    #[test]
    fn test_rejects_bad_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tif");
        let mut writer =
            CogWriter::create(&path, OutputProfile::new(10, 10), &small_config()).unwrap();

        let err = writer.write_window(&Window::new(8, 0, 4, 1), &[0; 4]).unwrap_err();
        assert!(matches!(err, RasterIndexError::OutOfBounds { .. }));

        let err = writer.write_window(&Window::new(0, 0, 2, 2), &[0; 3]).unwrap_err();
        assert!(matches!(err, RasterIndexError::InvalidData(_)));

        writer.write_window(&Window::new(0, 0, 10, 10), &[1; 100]).unwrap();
        let err = writer.write_window(&Window::new(0, 0, 1, 1), &[1]).unwrap_err();
        assert!(matches!(err, RasterIndexError::InvalidData(_)));
    }

    #[test]
    fn test_create_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.tif");
        std::fs::write(&path, vec![0xAB; 100_000]).unwrap();

        let mut writer =
            CogWriter::create(&path, OutputProfile::new(16, 16), &small_config()).unwrap();
        writer.write_window(&Window::new(0, 0, 16, 16), &[3; 256]).unwrap();
        let summary = writer.finish().unwrap();

        assert!(summary.bytes < 100_000);
        let (_, _, data) = read_back(&path);
        assert!(data.iter().all(|&v| v == 3));
    }

    #[test]
    fn test_unwritable_path_is_write_failure() {
        let err = CogWriter::create(
            "/nonexistent-dir/out.tif",
            OutputProfile::new(4, 4),
            &small_config(),
        )
        .err()
        .unwrap();
        assert!(err.is_write_failure());
    }

    #[test]
    fn test_tags_and_georef_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tagged.tif");
        let mut profile = OutputProfile::new(8, 8);
        profile.georef.pixel_scale = Some(vec![0.25, 0.25, 0.0]);
        profile.georef.geo_keys = Some(vec![1, 1, 0, 1, 3072, 0, 1, 31370]);

        let mut writer = CogWriter::create(&path, profile, &small_config()).unwrap();
        let mut tags = GdalMetadata::new();
        tags.set("LAYER_TYPE", "NDVI");
        writer.set_tags(tags);
        writer.write_window(&Window::new(0, 0, 8, 8), &[0; 64]).unwrap();
        writer.finish().unwrap();

        let layout = container::read_ifd_chain(&path).unwrap();
        let main = layout.main().unwrap();
        assert_eq!(main.u64_value(tag::TILE_WIDTH), Some(16));
        assert_eq!(main.u64_value(tag::COMPRESSION), Some(8));
        assert_eq!(main.u64_value(tag::PREDICTOR), Some(2));
        assert_eq!(
            main.get(tag::GDAL_NODATA).and_then(|e| e.as_ascii()).as_deref(),
            Some("255")
        );
        assert_eq!(
            main.get(tag::GEO_KEY_DIRECTORY).and_then(|e| e.as_u16s()),
            Some(vec![1, 1, 0, 1, 3072, 0, 1, 31370])
        );

        let read = container::read_dataset_tags(&path).unwrap();
        assert_eq!(read.get("LAYER_TYPE"), Some("NDVI"));
    }
}
