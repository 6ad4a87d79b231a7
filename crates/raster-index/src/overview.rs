//! Reduced-resolution overview pyramids for 8-bit rasters.
//!
//! Levels are built as a cascade: the first from full resolution, each
//! following one from the level before it, one output block at a time.
//! Multi-band chunky images are reduced per sample. Level directories are
//! appended to the file and the full-resolution directory is rewritten last,
//! so the file stays readable if a build fails halfway.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult};
use tracing::{debug, info, instrument};

use crate::config::{validate_factors, EngineConfig, DEFAULT_OVERVIEW_FACTORS};
use crate::container::{
    self, tag, GdalMetadata, IfdEntry, IfdInfo, PHOTOMETRIC_BLACK_IS_ZERO, PHOTOMETRIC_RGB,
    SUBFILE_REDUCED_RESOLUTION,
};
use crate::error::{RasterIndexError, Result};
use crate::grid::Window;
use crate::reader::{check_chunky, open_decoder};
use crate::types::SampleType;
use crate::writer::BlockLayout;

/// Metadata domain recording how overviews were resampled.
pub const OVERVIEW_DOMAIN: &str = "rio_overview";

/// How a level pixel is derived from its source footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    /// Mean of the valid (non-no-data) samples, rounded half up.
    #[default]
    Average,
    /// Top-left pixel of the footprint.
    Nearest,
}

impl Resampling {
    /// Parse from string (case-insensitive). Unknown names fall back to
    /// `Average`.
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "nearest" => Self::Nearest,
            _ => Self::Average,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Nearest => "nearest",
        }
    }
}

impl std::fmt::Display for Resampling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of an overview build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OverviewOutcome {
    /// Levels were added for these factors.
    Built { factors: Vec<u32> },
    /// The file already had `existing` reduced-resolution images; nothing
    /// was changed.
    Skipped { existing: usize },
}

impl OverviewOutcome {
    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built { .. })
    }
}

/// Where the chunks of a level come from.
enum ChunkSource {
    /// The full-resolution image, in whatever layout and compression the
    /// file uses. Chunks decode clipped to the image.
    Decoded(Decoder<BufReader<File>>),
    /// A level appended by this build. Blocks decode to a full
    /// `chunk_width × chunk_height`.
    Appended {
        file: File,
        offsets: Vec<u64>,
        counts: Vec<u64>,
    },
}

/// One image of the file seen as a grid of 8-bit chunky chunks.
struct SourceLevel {
    width: usize,
    height: usize,
    samples: usize,
    chunk_width: usize,
    chunk_height: usize,
    source: ChunkSource,
    cache: LruCache<usize, Vec<u8>>,
}

impl SourceLevel {
    fn new(
        width: usize,
        height: usize,
        samples: usize,
        (chunk_width, chunk_height): (usize, usize),
        source: ChunkSource,
        cache_bytes: usize,
    ) -> Result<Self> {
        if width == 0 || height == 0 || chunk_width == 0 || chunk_height == 0 || samples == 0 {
            return Err(RasterIndexError::invalid_data("empty image or chunk size"));
        }

        if let ChunkSource::Appended { offsets, counts, .. } = &source {
            let expected = width.div_ceil(chunk_width) * height.div_ceil(chunk_height);
            if offsets.len() != expected || counts.len() != expected {
                return Err(RasterIndexError::invalid_data(format!(
                    "expected {} blocks, level lists {} offsets and {} counts",
                    expected,
                    offsets.len(),
                    counts.len()
                )));
            }
        }

        let capacity = (cache_bytes / (chunk_width * chunk_height * samples)).max(1);
        Ok(Self {
            width,
            height,
            samples,
            chunk_width,
            chunk_height,
            source,
            cache: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        })
    }

    fn chunks_across(&self) -> usize {
        self.width.div_ceil(self.chunk_width)
    }

    /// Image pixels covered by chunk `(chunk_col, chunk_row)`.
    fn chunk_window(&self, chunk_col: usize, chunk_row: usize) -> Window {
        let col_off = chunk_col * self.chunk_width;
        let row_off = chunk_row * self.chunk_height;
        Window::new(
            col_off,
            row_off,
            self.chunk_width.min(self.width - col_off),
            self.chunk_height.min(self.height - row_off),
        )
    }

    /// Pixels per decoded row of the chunk covering `region`.
    fn row_pixels(&self, region: &Window) -> usize {
        match self.source {
            ChunkSource::Decoded(_) => region.width,
            ChunkSource::Appended { .. } => self.chunk_width,
        }
    }

    /// Decoded chunk, `row_pixels(region) * samples` bytes per row.
    fn chunk(&mut self, chunk_col: usize, chunk_row: usize) -> Result<&[u8]> {
        let index = chunk_row * self.chunks_across() + chunk_col;

        if !self.cache.contains(&index) {
            let region = self.chunk_window(chunk_col, chunk_row);
            let expected = self.row_pixels(&region) * region.height * self.samples;

            let decoded = match &mut self.source {
                ChunkSource::Decoded(decoder) => {
                    let chunk_index = u32::try_from(index).map_err(|_| {
                        RasterIndexError::invalid_data(format!("chunk index {} too large", index))
                    })?;
                    match decoder.read_chunk(chunk_index)? {
                        DecodingResult::U8(data) => data,
                        _ => {
                            return Err(RasterIndexError::unsupported(
                                "overview sources must decode to 8-bit samples",
                            ))
                        }
                    }
                }
                ChunkSource::Appended {
                    file,
                    offsets,
                    counts,
                } => {
                    let mut raw = vec![0u8; counts[index] as usize];
                    file.seek(SeekFrom::Start(offsets[index]))
                        .map_err(|e| RasterIndexError::read_failed(e.to_string()))?;
                    file.read_exact(&mut raw)
                        .map_err(|e| RasterIndexError::read_failed(e.to_string()))?;
                    container::decode_block(&raw, self.chunk_width, self.chunk_height, self.samples)?
                }
            };

            if decoded.len() < expected {
                return Err(RasterIndexError::read_failed(format!(
                    "chunk {} decoded to {} bytes, expected {}",
                    index,
                    decoded.len(),
                    expected
                )));
            }
            self.cache.put(index, decoded);
        }

        self.cache
            .get(&index)
            .map(|chunk| chunk.as_slice())
            .ok_or_else(|| RasterIndexError::read_failed(format!("chunk {} not cached", index)))
    }
}

/// Blocks of one finished level.
struct BuiltLevel {
    width: usize,
    height: usize,
    offsets: Vec<u64>,
    counts: Vec<u64>,
}

/// Builds overview levels in place.
#[derive(Debug, Clone)]
pub struct OverviewBuilder {
    factors: Vec<u32>,
    block_size: usize,
    deflate_level: u32,
    cache_bytes: usize,
}

impl Default for OverviewBuilder {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl OverviewBuilder {
    /// Create a builder using the configured ladder and block encoding.
    pub fn new(config: &EngineConfig) -> Self {
        let factors = if config.overviews.factors.is_empty() {
            DEFAULT_OVERVIEW_FACTORS.to_vec()
        } else {
            config.overviews.factors.clone()
        };

        Self {
            factors,
            block_size: config.block_size,
            deflate_level: config.deflate_level,
            cache_bytes: config.chunk_cache_size_bytes(),
        }
    }

    /// Override the factor ladder.
    pub fn with_factors(mut self, factors: Vec<u32>) -> Self {
        self.factors = factors;
        self
    }

    pub fn factors(&self) -> &[u32] {
        &self.factors
    }

    /// Add overviews to the raster at `path` unless it already has some.
    #[instrument(skip(self, path), fields(path = %path.display(), factors = ?self.factors))]
    pub fn build(&self, path: &Path, resampling: Resampling) -> Result<OverviewOutcome> {
        validate_factors(&self.factors).map_err(RasterIndexError::Config)?;

        let layout = container::read_ifd_chain(path)?;
        if layout.has_subfiles() {
            let existing = layout.ifds.len() - 1;
            info!(existing = existing, "Overviews already present, skipping");
            return Ok(OverviewOutcome::Skipped { existing });
        }

        let main = layout
            .main()
            .ok_or_else(|| RasterIndexError::invalid_data("file contains no image"))?;
        let flavor = layout.flavor;

        let (mut decoder, profile) = open_decoder(path)?;
        if profile.sample_type != SampleType::U8 {
            return Err(RasterIndexError::unsupported(format!(
                "overviews need 8-bit unsigned samples, found {}",
                profile.sample_type
            )));
        }
        check_chunky(&mut decoder, path, &profile)?;

        let samples = profile.band_count;
        let template = BlockLayout {
            width: 0,
            height: 0,
            block_size: self.block_size,
            samples: u16::try_from(samples).map_err(|_| {
                RasterIndexError::unsupported(format!("{} samples per pixel", samples))
            })?,
            photometric: profile.photometric.unwrap_or(if samples == 1 {
                PHOTOMETRIC_BLACK_IS_ZERO
            } else {
                PHOTOMETRIC_RGB
            }),
            nodata: byte_nodata(profile.nodata),
        };

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let mut source = SourceLevel::new(
            profile.width,
            profile.height,
            samples,
            (chunk_width as usize, chunk_height as usize),
            ChunkSource::Decoded(decoder),
            self.cache_bytes,
        )?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| RasterIndexError::write_failure(format!("{}: {}", path.display(), e)))?;

        let mut first_level: Option<u64> = None;
        let mut previous_pointer: Option<u64> = None;
        let mut previous_factor = 1u32;

        for &factor in &self.factors {
            let ratio = (factor / previous_factor) as usize;
            let level = self.build_level(&mut file, &mut source, ratio, resampling, template.nodata)?;

            let level_layout = BlockLayout {
                width: level.width,
                height: level.height,
                ..template.clone()
            };
            let mut entries = level_layout.entries(&level.offsets, &level.counts, flavor)?;
            if let Some(extra) = main.get(tag::EXTRA_SAMPLES) {
                entries.push(extra.clone());
            }
            entries.push(IfdEntry::long(tag::NEW_SUBFILE_TYPE, SUBFILE_REDUCED_RESOLUTION));

            let offset = container::write_ifd(&mut file, flavor, &entries, 0)?;
            match previous_pointer {
                Some(pointer) => container::patch_next_ifd(&mut file, flavor, pointer, offset)?,
                None => first_level = Some(offset),
            }
            previous_pointer = Some(offset + flavor.ifd_len(entries.len()) - flavor.word_len());

            info!(
                factor = factor,
                width = level.width,
                height = level.height,
                samples = samples,
                tiles = level.offsets.len(),
                "Built overview level"
            );

            let reader = File::open(path)
                .map_err(|e| RasterIndexError::read_failed(format!("{}: {}", path.display(), e)))?;
            source = SourceLevel::new(
                level.width,
                level.height,
                samples,
                (self.block_size, self.block_size),
                ChunkSource::Appended {
                    file: reader,
                    offsets: level.offsets,
                    counts: level.counts,
                },
                self.cache_bytes,
            )?;
            previous_factor = factor;
        }

        let Some(first_level) = first_level else {
            return Ok(OverviewOutcome::Built { factors: Vec::new() });
        };

        let main_entries = tag_main_entries(main, resampling)?;
        let main_offset = container::write_ifd(&mut file, flavor, &main_entries, first_level)?;
        container::patch_first_ifd(&mut file, flavor, main_offset)?;
        file.flush()?;
        file.sync_all()?;

        Ok(OverviewOutcome::Built {
            factors: self.factors.clone(),
        })
    }

    /// Append the blocks of the level `ratio` times smaller than `source`.
    fn build_level(
        &self,
        file: &mut File,
        source: &mut SourceLevel,
        ratio: usize,
        resampling: Resampling,
        nodata: Option<u8>,
    ) -> Result<BuiltLevel> {
        let bs = self.block_size;
        let width = source.width.div_ceil(ratio);
        let height = source.height.div_ceil(ratio);
        let across = width.div_ceil(bs);
        let down = height.div_ceil(bs);

        let mut offsets = Vec::with_capacity(across * down);
        let mut counts = Vec::with_capacity(across * down);
        let mut end = file.seek(SeekFrom::End(0))?;

        for block_row in 0..down {
            for block_col in 0..across {
                let out = Window::new(
                    block_col * bs,
                    block_row * bs,
                    bs.min(width - block_col * bs),
                    bs.min(height - block_row * bs),
                );
                let block = reduce_block(source, &out, bs, ratio, resampling, nodata)?;
                let encoded =
                    container::encode_block(&block, bs, source.samples, self.deflate_level)?;

                file.seek(SeekFrom::Start(end))?;
                file.write_all(&encoded)?;
                offsets.push(end);
                counts.push(encoded.len() as u64);
                end += encoded.len() as u64;
            }
        }

        debug!(width = width, height = height, ratio = ratio, "Level blocks written");

        Ok(BuiltLevel {
            width,
            height,
            offsets,
            counts,
        })
    }
}

/// The declared no-data value when it is a representable byte.
fn byte_nodata(nodata: Option<f64>) -> Option<u8> {
    nodata
        .filter(|v| v.fract() == 0.0 && (0.0..=255.0).contains(v))
        .map(|v| v as u8)
}

/// Compute one `bs × bs` output block. Padding is no-data, or 0 when the
/// source declares none.
fn reduce_block(
    source: &mut SourceLevel,
    out: &Window,
    bs: usize,
    ratio: usize,
    resampling: Resampling,
    nodata: Option<u8>,
) -> Result<Vec<u8>> {
    let spp = source.samples;
    let footprint = Window::new(
        out.col_off * ratio,
        out.row_off * ratio,
        (out.width * ratio).min(source.width - out.col_off * ratio),
        (out.height * ratio).min(source.height - out.row_off * ratio),
    );

    let mut block = vec![nodata.unwrap_or(0); bs * bs * spp];
    let mut sums = vec![0u64; bs * bs * spp];
    let mut valid = vec![0u32; bs * bs * spp];

    let first_col = footprint.col_off / source.chunk_width;
    let last_col = (footprint.col_end() - 1) / source.chunk_width;
    let first_row = footprint.row_off / source.chunk_height;
    let last_row = (footprint.row_end() - 1) / source.chunk_height;

    for chunk_row in first_row..=last_row {
        for chunk_col in first_col..=last_col {
            let region = source.chunk_window(chunk_col, chunk_row);
            let Some(overlap) = region.intersection(&footprint) else {
                continue;
            };
            let stride = source.row_pixels(&region) * spp;
            let chunk = source.chunk(chunk_col, chunk_row)?;

            for row in overlap.row_off..overlap.row_end() {
                let local_row = row - footprint.row_off;
                let out_row = local_row / ratio;
                let chunk_base = (row - region.row_off) * stride;

                for col in overlap.col_off..overlap.col_end() {
                    let local_col = col - footprint.col_off;
                    let px = chunk_base + (col - region.col_off) * spp;
                    let o = (out_row * bs + local_col / ratio) * spp;

                    match resampling {
                        Resampling::Average => {
                            for (s, &value) in chunk[px..px + spp].iter().enumerate() {
                                if Some(value) != nodata {
                                    sums[o + s] += value as u64;
                                    valid[o + s] += 1;
                                }
                            }
                        }
                        Resampling::Nearest => {
                            if local_row % ratio == 0 && local_col % ratio == 0 {
                                block[o..o + spp].copy_from_slice(&chunk[px..px + spp]);
                            }
                        }
                    }
                }
            }
        }
    }

    if resampling == Resampling::Average {
        for row in 0..out.height {
            for col in 0..out.width {
                let base = (row * bs + col) * spp;
                for o in base..base + spp {
                    let n = valid[o] as u64;
                    if n > 0 {
                        // Round half up.
                        block[o] = ((2 * sums[o] + n) / (2 * n)) as u8;
                    }
                }
            }
        }
    }

    Ok(block)
}

/// Entries of the full-resolution directory with the resampling recorded.
fn tag_main_entries(main: &IfdInfo, resampling: Resampling) -> Result<Vec<IfdEntry>> {
    let mut metadata = match main.get(tag::GDAL_METADATA).and_then(|e| e.as_ascii()) {
        Some(xml) => GdalMetadata::parse_xml(&xml)?,
        None => GdalMetadata::new(),
    };
    metadata.set_in_domain(OVERVIEW_DOMAIN, "resampling", resampling.as_str());

    let mut entries: Vec<IfdEntry> = main
        .entries
        .iter()
        .filter(|e| e.tag != tag::GDAL_METADATA)
        .cloned()
        .collect();
    entries.push(IfdEntry::ascii(tag::GDAL_METADATA, &metadata.to_xml()));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{CogWriter, OutputProfile};
    use tiff::decoder::{Decoder, DecodingResult};
    use tiff::encoder::compression::Lzw;
    use tiff::encoder::{colortype, TiffEncoder};

    fn config() -> EngineConfig {
        EngineConfig {
            block_size: 16,
            ..Default::default()
        }
    }

    fn write_raster(path: &Path, width: usize, height: usize, data: &[u8]) {
        let mut writer = CogWriter::create(path, OutputProfile::new(width, height), &config()).unwrap();
        writer.write_window(&Window::new(0, 0, width, height), data).unwrap();
        let mut tags = GdalMetadata::new();
        tags.set("LAYER_TYPE", "NDVI");
        writer.set_tags(tags);
        writer.finish().unwrap();
    }

    /// Decode every image of the file in chain order.
    fn read_levels(path: &Path) -> Vec<(u32, u32, Vec<u8>)> {
        let mut decoder = Decoder::new(File::open(path).unwrap()).unwrap();
        let mut levels = Vec::new();
        loop {
            let (w, h) = decoder.dimensions().unwrap();
            match decoder.read_image().unwrap() {
                DecodingResult::U8(data) => levels.push((w, h, data)),
                _ => panic!("expected u8"),
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().unwrap();
        }
        levels
    }

    #[test]
    fn test_build_adds_levels_with_ceil_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndvi.tif");
        write_raster(&path, 37, 20, &vec![100u8; 37 * 20]);

        let outcome = OverviewBuilder::new(&config())
            .with_factors(vec![2, 4, 8])
            .build(&path, Resampling::Average)
            .unwrap();
        assert_eq!(outcome, OverviewOutcome::Built { factors: vec![2, 4, 8] });

        let levels = read_levels(&path);
        let dims: Vec<(u32, u32)> = levels.iter().map(|(w, h, _)| (*w, *h)).collect();
        assert_eq!(dims, vec![(37, 20), (19, 10), (10, 5), (5, 3)]);
        for (_, _, data) in &levels {
            assert!(data.iter().all(|&v| v == 100));
        }

        let layout = container::read_ifd_chain(&path).unwrap();
        assert!(!layout.ifds[0].is_reduced_resolution());
        assert!(layout.ifds[1..].iter().all(|ifd| ifd.is_reduced_resolution()));

        let tags = container::read_dataset_tags(&path).unwrap();
        assert_eq!(tags.get("LAYER_TYPE"), Some("NDVI"));
        assert_eq!(tags.get_in_domain(OVERVIEW_DOMAIN, "resampling"), Some("average"));
    }

    #[test]
    fn test_second_build_is_skipped_and_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndvi.tif");
        write_raster(&path, 64, 64, &vec![7u8; 64 * 64]);

        let builder = OverviewBuilder::new(&config());
        assert!(builder.build(&path, Resampling::Average).unwrap().is_built());
        let before = std::fs::read(&path).unwrap();

        let outcome = builder.build(&path, Resampling::Average).unwrap();
        assert_eq!(outcome, OverviewOutcome::Skipped { existing: 5 });
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_average_ignores_nodata_and_rounds_half_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avg.tif");
        #[rustfmt::skip]
        let data = [
            10, 20,   1, 2,    255, 255,
            255, 255, 1, 2,    255, 255,
        ];
        write_raster(&path, 6, 2, &data);

        OverviewBuilder::new(&config())
            .with_factors(vec![2])
            .build(&path, Resampling::Average)
            .unwrap();

        let levels = read_levels(&path);
        assert_eq!(levels[1].2, vec![15, 2, 255]);
    }

    #[test]
    fn test_nearest_takes_top_left() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nearest.tif");
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        write_raster(&path, 4, 2, &data);

        OverviewBuilder::new(&config())
            .with_factors(vec![2])
            .build(&path, Resampling::Nearest)
            .unwrap();

        let levels = read_levels(&path);
        assert_eq!(levels[1].2, vec![1, 3]);
        let tags = container::read_dataset_tags(&path).unwrap();
        assert_eq!(tags.get_in_domain(OVERVIEW_DOMAIN, "resampling"), Some("nearest"));
    }

    #[test]
    fn test_cascade_matches_direct_average_for_uniform_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quad.tif");
        // Four 8x8 quadrants of different values.
        let mut data = vec![0u8; 16 * 16];
        for row in 0..16 {
            for col in 0..16 {
                data[row * 16 + col] = match (row < 8, col < 8) {
                    (true, true) => 10,
                    (true, false) => 20,
                    (false, true) => 30,
                    (false, false) => 40,
                };
            }
        }
        write_raster(&path, 16, 16, &data);

        OverviewBuilder::new(&config())
            .with_factors(vec![2, 8, 16])
            .build(&path, Resampling::Average)
            .unwrap();

        let levels = read_levels(&path);
        assert_eq!(levels[2].2, vec![10, 20, 30, 40]);
        assert_eq!(levels[3].2, vec![25]);
    }

    #[test]
    fn test_striped_uncompressed_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("striped.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            let data: Vec<u8> = (0..8 * 6).map(|i| if i % 8 < 4 { 50 } else { 60 }).collect();
            encoder
                .write_image::<colortype::Gray8>(8, 6, &data)
                .unwrap();
        }

        OverviewBuilder::new(&config())
            .with_factors(vec![2])
            .build(&path, Resampling::Average)
            .unwrap();

        let levels = read_levels(&path);
        assert_eq!((levels[1].0, levels[1].1), (4, 3));
        assert_eq!(levels[1].2, vec![50, 50, 60, 60, 50, 50, 60, 60, 50, 50, 60, 60]);
    }

    #[test]
    fn test_lzw_source_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lzw.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            let data: Vec<u8> = (0..64 * 64).map(|i| if i % 64 < 32 { 100 } else { 200 }).collect();
            encoder
                .write_image_with_compression::<colortype::Gray8, _>(64, 64, Lzw, &data)
                .unwrap();
        }

        let outcome = OverviewBuilder::new(&config())
            .with_factors(vec![2, 64])
            .build(&path, Resampling::Average)
            .unwrap();
        assert!(outcome.is_built());

        let levels = read_levels(&path);
        assert_eq!((levels[1].0, levels[1].1), (32, 32));
        assert_eq!(&levels[1].2[..32], &[[100u8; 16], [200u8; 16]].concat()[..]);
        assert_eq!(levels[2].2, vec![150]);
    }

    #[test]
    fn test_rgb_source_is_averaged_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.tif");
        #[rustfmt::skip]
        let data: [u8; 4 * 2 * 3] = [
            10, 100, 200,   20, 110, 201,   0, 0, 0,    255, 255, 255,
            30, 120, 202,   40, 130, 203,   0, 0, 0,    255, 255, 255,
        ];
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder.write_image::<colortype::RGB8>(4, 2, &data).unwrap();
        }

        OverviewBuilder::new(&config())
            .with_factors(vec![2])
            .build(&path, Resampling::Average)
            .unwrap();

        let levels = read_levels(&path);
        assert_eq!((levels[1].0, levels[1].1), (2, 1));
        assert_eq!(levels[1].2, vec![25, 115, 202, 128, 128, 128]);

        let layout = container::read_ifd_chain(&path).unwrap();
        let level = &layout.ifds[1];
        assert!(level.is_reduced_resolution());
        assert_eq!(level.u64_value(tag::SAMPLES_PER_PIXEL), Some(3));
        assert_eq!(level.u64_value(tag::PHOTOMETRIC), Some(PHOTOMETRIC_RGB as u64));
        assert!(level.get(tag::GDAL_NODATA).is_none());
    }

    #[test]
    fn test_rgb_nearest_keeps_whole_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb_nearest.tif");
        let data: Vec<u8> = (0..4 * 4 * 3).map(|i| i as u8).collect();
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder.write_image::<colortype::RGB8>(4, 4, &data).unwrap();
        }

        OverviewBuilder::new(&config())
            .with_factors(vec![2])
            .build(&path, Resampling::Nearest)
            .unwrap();

        let levels = read_levels(&path);
        // Pixels (0,0), (2,0), (0,2), (2,2).
        assert_eq!(levels[1].2, vec![0, 1, 2, 6, 7, 8, 24, 25, 26, 30, 31, 32]);
    }

    #[test]
    fn test_float_raster_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(file).unwrap();
            encoder
                .write_image::<colortype::Gray32Float>(4, 4, &[0.5f32; 16])
                .unwrap();
        }

        let err = OverviewBuilder::default()
            .build(&path, Resampling::Average)
            .unwrap_err();
        assert!(matches!(err, RasterIndexError::UnsupportedLayout(_)));
    }

    #[test]
    fn test_invalid_ladder_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ladder.tif");
        write_raster(&path, 8, 8, &[1u8; 64]);

        let err = OverviewBuilder::new(&config())
            .with_factors(vec![3])
            .build(&path, Resampling::Average)
            .unwrap_err();
        assert!(matches!(err, RasterIndexError::Config(_)));
    }

    #[test]
    fn test_resampling_parse() {
        assert_eq!(Resampling::from_str("NEAREST"), Resampling::Nearest);
        assert_eq!(Resampling::from_str("average"), Resampling::Average);
        assert_eq!(Resampling::from_str("bogus"), Resampling::Average);
    }
}
