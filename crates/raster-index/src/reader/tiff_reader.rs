//! GeoTIFF band reader backed by the `tiff` decoder.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;
use tracing::debug;

use super::{check_window, BandReader};
use crate::cache::ChunkCache;
use crate::container::tag;
use crate::error::{RasterIndexError, Result};
use crate::grid::Window;
use crate::types::{CacheStats, GeoReference, RasterProfile, SampleType};

/// Default budget for decoded chunks kept per reader.
pub const DEFAULT_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// PlanarConfiguration value for band-separate storage.
const PLANAR_SEPARATE: u32 = 2;

/// Reads one band of a chunky (pixel-interleaved) GeoTIFF.
///
/// Only the strips or tiles intersecting a window are decoded. Decoded
/// chunks are kept in an LRU cache so consecutive windows over a striped
/// file do not decode the same strip twice.
pub struct TiffBandReader {
    path: PathBuf,
    decoder: Decoder<BufReader<File>>,
    band: usize,
    profile: RasterProfile,
    chunk_width: usize,
    chunk_height: usize,
    chunks_across: usize,
    cache: ChunkCache,
}

impl TiffBandReader {
    /// Open band `band` (1-based) of the file at `path`.
    pub fn open(path: impl AsRef<Path>, band: usize) -> Result<Self> {
        Self::open_with_cache(path, band, DEFAULT_CACHE_BYTES)
    }

    /// Open with an explicit chunk cache budget in bytes.
    pub fn open_with_cache(path: impl AsRef<Path>, band: usize, cache_bytes: usize) -> Result<Self> {
        let path = path.as_ref();
        let (mut decoder, profile) = open_decoder(path)?;

        if band == 0 || band > profile.band_count {
            return Err(RasterIndexError::InvalidBand {
                path: path.to_path_buf(),
                band,
                count: profile.band_count,
            });
        }

        check_chunky(&mut decoder, path, &profile)?;

        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let chunk_width = (chunk_width as usize).max(1);
        let chunk_height = (chunk_height as usize).max(1);
        let chunks_across = profile.width.div_ceil(chunk_width);

        debug!(
            path = %path.display(),
            band = band,
            width = profile.width,
            height = profile.height,
            bands = profile.band_count,
            sample_type = %profile.sample_type,
            chunk_width = chunk_width,
            chunk_height = chunk_height,
            "Opened input raster"
        );

        Ok(Self {
            path: path.to_path_buf(),
            decoder,
            band: band - 1,
            profile,
            chunk_width,
            chunk_height,
            chunks_across,
            cache: ChunkCache::new(cache_bytes),
        })
    }

    /// Everything known about the source raster.
    pub fn profile(&self) -> &RasterProfile {
        &self.profile
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The band being read (1-based).
    pub fn band(&self) -> usize {
        self.band + 1
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Pixel region covered by chunk `(chunk_col, chunk_row)`.
    fn chunk_window(&self, chunk_col: usize, chunk_row: usize) -> Window {
        let col_off = chunk_col * self.chunk_width;
        let row_off = chunk_row * self.chunk_height;
        Window::new(
            col_off,
            row_off,
            self.chunk_width.min(self.profile.width - col_off),
            self.chunk_height.min(self.profile.height - row_off),
        )
    }

    fn load_chunk(&mut self, index: u32, expected: usize) -> Result<Vec<f32>> {
        let samples = self.profile.band_count;
        let decoded = self.decoder.read_chunk(index)?;
        let values = select_band(decoded, samples, self.band)?;

        if values.len() != expected {
            return Err(RasterIndexError::read_failed(format!(
                "{}: chunk {} decoded to {} values, expected {}",
                self.path.display(),
                index,
                values.len(),
                expected
            )));
        }
        Ok(values)
    }
}

impl BandReader for TiffBandReader {
    fn shape(&self) -> (usize, usize) {
        (self.profile.width, self.profile.height)
    }

    fn nodata(&self) -> Option<f64> {
        self.profile.nodata
    }

    fn sample_type(&self) -> SampleType {
        self.profile.sample_type
    }

    fn read_window(&mut self, window: &Window) -> Result<Vec<f32>> {
        check_window(window, self.profile.width, self.profile.height)?;

        let mut out = vec![0.0f32; window.pixel_count()];
        if out.is_empty() {
            return Ok(out);
        }

        let first_col = window.col_off / self.chunk_width;
        let last_col = (window.col_end() - 1) / self.chunk_width;
        let first_row = window.row_off / self.chunk_height;
        let last_row = (window.row_end() - 1) / self.chunk_height;

        for chunk_row in first_row..=last_row {
            for chunk_col in first_col..=last_col {
                let region = self.chunk_window(chunk_col, chunk_row);
                let Some(overlap) = region.intersection(window) else {
                    continue;
                };
                let index = (chunk_row * self.chunks_across + chunk_col) as u32;

                if let Some(chunk) = self.cache.get(&index) {
                    copy_overlap(chunk, &region, &overlap, window, &mut out);
                    continue;
                }

                let chunk = self.load_chunk(index, region.pixel_count())?;
                copy_overlap(&chunk, &region, &overlap, window, &mut out);
                self.cache.insert(index, chunk);
            }
        }

        Ok(out)
    }
}

/// Open the first image of `path` and read its profile.
pub(crate) fn open_decoder(path: &Path) -> Result<(Decoder<BufReader<File>>, RasterProfile)> {
    let file = File::open(path).map_err(|e| RasterIndexError::input_not_found(path, e))?;
    let decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| RasterIndexError::input_not_found(path, e))?;
    let mut decoder = decoder.with_limits(Limits::unlimited());

    let profile = read_profile(&mut decoder)?;
    Ok((decoder, profile))
}

/// Reject band-separate storage of multi-band images.
pub(crate) fn check_chunky(
    decoder: &mut Decoder<BufReader<File>>,
    path: &Path,
    profile: &RasterProfile,
) -> Result<()> {
    let planar = optional_u32(decoder, Tag::PlanarConfiguration)?.unwrap_or(1);
    if planar == PLANAR_SEPARATE && profile.band_count > 1 {
        return Err(RasterIndexError::unsupported(format!(
            "{} stores bands in separate planes",
            path.display()
        )));
    }
    Ok(())
}

/// Copy the `overlap` part of a decoded chunk covering `region` into a
/// buffer covering `window`.
fn copy_overlap(chunk: &[f32], region: &Window, overlap: &Window, window: &Window, out: &mut [f32]) {
    for row in overlap.row_off..overlap.row_end() {
        let src = (row - region.row_off) * region.width + (overlap.col_off - region.col_off);
        let dst = (row - window.row_off) * window.width + (overlap.col_off - window.col_off);
        out[dst..dst + overlap.width].copy_from_slice(&chunk[src..src + overlap.width]);
    }
}

fn pick<T: Copy>(data: &[T], samples: usize, band: usize, convert: impl Fn(T) -> f32) -> Vec<f32> {
    if samples == 1 {
        data.iter().map(|&v| convert(v)).collect()
    } else {
        data.iter()
            .skip(band)
            .step_by(samples)
            .map(|&v| convert(v))
            .collect()
    }
}

fn select_band(decoded: DecodingResult, samples: usize, band: usize) -> Result<Vec<f32>> {
    let values = match decoded {
        DecodingResult::U8(data) => pick(&data, samples, band, f32::from),
        DecodingResult::U16(data) => pick(&data, samples, band, f32::from),
        DecodingResult::U32(data) => pick(&data, samples, band, |v| v as f32),
        DecodingResult::U64(data) => pick(&data, samples, band, |v| v as f32),
        DecodingResult::I8(data) => pick(&data, samples, band, f32::from),
        DecodingResult::I16(data) => pick(&data, samples, band, f32::from),
        DecodingResult::I32(data) => pick(&data, samples, band, |v| v as f32),
        DecodingResult::I64(data) => pick(&data, samples, band, |v| v as f32),
        DecodingResult::F32(data) => pick(&data, samples, band, |v| v),
        DecodingResult::F64(data) => pick(&data, samples, band, |v| v as f32),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(RasterIndexError::unsupported(
                "decoded sample type is not supported",
            ))
        }
    };
    Ok(values)
}

fn optional_u32(decoder: &mut Decoder<BufReader<File>>, tag: Tag) -> Result<Option<u32>> {
    Ok(decoder.find_tag(tag)?.map(|v| v.into_u32()).transpose()?)
}

fn optional_u32_vec(decoder: &mut Decoder<BufReader<File>>, tag: Tag) -> Result<Option<Vec<u32>>> {
    Ok(decoder.find_tag(tag)?.map(|v| v.into_u32_vec()).transpose()?)
}

fn optional_f64_vec(decoder: &mut Decoder<BufReader<File>>, code: u16) -> Result<Option<Vec<f64>>> {
    Ok(decoder
        .find_tag(Tag::from_u16_exhaustive(code))?
        .map(|v| v.into_f64_vec())
        .transpose()?)
}

fn optional_string(decoder: &mut Decoder<BufReader<File>>, code: u16) -> Result<Option<String>> {
    Ok(decoder
        .find_tag(Tag::from_u16_exhaustive(code))?
        .map(|v| v.into_string())
        .transpose()?)
}

fn read_profile(decoder: &mut Decoder<BufReader<File>>) -> Result<RasterProfile> {
    let (width, height) = decoder.dimensions()?;

    let band_count = optional_u32(decoder, Tag::SamplesPerPixel)?.unwrap_or(1) as usize;
    let bits = optional_u32_vec(decoder, Tag::BitsPerSample)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let format = optional_u32_vec(decoder, Tag::SampleFormat)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);

    let sample_type = match (format, bits) {
        (1, 8) => SampleType::U8,
        (1, 16) => SampleType::U16,
        (1, 32) => SampleType::U32,
        (1, 64) => SampleType::U64,
        (2, 8) => SampleType::I8,
        (2, 16) => SampleType::I16,
        (2, 32) => SampleType::I32,
        (2, 64) => SampleType::I64,
        (3, 32) => SampleType::F32,
        (3, 64) => SampleType::F64,
        _ => {
            return Err(RasterIndexError::unsupported(format!(
                "{}-bit samples with sample format {}",
                bits, format
            )))
        }
    };

    let nodata = optional_string(decoder, tag::GDAL_NODATA)?
        .and_then(|text| text.trim_matches(char::from(0)).trim().parse::<f64>().ok());
    let photometric = optional_u32(decoder, Tag::PhotometricInterpretation)?.map(|v| v as u16);

    let georef = GeoReference {
        pixel_scale: optional_f64_vec(decoder, tag::MODEL_PIXEL_SCALE)?,
        tiepoints: optional_f64_vec(decoder, tag::MODEL_TIEPOINT)?,
        transformation: optional_f64_vec(decoder, tag::MODEL_TRANSFORMATION)?,
        geo_keys: optional_u32_vec(decoder, Tag::from_u16_exhaustive(tag::GEO_KEY_DIRECTORY))?
            .map(|keys| keys.into_iter().map(|k| k as u16).collect()),
        geo_doubles: optional_f64_vec(decoder, tag::GEO_DOUBLE_PARAMS)?,
        geo_ascii: optional_string(decoder, tag::GEO_ASCII_PARAMS)?,
    };

    Ok(RasterProfile {
        width: width as usize,
        height: height as usize,
        band_count,
        sample_type,
        nodata,
        photometric,
        georef,
    })
}
