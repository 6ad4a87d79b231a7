//! Windowed single-band access to input rasters.

mod tiff_reader;

pub use tiff_reader::{TiffBandReader, DEFAULT_CACHE_BYTES};

pub(crate) use tiff_reader::{check_chunky, open_decoder};

use crate::error::{RasterIndexError, Result};
use crate::grid::Window;
use crate::types::SampleType;

/// Random windowed access to one band of a raster.
///
/// Implementations must return exactly `window.width * window.height`
/// row-major values, and must reject windows outside the raster instead of
/// reading past it.
pub trait BandReader: Send {
    /// `(width, height)` in pixels.
    fn shape(&self) -> (usize, usize);

    /// No-data value declared by the source.
    fn nodata(&self) -> Option<f64>;

    /// Native sample type of the band.
    fn sample_type(&self) -> SampleType;

    /// Read a window as `f32` values.
    fn read_window(&mut self, window: &Window) -> Result<Vec<f32>>;
}

/// Extent shared by two rasters: the per-axis minimum, plus whether they
/// differed.
pub fn common_extent(a: (usize, usize), b: (usize, usize)) -> (usize, usize, bool) {
    let width = a.0.min(b.0);
    let height = a.1.min(b.1);
    (width, height, a != b)
}

/// Reject windows that leave the raster.
pub(crate) fn check_window(window: &Window, width: usize, height: usize) -> Result<()> {
    if window.fits_within(width, height) {
        Ok(())
    } else {
        Err(RasterIndexError::out_of_bounds(
            window.to_string(),
            format!("{}x{}", width, height),
        ))
    }
}

/// An in-memory band, mostly useful for tests and synthetic inputs.
#[derive(Debug, Clone)]
pub struct MemoryBandReader {
    width: usize,
    height: usize,
    data: Vec<f32>,
    nodata: Option<f64>,
    sample_type: SampleType,
}

impl MemoryBandReader {
    /// Wrap row-major `f32` values.
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != width * height {
            return Err(RasterIndexError::invalid_data(format!(
                "{} values for a {}x{} band",
                data.len(),
                width,
                height
            )));
        }

        Ok(Self {
            width,
            height,
            data,
            nodata: None,
            sample_type: SampleType::F32,
        })
    }

    /// A band holding one value everywhere.
    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
            nodata: None,
            sample_type: SampleType::F32,
        }
    }

    pub fn with_nodata(mut self, nodata: f64) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn with_sample_type(mut self, sample_type: SampleType) -> Self {
        self.sample_type = sample_type;
        self
    }
}

impl BandReader for MemoryBandReader {
    fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    fn read_window(&mut self, window: &Window) -> Result<Vec<f32>> {
        check_window(window, self.width, self.height)?;

        let mut out = Vec::with_capacity(window.pixel_count());
        for row in window.row_off..window.row_end() {
            let start = row * self.width + window.col_off;
            out.extend_from_slice(&self.data[start..start + window.width]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_extent_takes_minimum() {
        assert_eq!(common_extent((1000, 1000), (1000, 1000)), (1000, 1000, false));
        assert_eq!(common_extent((1000, 1000), (998, 1000)), (998, 1000, true));
        assert_eq!(common_extent((10, 3), (4, 8)), (4, 3, true));
    }

    #[test]
    fn test_memory_reader_windows() {
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let mut reader = MemoryBandReader::new(4, 3, data).unwrap();

        assert_eq!(
            reader.read_window(&Window::new(1, 1, 2, 2)).unwrap(),
            vec![5.0, 6.0, 9.0, 10.0]
        );
        assert!(matches!(
            reader.read_window(&Window::new(3, 0, 2, 1)),
            Err(RasterIndexError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_memory_reader_rejects_wrong_length() {
        assert!(MemoryBandReader::new(2, 2, vec![0.0; 3]).is_err());
    }
}
