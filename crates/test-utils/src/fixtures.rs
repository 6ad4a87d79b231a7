//! GeoTIFF fixtures written with the `tiff` encoder.
//!
//! Fixtures mirror what index inputs look like in practice: a float or
//! 8-bit NIR band, an interleaved RGB image, optional `GDAL_NODATA` and a
//! small UTM georeference.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use tiff::encoder::colortype::{ColorType, Gray32Float, Gray8, RGB8};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tiff::TiffResult;

const GEOTIFF_MODELPIXELSCALE: u16 = 33550;
const GEOTIFF_MODELTIEPOINT: u16 = 33922;
const GEOTIFF_GEOKEYDIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

/// Georeference attached to fixtures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixtureGeo {
    /// Upper-left corner in map units.
    pub origin: (f64, f64),
    /// Square pixel edge in map units.
    pub pixel_size: f64,
    /// Projected EPSG code.
    pub epsg: u16,
}

impl Default for FixtureGeo {
    fn default() -> Self {
        Self {
            origin: (500_000.0, 4_600_000.0),
            pixel_size: 0.5,
            epsg: 32633,
        }
    }
}

impl FixtureGeo {
    /// ModelPixelScale values.
    pub fn pixel_scale(&self) -> [f64; 3] {
        [self.pixel_size, self.pixel_size, 0.0]
    }

    /// ModelTiepoint tying pixel (0, 0) to the origin.
    pub fn tiepoint(&self) -> [f64; 6] {
        [0.0, 0.0, 0.0, self.origin.0, self.origin.1, 0.0]
    }

    /// Minimal GeoKeyDirectory: projected model, pixel-is-area, EPSG code.
    pub fn geo_keys(&self) -> [u16; 16] {
        [
            1, 1, 0, 3, //
            1024, 0, 1, 1, //
            1025, 0, 1, 1, //
            3072, 0, 1, self.epsg,
        ]
    }
}

/// Knobs shared by all fixture writers.
#[derive(Debug, Clone, Default)]
pub struct FixtureOptions {
    pub geo: Option<FixtureGeo>,
    /// Written verbatim to `GDAL_NODATA`.
    pub nodata: Option<String>,
    /// Strip height; the encoder default when `None`.
    pub rows_per_strip: Option<u32>,
}

impl FixtureOptions {
    /// Georeferenced, no no-data value.
    pub fn georeferenced() -> Self {
        Self {
            geo: Some(FixtureGeo::default()),
            ..Default::default()
        }
    }

    pub fn with_nodata(mut self, nodata: impl Into<String>) -> Self {
        self.nodata = Some(nodata.into());
        self
    }

    pub fn with_rows_per_strip(mut self, rows: u32) -> Self {
        self.rows_per_strip = Some(rows);
        self
    }
}

/// Write a single-band float32 GeoTIFF.
pub fn write_gray_f32(
    path: &Path,
    width: u32,
    height: u32,
    data: &[f32],
    options: &FixtureOptions,
) -> TiffResult<()> {
    write_image::<Gray32Float>(path, width, height, data, options)
}

/// Write a single-band uint8 GeoTIFF.
pub fn write_gray_u8(
    path: &Path,
    width: u32,
    height: u32,
    data: &[u8],
    options: &FixtureOptions,
) -> TiffResult<()> {
    write_image::<Gray8>(path, width, height, data, options)
}

/// Write a pixel-interleaved RGB uint8 GeoTIFF. `data` is RGBRGB...
pub fn write_rgb8(
    path: &Path,
    width: u32,
    height: u32,
    data: &[u8],
    options: &FixtureOptions,
) -> TiffResult<()> {
    write_image::<RGB8>(path, width, height, data, options)
}

/// RGB image whose red band is `red`, green band is `green` and blue is 0.
pub fn write_rgb8_bands(
    path: &Path,
    width: u32,
    height: u32,
    red: u8,
    green: u8,
    options: &FixtureOptions,
) -> TiffResult<()> {
    let pixels = (width * height) as usize;
    let mut data = Vec::with_capacity(pixels * 3);
    for _ in 0..pixels {
        data.extend_from_slice(&[red, green, 0]);
    }
    write_rgb8(path, width, height, &data, options)
}

fn write_image<C: ColorType>(
    path: &Path,
    width: u32,
    height: u32,
    data: &[C::Inner],
    options: &FixtureOptions,
) -> TiffResult<()>
where
    [C::Inner]: TiffValue,
{
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    let mut image = encoder.new_image::<C>(width, height)?;

    if let Some(rows) = options.rows_per_strip {
        image.rows_per_strip(rows)?;
    }

    if let Some(geo) = &options.geo {
        let dir = image.encoder();
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELPIXELSCALE), &geo.pixel_scale()[..])?;
        dir.write_tag(Tag::Unknown(GEOTIFF_MODELTIEPOINT), &geo.tiepoint()[..])?;
        dir.write_tag(Tag::Unknown(GEOTIFF_GEOKEYDIRECTORY), &geo.geo_keys()[..])?;
    }

    if let Some(nodata) = &options.nodata {
        image
            .encoder()
            .write_tag(Tag::Unknown(GDAL_NODATA), nodata.as_str())?;
    }

    image.write_data(data)
}
