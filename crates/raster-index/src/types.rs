//! Core types shared by readers, writers and the pipeline.

use serde::{Deserialize, Serialize};

/// GeoKey id of the projected CRS code.
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
/// GeoKey id of the geographic CRS code.
const GEOGRAPHIC_TYPE_GEO_KEY: u16 = 2048;

/// Pixel data type of a raster band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl SampleType {
    /// Size of one sample in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Whether samples are 8-bit unsigned (the quantized encoding).
    pub fn is_u8(&self) -> bool {
        matches!(self, Self::U8)
    }
}

impl std::fmt::Display for SampleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::U32 => "uint32",
            Self::U64 => "uint64",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::I32 => "int32",
            Self::I64 => "int64",
            Self::F32 => "float32",
            Self::F64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/// GeoTIFF georeferencing carried from an input to every derived output.
///
/// Values are kept as stored so they can be written back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoReference {
    /// ModelPixelScale (sx, sy, sz).
    pub pixel_scale: Option<Vec<f64>>,
    /// ModelTiepoint (i, j, k, x, y, z)*.
    pub tiepoints: Option<Vec<f64>>,
    /// ModelTransformation 4x4 matrix.
    pub transformation: Option<Vec<f64>>,
    /// GeoKeyDirectory.
    pub geo_keys: Option<Vec<u16>>,
    /// GeoDoubleParams.
    pub geo_doubles: Option<Vec<f64>>,
    /// GeoAsciiParams.
    pub geo_ascii: Option<String>,
}

impl GeoReference {
    /// Whether no georeferencing is present.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// GDAL-style affine transform `[x0, dx, rx, y0, ry, dy]`.
    pub fn geo_transform(&self) -> Option<[f64; 6]> {
        if let Some(m) = &self.transformation {
            if m.len() >= 8 {
                return Some([m[3], m[0], m[1], m[7], m[4], m[5]]);
            }
        }

        let scale = self.pixel_scale.as_ref()?;
        let tie = self.tiepoints.as_ref()?;
        if scale.len() < 2 || tie.len() < 6 {
            return None;
        }

        let x0 = tie[3] - tie[0] * scale[0];
        let y0 = tie[4] + tie[1] * scale[1];
        Some([x0, scale[0], 0.0, y0, 0.0, -scale[1]])
    }

    /// EPSG code from the GeoKey directory, if one is declared.
    pub fn epsg(&self) -> Option<u16> {
        let keys = self.geo_keys.as_ref()?;
        // Header is 4 shorts, then (key, location, count, value) entries.
        let mut projected = None;
        let mut geographic = None;
        for entry in keys.get(4..)?.chunks_exact(4) {
            if entry[1] != 0 {
                continue;
            }
            match entry[0] {
                PROJECTED_CS_TYPE_GEO_KEY => projected = Some(entry[3]),
                GEOGRAPHIC_TYPE_GEO_KEY => geographic = Some(entry[3]),
                _ => {}
            }
        }
        projected.or(geographic)
    }
}

/// Read-side description of an open raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterProfile {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Samples per pixel.
    pub band_count: usize,
    /// Sample data type.
    pub sample_type: SampleType,
    /// No-data value declared by the source (`GDAL_NODATA`).
    pub nodata: Option<f64>,
    /// Photometric interpretation of the source, if declared.
    pub photometric: Option<u16>,
    /// Georeferencing tags.
    pub georef: GeoReference,
}

/// Statistics about the chunk cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub memory_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_transform_from_tiepoint() {
        let georef = GeoReference {
            pixel_scale: Some(vec![0.25, 0.25, 0.0]),
            tiepoints: Some(vec![0.0, 0.0, 0.0, 140000.0, 175000.0, 0.0]),
            ..Default::default()
        };

        let gt = georef.geo_transform().unwrap();
        assert_eq!(gt, [140000.0, 0.25, 0.0, 175000.0, 0.0, -0.25]);
    }

    #[test]
    fn test_geo_transform_missing() {
        assert!(GeoReference::default().geo_transform().is_none());
        assert!(GeoReference::default().is_empty());
    }

    #[test]
    fn test_epsg_prefers_projected_key() {
        let georef = GeoReference {
            geo_keys: Some(vec![
                1, 1, 0, 3, //
                1024, 0, 1, 1, //
                2048, 0, 1, 4326, //
                3072, 0, 1, 31370,
            ]),
            ..Default::default()
        };
        assert_eq!(georef.epsg(), Some(31370));
    }

    #[test]
    fn test_sample_type_sizes() {
        assert_eq!(SampleType::U8.size_bytes(), 1);
        assert_eq!(SampleType::I16.size_bytes(), 2);
        assert_eq!(SampleType::F32.size_bytes(), 4);
        assert_eq!(SampleType::F64.size_bytes(), 8);
        assert_eq!(SampleType::F32.to_string(), "float32");
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let mut stats = CacheStats::default();
        assert!((stats.hit_rate() - 0.0).abs() < f64::EPSILON);

        stats.hits = 80;
        stats.misses = 20;
        assert!((stats.hit_rate() - 0.8).abs() < f64::EPSILON);
    }
}
