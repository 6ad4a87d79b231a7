//! Block payload encoding: horizontal differencing plus zlib deflate.
//!
//! Only the 8-bit chunky blocks the engine writes itself go through here.
//! Foreign chunks are decoded by the `tiff` crate.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{RasterIndexError, Result};

/// Encode a row-major block `width` pixels wide, `samples` bytes per pixel,
/// with predictor 2 and deflate.
pub fn encode_block(data: &[u8], width: usize, samples: usize, level: u32) -> Result<Vec<u8>> {
    let row_len = width * samples;
    if row_len == 0 || data.len() % row_len != 0 {
        return Err(RasterIndexError::invalid_data(format!(
            "block of {} bytes is not a multiple of {} pixels of {} samples",
            data.len(),
            width,
            samples
        )));
    }

    let mut differenced = data.to_vec();
    for row in differenced.chunks_exact_mut(row_len) {
        for i in (samples..row.len()).rev() {
            row[i] = row[i].wrapping_sub(row[i - samples]);
        }
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(&differenced)?;
    Ok(encoder.finish()?)
}

/// Invert [`encode_block`] for a block of `rows` rows.
pub fn decode_block(bytes: &[u8], width: usize, rows: usize, samples: usize) -> Result<Vec<u8>> {
    let row_len = width * samples;
    let expected = row_len * rows;

    let mut data = Vec::with_capacity(expected);
    ZlibDecoder::new(bytes)
        .read_to_end(&mut data)
        .map_err(|e| RasterIndexError::read_failed(format!("inflate failed: {}", e)))?;

    if data.len() < expected {
        return Err(RasterIndexError::read_failed(format!(
            "block decoded to {} bytes, expected {}",
            data.len(),
            expected
        )));
    }
    data.truncate(expected);

    if row_len > 0 {
        for row in data.chunks_exact_mut(row_len) {
            for i in samples..row.len() {
                row[i] = row[i].wrapping_add(row[i - samples]);
            }
        }
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predictor_and_deflate_invert() {
        let width = 7;
        let data: Vec<u8> = (0..width * 5).map(|i| (i * 37 % 256) as u8).collect();

        let encoded = encode_block(&data, width, 1, 6).unwrap();
        assert_eq!(decode_block(&encoded, width, 5, 1).unwrap(), data);
    }

    #[test]
    fn test_predictor_differences_per_sample() {
        // Two RGB pixels: each channel is differenced against its own
        // channel in the previous pixel.
        let data = [10u8, 100, 200, 12, 90, 201];
        let encoded = encode_block(&data, 2, 3, 6).unwrap();

        let mut raw = Vec::new();
        ZlibDecoder::new(encoded.as_slice())
            .read_to_end(&mut raw)
            .unwrap();
        assert_eq!(raw, vec![10, 100, 200, 2, 246, 1]);
        assert_eq!(decode_block(&encoded, 2, 1, 3).unwrap(), data);
    }

    #[test]
    fn test_constant_block_compresses() {
        let data = vec![255u8; 512 * 512];
        let encoded = encode_block(&data, 512, 1, 6).unwrap();
        assert!(encoded.len() < 4096);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let data: Vec<u8> = (0..64 * 64).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            encode_block(&data, 64, 1, 6).unwrap(),
            encode_block(&data, 64, 1, 6).unwrap()
        );
    }

    #[test]
    fn test_short_payload_is_an_error() {
        let encoded = encode_block(&[1, 2, 3], 3, 1, 6).unwrap();
        assert!(decode_block(&encoded, 4, 1, 1).is_err());
    }

    #[test]
    fn test_ragged_block_is_rejected() {
        assert!(encode_block(&[1, 2, 3, 4, 5], 2, 1, 6).is_err());
    }
}
