//! 8-bit quantization of bounded index values.
//!
//! Values in `[lo, hi]` map affinely onto codes `0..=254`; code 255 is the
//! no-data sentinel and is never produced for a finite value.

use serde::{Deserialize, Serialize};

/// Reserved no-data code.
pub const SENTINEL: u8 = 255;

/// Largest code produced by valid data.
pub const MAX_CODE: u8 = 254;

/// Closed value range of an index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub lo: f32,
    pub hi: f32,
}

impl ValueRange {
    /// `[-1, 1]`, the range of normalized differences.
    pub const SYMMETRIC: ValueRange = ValueRange { lo: -1.0, hi: 1.0 };

    /// `[0, 1]`, the range of the heat-risk index.
    pub const UNIT: ValueRange = ValueRange { lo: 0.0, hi: 1.0 };

    /// Create a new range. `lo` must be below `hi`.
    pub fn new(lo: f32, hi: f32) -> Self {
        Self { lo, hi }
    }

    /// Width of the range.
    pub fn span(&self) -> f32 {
        self.hi - self.lo
    }

    /// Clamp a value into the range.
    pub fn clamp(&self, value: f32) -> f32 {
        value.clamp(self.lo, self.hi)
    }
}

impl std::fmt::Display for ValueRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.lo, self.hi)
    }
}

/// Affine 8-bit encoder/decoder over a [`ValueRange`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quantizer {
    range: ValueRange,
}

impl Quantizer {
    /// Create a quantizer for the given range.
    pub fn new(range: ValueRange) -> Self {
        Self { range }
    }

    /// The range this quantizer covers.
    pub fn range(&self) -> ValueRange {
        self.range
    }

    /// One quantization step in value units.
    pub fn step(&self) -> f32 {
        self.range.span() / MAX_CODE as f32
    }

    /// Encode a value. Non-finite values encode as the sentinel; finite
    /// values outside the range are clamped first.
    #[inline]
    pub fn encode(&self, value: f32) -> u8 {
        if !value.is_finite() {
            return SENTINEL;
        }

        let clamped = self.range.clamp(value);
        let scaled = (clamped - self.range.lo) / self.range.span() * MAX_CODE as f32;
        scaled.round().clamp(0.0, MAX_CODE as f32) as u8
    }

    /// Decode a code. The sentinel decodes to `None`.
    #[inline]
    pub fn decode(&self, code: u8) -> Option<f32> {
        if code == SENTINEL {
            return None;
        }

        Some(self.range.lo + code as f32 / MAX_CODE as f32 * self.range.span())
    }

    /// Encode a block of values into `out`.
    pub fn encode_block(&self, values: &[f32], out: &mut [u8]) {
        for (code, &value) in out.iter_mut().zip(values) {
            *code = self.encode(value);
        }
    }

    /// Human-readable encoding description for dataset tags.
    pub fn encoding_description(&self) -> String {
        format!(
            "uint8: [0,{}] maps to [{},{}], {}=nodata",
            MAX_CODE, self.range.lo, self.range.hi, SENTINEL
        )
    }

    /// Literal encode formula for dataset tags.
    pub fn encode_formula(&self) -> String {
        format!(
            "pixel = round((value - ({})) / {} * {})",
            self.range.lo,
            self.range.span(),
            MAX_CODE
        )
    }

    /// Literal decode formula for dataset tags.
    pub fn decode_formula(&self) -> String {
        if self.range.lo == 0.0 {
            format!("value = (pixel / {}) * {}", MAX_CODE, self.range.span())
        } else {
            format!(
                "value = (pixel / {}) * {} + ({})",
                MAX_CODE,
                self.range.span(),
                self.range.lo
            )
        }
    }
}
