//! Per-pixel index formulas.
//!
//! A formula maps one or more same-shaped input blocks onto one output block
//! elementwise. The pipeline owns tiling, no-data masking and quantization,
//! so a formula only ever sees valid values.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{RasterIndexError, Result};
use crate::quantize::{Quantizer, ValueRange};

/// How the pipeline must interpret an input before handing it to a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEncoding {
    /// Raw sample values.
    Raw,
    /// 8-bit inputs are quantized codes over the given range and must be
    /// decoded first; other sample types are used as-is.
    QuantizedIfU8(QuantizedRange),
}

/// Range a quantized input was encoded over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizedRange {
    Symmetric,
    Unit,
}

impl QuantizedRange {
    /// The value range of the encoding.
    pub fn value_range(&self) -> ValueRange {
        match self {
            Self::Symmetric => ValueRange::SYMMETRIC,
            Self::Unit => ValueRange::UNIT,
        }
    }

    /// Quantizer matching the encoding.
    pub fn quantizer(&self) -> Quantizer {
        Quantizer::new(self.value_range())
    }
}

/// A pure elementwise index formula.
pub trait IndexFormula: Send + Sync {
    /// Layer type written to the `LAYER_TYPE` tag (e.g. "NDVI").
    fn layer_type(&self) -> &str;

    /// Formula text written to the `FORMULA` tag.
    fn expression(&self) -> &str;

    /// Range of the result; values are clamped into it before encoding.
    fn value_range(&self) -> ValueRange;

    /// Role names of the inputs, in the order `apply` receives them.
    fn input_roles(&self) -> &[&'static str];

    /// Number of inputs.
    fn arity(&self) -> usize {
        self.input_roles().len()
    }

    /// How input `index` must be decoded before `apply`.
    fn input_encoding(&self, _index: usize) -> InputEncoding {
        InputEncoding::Raw
    }

    /// Extra provenance tags written alongside the standard ones.
    fn provenance(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    /// Compute one value from one pixel of each input.
    fn compute(&self, pixel: &[f32]) -> f32;

    /// Compute a block. `inputs` are same-length slices, one per role.
    fn apply(&self, inputs: &[&[f32]], out: &mut [f32]) {
        let mut pixel = vec![0.0f32; inputs.len()];
        for (i, value) in out.iter_mut().enumerate() {
            for (slot, input) in pixel.iter_mut().zip(inputs) {
                *slot = input[i];
            }
            *value = self.compute(&pixel);
        }
    }
}

/// `(x - y) / (x + y)` before clipping; a zero denominator yields exactly 0.
#[inline]
pub fn normalized_difference_raw(x: f32, y: f32) -> f32 {
    let denominator = x + y;
    if denominator != 0.0 {
        (x - y) / denominator
    } else {
        0.0
    }
}

/// [`normalized_difference_raw`] clamped to `[-1, 1]`.
#[inline]
pub fn normalized_difference(x: f32, y: f32) -> f32 {
    normalized_difference_raw(x, y).clamp(-1.0, 1.0)
}

/// A normalized-difference index over two inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDifference {
    layer_type: &'static str,
    expression: &'static str,
    roles: [&'static str; 2],
}

impl NormalizedDifference {
    /// Vegetation index: `(NIR - Red) / (NIR + Red)`.
    pub fn ndvi() -> Self {
        Self {
            layer_type: "NDVI",
            expression: "(NIR - Red) / (NIR + Red)",
            roles: ["NIR", "RGB"],
        }
    }

    /// Water index: `(Green - NIR) / (Green + NIR)`.
    pub fn ndwi() -> Self {
        Self {
            layer_type: "NDWI",
            expression: "(Green - NIR) / (Green + NIR)",
            roles: ["RGB", "NIR"],
        }
    }
}

impl IndexFormula for NormalizedDifference {
    fn layer_type(&self) -> &str {
        self.layer_type
    }

    fn expression(&self) -> &str {
        self.expression
    }

    fn value_range(&self) -> ValueRange {
        ValueRange::SYMMETRIC
    }

    fn input_roles(&self) -> &[&'static str] {
        &self.roles
    }

    #[inline]
    fn compute(&self, pixel: &[f32]) -> f32 {
        normalized_difference(pixel[0], pixel[1])
    }

    fn apply(&self, inputs: &[&[f32]], out: &mut [f32]) {
        let (x, y) = (inputs[0], inputs[1]);
        for ((value, &a), &b) in out.iter_mut().zip(x).zip(y) {
            *value = normalized_difference(a, b);
        }
    }
}

/// Placeholder heat-risk index derived from a vegetation index.
///
/// `risk = 1 - (v + 1) / 2`, clamped to `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeatRisk;

impl HeatRisk {
    /// Model version recorded alongside the output.
    pub const MODEL_VERSION: &'static str = "placeholder_v1";
}

impl IndexFormula for HeatRisk {
    fn layer_type(&self) -> &str {
        "UHI_PREDICTION"
    }

    fn expression(&self) -> &str {
        "heat_risk = 1 - (ndvi + 1) / 2"
    }

    fn value_range(&self) -> ValueRange {
        ValueRange::UNIT
    }

    fn input_roles(&self) -> &[&'static str] {
        &["NDVI"]
    }

    fn input_encoding(&self, _index: usize) -> InputEncoding {
        InputEncoding::QuantizedIfU8(QuantizedRange::Symmetric)
    }

    fn provenance(&self) -> Vec<(&'static str, String)> {
        vec![
            ("MODEL_VERSION", Self::MODEL_VERSION.to_string()),
            ("INPUT_LAYERS", "NDVI".to_string()),
        ]
    }

    #[inline]
    fn compute(&self, pixel: &[f32]) -> f32 {
        (1.0 - (pixel[0] + 1.0) / 2.0).clamp(0.0, 1.0)
    }
}

/// Closure type backing [`FnFormula`].
pub type PixelFn = Arc<dyn Fn(&[f32]) -> f32 + Send + Sync>;

/// A caller-supplied formula.
#[derive(Clone)]
pub struct FnFormula {
    layer_type: String,
    expression: String,
    range: ValueRange,
    roles: Vec<&'static str>,
    encodings: Vec<InputEncoding>,
    func: PixelFn,
}

impl FnFormula {
    /// Create a formula from a per-pixel closure.
    pub fn new(
        layer_type: impl Into<String>,
        expression: impl Into<String>,
        range: ValueRange,
        roles: Vec<&'static str>,
        func: impl Fn(&[f32]) -> f32 + Send + Sync + 'static,
    ) -> Self {
        let encodings = vec![InputEncoding::Raw; roles.len()];
        Self {
            layer_type: layer_type.into(),
            expression: expression.into(),
            range,
            roles,
            encodings,
            func: Arc::new(func),
        }
    }

    /// Declare that input `index` is a quantized 8-bit layer.
    pub fn with_quantized_input(mut self, index: usize, range: QuantizedRange) -> Self {
        if let Some(slot) = self.encodings.get_mut(index) {
            *slot = InputEncoding::QuantizedIfU8(range);
        }
        self
    }
}

impl std::fmt::Debug for FnFormula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFormula")
            .field("layer_type", &self.layer_type)
            .field("expression", &self.expression)
            .field("range", &self.range)
            .field("roles", &self.roles)
            .finish()
    }
}

impl IndexFormula for FnFormula {
    fn layer_type(&self) -> &str {
        &self.layer_type
    }

    fn expression(&self) -> &str {
        &self.expression
    }

    fn value_range(&self) -> ValueRange {
        self.range
    }

    fn input_roles(&self) -> &[&'static str] {
        &self.roles
    }

    fn input_encoding(&self, index: usize) -> InputEncoding {
        self.encodings
            .get(index)
            .copied()
            .unwrap_or(InputEncoding::Raw)
    }

    fn compute(&self, pixel: &[f32]) -> f32 {
        (self.func)(pixel)
    }
}

/// Selector for the built-in formulas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormulaKind {
    Ndvi,
    Ndwi,
    #[serde(alias = "heat-risk", alias = "heat_risk")]
    HeatRisk,
}

impl FormulaKind {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ndvi" => Ok(Self::Ndvi),
            "ndwi" => Ok(Self::Ndwi),
            "heatrisk" | "heat-risk" | "heat_risk" | "uhi" => Ok(Self::HeatRisk),
            other => Err(RasterIndexError::Formula(format!(
                "unknown formula '{}'",
                other
            ))),
        }
    }

    /// Instantiate the formula.
    pub fn build(&self) -> Arc<dyn IndexFormula> {
        match self {
            Self::Ndvi => Arc::new(NormalizedDifference::ndvi()),
            Self::Ndwi => Arc::new(NormalizedDifference::ndwi()),
            Self::HeatRisk => Arc::new(HeatRisk),
        }
    }

    /// Get the selector name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ndvi => "ndvi",
            Self::Ndwi => "ndwi",
            Self::HeatRisk => "heat-risk",
        }
    }
}

impl std::str::FromStr for FormulaKind {
    type Err = RasterIndexError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for FormulaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_denominator_is_zero() {
        assert_eq!(normalized_difference_raw(0.0, 0.0), 0.0);
        assert_eq!(normalized_difference_raw(4.0, -4.0), 0.0);
        assert_eq!(normalized_difference(0.0, 0.0), 0.0);
        assert_eq!(normalized_difference(5.0, -5.0), 0.0);
        assert_eq!(normalized_difference(-0.0, 0.0), 0.0);
    }

    #[test]
    fn test_normalized_difference_values() {
        assert!((normalized_difference(3.0, 1.0) - 0.5).abs() < 1e-6);
        assert!((normalized_difference(1.0, 3.0) + 0.5).abs() < 1e-6);
        assert_eq!(normalized_difference(10.0, 0.0), 1.0);
    }

    #[test]
    fn test_normalized_difference_clamps() {
        // Negative reflectances can push the ratio outside [-1, 1].
        assert_eq!(normalized_difference(3.0, -2.0), 1.0);
        assert_eq!(normalized_difference(2.0, -3.0), -1.0);
    }

    #[test]
    fn test_ndvi_and_ndwi_roles() {
        let ndvi = NormalizedDifference::ndvi();
        assert_eq!(ndvi.layer_type(), "NDVI");
        assert_eq!(ndvi.input_roles(), &["NIR", "RGB"]);
        assert_eq!(ndvi.arity(), 2);

        let ndwi = NormalizedDifference::ndwi();
        assert_eq!(ndwi.expression(), "(Green - NIR) / (Green + NIR)");
        assert_eq!(ndwi.input_roles(), &["RGB", "NIR"]);
    }

    #[test]
    fn test_apply_block() {
        let x = [3.0f32, 0.0, 2.0];
        let y = [1.0f32, 0.0, 2.0];
        let mut out = [9.0f32; 3];
        NormalizedDifference::ndvi().apply(&[&x[..], &y[..]], &mut out);
        assert!((out[0] - 0.5).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_heat_risk() {
        let risk = HeatRisk;
        assert_eq!(risk.arity(), 1);
        assert_eq!(risk.compute(&[-1.0]), 1.0);
        assert_eq!(risk.compute(&[1.0]), 0.0);
        assert!((risk.compute(&[0.0]) - 0.5).abs() < 1e-6);
        assert_eq!(risk.compute(&[3.0]), 0.0);
        assert_eq!(
            risk.input_encoding(0),
            InputEncoding::QuantizedIfU8(QuantizedRange::Symmetric)
        );
        assert_eq!(risk.provenance()[0], ("MODEL_VERSION", "placeholder_v1".to_string()));
        assert!(NormalizedDifference::ndvi().provenance().is_empty());
    }

    #[test]
    fn test_fn_formula() {
        let ratio = FnFormula::new(
            "RATIO",
            "a / 10",
            ValueRange::UNIT,
            vec!["A"],
            |p: &[f32]| p[0] / 10.0,
        );
        let input = [5.0f32, 10.0];
        let mut out = [0.0f32; 2];
        ratio.apply(&[&input[..]], &mut out);
        assert_eq!(out, [0.5, 1.0]);
        assert_eq!(ratio.input_encoding(0), InputEncoding::Raw);

        let quantized = ratio.with_quantized_input(0, QuantizedRange::Unit);
        assert_eq!(
            quantized.input_encoding(0),
            InputEncoding::QuantizedIfU8(QuantizedRange::Unit)
        );
    }

    #[test]
    fn test_formula_kind_parse() {
        assert_eq!(FormulaKind::parse("NDVI").unwrap(), FormulaKind::Ndvi);
        assert_eq!(FormulaKind::parse("ndwi").unwrap(), FormulaKind::Ndwi);
        assert_eq!(FormulaKind::parse("heat-risk").unwrap(), FormulaKind::HeatRisk);
        assert!(FormulaKind::parse("evi").is_err());
        assert_eq!(FormulaKind::HeatRisk.build().layer_type(), "UHI_PREDICTION");
    }
}
