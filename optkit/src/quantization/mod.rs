//! Simulated quantization: encodings, tensor quantizers and the wrappers inserted around
//! the layers of a model.
mod export;
mod histogram;
mod sim;
pub mod ste;
mod tensor_quantizer;
mod wrapper;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use export::{EncodingFile, EncodingRecord};
pub use sim::QuantizationSimModel;
pub use tensor_quantizer::TensorQuantizer;
pub use wrapper::{QcQuantizeOpMode, QcQuantizeStandalone, QcQuantizeWrapper};

pub const MIN_BITWIDTH: u8 = 4;
pub const MAX_BITWIDTH: u8 = 32;

/// Smallest span an encoding covers, keeps `delta` away from zero for constant tensors
const MIN_RANGE: f32 = 1e-5;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum QuantizerError {
    #[error("no quantizer named '{0}'")]
    NotFound(String),
    #[error("'{name}' matches several quantizers: {candidates:?}")]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },
    #[error("quantizer '{0}' has no encoding")]
    NoEncoding(String),
    #[error("bitwidth {0} is outside {MIN_BITWIDTH}..={MAX_BITWIDTH}")]
    InvalidBitwidth(u8),
}

pub fn check_bitwidth(bitwidth: u8) -> Result<u8, QuantizerError> {
    if (MIN_BITWIDTH..=MAX_BITWIDTH).contains(&bitwidth) {
        Ok(bitwidth)
    } else {
        Err(QuantizerError::InvalidBitwidth(bitwidth))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    #[default]
    Nearest,
    Stochastic,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantScheme {
    /// Encodings cover the observed min/max
    PostTrainingTf,
    /// Encodings minimize quantization plus clipping noise over a histogram of the values
    #[default]
    PostTrainingTfEnhanced,
}

/// Quantization grid of a tensor: `2^bitwidth` values `(q + offset) * delta`
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Encoding {
    pub min: f32,
    pub max: f32,
    pub delta: f32,
    pub offset: i64,
    pub bitwidth: u8,
}

impl Encoding {
    fn num_steps(bitwidth: u8) -> f64 {
        ((1u64 << bitwidth) - 1) as f64
    }

    /// Grid covering `[min, max]` extended to include zero. Asymmetric grids are nudged so
    /// that zero is exactly representable, symmetric grids are centered on zero.
    pub fn from_range(min: f32, max: f32, bitwidth: u8, symmetric: bool) -> Self {
        let min = min.min(0.0) as f64;
        let max = max.max(0.0) as f64;
        if symmetric {
            let abs_max = min.abs().max(max).max(MIN_RANGE as f64);
            let half = (1u64 << (bitwidth - 1)) as f64;
            let delta = abs_max / (half - 1.0);
            let offset = -(half as i64);
            return Self {
                min: (offset as f64 * delta) as f32,
                max: ((half - 1.0) * delta) as f32,
                delta: delta as f32,
                offset,
                bitwidth,
            };
        }
        let steps = Self::num_steps(bitwidth);
        let max = max.max(min + MIN_RANGE as f64);
        let delta = (max - min) / steps;
        let offset = (min / delta).round();
        let min = offset * delta;
        Self {
            min: min as f32,
            max: (min + steps * delta) as f32,
            delta: delta as f32,
            offset: offset as i64,
            bitwidth,
        }
    }

    /// Grid index of `x` before clamping, rounded with `round`
    fn index(&self, x: f32, round: impl FnOnce(f64) -> f64) -> f64 {
        round(x as f64 / self.delta as f64) - self.offset as f64
    }

    /// Snaps a value onto the grid, clamping out-of-range values to the grid ends
    pub fn quantize_dequantize(&self, x: f32, round: impl FnOnce(f64) -> f64) -> f32 {
        let q = self.index(x, round).clamp(0.0, Self::num_steps(self.bitwidth));
        ((q + self.offset as f64) * self.delta as f64) as f32
    }
}

/// Quantize-dequantizes a whole buffer, warning once when a large share of it is clipped
pub(crate) fn quantize_dequantize_slice(
    name: &str,
    encoding: &Encoding,
    values: &mut [f32],
    mut round: impl FnMut(f64) -> f64,
) {
    let mut clipped = 0usize;
    let top = Encoding::num_steps(encoding.bitwidth);
    for v in values.iter_mut() {
        let q = encoding.index(*v, &mut round);
        if !(0.0..=top).contains(&q) {
            clipped += 1;
        }
        *v = ((q.clamp(0.0, top) + encoding.offset as f64) * encoding.delta as f64) as f32;
    }
    if !values.is_empty() && clipped * 10 > values.len() {
        warn!(
            "{name}: {clipped} of {} values clipped to [{}, {}]",
            values.len(),
            encoding.min,
            encoding.max
        );
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(-1.0, 3.0, 8)]
    #[case(0.5, 2.0, 8)]
    #[case(-7.0, -0.25, 4)]
    #[case(-0.3, 0.3, 16)]
    fn test_asymmetric_grid_contains_zero(#[case] min: f32, #[case] max: f32, #[case] bw: u8) {
        let encoding = Encoding::from_range(min, max, bw, false);
        assert!(encoding.min <= 0.0 && encoding.max >= 0.0);
        assert_eq!(encoding.quantize_dequantize(0.0, f64::round), 0.0);
        let span = encoding.max - encoding.min;
        assert!((span - encoding.delta * ((1u64 << bw) - 1) as f32).abs() < 1e-4 * span.max(1.0));
    }

    #[test]
    fn test_symmetric_grid() {
        let encoding = Encoding::from_range(-0.5, 2.54, 8, true);
        assert_eq!(encoding.offset, -128);
        assert!((encoding.delta - 0.02).abs() < 1e-6);
        assert!((encoding.max - 2.54).abs() < 1e-5);
        assert!((encoding.quantize_dequantize(1.011, f64::round) - 1.02).abs() < 1e-5);
    }

    #[test]
    fn test_values_are_clamped_to_the_grid() {
        let encoding = Encoding::from_range(0.0, 1.0, 8, false);
        assert_eq!(encoding.offset, 0);
        assert_eq!(encoding.quantize_dequantize(-3.0, f64::round), 0.0);
        assert!((encoding.quantize_dequantize(5.0, f64::round) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bitwidth_bounds() {
        assert!(check_bitwidth(4).is_ok());
        assert!(check_bitwidth(32).is_ok());
        assert_eq!(check_bitwidth(3), Err(QuantizerError::InvalidBitwidth(3)));
        assert_eq!(check_bitwidth(33), Err(QuantizerError::InvalidBitwidth(33)));
    }
}
