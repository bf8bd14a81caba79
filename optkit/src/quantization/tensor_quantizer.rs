use anyhow::Result;
use rand::Rng;

use crate::tensor::Tensor;

use super::{
    Encoding, QuantScheme, QuantizerError, RoundingMode, check_bitwidth, histogram::Histogram,
    quantize_dequantize_slice,
};

#[derive(Clone, Debug, PartialEq)]
enum TensorStats {
    MinMax { min: f32, max: f32 },
    Histogram(Histogram),
}

/// Collects statistics over the values of one tensor and quantizes it with the encoding
/// computed from them
#[derive(Clone, Debug, PartialEq)]
pub struct TensorQuantizer {
    bitwidth: u8,
    pub round_mode: RoundingMode,
    pub quant_scheme: QuantScheme,
    pub use_symmetric_encodings: bool,
    pub enabled: bool,
    stats: Option<TensorStats>,
    encoding: Option<Encoding>,
    frozen: bool,
}

impl TensorQuantizer {
    pub fn new(
        bitwidth: u8,
        round_mode: RoundingMode,
        quant_scheme: QuantScheme,
        use_symmetric_encodings: bool,
        enabled: bool,
    ) -> Result<Self, QuantizerError> {
        Ok(Self {
            bitwidth: check_bitwidth(bitwidth)?,
            round_mode,
            quant_scheme,
            use_symmetric_encodings,
            enabled,
            stats: None,
            encoding: None,
            frozen: false,
        })
    }

    pub fn bitwidth(&self) -> u8 {
        self.bitwidth
    }

    pub fn set_bitwidth(&mut self, bitwidth: u8) -> Result<(), QuantizerError> {
        self.bitwidth = check_bitwidth(bitwidth)?;
        Ok(())
    }

    pub fn encoding(&self) -> Option<&Encoding> {
        self.encoding.as_ref()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn update_encoding_stats(&mut self, tensor: &Tensor<f32>) {
        let values = tensor.get_data();
        if values.is_empty() {
            return;
        }
        match &mut self.stats {
            Some(TensorStats::MinMax { min, max }) => {
                *min = min.min(tensor.min_value());
                *max = max.max(tensor.max_value());
            }
            Some(TensorStats::Histogram(histogram)) => histogram.update(values),
            None => {
                self.stats = match self.quant_scheme {
                    QuantScheme::PostTrainingTf => Some(TensorStats::MinMax {
                        min: tensor.min_value(),
                        max: tensor.max_value(),
                    }),
                    QuantScheme::PostTrainingTfEnhanced => {
                        Histogram::new(values).map(TensorStats::Histogram)
                    }
                }
            }
        }
    }

    /// Computes the encoding from the statistics gathered so far. Frozen quantizers keep
    /// their encoding, quantizers without statistics keep none.
    pub fn compute_encoding(&mut self) -> Option<&Encoding> {
        if !self.frozen {
            if let Some(stats) = &self.stats {
                let (min, max) = match stats {
                    TensorStats::MinMax { min, max } => (*min, *max),
                    TensorStats::Histogram(histogram) => {
                        histogram.optimal_range(self.bitwidth, self.use_symmetric_encodings)
                    }
                };
                self.encoding = Some(Encoding::from_range(
                    min,
                    max,
                    self.bitwidth,
                    self.use_symmetric_encodings,
                ));
            }
        }
        self.encoding.as_ref()
    }

    /// Drops the statistics, and the encoding unless it is frozen
    pub fn reset_encoding_stats(&mut self) {
        self.stats = None;
        if !self.frozen {
            self.encoding = None;
        }
    }

    /// Replaces the encoding and stops it from being recomputed
    pub fn freeze_encoding(&mut self, encoding: Encoding) -> Result<(), QuantizerError> {
        self.bitwidth = check_bitwidth(encoding.bitwidth)?;
        self.encoding = Some(encoding);
        self.frozen = true;
        Ok(())
    }

    /// Snaps `tensor` onto the encoding grid. Stochastic rounding draws from `rng`.
    pub fn quantize_dequantize<R: Rng>(
        &self,
        name: &str,
        tensor: &Tensor<f32>,
        round_mode: RoundingMode,
        rng: &mut R,
    ) -> Result<Tensor<f32>> {
        let encoding = self
            .encoding
            .as_ref()
            .ok_or_else(|| QuantizerError::NoEncoding(name.to_string()))?;
        let mut quantized = tensor.clone();
        match round_mode {
            RoundingMode::Nearest => {
                quantize_dequantize_slice(name, encoding, quantized.get_data_mut(), f64::round)
            }
            RoundingMode::Stochastic => quantize_dequantize_slice(
                name,
                encoding,
                quantized.get_data_mut(),
                |x| (x + rng.gen::<f64>()).floor(),
            ),
        }
        Ok(quantized)
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn quantizer(scheme: QuantScheme) -> TensorQuantizer {
        TensorQuantizer::new(8, RoundingMode::Nearest, scheme, false, true).unwrap()
    }

    #[test]
    fn test_encoding_needs_stats() {
        let mut q = quantizer(QuantScheme::PostTrainingTf);
        assert!(q.compute_encoding().is_none());
        let mut rng = StdRng::seed_from_u64(0);
        let err = q
            .quantize_dequantize("x", &Tensor::zeros(vec![2]), RoundingMode::Nearest, &mut rng)
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<QuantizerError>(),
            Some(&QuantizerError::NoEncoding("x".to_string()))
        );
    }

    #[test]
    fn test_encoding_is_stable_and_contains_zero() {
        for scheme in [QuantScheme::PostTrainingTf, QuantScheme::PostTrainingTfEnhanced] {
            let mut q = quantizer(scheme);
            for seed in 0..4 {
                q.update_encoding_stats(&Tensor::random_seeded(vec![64], seed).map(|v| v + 2.0));
            }
            let first = *q.compute_encoding().unwrap();
            assert!(first.min <= 0.0 && 0.0 <= first.max);
            assert_eq!(q.compute_encoding(), Some(&first));
        }
    }

    #[test]
    fn test_stats_accumulate_over_batches() {
        let mut q = quantizer(QuantScheme::PostTrainingTf);
        q.update_encoding_stats(&Tensor::new(vec![2], vec![-1.0, 0.5]));
        q.update_encoding_stats(&Tensor::new(vec![2], vec![0.0, 3.0]));
        let encoding = *q.compute_encoding().unwrap();
        assert!((encoding.min + 1.0).abs() < 0.02);
        assert!((encoding.max - 3.0).abs() < 0.02);
    }

    #[test]
    fn test_frozen_encoding_survives_reset() {
        let mut q = quantizer(QuantScheme::PostTrainingTf);
        let frozen = Encoding::from_range(-1.0, 1.0, 8, false);
        q.freeze_encoding(frozen).unwrap();
        q.update_encoding_stats(&Tensor::new(vec![1], vec![40.0]));
        assert_eq!(q.compute_encoding(), Some(&frozen));
        q.reset_encoding_stats();
        assert_eq!(q.encoding(), Some(&frozen));
    }

    #[test]
    fn test_stochastic_rounding_stays_on_neighbours() {
        let mut q = quantizer(QuantScheme::PostTrainingTf);
        q.update_encoding_stats(&Tensor::new(vec![2], vec![0.0, 2.55]));
        q.compute_encoding();
        let x = Tensor::new(vec![1000], vec![0.015; 1000]);
        let mut rng = StdRng::seed_from_u64(3);
        let out = q
            .quantize_dequantize("x", &x, RoundingMode::Stochastic, &mut rng)
            .unwrap();
        assert!(
            out.get_data()
                .iter()
                .all(|v| (v - 0.01).abs() < 1e-5 || (v - 0.02).abs() < 1e-5)
        );
        let mean = out.get_data().iter().sum::<f32>() / 1000.0;
        assert!((mean - 0.015).abs() < 2e-3);
    }
}
