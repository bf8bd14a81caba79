//! Quantize-dequantize operators around a single layer call.
use std::{borrow::Cow, collections::BTreeMap};

use anyhow::Result;
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::QuantSimConfig,
    layers::{Evaluate, Layer},
    tensor::Tensor,
};

use super::{EncodingFile, QuantizerError, RoundingMode, TensorQuantizer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QcQuantizeOpMode {
    /// Values flow through untouched
    #[default]
    Passthrough,
    /// Activation statistics are collected, values flow through untouched
    Analysis,
    /// Values are snapped onto the computed encodings
    Active,
}

/// Outside of training only round-to-nearest is used, whatever the quantizer asks for
fn round_mode(quantizer: &TensorQuantizer, training: bool) -> RoundingMode {
    if training {
        quantizer.round_mode
    } else {
        RoundingMode::Nearest
    }
}

fn quantize_activation(
    name: &str,
    quantizer: &mut TensorQuantizer,
    mode: QcQuantizeOpMode,
    training: bool,
    tensor: Tensor<f32>,
    rng: &mut StdRng,
) -> Result<Tensor<f32>> {
    match mode {
        QcQuantizeOpMode::Passthrough => Ok(tensor),
        QcQuantizeOpMode::Analysis => {
            quantizer.update_encoding_stats(&tensor);
            Ok(tensor)
        }
        QcQuantizeOpMode::Active => {
            quantizer.quantize_dequantize(name, &tensor, round_mode(quantizer, training), rng)
        }
    }
}

fn activation_quantizer(
    config: &QuantSimConfig,
    enabled: bool,
) -> Result<TensorQuantizer, QuantizerError> {
    TensorQuantizer::new(
        config.default_output_bw,
        config.round_mode,
        config.quant_scheme,
        config.use_symmetric_encodings,
        enabled,
    )
}

/// Wraps one module: a quantizer per parameter, a disabled input quantizer and an output
/// quantizer enabled when outputs are quantized
#[derive(Clone, Debug)]
pub struct QcQuantizeWrapper {
    name: String,
    mode: QcQuantizeOpMode,
    training: bool,
    param_quantizers: BTreeMap<String, TensorQuantizer>,
    input_quantizer: TensorQuantizer,
    output_quantizer: TensorQuantizer,
    rng: StdRng,
}

impl QcQuantizeWrapper {
    pub fn new(name: impl Into<String>, layer: &Layer, config: &QuantSimConfig) -> Result<Self> {
        let name = name.into();
        let param_quantizers: BTreeMap<String, TensorQuantizer> = layer
            .parameters()
            .into_iter()
            .map(|(param, _)| {
                debug!("adding quantizer for parameter {name}.{param}");
                TensorQuantizer::new(
                    config.default_param_bw,
                    config.round_mode,
                    config.quant_scheme,
                    config.use_symmetric_encodings,
                    true,
                )
                .map(|q| (param.to_string(), q))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            name,
            mode: QcQuantizeOpMode::Passthrough,
            training: false,
            param_quantizers,
            input_quantizer: activation_quantizer(config, false)?,
            output_quantizer: activation_quantizer(config, config.is_output_quantized)?,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> QcQuantizeOpMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: QcQuantizeOpMode) {
        self.mode = mode;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// In training, parameter encodings follow the parameters on every pass and the
    /// configured rounding mode applies
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn param_quantizers(&self) -> &BTreeMap<String, TensorQuantizer> {
        &self.param_quantizers
    }

    pub fn param_quantizer_mut(&mut self, param: &str) -> Option<&mut TensorQuantizer> {
        self.param_quantizers.get_mut(param)
    }

    pub fn input_quantizer(&self) -> &TensorQuantizer {
        &self.input_quantizer
    }

    pub fn input_quantizer_mut(&mut self) -> &mut TensorQuantizer {
        &mut self.input_quantizer
    }

    pub fn output_quantizer(&self) -> &TensorQuantizer {
        &self.output_quantizer
    }

    pub fn output_quantizer_mut(&mut self) -> &mut TensorQuantizer {
        &mut self.output_quantizer
    }

    pub fn set_output_bw(&mut self, bitwidth: u8) -> Result<(), QuantizerError> {
        self.output_quantizer.set_bitwidth(bitwidth)
    }

    /// Drops the statistics and non-frozen encodings of every quantizer
    pub fn reset_encodings(&mut self) {
        self.input_quantizer.reset_encoding_stats();
        self.output_quantizer.reset_encoding_stats();
        self.param_quantizers
            .values_mut()
            .for_each(TensorQuantizer::reset_encoding_stats);
    }

    /// Computes the activation encodings from the statistics collected in analysis mode.
    /// Parameter encodings are computed on the fly by [`Self::forward`].
    pub fn compute_encoding(&mut self) {
        self.input_quantizer.compute_encoding();
        self.output_quantizer.compute_encoding();
    }

    /// Freezes the parameter quantizers found in `file` under `<module_name>.<param>`,
    /// returning how many were frozen
    pub fn set_and_freeze_param_encoding(
        &mut self,
        module_name: &str,
        file: &EncodingFile,
    ) -> Result<usize, QuantizerError> {
        let mut frozen = 0;
        for (param, quantizer) in self.param_quantizers.iter_mut() {
            if let Some(record) = file.param_encoding(&format!("{module_name}.{param}")) {
                quantizer.freeze_encoding(record.to_encoding())?;
                quantizer.use_symmetric_encodings = record.is_symmetric;
                frozen += 1;
            }
        }
        Ok(frozen)
    }

    /// `layer` with its enabled parameters snapped onto their encodings. The wrapped layer
    /// itself is never written to, so full precision values survive failed evaluations.
    fn quantize_dequantize_params<'a>(&mut self, layer: &'a Layer) -> Result<Cow<'a, Layer>> {
        let mut quantized = Cow::Borrowed(layer);
        if self.mode == QcQuantizeOpMode::Passthrough {
            return Ok(quantized);
        }
        for (param, tensor) in layer.parameters() {
            let Some(quantizer) = self.param_quantizers.get_mut(param) else {
                continue;
            };
            if !quantizer.enabled {
                continue;
            }
            if (self.training || quantizer.encoding().is_none()) && !quantizer.is_frozen() {
                quantizer.reset_encoding_stats();
                quantizer.update_encoding_stats(tensor);
                quantizer.compute_encoding();
            }
            let name = format!("{}.{param}", self.name);
            let round = round_mode(quantizer, self.training);
            let value = quantizer.quantize_dequantize(&name, tensor, round, &mut self.rng)?;
            if let Some(slot) = quantized.to_mut().parameter_mut(param) {
                *slot = value;
            }
        }
        Ok(quantized)
    }

    pub fn forward(&mut self, layer: &Layer, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        let quantized_inputs = if self.input_quantizer.enabled {
            let name = format!("{}.input", self.name);
            Some(
                inputs
                    .iter()
                    .map(|t| {
                        quantize_activation(
                            &name,
                            &mut self.input_quantizer,
                            self.mode,
                            self.training,
                            (*t).clone(),
                            &mut self.rng,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            None
        };
        let args: Vec<&Tensor<f32>> = match &quantized_inputs {
            Some(tensors) => tensors.iter().collect(),
            None => inputs.to_vec(),
        };

        let output = self.quantize_dequantize_params(layer)?.evaluate(&args)?;

        if !self.output_quantizer.enabled {
            return Ok(output);
        }
        quantize_activation(
            &self.name,
            &mut self.output_quantizer,
            self.mode,
            self.training,
            output,
            &mut self.rng,
        )
    }
}

/// Output quantization for a functional operation, which has no parameters
#[derive(Clone, Debug)]
pub struct QcQuantizeStandalone {
    name: String,
    mode: QcQuantizeOpMode,
    training: bool,
    output_quantizer: TensorQuantizer,
    rng: StdRng,
}

impl QcQuantizeStandalone {
    pub fn new(name: impl Into<String>, config: &QuantSimConfig) -> Result<Self, QuantizerError> {
        Ok(Self {
            name: name.into(),
            mode: QcQuantizeOpMode::Passthrough,
            training: false,
            output_quantizer: activation_quantizer(config, true)?,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_mode(&mut self, mode: QcQuantizeOpMode) {
        self.mode = mode;
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn output_quantizer(&self) -> &TensorQuantizer {
        &self.output_quantizer
    }

    pub fn output_quantizer_mut(&mut self) -> &mut TensorQuantizer {
        &mut self.output_quantizer
    }

    pub fn reset_encodings(&mut self) {
        self.output_quantizer.reset_encoding_stats();
    }

    pub fn compute_encoding(&mut self) {
        self.output_quantizer.compute_encoding();
    }

    pub fn forward(&mut self, layer: &Layer, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        let output = layer.evaluate(inputs)?;
        quantize_activation(
            &self.name,
            &mut self.output_quantizer,
            self.mode,
            self.training,
            output,
            &mut self.rng,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::Activation,
        quantization::{Encoding, QuantScheme},
        testing::random_conv,
    };

    fn tf_config() -> QuantSimConfig {
        QuantSimConfig {
            quant_scheme: QuantScheme::PostTrainingTf,
            ..QuantSimConfig::default()
        }
    }

    fn conv_layer() -> Layer {
        Layer::Convolution(random_conv(4, 2, 3, 0))
    }

    #[test]
    fn test_fresh_wrapper_is_passthrough() {
        let layer = conv_layer();
        let mut wrapper =
            QcQuantizeWrapper::new("conv", &layer, &QuantSimConfig::default()).unwrap();
        assert_eq!(wrapper.mode(), QcQuantizeOpMode::Passthrough);
        assert_eq!(
            wrapper.param_quantizers().keys().collect::<Vec<_>>(),
            ["bias", "weight"]
        );
        assert!(!wrapper.input_quantizer().enabled);
        let x = Tensor::random_seeded(vec![1, 2, 5, 5], 1);
        let expected = layer.evaluate(&[&x]).unwrap();
        assert_eq!(wrapper.forward(&layer, &[&x]).unwrap(), expected);
    }

    #[test]
    fn test_analysis_collects_without_changing_values() {
        let layer = conv_layer();
        let mut wrapper = QcQuantizeWrapper::new("conv", &layer, &tf_config()).unwrap();
        wrapper.set_mode(QcQuantizeOpMode::Analysis);
        let x = Tensor::random_seeded(vec![1, 2, 5, 5], 1);
        let out = wrapper.forward(&layer, &[&x]).unwrap();
        // parameters are quantized in analysis mode, only activations pass through
        assert!(out.max_abs_diff(&layer.evaluate(&[&x]).unwrap()) < 0.25);
        assert!(wrapper.output_quantizer().encoding().is_none());
        wrapper.compute_encoding();
        let encoding = *wrapper.output_quantizer().encoding().unwrap();
        assert!(encoding.min <= out.min_value().min(0.0) + encoding.delta);
        assert!(encoding.max >= out.max_value().max(0.0) - encoding.delta);
    }

    #[test]
    fn test_active_output_lies_on_the_grid() {
        let layer = conv_layer();
        let config = QuantSimConfig {
            default_output_bw: 4,
            ..tf_config()
        };
        let mut wrapper = QcQuantizeWrapper::new("conv", &layer, &config).unwrap();
        let x = Tensor::random_seeded(vec![1, 2, 5, 5], 2);
        wrapper.set_mode(QcQuantizeOpMode::Analysis);
        wrapper.forward(&layer, &[&x]).unwrap();
        wrapper.compute_encoding();
        wrapper.set_mode(QcQuantizeOpMode::Active);
        let out = wrapper.forward(&layer, &[&x]).unwrap();
        let encoding = *wrapper.output_quantizer().encoding().unwrap();
        for v in out.get_data() {
            let steps = v / encoding.delta - encoding.offset as f32;
            assert!((steps - steps.round()).abs() < 1e-3);
            assert!((-1e-3..=15.001).contains(&steps));
        }
        // parameters are back to full precision after the pass
        assert_eq!(layer, conv_layer());
        assert!(wrapper.param_quantizers()["weight"].encoding().is_some());
    }

    #[test]
    fn test_active_without_encoding_fails() {
        let layer = Layer::Activation(Activation::Relu);
        let mut wrapper =
            QcQuantizeWrapper::new("relu", &layer, &QuantSimConfig::default()).unwrap();
        wrapper.set_mode(QcQuantizeOpMode::Active);
        let err = wrapper
            .forward(&layer, &[&Tensor::zeros(vec![2])])
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<QuantizerError>(),
            Some(&QuantizerError::NoEncoding("relu".to_string()))
        );
    }

    #[test]
    fn test_reset_keeps_frozen_params() {
        let layer = conv_layer();
        let mut wrapper =
            QcQuantizeWrapper::new("conv", &layer, &QuantSimConfig::default()).unwrap();
        let encoding = Encoding::from_range(-0.5, 0.5, 8, false);
        wrapper
            .param_quantizer_mut("weight")
            .unwrap()
            .freeze_encoding(encoding)
            .unwrap();
        wrapper.set_mode(QcQuantizeOpMode::Analysis);
        wrapper
            .forward(&layer, &[&Tensor::random_seeded(vec![1, 2, 5, 5], 3)])
            .unwrap();
        wrapper.reset_encodings();
        assert_eq!(wrapper.param_quantizers()["weight"].encoding(), Some(&encoding));
        assert!(wrapper.param_quantizers()["bias"].encoding().is_none());
        assert!(wrapper.set_output_bw(2).is_err());
    }
}
