//! The layers a [`crate::model::Model`] is made of, together with their float evaluation.
pub mod activation;
pub mod batchnorm;
pub mod common;
pub mod convolution;
pub mod dense;
pub mod padding;
pub mod pooling;
pub mod reshape;

use std::fmt;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

pub use activation::Activation;
pub use batchnorm::BatchNorm;
pub use common::{Add, Concat};
pub use convolution::{Convolution, KernelFormat};
pub use dense::Dense;
pub use padding::Pad;
pub use pooling::Pooling;
pub use reshape::Reshape;

pub trait OpInfo {
    /// Returns the shape of the output given the shapes of the inputs (in input order)
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape>;

    /// Textual description of the operation
    fn describe(&self) -> String;
}

pub trait Evaluate {
    /// Evaluates the operation on float inputs
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Convolution(Convolution),
    Dense(Dense),
    BatchNorm(BatchNorm),
    Activation(Activation),
    Pad(Pad),
    Pooling(Pooling),
    Reshape(Reshape),
    Add(Add),
    Concat(Concat),
    Identity,
    /// Dropout ratio, a no-op at inference time
    Dropout(f32),
}

impl Layer {
    /// Learnable parameters, in a stable order, keyed by their conventional name
    pub fn parameters(&self) -> Vec<(&'static str, &Tensor<f32>)> {
        match self {
            Layer::Convolution(conv) => with_bias(&conv.weight, conv.bias.as_ref()),
            Layer::Dense(dense) => with_bias(&dense.weight, dense.bias.as_ref()),
            Layer::BatchNorm(bn) => vec![("weight", &bn.gamma), ("bias", &bn.beta)],
            Layer::Activation(Activation::PRelu(slope)) => vec![("weight", slope)],
            _ => vec![],
        }
    }

    pub fn parameter_mut(&mut self, name: &str) -> Option<&mut Tensor<f32>> {
        match (self, name) {
            (Layer::Convolution(conv), "weight") => Some(&mut conv.weight),
            (Layer::Convolution(conv), "bias") => conv.bias.as_mut(),
            (Layer::Dense(dense), "weight") => Some(&mut dense.weight),
            (Layer::Dense(dense), "bias") => dense.bias.as_mut(),
            (Layer::BatchNorm(bn), "weight") => Some(&mut bn.gamma),
            (Layer::BatchNorm(bn), "bias") => Some(&mut bn.beta),
            (Layer::Activation(Activation::PRelu(slope)), "weight") => Some(slope),
            _ => None,
        }
    }
}

fn with_bias<'a>(
    weight: &'a Tensor<f32>,
    bias: Option<&'a Tensor<f32>>,
) -> Vec<(&'static str, &'a Tensor<f32>)> {
    let mut params = vec![("weight", weight)];
    if let Some(bias) = bias {
        params.push(("bias", bias));
    }
    params
}

impl OpInfo for Layer {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        match self {
            Layer::Convolution(conv) => conv.output_shape(input_shapes),
            Layer::Dense(dense) => dense.output_shape(input_shapes),
            Layer::BatchNorm(bn) => bn.output_shape(input_shapes),
            Layer::Activation(activation) => activation.output_shape(input_shapes),
            Layer::Pad(pad) => pad.output_shape(input_shapes),
            Layer::Pooling(pooling) => pooling.output_shape(input_shapes),
            Layer::Reshape(reshape) => reshape.output_shape(input_shapes),
            Layer::Add(add) => add.output_shape(input_shapes),
            Layer::Concat(concat) => concat.output_shape(input_shapes),
            Layer::Identity | Layer::Dropout(_) => {
                expect_inputs(input_shapes.len(), 1, &self.describe())?;
                Ok(input_shapes[0].clone())
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Layer::Convolution(conv) => conv.describe(),
            Layer::Dense(dense) => dense.describe(),
            Layer::BatchNorm(bn) => bn.describe(),
            Layer::Activation(activation) => activation.describe(),
            Layer::Pad(pad) => pad.describe(),
            Layer::Pooling(pooling) => pooling.describe(),
            Layer::Reshape(reshape) => reshape.describe(),
            Layer::Add(add) => add.describe(),
            Layer::Concat(concat) => concat.describe(),
            Layer::Identity => "Identity".to_string(),
            Layer::Dropout(ratio) => format!("Dropout({ratio})"),
        }
    }
}

impl Evaluate for Layer {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        match self {
            Layer::Convolution(conv) => conv.evaluate(inputs),
            Layer::Dense(dense) => dense.evaluate(inputs),
            Layer::BatchNorm(bn) => bn.evaluate(inputs),
            Layer::Activation(activation) => activation.evaluate(inputs),
            Layer::Pad(pad) => pad.evaluate(inputs),
            Layer::Pooling(pooling) => pooling.evaluate(inputs),
            Layer::Reshape(reshape) => reshape.evaluate(inputs),
            Layer::Add(add) => add.evaluate(inputs),
            Layer::Concat(concat) => concat.evaluate(inputs),
            Layer::Identity | Layer::Dropout(_) => {
                expect_inputs(inputs.len(), 1, &self.describe())?;
                Ok(inputs[0].clone())
            }
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}

pub(crate) fn expect_inputs(found: usize, expected: usize, what: &str) -> Result<()> {
    ensure!(
        found == expected,
        "{what} expects {expected} input(s), got {found}"
    );
    Ok(())
}

/// Checks the input is a `[N, C, H, W]` tensor and returns its dimensions
pub(crate) fn nchw(shape: &[usize], what: &str) -> Result<[usize; 4]> {
    ensure!(
        shape.len() == 4,
        "{what} expects a [N, C, H, W] input, got {shape:?}"
    );
    Ok([shape[0], shape[1], shape[2], shape[3]])
}
