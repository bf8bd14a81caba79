use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    /// ReLU clipped at 6
    Relu6,
    /// Leaky ReLU with learned slopes, one per channel (axis 1) or a single shared one
    PRelu(Tensor<f32>),
    Sigmoid,
    Tanh,
}

impl Activation {
    fn apply(&self, x: f32, channel: usize) -> f32 {
        match self {
            Activation::Relu => x.max(0.0),
            Activation::Relu6 => x.clamp(0.0, 6.0),
            Activation::PRelu(slope) => {
                let slope = slope.get_data();
                let a = if slope.len() == 1 { slope[0] } else { slope[channel] };
                if x >= 0.0 { x } else { a * x }
            }
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
        }
    }
}

impl OpInfo for Activation {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, &self.describe())?;
        if let Activation::PRelu(slope) = self {
            let shape = &input_shapes[0];
            ensure!(
                slope.len() == 1 || (shape.len() >= 2 && shape[1] == slope.len()),
                "PRelu with {} slopes cannot apply to input {shape:?}",
                slope.len()
            );
        }
        Ok(input_shapes[0].clone())
    }

    fn describe(&self) -> String {
        match self {
            Activation::Relu => "RELU".to_string(),
            Activation::Relu6 => "RELU6".to_string(),
            Activation::PRelu(slope) => format!("PRELU: {} slopes", slope.len()),
            Activation::Sigmoid => "SIGMOID".to_string(),
            Activation::Tanh => "TANH".to_string(),
        }
    }
}

impl Evaluate for Activation {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, &self.describe())?;
        let shape = self.output_shape(&[inputs[0].get_shape()])?;
        let (channels, inner) = if shape.len() >= 2 {
            (shape[1], shape[2..].iter().product::<usize>())
        } else {
            (1, 1)
        };
        let data = inputs[0]
            .get_data()
            .iter()
            .enumerate()
            .map(|(i, x)| self.apply(*x, (i / inner) % channels))
            .collect();
        Ok(Tensor::new(shape, data))
    }
}
