use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs};

/// Fully connected layer, `weight` is `[out_features, in_features]`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weight: Tensor<f32>,
    pub bias: Option<Tensor<f32>>,
}

impl Dense {
    pub fn new(weight: Tensor<f32>, bias: Option<Tensor<f32>>) -> Result<Self> {
        ensure!(
            weight.rank() == 2,
            "dense weight must be [out, in], got {:?}",
            weight.shape()
        );
        if let Some(bias) = &bias {
            ensure!(
                bias.len() == weight.shape()[0],
                "dense bias has {} values for {} outputs",
                bias.len(),
                weight.shape()[0]
            );
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn bias_or_zeros(&self) -> Vec<f32> {
        self.bias
            .as_ref()
            .map(|b| b.get_data().to_vec())
            .unwrap_or_else(|| vec![0.0; self.out_features()])
    }
}

impl OpInfo for Dense {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, "Dense")?;
        let shape = &input_shapes[0];
        ensure!(
            shape.len() == 2 && shape[1] == self.in_features(),
            "Dense expects a [N, {}] input, got {shape:?}",
            self.in_features()
        );
        Ok(vec![shape[0], self.out_features()])
    }

    fn describe(&self) -> String {
        format!("Dense: {} -> {}", self.in_features(), self.out_features())
    }
}

impl Evaluate for Dense {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, "Dense")?;
        let out_shape = self.output_shape(&[inputs[0].get_shape()])?;
        let (batch, fan_in, fan_out) = (out_shape[0], self.in_features(), self.out_features());
        let bias = self.bias_or_zeros();
        let bias = bias.as_slice();
        let weight = self.weight.get_data();
        let input = inputs[0].get_data();
        let out = (0..batch)
            .flat_map(|n| {
                let row = &input[n * fan_in..(n + 1) * fan_in];
                (0..fan_out).map(move |o| {
                    let w = &weight[o * fan_in..(o + 1) * fan_in];
                    row.iter().zip(w).map(|(x, w)| x * w).sum::<f32>() + bias[o]
                })
            })
            .collect();
        Ok(Tensor::new(out_shape, out))
    }
}
