use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs};

pub const DEFAULT_EPSILON: f32 = 1e-5;

/// Inference-time batch normalization over axis 1
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Tensor<f32>,
    pub beta: Tensor<f32>,
    pub running_mean: Tensor<f32>,
    pub running_var: Tensor<f32>,
    pub epsilon: f32,
}

impl BatchNorm {
    pub fn new(
        gamma: Vec<f32>,
        beta: Vec<f32>,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
        epsilon: f32,
    ) -> Result<Self> {
        let channels = gamma.len();
        ensure!(
            beta.len() == channels
                && running_mean.len() == channels
                && running_var.len() == channels,
            "batchnorm statistics must all have {channels} values"
        );
        ensure!(
            running_var.iter().all(|v| *v + epsilon > 0.0),
            "batchnorm variance plus epsilon must be positive"
        );
        let vector = |v: Vec<f32>| Tensor::new(vec![v.len()], v);
        Ok(Self {
            gamma: vector(gamma),
            beta: vector(beta),
            running_mean: vector(running_mean),
            running_var: vector(running_var),
            epsilon,
        })
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    /// Per-channel `(a, b)` such that the layer computes `a * x + b`
    pub fn scale_shift(&self) -> (Vec<f32>, Vec<f32>) {
        let scale: Vec<f32> = self
            .gamma
            .get_data()
            .iter()
            .zip(self.running_var.get_data())
            .map(|(g, v)| g / (v + self.epsilon).sqrt())
            .collect();
        let shift = self
            .beta
            .get_data()
            .iter()
            .zip(self.running_mean.get_data())
            .zip(scale.iter())
            .map(|((b, m), a)| b - m * a)
            .collect();
        (scale, shift)
    }
}

impl OpInfo for BatchNorm {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, "BatchNorm")?;
        let shape = &input_shapes[0];
        ensure!(
            shape.len() >= 2 && shape[1] == self.channels(),
            "BatchNorm over {} channels got input {shape:?}",
            self.channels()
        );
        Ok(shape.clone())
    }

    fn describe(&self) -> String {
        format!("BatchNorm: {} channels", self.channels())
    }
}

impl Evaluate for BatchNorm {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, "BatchNorm")?;
        let shape = self.output_shape(&[inputs[0].get_shape()])?;
        let (scale, shift) = self.scale_shift();
        let inner = shape[2..].iter().product::<usize>();
        let channels = self.channels();
        let data = inputs[0]
            .get_data()
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let c = (i / inner) % channels;
                x * scale[c] + shift[c]
            })
            .collect();
        Ok(Tensor::new(shape, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batchnorm() {
        let bn = BatchNorm::new(
            vec![2.0, 1.0],
            vec![1.0, 0.0],
            vec![0.5, -1.0],
            vec![4.0, 1.0],
            0.0,
        )
        .unwrap();
        let input = Tensor::new(vec![1, 2, 1, 2], vec![0.5, 2.5, -1.0, 1.0]);
        let out = bn.evaluate(&[&input]).unwrap();
        assert_eq!(out.get_data(), &[1.0, 3.0, 0.0, 2.0]);
    }

    #[test]
    fn test_batchnorm_rejects_mismatched_stats() {
        assert!(
            BatchNorm::new(vec![1.0], vec![0.0, 0.0], vec![0.0], vec![1.0], DEFAULT_EPSILON)
                .is_err()
        );
    }
}
