//! Parameter-free layers combining several inputs.
use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs};

/// Element-wise sum of two tensors of the same shape
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Add;

impl OpInfo for Add {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 2, "Add")?;
        ensure!(
            input_shapes[0] == input_shapes[1],
            "Add expects equal shapes, got {:?} and {:?}",
            input_shapes[0],
            input_shapes[1]
        );
        Ok(input_shapes[0].clone())
    }

    fn describe(&self) -> String {
        "Add".to_string()
    }
}

impl Evaluate for Add {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        let shape = self.output_shape(&inputs.iter().map(|t| t.get_shape()).collect::<Vec<_>>())?;
        let data = inputs[0]
            .get_data()
            .iter()
            .zip(inputs[1].get_data())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Tensor::new(shape, data))
    }
}

/// Concatenation along `axis`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Concat {
    pub axis: usize,
}

impl OpInfo for Concat {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        ensure!(!input_shapes.is_empty(), "Concat expects at least one input");
        let first = &input_shapes[0];
        ensure!(self.axis < first.len(), "Concat axis {} out of range for {first:?}", self.axis);
        let mut out = first.clone();
        out[self.axis] = 0;
        for shape in input_shapes {
            ensure!(
                shape.len() == first.len()
                    && shape
                        .iter()
                        .zip(first)
                        .enumerate()
                        .all(|(i, (a, b))| i == self.axis || a == b),
                "Concat inputs {first:?} and {shape:?} differ outside axis {}",
                self.axis
            );
            out[self.axis] += shape[self.axis];
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("Concat: axis {}", self.axis)
    }
}

impl Evaluate for Concat {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        let shape = self.output_shape(&inputs.iter().map(|t| t.get_shape()).collect::<Vec<_>>())?;
        let outer = shape[..self.axis].iter().product::<usize>();
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for input in inputs {
                let chunk = input.shape()[self.axis..].iter().product::<usize>();
                data.extend_from_slice(&input.get_data()[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(Tensor::new(shape, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add() {
        let a = Tensor::new(vec![2], vec![1.0, 2.0]);
        let b = Tensor::new(vec![2], vec![0.5, -2.0]);
        assert_eq!(Add.evaluate(&[&a, &b]).unwrap().get_data(), &[1.5, 0.0]);
        assert!(Add.evaluate(&[&a]).is_err());
    }

    #[test]
    fn test_concat_channels() {
        let a = Tensor::new(vec![2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::new(vec![2, 2, 2], vec![5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let out = Concat { axis: 1 }.evaluate(&[&a, &b]).unwrap();
        assert_eq!(out.get_shape(), vec![2, 3, 2]);
        assert_eq!(
            out.get_data(),
            &[1.0, 2.0, 5.0, 6.0, 7.0, 8.0, 3.0, 4.0, 9.0, 10.0, 11.0, 12.0]
        );
    }
}
