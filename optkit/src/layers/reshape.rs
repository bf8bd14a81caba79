use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Reshape {
    /// Collapses the dimensions before and from `axis` into a 2D tensor
    Flatten { axis: usize },
    /// Target shape with ONNX conventions: `0` copies the input dimension, `-1` is inferred
    Reshape { shape: Vec<i64> },
}

impl OpInfo for Reshape {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, &self.describe())?;
        let input = &input_shapes[0];
        let size = input.iter().product::<usize>();
        match self {
            Reshape::Flatten { axis } => {
                ensure!(*axis <= input.len(), "cannot flatten {input:?} at axis {axis}");
                Ok(vec![
                    input[..*axis].iter().product(),
                    input[*axis..].iter().product(),
                ])
            }
            Reshape::Reshape { shape } => {
                let mut inferred = None;
                let mut out = Vec::with_capacity(shape.len());
                for (i, &dim) in shape.iter().enumerate() {
                    match dim {
                        -1 if inferred.is_none() => {
                            inferred = Some(i);
                            out.push(1);
                        }
                        0 => out.push(*input.get(i).ok_or_else(|| {
                            anyhow::anyhow!("reshape copies missing dimension {i} of {input:?}")
                        })?),
                        d if d > 0 => out.push(d as usize),
                        d => bail!("invalid reshape dimension {d} in {shape:?}"),
                    }
                }
                let known = out.iter().product::<usize>();
                if let Some(i) = inferred {
                    ensure!(
                        known > 0 && size % known == 0,
                        "cannot infer reshape of {input:?} into {shape:?}"
                    );
                    out[i] = size / known;
                }
                ensure!(
                    out.iter().product::<usize>() == size,
                    "cannot reshape {input:?} into {shape:?}"
                );
                Ok(out)
            }
        }
    }

    fn describe(&self) -> String {
        match self {
            Reshape::Flatten { axis } => format!("Flatten: axis {axis}"),
            Reshape::Reshape { shape } => format!("Reshape: {shape:?}"),
        }
    }
}

impl Evaluate for Reshape {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, &self.describe())?;
        let shape = self.output_shape(&[inputs[0].get_shape()])?;
        Ok(inputs[0].clone().reshape(shape)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reshape() {
        let input = Tensor::new(vec![2, 3, 3], (0..18).map(|v| v as f32).collect());
        let reshape = Reshape::Reshape {
            shape: vec![3, -1, 0],
        };
        let output = reshape.evaluate(&[&input]).expect("reshape shouldn't fail");
        assert_eq!(output.get_shape(), vec![3, 2, 3]);
        assert_eq!(output.get_data(), input.get_data());
    }

    #[test]
    fn test_flatten() {
        let flatten = Reshape::Flatten { axis: 1 };
        assert_eq!(
            flatten.output_shape(&[vec![2, 3, 4, 5]]).unwrap(),
            vec![2, 60]
        );
    }
}
