use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs, nchw};

/// Constant spatial padding of a `[N, C, H, W]` tensor
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pad {
    /// `[top, left, bottom, right]`
    pub pads: [usize; 4],
    pub value: f32,
}

impl Pad {
    pub fn new(pads: [usize; 4]) -> Self {
        Self { pads, value: 0.0 }
    }
}

impl OpInfo for Pad {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, "Pad")?;
        let [n, c, h, w] = nchw(&input_shapes[0], "Pad")?;
        let [t, l, b, r] = self.pads;
        Ok(vec![n, c, h + t + b, w + l + r])
    }

    fn describe(&self) -> String {
        format!("Pad: {:?} with {}", self.pads, self.value)
    }
}

impl Evaluate for Pad {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, "Pad")?;
        let [n, c, h, w] = nchw(inputs[0].shape(), "Pad")?;
        let out_shape = self.output_shape(&[inputs[0].get_shape()])?;
        let (out_h, out_w) = (out_shape[2], out_shape[3]);
        let [t, l, _, _] = self.pads;
        let mut out = vec![self.value; out_shape.iter().product()];
        let input = inputs[0].get_data();
        for plane in 0..n * c {
            for y in 0..h {
                let src = (plane * h + y) * w;
                let dst = (plane * out_h + y + t) * out_w + l;
                out[dst..dst + w].copy_from_slice(&input[src..src + w]);
            }
        }
        Ok(Tensor::new(out_shape, out))
    }
}
