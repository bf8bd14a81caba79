use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor};

use super::{Evaluate, OpInfo, expect_inputs, nchw};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    /// `[top, left, bottom, right]`
    pub padding: [usize; 4],
}

impl Window {
    pub fn new(kernel: [usize; 2], stride: [usize; 2]) -> Self {
        Self {
            kernel,
            stride,
            padding: [0; 4],
        }
    }

    fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let [pt, pl, pb, pr] = self.padding;
        let (ph, pw) = (h + pt + pb, w + pl + pr);
        if ph < self.kernel[0] || pw < self.kernel[1] || self.stride.contains(&0) {
            bail!("pooling window {self:?} does not fit input {h}x{w}");
        }
        Ok((
            (ph - self.kernel[0]) / self.stride[0] + 1,
            (pw - self.kernel[1]) / self.stride[1] + 1,
        ))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Pooling {
    Max(Window),
    /// Average over the window, padded positions excluded
    Average(Window),
    GlobalAverage,
}

impl Pooling {
    fn window(&self) -> Option<&Window> {
        match self {
            Pooling::Max(w) | Pooling::Average(w) => Some(w),
            Pooling::GlobalAverage => None,
        }
    }
}

impl OpInfo for Pooling {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, &self.describe())?;
        let [n, c, h, w] = nchw(&input_shapes[0], &self.describe())?;
        match self.window() {
            Some(window) => {
                let (oh, ow) = window.output_hw(h, w)?;
                Ok(vec![n, c, oh, ow])
            }
            None => Ok(vec![n, c, 1, 1]),
        }
    }

    fn describe(&self) -> String {
        match self {
            Pooling::Max(w) => format!("MaxPool: {:?}", w.kernel),
            Pooling::Average(w) => format!("AvgPool: {:?}", w.kernel),
            Pooling::GlobalAverage => "GlobalAvgPool".to_string(),
        }
    }
}

impl Evaluate for Pooling {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, &self.describe())?;
        let [n, c, h, w] = nchw(inputs[0].shape(), &self.describe())?;
        let out_shape = self.output_shape(&[inputs[0].get_shape()])?;
        let input = inputs[0].get_data();
        let Some(window) = self.window() else {
            let data = input
                .chunks(h * w)
                .map(|plane| plane.iter().sum::<f32>() / (h * w) as f32)
                .collect();
            return Ok(Tensor::new(out_shape, data));
        };
        let (oh, ow) = (out_shape[2], out_shape[3]);
        let [pt, pl, _, _] = window.padding;
        let mut out = Vec::with_capacity(out_shape.iter().product());
        for plane in 0..n * c {
            for y in 0..oh {
                for x in 0..ow {
                    let mut max = f32::NEG_INFINITY;
                    let (mut sum, mut count) = (0.0f32, 0usize);
                    for ky in 0..window.kernel[0] {
                        let iy = (y * window.stride[0] + ky) as isize - pt as isize;
                        if iy < 0 || iy as usize >= h {
                            continue;
                        }
                        for kx in 0..window.kernel[1] {
                            let ix = (x * window.stride[1] + kx) as isize - pl as isize;
                            if ix < 0 || ix as usize >= w {
                                continue;
                            }
                            let v = input[(plane * h + iy as usize) * w + ix as usize];
                            max = max.max(v);
                            sum += v;
                            count += 1;
                        }
                    }
                    out.push(match self {
                        Pooling::Max(_) => max,
                        _ => sum / count.max(1) as f32,
                    });
                }
            }
        }
        Ok(Tensor::new(out_shape, out))
    }
}
