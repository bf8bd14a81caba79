use anyhow::{Result, bail, ensure};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::tensor::{Shape, Tensor, inverse_permutation};

use super::{Evaluate, OpInfo, expect_inputs, nchw};

/// Memory layout of a convolution kernel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum KernelFormat {
    /// `[out_channels, in_channels / groups, kh, kw]`, the ONNX and PyTorch layout
    OIHW,
    /// `[kh, kw, in_channels, out_channels]`, or `[kh, kw, channels, multiplier]`
    /// for depthwise kernels
    HWIO,
}

/// Convolution layer description (weights)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Convolution {
    pub weight: Tensor<f32>,
    /// One value per output channel
    pub bias: Option<Tensor<f32>>,
    pub kernel_format: KernelFormat,
    pub stride: [usize; 2],
    /// `[top, left, bottom, right]`
    pub padding: [usize; 4],
    pub groups: usize,
}

impl Convolution {
    pub fn new(weight: Tensor<f32>, bias: Option<Tensor<f32>>) -> Result<Self> {
        Self::with_params(weight, bias, KernelFormat::OIHW, [1, 1], [0; 4], 1)
    }

    pub fn with_params(
        weight: Tensor<f32>,
        bias: Option<Tensor<f32>>,
        kernel_format: KernelFormat,
        stride: [usize; 2],
        padding: [usize; 4],
        groups: usize,
    ) -> Result<Self> {
        let conv = Self {
            weight,
            bias,
            kernel_format,
            stride,
            padding,
            groups,
        };
        conv.validate()?;
        Ok(conv)
    }

    /// Depthwise convolution with a channel multiplier of 1, `weight` given as
    /// `[channels, 1, kh, kw]`
    pub fn depthwise(
        weight: Tensor<f32>,
        bias: Option<Tensor<f32>>,
        stride: [usize; 2],
        padding: [usize; 4],
    ) -> Result<Self> {
        let channels = weight.shape().first().copied().unwrap_or(0);
        Self::with_params(weight, bias, KernelFormat::OIHW, stride, padding, channels)
    }

    fn validate(&self) -> Result<()> {
        let shape = self.weight.shape();
        ensure!(
            shape.len() == 4,
            "convolution kernel must have rank 4, got {shape:?}"
        );
        ensure!(self.groups >= 1, "convolution groups must be at least 1");
        ensure!(
            self.stride.iter().all(|s| *s >= 1),
            "convolution stride must be at least 1"
        );
        if self.kernel_format == KernelFormat::HWIO && self.groups > 1 {
            ensure!(
                shape[2] == self.groups,
                "grouped HWIO kernels must be depthwise ([kh, kw, channels, multiplier]), got {shape:?} with {} groups",
                self.groups
            );
        }
        ensure!(
            self.out_channels() % self.groups == 0,
            "{} output channels not divisible into {} groups",
            self.out_channels(),
            self.groups
        );
        if let Some(bias) = &self.bias {
            ensure!(
                bias.len() == self.out_channels(),
                "convolution bias has {} values for {} output channels",
                bias.len(),
                self.out_channels()
            );
        }
        Ok(())
    }

    pub fn kernel_hw(&self) -> (usize, usize) {
        let shape = self.weight.shape();
        match self.kernel_format {
            KernelFormat::OIHW => (shape[2], shape[3]),
            KernelFormat::HWIO => (shape[0], shape[1]),
        }
    }

    pub fn in_channels(&self) -> usize {
        let shape = self.weight.shape();
        match self.kernel_format {
            KernelFormat::OIHW => shape[1] * self.groups,
            KernelFormat::HWIO => shape[2],
        }
    }

    pub fn out_channels(&self) -> usize {
        let shape = self.weight.shape();
        match self.kernel_format {
            KernelFormat::OIHW => shape[0],
            KernelFormat::HWIO if self.groups > 1 => shape[2] * shape[3],
            KernelFormat::HWIO => shape[3],
        }
    }

    /// One group per input channel and one output channel per group
    pub fn is_depthwise(&self) -> bool {
        self.groups > 1 && self.groups == self.in_channels() && self.out_channels() == self.groups
    }

    pub fn has_padding(&self) -> bool {
        self.padding.iter().any(|p| *p != 0)
    }

    /// Axes moving the stored kernel into `[out, in, kh, kw]` order, `None` when already there.
    /// Depthwise HWIO kernels `[kh, kw, channels, 1]` land on `[channels, 1, kh, kw]`.
    pub fn canonical_axes(&self) -> Option<[usize; 4]> {
        match self.kernel_format {
            KernelFormat::OIHW => None,
            KernelFormat::HWIO if self.groups > 1 => Some([2, 3, 0, 1]),
            KernelFormat::HWIO => Some([3, 2, 0, 1]),
        }
    }

    /// The kernel in `[out, in / groups, kh, kw]` order
    pub fn canonical_weight(&self) -> Result<Tensor<f32>> {
        let Some(axes) = self.canonical_axes() else {
            return Ok(self.weight.clone());
        };
        let permuted = self.weight.permute(&axes)?;
        if self.groups > 1 {
            // [channels, multiplier, kh, kw] -> [channels * multiplier, 1, kh, kw]
            let [c, m, kh, kw]: [usize; 4] = permuted.shape().try_into()?;
            return Ok(permuted.reshape(vec![c * m, 1, kh, kw])?);
        }
        Ok(permuted)
    }

    /// Replaces the kernel by `canonical`, given in the order [`Self::canonical_weight`] returns
    pub fn set_canonical_weight(&mut self, canonical: Tensor<f32>) -> Result<()> {
        let expected = self.canonical_weight_shape();
        ensure!(
            canonical.shape() == expected.as_slice(),
            "canonical kernel shape {:?} does not match expected {:?}",
            canonical.shape(),
            expected
        );
        self.weight = match self.canonical_axes() {
            None => canonical,
            Some(axes) => {
                let canonical = if self.groups > 1 {
                    let shape = self.weight.shape();
                    canonical.reshape(vec![shape[2], shape[3], shape[0], shape[1]])?
                } else {
                    canonical
                };
                canonical.permute(&inverse_permutation(&axes))?
            }
        };
        Ok(())
    }

    fn canonical_weight_shape(&self) -> Shape {
        let (kh, kw) = self.kernel_hw();
        vec![
            self.out_channels(),
            self.in_channels() / self.groups,
            kh,
            kw,
        ]
    }

    /// Bias values, zeros when the layer has none
    pub fn bias_or_zeros(&self) -> Vec<f32> {
        self.bias
            .as_ref()
            .map(|b| b.get_data().to_vec())
            .unwrap_or_else(|| vec![0.0; self.out_channels()])
    }
}

impl OpInfo for Convolution {
    fn output_shape(&self, input_shapes: &[Shape]) -> Result<Shape> {
        expect_inputs(input_shapes.len(), 1, "Conv")?;
        let [n, c, h, w] = nchw(&input_shapes[0], "Conv")?;
        ensure!(
            c == self.in_channels(),
            "Conv expects {} input channels, got {c}",
            self.in_channels()
        );
        let (kh, kw) = self.kernel_hw();
        let [pt, pl, pb, pr] = self.padding;
        let (ph, pw) = (h + pt + pb, w + pl + pr);
        if ph < kh || pw < kw {
            bail!("Conv kernel {kh}x{kw} larger than padded input {ph}x{pw}");
        }
        Ok(vec![
            n,
            self.out_channels(),
            (ph - kh) / self.stride[0] + 1,
            (pw - kw) / self.stride[1] + 1,
        ])
    }

    fn describe(&self) -> String {
        let (kh, kw) = self.kernel_hw();
        format!(
            "Conv: {} -> {} kernel {kh}x{kw} groups {} ({:?})",
            self.in_channels(),
            self.out_channels(),
            self.groups,
            self.kernel_format
        )
    }
}

impl Evaluate for Convolution {
    fn evaluate(&self, inputs: &[&Tensor<f32>]) -> Result<Tensor<f32>> {
        expect_inputs(inputs.len(), 1, "Conv")?;
        let out_shape = self.output_shape(&[inputs[0].get_shape()])?;
        let [_, c, h, w] = nchw(inputs[0].shape(), "Conv")?;
        let [_, out_c, out_h, out_w]: [usize; 4] = out_shape.as_slice().try_into()?;
        let weight = self.canonical_weight()?;
        let weight = weight.get_data();
        let bias = self.bias_or_zeros();
        let input = inputs[0].get_data();
        let (kh, kw) = self.kernel_hw();
        let cin_g = c / self.groups;
        let cout_g = out_c / self.groups;
        let [pt, pl, _, _] = self.padding;

        let mut out = vec![0.0f32; out_shape.iter().product()];
        out.par_chunks_mut(out_h * out_w)
            .enumerate()
            .for_each(|(plane, chunk)| {
                let (n, o) = (plane / out_c, plane % out_c);
                let g = o / cout_g;
                for y in 0..out_h {
                    for x in 0..out_w {
                        let mut acc = bias[o];
                        for ci in 0..cin_g {
                            let channel = g * cin_g + ci;
                            for ky in 0..kh {
                                let iy = (y * self.stride[0] + ky) as isize - pt as isize;
                                if iy < 0 || iy as usize >= h {
                                    continue;
                                }
                                for kx in 0..kw {
                                    let ix = (x * self.stride[1] + kx) as isize - pl as isize;
                                    if ix < 0 || ix as usize >= w {
                                        continue;
                                    }
                                    let i = ((n * c + channel) * h + iy as usize) * w + ix as usize;
                                    let k = ((o * cin_g + ci) * kh + ky) * kw + kx;
                                    acc += input[i] * weight[k];
                                }
                            }
                        }
                        chunk[y * out_w + x] = acc;
                    }
                }
            });
        Ok(Tensor::new(out_shape, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conv_identity_kernel() {
        // 1x1 kernel copying channel 0 and doubling channel 1
        let weight = Tensor::new(vec![2, 2, 1, 1], vec![1.0, 0.0, 0.0, 2.0]);
        let conv = Convolution::new(weight, Some(Tensor::new(vec![2], vec![0.5, 0.0]))).unwrap();
        let input = Tensor::random_seeded(vec![1, 2, 3, 3], 3);
        let out = conv.evaluate(&[&input]).unwrap();
        assert_eq!(out.get_shape(), vec![1, 2, 3, 3]);
        for i in 0..9 {
            assert!((out.get_data()[i] - (input.get_data()[i] + 0.5)).abs() < 1e-6);
            assert!((out.get_data()[9 + i] - 2.0 * input.get_data()[9 + i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_conv_output_shape_with_stride_and_padding() {
        let weight = Tensor::zeros(vec![4, 3, 3, 3]);
        let conv =
            Convolution::with_params(weight, None, KernelFormat::OIHW, [2, 2], [1, 1, 1, 1], 1)
                .unwrap();
        assert_eq!(
            conv.output_shape(&[vec![2, 3, 8, 8]]).unwrap(),
            vec![2, 4, 4, 4]
        );
        assert!(conv.output_shape(&[vec![2, 5, 8, 8]]).is_err());
    }

    #[test]
    fn test_hwio_matches_oihw() {
        let oihw = Tensor::random_seeded(vec![4, 3, 3, 3], 11);
        let hwio = oihw.permute(&[2, 3, 1, 0]).unwrap();
        let a = Convolution::new(oihw, None).unwrap();
        let b =
            Convolution::with_params(hwio, None, KernelFormat::HWIO, [1, 1], [0; 4], 1).unwrap();
        let input = Tensor::random_seeded(vec![1, 3, 5, 5], 12);
        let diff = a
            .evaluate(&[&input])
            .unwrap()
            .max_abs_diff(&b.evaluate(&[&input]).unwrap());
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_depthwise_hwio_round_trip() {
        let hwio = Tensor::random_seeded(vec![3, 3, 5, 1], 2);
        let mut conv =
            Convolution::with_params(hwio.clone(), None, KernelFormat::HWIO, [1, 1], [1; 4], 5)
                .unwrap();
        assert!(conv.is_depthwise());
        let canonical = conv.canonical_weight().unwrap();
        assert_eq!(canonical.get_shape(), vec![5, 1, 3, 3]);
        conv.set_canonical_weight(canonical).unwrap();
        assert_eq!(conv.weight, hwio);
    }

    #[test]
    fn test_depthwise_evaluation() {
        let weight = Tensor::new(vec![2, 1, 1, 1], vec![3.0, -1.0]);
        let conv = Convolution::depthwise(weight, None, [1, 1], [0; 4]).unwrap();
        assert!(conv.is_depthwise());
        let input = Tensor::new(vec![1, 2, 1, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let out = conv.evaluate(&[&input]).unwrap();
        assert_eq!(out.get_data(), &[3.0, 6.0, -3.0, -4.0]);
    }
}
