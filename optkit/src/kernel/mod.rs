//! Scale and bias math of cross-layer equalization.
//!
//! Everything here works on plain buffers in a fixed layout: weights are row-major
//! `[out_channels, in_channels, kh, kw]`, depthwise weights `[channels, 1, kh, kw]`.
//! Callers marshal their layers in and out of that layout.
use rayon::prelude::*;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum KernelError {
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("{0} has no bias")]
    MissingBias(&'static str),
}

type KernelResult<T> = Result<T, KernelError>;

#[derive(Clone, Debug, PartialEq)]
pub struct EqualizationParams {
    pub weight: Vec<f32>,
    pub weight_shape: [usize; 4],
    pub bias: Option<Vec<f32>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BnParamsHighBiasFold {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayerParams {
    pub weight: Vec<f32>,
    pub weight_shape: [usize; 4],
    pub bias: Option<Vec<f32>>,
    /// Whether a ReLU sits between this layer and the next one
    pub activation_is_relu: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScaledPair {
    pub prev: EqualizationParams,
    pub curr: EqualizationParams,
    /// One factor per output channel of `prev`
    pub scale: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ScaledTriplet {
    pub prev: EqualizationParams,
    pub depthwise: EqualizationParams,
    pub next: EqualizationParams,
    pub scale_12: Vec<f32>,
    pub scale_23: Vec<f32>,
}

fn check_layout(
    what: &str,
    weight: &[f32],
    shape: &[usize; 4],
    bias: Option<&Vec<f32>>,
) -> KernelResult<()> {
    let expected = shape.iter().product::<usize>();
    if weight.len() != expected {
        return Err(KernelError::ShapeMismatch(format!(
            "{what} weight holds {} values for shape {shape:?}",
            weight.len()
        )));
    }
    if let Some(bias) = bias {
        if bias.len() != shape[0] {
            return Err(KernelError::ShapeMismatch(format!(
                "{what} bias holds {} values for {} output channels",
                bias.len(),
                shape[0]
            )));
        }
    }
    Ok(())
}

fn kernel_volume(shape: &[usize; 4]) -> usize {
    shape[2] * shape[3]
}

/// Largest absolute weight of every output channel
fn output_channel_ranges(weight: &[f32], shape: &[usize; 4]) -> Vec<f32> {
    let per_channel = shape[1] * kernel_volume(shape);
    weight
        .par_chunks(per_channel.max(1))
        .map(|w| w.iter().fold(0.0f32, |acc, v| acc.max(v.abs())))
        .collect()
}

/// Largest absolute weight of every input channel
fn input_channel_ranges(weight: &[f32], shape: &[usize; 4]) -> Vec<f32> {
    let [out, inp, _, _] = *shape;
    let k = kernel_volume(shape);
    (0..inp)
        .into_par_iter()
        .map(|i| {
            (0..out)
                .flat_map(|o| {
                    let start = (o * inp + i) * k;
                    weight[start..start + k].iter()
                })
                .fold(0.0f32, |acc, v| acc.max(v.abs()))
        })
        .collect()
}

fn scale_output_channels(params: &mut EqualizationParams, factors: &[f32], divide: bool) {
    let per_channel = params.weight_shape[1] * kernel_volume(&params.weight_shape);
    params
        .weight
        .par_chunks_mut(per_channel.max(1))
        .zip(factors.par_iter())
        .for_each(|(w, s)| {
            w.iter_mut()
                .for_each(|v| if divide { *v /= s } else { *v *= s });
        });
}

fn scale_input_channels(params: &mut EqualizationParams, factors: &[f32]) {
    let inp = params.weight_shape[1];
    let k = kernel_volume(&params.weight_shape);
    params
        .weight
        .par_chunks_mut((inp * k).max(1))
        .for_each(|row| {
            row.chunks_mut(k.max(1))
                .zip(factors.iter())
                .for_each(|(w, s)| w.iter_mut().for_each(|v| *v *= s));
        });
}

fn divide_bias(params: &mut EqualizationParams, factors: &[f32]) {
    if let Some(bias) = params.bias.as_mut() {
        bias.iter_mut().zip(factors).for_each(|(b, s)| *b /= s);
    }
}

/// Equalizes the output channels of `prev` with the input channels of `curr`:
/// `s = sqrt(r_prev / r_curr)`, `prev /= s`, `curr *= s` along the shared channels.
/// A channel with a zero range on either side keeps a factor of 1.
pub fn scale_layer_params(
    mut prev: EqualizationParams,
    mut curr: EqualizationParams,
) -> KernelResult<ScaledPair> {
    check_layout("previous layer", &prev.weight, &prev.weight_shape, prev.bias.as_ref())?;
    check_layout("current layer", &curr.weight, &curr.weight_shape, curr.bias.as_ref())?;
    if prev.weight_shape[0] != curr.weight_shape[1] {
        return Err(KernelError::ShapeMismatch(format!(
            "previous layer has {} output channels, current layer expects {}",
            prev.weight_shape[0], curr.weight_shape[1]
        )));
    }
    let r_prev = output_channel_ranges(&prev.weight, &prev.weight_shape);
    let r_curr = input_channel_ranges(&curr.weight, &curr.weight_shape);
    let scale: Vec<f32> = r_prev
        .iter()
        .zip(r_curr.iter())
        .map(|(&a, &b)| {
            if a == 0.0 || b == 0.0 {
                1.0
            } else {
                (a / b).sqrt()
            }
        })
        .collect();

    scale_output_channels(&mut prev, &scale, true);
    divide_bias(&mut prev, &scale);
    scale_input_channels(&mut curr, &scale);
    Ok(ScaledPair { prev, curr, scale })
}

/// Equalizes a `prev -> depthwise -> next` triplet with two factor arrays:
/// `c = cbrt(r0 r1 r2)`, `s12 = r0 / c` and `s23 = c / r2`.
pub fn scale_depthwise_separable_layer(
    mut prev: EqualizationParams,
    mut depthwise: EqualizationParams,
    mut next: EqualizationParams,
) -> KernelResult<ScaledTriplet> {
    check_layout("previous layer", &prev.weight, &prev.weight_shape, prev.bias.as_ref())?;
    check_layout(
        "depthwise layer",
        &depthwise.weight,
        &depthwise.weight_shape,
        depthwise.bias.as_ref(),
    )?;
    check_layout("next layer", &next.weight, &next.weight_shape, next.bias.as_ref())?;
    let channels = prev.weight_shape[0];
    if depthwise.weight_shape[0] != channels
        || depthwise.weight_shape[1] != 1
        || next.weight_shape[1] != channels
    {
        return Err(KernelError::ShapeMismatch(format!(
            "depthwise separable shapes do not line up: {:?} -> {:?} -> {:?}",
            prev.weight_shape, depthwise.weight_shape, next.weight_shape
        )));
    }
    let r0 = output_channel_ranges(&prev.weight, &prev.weight_shape);
    let r1 = output_channel_ranges(&depthwise.weight, &depthwise.weight_shape);
    let r2 = input_channel_ranges(&next.weight, &next.weight_shape);
    let (scale_12, scale_23): (Vec<f32>, Vec<f32>) = (0..channels)
        .map(|c| {
            let product = r0[c] * r1[c] * r2[c];
            if product == 0.0 {
                return (1.0, 1.0);
            }
            let cube_root = product.cbrt();
            (r0[c] / cube_root, cube_root / r2[c])
        })
        .unzip();

    scale_output_channels(&mut prev, &scale_12, true);
    divide_bias(&mut prev, &scale_12);
    let depthwise_factors: Vec<f32> = scale_12
        .iter()
        .zip(scale_23.iter())
        .map(|(s12, s23)| s12 / s23)
        .collect();
    scale_output_channels(&mut depthwise, &depthwise_factors, false);
    divide_bias(&mut depthwise, &scale_23);
    scale_input_channels(&mut next, &scale_23);
    Ok(ScaledTriplet {
        prev,
        depthwise,
        next,
        scale_12,
        scale_23,
    })
}

/// Moves the part of `prev`'s bias a following layer can absorb into `curr`'s bias.
/// Behind a ReLU only `max(0, beta - 3 |gamma|)` is moved, otherwise all of `beta`.
pub fn update_bias(
    mut prev: LayerParams,
    mut curr: LayerParams,
    bn: &BnParamsHighBiasFold,
) -> KernelResult<(LayerParams, LayerParams)> {
    check_layout("previous layer", &prev.weight, &prev.weight_shape, prev.bias.as_ref())?;
    check_layout("current layer", &curr.weight, &curr.weight_shape, curr.bias.as_ref())?;
    let channels = prev.weight_shape[0];
    if bn.gamma.len() != channels || bn.beta.len() != channels {
        return Err(KernelError::ShapeMismatch(format!(
            "batchnorm has {}/{} gamma/beta values for {channels} channels",
            bn.gamma.len(),
            bn.beta.len()
        )));
    }
    let absorb: Vec<f32> = bn
        .gamma
        .iter()
        .zip(bn.beta.iter())
        .map(|(g, b)| {
            if prev.activation_is_relu {
                (b - 3.0 * g.abs()).max(0.0)
            } else {
                *b
            }
        })
        .collect();

    let [out, inp, _, _] = curr.weight_shape;
    let k = kernel_volume(&curr.weight_shape);
    let shift: Vec<f32> = if inp == channels {
        (0..out)
            .map(|o| {
                (0..inp)
                    .map(|i| {
                        let start = (o * inp + i) * k;
                        curr.weight[start..start + k].iter().sum::<f32>() * absorb[i]
                    })
                    .sum()
            })
            .collect()
    } else if out == channels && inp == 1 {
        (0..out)
            .map(|c| curr.weight[c * k..(c + 1) * k].iter().sum::<f32>() * absorb[c])
            .collect()
    } else {
        return Err(KernelError::ShapeMismatch(format!(
            "layer {:?} cannot absorb the bias of {channels} channels",
            curr.weight_shape
        )));
    };

    let prev_bias = prev
        .bias
        .as_mut()
        .ok_or(KernelError::MissingBias("previous layer"))?;
    let curr_bias = curr
        .bias
        .as_mut()
        .ok_or(KernelError::MissingBias("current layer"))?;
    prev_bias.iter_mut().zip(absorb.iter()).for_each(|(b, a)| *b -= a);
    curr_bias.iter_mut().zip(shift.iter()).for_each(|(b, s)| *b += s);
    Ok((prev, curr))
}
