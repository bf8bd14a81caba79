//! Straight-through estimator for the gradient of quantize-dequantize.
use anyhow::{Result, ensure};

use crate::tensor::Tensor;

use super::Encoding;

/// Passes `grad` through where `min <= x <= max` and zeroes it elsewhere
pub fn compute_dloss_by_dx(
    x: &Tensor<f32>,
    grad: &Tensor<f32>,
    min: f32,
    max: f32,
) -> Result<Tensor<f32>> {
    ensure!(
        x.shape() == grad.shape(),
        "gradient of shape {:?} does not match input of shape {:?}",
        grad.shape(),
        x.shape()
    );
    let data = x
        .get_data()
        .iter()
        .zip(grad.get_data())
        .map(|(x, g)| if (min..=max).contains(x) { *g } else { 0.0 })
        .collect();
    Ok(Tensor::new(x.get_shape(), data))
}

/// [`compute_dloss_by_dx`] over the range of `encoding`
pub fn compute_dloss_by_dx_for(
    x: &Tensor<f32>,
    grad: &Tensor<f32>,
    encoding: &Encoding,
) -> Result<Tensor<f32>> {
    compute_dloss_by_dx(x, grad, encoding.min, encoding.max)
}
