//! Seeded random layers and small reference models, shared by unit tests and benches.
use itertools::Itertools;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    layers::{Activation, BatchNorm, Convolution, Dense, Layer, Reshape},
    model::Model,
    tensor::Tensor,
};

pub fn random_vector(n: usize, seed: u64) -> Vec<f32> {
    random_vector_in(n, seed, -1.0, 1.0)
}

pub fn random_vector_in(n: usize, seed: u64, low: f32, high: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(low..high)).collect_vec()
}

/// `[out, inp, k, k]` convolution with a bias, padded to keep the spatial size
pub fn random_conv(out: usize, inp: usize, k: usize, seed: u64) -> Convolution {
    let weight = Tensor::random_seeded(vec![out, inp, k, k], seed);
    let bias = Tensor::new(vec![out], random_vector(out, seed.wrapping_add(1)));
    Convolution::with_params(
        weight,
        Some(bias),
        crate::layers::KernelFormat::OIHW,
        [1, 1],
        [0; 4],
        1,
    )
    .map(|mut conv| {
        conv.padding = [k / 2; 4];
        conv
    })
    .expect("valid random convolution")
}

/// Depthwise `[channels, 1, k, k]` convolution, padded to keep the spatial size
pub fn random_depthwise(channels: usize, k: usize, seed: u64) -> Convolution {
    let weight = Tensor::random_seeded(vec![channels, 1, k, k], seed);
    let bias = Tensor::new(vec![channels], random_vector(channels, seed.wrapping_add(1)));
    Convolution::depthwise(weight, Some(bias), [1, 1], [k / 2; 4]).expect("valid random depthwise")
}

pub fn random_dense(out: usize, inp: usize, seed: u64) -> Dense {
    let weight = Tensor::random_seeded(vec![out, inp], seed);
    let bias = Tensor::new(vec![out], random_vector(out, seed.wrapping_add(1)));
    Dense::new(weight, Some(bias)).expect("valid random dense")
}

/// Batchnorm with positive variances and gammas away from zero
pub fn random_bn(channels: usize, seed: u64) -> BatchNorm {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut draw = |low: f32, high: f32| {
        (0..channels)
            .map(|_| rng.gen_range(low..high))
            .collect_vec()
    };
    let gamma = draw(0.5, 1.5);
    let beta = draw(-1.0, 1.0);
    let mean = draw(-0.5, 0.5);
    let var = draw(0.5, 1.5);
    BatchNorm::new(gamma, beta, mean, var, crate::layers::batchnorm::DEFAULT_EPSILON)
        .expect("valid random batchnorm")
}

/// `conv1 -> bn1 -> relu1 -> conv2 -> bn2`, fed `[N, 3, H, W]`
pub fn conv_bn_relu_chain(seed: u64) -> Model {
    Model::sequential(
        "chain",
        [
            ("conv1", Layer::Convolution(random_conv(8, 3, 3, seed))),
            ("bn1", Layer::BatchNorm(random_bn(8, seed + 1))),
            ("relu1", Layer::Activation(Activation::Relu)),
            ("conv2", Layer::Convolution(random_conv(4, 8, 3, seed + 2))),
            ("bn2", Layer::BatchNorm(random_bn(4, seed + 3))),
        ],
    )
    .expect("valid chain")
}

/// A MobileNet style block `conv -> bn -> relu6 -> dw -> bn -> relu6 -> conv -> bn`,
/// followed by `flatten -> fc -> bn`, fed `[N, 3, 6, 6]`
pub fn depthwise_separable_block(seed: u64) -> Model {
    Model::sequential(
        "mobile",
        [
            ("expand", Layer::Convolution(random_conv(6, 3, 1, seed))),
            ("expand_bn", Layer::BatchNorm(random_bn(6, seed + 1))),
            ("expand_act", Layer::Activation(Activation::Relu6)),
            ("dw", Layer::Convolution(random_depthwise(6, 3, seed + 2))),
            ("dw_bn", Layer::BatchNorm(random_bn(6, seed + 3))),
            ("dw_act", Layer::Activation(Activation::Relu6)),
            ("project", Layer::Convolution(random_conv(4, 6, 1, seed + 4))),
            ("project_bn", Layer::BatchNorm(random_bn(4, seed + 5))),
            ("flatten", Layer::Reshape(Reshape::Flatten { axis: 1 })),
            ("fc", Layer::Dense(random_dense(5, 4 * 6 * 6, seed + 6))),
            ("fc_bn", Layer::BatchNorm(random_bn(5, seed + 7))),
        ],
    )
    .expect("valid block")
}

/// Largest element-wise difference relative to the magnitude of `expected`
pub fn relative_error(got: &Tensor<f32>, expected: &Tensor<f32>) -> f32 {
    let scale = expected
        .get_data()
        .iter()
        .fold(1.0f32, |acc, v| acc.max(v.abs()));
    got.max_abs_diff(expected) / scale
}
