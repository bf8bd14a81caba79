//! Batchnorm fold: absorbs batchnorm layers into the convolution or linear layer next to
//! them, then drops the batchnorm from the invocation graph.
use std::collections::HashSet;

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    graph::{ConnectedGraph, GraphBounds, OpId},
    kernel::EqualizationParams,
    layers::{Activation, BatchNorm, Layer},
    model::{Model, ModuleId, NodeId, RebindError, Relocation, save_and_load},
    tensor::Shape,
};

use super::{
    CleError, ModuleRef, Rewritten,
    conv_bn::{ActivationType, find_all_conv_bn_with_activation},
    scaling::{layer_params, write_layer_params},
};

/// Which side of the layer the batchnorm sat on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldPosition {
    /// The batchnorm consumed the layer output
    Output,
    /// The batchnorm produced the layer input
    Input,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldedPair {
    pub conv: ModuleRef,
    pub bn: ModuleRef,
    pub position: FoldPosition,
}

impl FoldedPair {
    pub fn rebind(&mut self, relocation: &Relocation) -> Result<(), RebindError> {
        self.conv.rebind(relocation)?;
        self.bn.rebind(relocation)
    }
}

/// `W' = W a`, `b' = b a + (beta - mean a)` per output channel, with `a = gamma / sqrt(var + eps)`
pub fn fold_output(params: &mut EqualizationParams, bn: &BatchNorm) -> Result<()> {
    let [out, inp, kh, kw] = params.weight_shape;
    ensure!(
        bn.channels() == out,
        CleError::Structural(format!(
            "batchnorm over {} channels cannot fold into {out} output channels",
            bn.channels()
        ))
    );
    let (scale, shift) = bn.scale_shift();
    let per_channel = inp * kh * kw;
    params
        .weight
        .chunks_mut(per_channel.max(1))
        .zip(scale.iter())
        .for_each(|(w, a)| w.iter_mut().for_each(|v| *v *= a));
    let bias = params.bias.get_or_insert_with(|| vec![0.0; out]);
    for ((b, a), s) in bias.iter_mut().zip(&scale).zip(&shift) {
        *b = *b * a + s;
    }
    Ok(())
}

/// `W'[o, i] = W[o, i] a_i`, `b'_o = b_o + sum_{i,k} W[o, i, k] (beta_i - mean_i a_i)`.
/// For a depthwise layer the only input channel of output `o` is channel `o` itself.
pub fn fold_input(params: &mut EqualizationParams, bn: &BatchNorm, depthwise: bool) -> Result<()> {
    let [out, inp, kh, kw] = params.weight_shape;
    let channels = if depthwise { out } else { inp };
    ensure!(
        bn.channels() == channels && (!depthwise || inp == 1),
        CleError::Structural(format!(
            "batchnorm over {} channels cannot fold into the {channels} input channels of {:?}",
            bn.channels(),
            params.weight_shape
        ))
    );
    let (scale, shift) = bn.scale_shift();
    let k = kh * kw;
    let mut bias = params.bias.take().unwrap_or_else(|| vec![0.0; out]);
    for (o, b) in bias.iter_mut().enumerate() {
        for i in 0..inp {
            let channel = if depthwise { o } else { i };
            let start = (o * inp + i) * k;
            let w = &mut params.weight[start..start + k];
            *b += w.iter().sum::<f32>() * shift[channel];
            w.iter_mut().for_each(|v| *v *= scale[channel]);
        }
    }
    params.bias = Some(bias);
    Ok(())
}

/// A batchnorm can only be pushed through the input of an unpadded, non grouped (or
/// depthwise) convolution
fn is_valid_input_fold(layer: &Layer) -> bool {
    match layer {
        Layer::Convolution(conv) => {
            !conv.has_padding() && (conv.groups == 1 || conv.is_depthwise())
        }
        _ => false,
    }
}

fn invocations(model: &Model, id: ModuleId) -> usize {
    model
        .nodes()
        .iter()
        .filter(|n| n.module() == Some(id))
        .count()
}

fn fold_pair(
    model: &mut Model,
    conv: ModuleId,
    bn: ModuleId,
    position: FoldPosition,
) -> Result<()> {
    let bn_layer = match model.module(bn).map(|m| &m.layer) {
        Some(Layer::BatchNorm(bn)) => bn.clone(),
        other => bail!(CleError::Structural(format!(
            "module {bn} is not a batchnorm: {other:?}"
        ))),
    };
    let module = model
        .module(conv)
        .ok_or_else(|| CleError::Structural(format!("module {conv} does not exist")))?;
    let depthwise = matches!(&module.layer, Layer::Convolution(c) if c.is_depthwise());
    // compute everything before touching the model
    let mut params = layer_params(&module.name, &module.layer)?;
    match position {
        FoldPosition::Output => fold_output(&mut params, &bn_layer)?,
        FoldPosition::Input => fold_input(&mut params, &bn_layer, depthwise)?,
    }
    let mut layer = module.layer.clone();
    write_layer_params(&mut layer, params)?;
    debug!(
        "folded {:?} batchnorm {bn} into '{}'",
        position, module.name
    );
    model.replace_layer(conv, layer)?;
    Ok(())
}

/// Folds every batchnorm adjacent to a convolution or linear layer. Folding into the layer
/// feeding the batchnorm is preferred, and each batchnorm is folded at most once.
pub fn fold_all_batch_norms(
    model: &Model,
    input_shapes: &[Shape],
    bounds: &GraphBounds,
) -> Result<Rewritten<Vec<FoldedPair>>> {
    let graph = ConnectedGraph::build_bounded(model, input_shapes, bounds)?;
    let records = find_all_conv_bn_with_activation(&graph);

    let mut candidates: Vec<(ModuleId, OpId, FoldPosition)> = records
        .iter()
        .filter_map(|(conv, info)| info.output_bn.map(|bn| (*conv, bn, FoldPosition::Output)))
        .collect();
    candidates.extend(records.iter().filter_map(|(conv, info)| {
        match (info.input_bn, info.in_activation_type) {
            (Some(bn), ActivationType::NoActivation) => Some((*conv, bn, FoldPosition::Input)),
            _ => None,
        }
    }));

    let mut rewritten = model.clone();
    let mut picked: HashSet<ModuleId> = HashSet::new();
    let mut bypassed: Vec<NodeId> = Vec::new();
    let mut pairs = Vec::new();
    for (conv, bn_op, position) in candidates {
        let bn_op = graph.op(bn_op);
        let (Some(bn), Some(bn_node)) = (bn_op.module(), bn_op.node()) else {
            debug!("skipping functional batchnorm {}", bn_op.name());
            continue;
        };
        if picked.contains(&bn) {
            continue;
        }
        let conv_layer = &rewritten
            .module(conv)
            .ok_or_else(|| CleError::Structural(format!("module {conv} does not exist")))?
            .layer;
        if position == FoldPosition::Input && !is_valid_input_fold(conv_layer) {
            debug!(
                "cannot fold {} forward into a padded or grouped convolution",
                bn_op.dotted_name()
            );
            continue;
        }
        if invocations(&rewritten, conv) != 1 || invocations(&rewritten, bn) != 1 {
            debug!("skipping {}, its modules are invoked more than once", bn_op.dotted_name());
            continue;
        }
        fold_pair(&mut rewritten, conv, bn, position)?;
        picked.insert(bn);
        bypassed.push(bn_node);
        pairs.push(FoldedPair {
            conv: ModuleRef::new(&rewritten, conv)?,
            bn: ModuleRef::new(&rewritten, bn)?,
            position,
        });
    }

    // highest first so the remaining node ids stay valid
    bypassed.sort_unstable_by(|a, b| b.cmp(a));
    for node in bypassed {
        rewritten.bypass_node(node)?;
    }
    let (model, relocation) = save_and_load(&rewritten)?;
    for pair in pairs.iter_mut() {
        pair.rebind(&relocation)?;
    }
    info!(
        "folded {} batchnorm layer(s) in '{}'",
        pairs.len(),
        model.name()
    );
    Ok(Rewritten {
        model,
        relocation,
        result: pairs,
    })
}

/// Replaces every ReLU6 module by a ReLU, returning how many were replaced
pub fn replace_relu6_with_relu(model: &mut Model) -> usize {
    let relu6: Vec<ModuleId> = model
        .modules()
        .filter(|(_, m)| matches!(m.layer, Layer::Activation(Activation::Relu6)))
        .map(|(id, _)| id)
        .collect();
    for id in &relu6 {
        if let Some(module) = model.module_mut(*id) {
            module.layer = Layer::Activation(Activation::Relu);
        }
    }
    relu6.len()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        layers::{Convolution, KernelFormat, Reshape},
        tensor::Tensor,
        testing::{random_bn, random_conv, random_dense, relative_error},
    };

    fn fold(model: &Model, input_shape: Shape) -> Rewritten<Vec<FoldedPair>> {
        fold_all_batch_norms(model, &[input_shape], &GraphBounds::default()).unwrap()
    }

    fn assert_same_function(before: &Model, after: &Model, input_shape: Shape) {
        let input = Tensor::random_seeded(input_shape, 77);
        let expected = before.forward(&[input.clone()]).unwrap();
        let got = after.forward(&[input]).unwrap();
        assert!(relative_error(&got[0], &expected[0]) < 1e-4);
    }

    #[rstest]
    #[case::oihw(KernelFormat::OIHW)]
    #[case::hwio(KernelFormat::HWIO)]
    fn test_output_fold_preserves_function(#[case] format: KernelFormat) {
        let mut conv = random_conv(4, 3, 3, 0);
        if format == KernelFormat::HWIO {
            conv.weight = conv.weight.permute(&[2, 3, 1, 0]).unwrap();
            conv.kernel_format = KernelFormat::HWIO;
        }
        let model = Model::sequential(
            "net",
            [
                ("conv", Layer::Convolution(conv)),
                ("bn", Layer::BatchNorm(random_bn(4, 1))),
                ("relu", Layer::Activation(Activation::Relu)),
            ],
        )
        .unwrap();
        let folded = fold(&model, vec![2, 3, 5, 5]);
        assert_eq!(folded.result.len(), 1);
        let pair = &folded.result[0];
        assert_eq!(pair.position, FoldPosition::Output);
        assert_eq!(folded.model.module(pair.bn.id).unwrap().name, "bn");
        assert_eq!(folded.model.nodes().len(), 2);
        assert_same_function(&model, &folded.model, vec![2, 3, 5, 5]);
    }

    #[test]
    fn test_missing_bias_becomes_folded_bias() {
        let mut conv = random_conv(2, 2, 1, 0);
        conv.bias = None;
        let model = Model::sequential(
            "net",
            [
                ("conv", Layer::Convolution(conv)),
                ("bn", Layer::BatchNorm(random_bn(2, 1))),
            ],
        )
        .unwrap();
        let folded = fold(&model, vec![1, 2, 3, 3]);
        let Layer::Convolution(conv) = &folded.model.module_by_name("conv").unwrap().layer else {
            panic!("conv expected");
        };
        assert!(conv.bias.is_some());
        assert_same_function(&model, &folded.model, vec![1, 2, 3, 3]);
    }

    #[test]
    fn test_input_fold_preserves_function() {
        let depthwise = Convolution::depthwise(
            Tensor::random_seeded(vec![4, 1, 3, 3], 5),
            Some(Tensor::random_seeded(vec![4], 6)),
            [1, 1],
            [0; 4],
        )
        .unwrap();
        let model = Model::sequential(
            "net",
            [
                ("bn0", Layer::BatchNorm(random_bn(3, 0))),
                ("conv", Layer::Convolution(random_conv(4, 3, 1, 1))),
                ("relu", Layer::Activation(Activation::Relu)),
                ("bn1", Layer::BatchNorm(random_bn(4, 2))),
                ("dw", Layer::Convolution(depthwise)),
            ],
        )
        .unwrap();
        let folded = fold(&model, vec![1, 3, 6, 6]);
        let positions: Vec<_> = folded
            .result
            .iter()
            .map(|p| (p.conv.name.as_str(), p.bn.name.as_str(), p.position))
            .collect();
        assert_eq!(
            positions,
            vec![
                ("conv", "bn0", FoldPosition::Input),
                ("dw", "bn1", FoldPosition::Input)
            ]
        );
        assert_same_function(&model, &folded.model, vec![1, 3, 6, 6]);
    }

    #[test]
    fn test_input_fold_refused_through_padding_or_activation() {
        let model = Model::sequential(
            "net",
            [
                ("bn0", Layer::BatchNorm(random_bn(3, 0))),
                ("padded", Layer::Convolution(random_conv(3, 3, 3, 1))),
                ("relu", Layer::Activation(Activation::Relu)),
                ("bn1", Layer::BatchNorm(random_bn(3, 2))),
                ("relu6", Layer::Activation(Activation::Relu6)),
                ("conv", Layer::Convolution(random_conv(2, 3, 1, 3))),
            ],
        )
        .unwrap();
        let folded = fold(&model, vec![1, 3, 4, 4]);
        assert!(folded.result.is_empty());
        assert_eq!(folded.model.nodes().len(), model.nodes().len());
    }

    #[test]
    fn test_linear_after_flatten() {
        let model = Model::sequential(
            "net",
            [
                ("flatten", Layer::Reshape(Reshape::Flatten { axis: 1 })),
                ("fc", Layer::Dense(random_dense(3, 8, 0))),
                ("bn", Layer::BatchNorm(random_bn(3, 1))),
            ],
        )
        .unwrap();
        let folded = fold(&model, vec![2, 2, 2, 2]);
        assert_eq!(folded.result.len(), 1);
        assert_same_function(&model, &folded.model, vec![2, 2, 2, 2]);
    }

    #[test]
    fn test_shared_batchnorm_is_left_alone() {
        let mut model = Model::new("net");
        let x = model.add_input();
        let conv = model
            .add_module("conv", Layer::Convolution(random_conv(2, 2, 1, 0)))
            .unwrap();
        let bn = model.add_module("bn", Layer::BatchNorm(random_bn(2, 1))).unwrap();
        let a = model.call(conv, vec![x]).unwrap();
        let b = model.call(bn, vec![a]).unwrap();
        let c = model.call(bn, vec![b]).unwrap();
        model.set_outputs(vec![c]);
        let folded = fold(&model, vec![1, 2, 2, 2]);
        assert!(folded.result.is_empty());
    }

    fn assert_same_outputs(before: &Model, after: &Model, input_shape: Shape) {
        let input = Tensor::random_seeded(input_shape, 78);
        let expected = before.forward(&[input.clone()]).unwrap();
        let got = after.forward(&[input]).unwrap();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(&expected) {
            assert!(relative_error(g, e) < 1e-4);
        }
    }

    #[test]
    fn test_conv_read_as_model_output_is_not_folded() {
        let mut model = Model::new("net");
        let x = model.add_input();
        let conv = model
            .add_module("conv", Layer::Convolution(random_conv(3, 2, 3, 0)))
            .unwrap();
        let bn = model.add_module("bn", Layer::BatchNorm(random_bn(3, 1))).unwrap();
        let c = model.call(conv, vec![x]).unwrap();
        let b = model.call(bn, vec![c.clone()]).unwrap();
        model.set_outputs(vec![c, b]);

        let folded = fold(&model, vec![1, 2, 4, 4]);
        assert!(folded.result.is_empty());
        assert_same_outputs(&model, &folded.model, vec![1, 2, 4, 4]);
    }

    #[test]
    fn test_batchnorm_read_as_model_output_is_folded() {
        let mut model = Model::new("net");
        let x = model.add_input();
        let conv = model
            .add_module("conv", Layer::Convolution(random_conv(3, 2, 3, 0)))
            .unwrap();
        let bn = model.add_module("bn", Layer::BatchNorm(random_bn(3, 1))).unwrap();
        let relu = model
            .add_module("relu", Layer::Activation(Activation::Relu))
            .unwrap();
        let c = model.call(conv, vec![x]).unwrap();
        let b = model.call(bn, vec![c]).unwrap();
        let r = model.call(relu, vec![b.clone()]).unwrap();
        model.set_outputs(vec![b, r]);

        // the folded conv takes over the batchnorm's place among the outputs
        let folded = fold(&model, vec![1, 2, 4, 4]);
        assert_eq!(folded.result.len(), 1);
        assert_eq!(folded.model.nodes().len(), 2);
        assert_same_outputs(&model, &folded.model, vec![1, 2, 4, 4]);
    }

    #[test]
    fn test_relu6_replacement() {
        let mut model = Model::sequential(
            "net",
            [
                ("a", Layer::Activation(Activation::Relu6)),
                ("b", Layer::Activation(Activation::Relu)),
                ("c", Layer::Activation(Activation::Relu6)),
            ],
        )
        .unwrap();
        assert_eq!(replace_relu6_with_relu(&mut model), 2);
        assert!(
            model
                .modules()
                .all(|(_, m)| m.layer == Layer::Activation(Activation::Relu))
        );
    }
}
