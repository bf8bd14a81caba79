//! Cross-layer scaling of the cls sets found in a model.
use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    graph::{ConnectedGraph, GraphBounds, OpKind},
    kernel::{self, EqualizationParams},
    layers::Layer,
    model::{Model, ModuleId, RebindError, Relocation, save_and_load},
    tensor::{Shape, Tensor},
};

use super::{
    CleError, ModuleRef, Rewritten,
    layer_groups::{ClsSet, find_layer_groups_to_scale, is_relu_activation_present_in_cls_sets},
};

/// Per-channel factors applied by one cls set, one array per adjacent pair of layers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScaleFactor {
    Pair(Vec<f32>),
    Triplet(Vec<f32>, Vec<f32>),
}

impl ScaleFactor {
    pub fn arrays(&self) -> Vec<&[f32]> {
        match self {
            ScaleFactor::Pair(s) => vec![s.as_slice()],
            ScaleFactor::Triplet(s12, s23) => vec![s12.as_slice(), s23.as_slice()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClsSetLayerPairInfo {
    pub layer1: ModuleRef,
    pub layer2: ModuleRef,
    pub scale_factor: Vec<f32>,
    pub relu_activation_between_layers: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClsSetInfo {
    pub cls_pair_info_list: Vec<ClsSetLayerPairInfo>,
}

impl ClsSetInfo {
    pub fn rebind(&mut self, relocation: &Relocation) -> Result<(), RebindError> {
        for pair in self.cls_pair_info_list.iter_mut() {
            pair.layer1.rebind(relocation)?;
            pair.layer2.rebind(relocation)?;
        }
        Ok(())
    }
}

/// The weight of a convolution or linear layer in `[out, in, kh, kw]` order, plus its bias
pub(crate) fn layer_params(name: &str, layer: &Layer) -> Result<EqualizationParams> {
    match layer {
        Layer::Convolution(conv) => {
            let weight = conv.canonical_weight()?;
            let weight_shape: [usize; 4] = weight.shape().try_into()?;
            Ok(EqualizationParams {
                weight: weight.into_data(),
                weight_shape,
                bias: conv.bias.as_ref().map(|b| b.get_data().to_vec()),
            })
        }
        Layer::Dense(dense) => Ok(EqualizationParams {
            weight_shape: [dense.out_features(), dense.in_features(), 1, 1],
            weight: dense.weight.get_data().to_vec(),
            bias: dense.bias.as_ref().map(|b| b.get_data().to_vec()),
        }),
        other => bail!(CleError::UnsupportedLayer {
            name: name.to_string(),
            layer: other.to_string(),
        }),
    }
}

/// Writes parameters given in the layout of [`layer_params`] back into the layer's own layout
pub(crate) fn write_layer_params(layer: &mut Layer, params: EqualizationParams) -> Result<()> {
    let bias = params.bias.map(|b| Tensor::new(vec![b.len()], b));
    match layer {
        Layer::Convolution(conv) => {
            let canonical = Tensor::try_new(params.weight_shape.to_vec(), params.weight)?;
            conv.set_canonical_weight(canonical)?;
            if bias.is_some() {
                conv.bias = bias;
            }
        }
        Layer::Dense(dense) => {
            let [out, inp, _, _] = params.weight_shape;
            ensure!(
                [out, inp] == [dense.out_features(), dense.in_features()],
                "cannot write a {:?} weight into a dense layer of {:?}",
                params.weight_shape,
                dense.weight.shape()
            );
            dense.weight = Tensor::try_new(vec![out, inp], params.weight)?;
            if bias.is_some() {
                dense.bias = bias;
            }
        }
        other => bail!("cannot write weights into {other}"),
    }
    Ok(())
}

/// Marshals a layer for scaling: only regular convolutions, depthwise convolutions and
/// linear layers take part
fn scalable_params(model: &Model, id: ModuleId) -> Result<EqualizationParams> {
    let module = model
        .module(id)
        .ok_or_else(|| CleError::Structural(format!("module {id} does not exist")))?;
    match OpKind::of(&module.layer) {
        OpKind::Conv | OpKind::DepthwiseConv | OpKind::Linear => {
            layer_params(&module.name, &module.layer)
        }
        _ => bail!(CleError::UnsupportedLayer {
            name: module.name.clone(),
            layer: module.layer.to_string(),
        }),
    }
}

fn updated_layer(model: &Model, id: ModuleId, params: EqualizationParams) -> Result<Layer> {
    let mut layer = model
        .module(id)
        .ok_or_else(|| CleError::Structural(format!("module {id} does not exist")))?
        .layer
        .clone();
    write_layer_params(&mut layer, params)?;
    Ok(layer)
}

/// Scales the layers of one cls set in place. A pair yields one factor array, a
/// depthwise separable triplet two. No layer is modified unless all of them can be.
pub fn scale_cls_set(model: &mut Model, layers: &[ModuleId]) -> Result<ScaleFactor> {
    let (updates, scale) = match layers {
        [prev, curr] => {
            let scaled = kernel::scale_layer_params(
                scalable_params(model, *prev)?,
                scalable_params(model, *curr)?,
            )?;
            (
                vec![
                    (*prev, updated_layer(model, *prev, scaled.prev)?),
                    (*curr, updated_layer(model, *curr, scaled.curr)?),
                ],
                ScaleFactor::Pair(scaled.scale),
            )
        }
        [prev, depthwise, next] => {
            let scaled = kernel::scale_depthwise_separable_layer(
                scalable_params(model, *prev)?,
                scalable_params(model, *depthwise)?,
                scalable_params(model, *next)?,
            )?;
            (
                vec![
                    (*prev, updated_layer(model, *prev, scaled.prev)?),
                    (*depthwise, updated_layer(model, *depthwise, scaled.depthwise)?),
                    (*next, updated_layer(model, *next, scaled.next)?),
                ],
                ScaleFactor::Triplet(scaled.scale_12, scaled.scale_23),
            )
        }
        other => bail!(CleError::InvalidInput(format!(
            "a cls set holds 2 or 3 layers, got {}",
            other.len()
        ))),
    };
    for (id, layer) in updates {
        model.replace_layer(id, layer)?;
    }
    Ok(scale)
}

/// Finds the cls sets of `model` and scales each of them
pub fn scale_model(
    model: &Model,
    input_shapes: &[Shape],
    bounds: &GraphBounds,
) -> Result<Rewritten<Vec<ClsSetInfo>>> {
    let graph = ConnectedGraph::build_bounded(model, input_shapes, bounds)?;
    let cls_sets: Vec<ClsSet> = find_layer_groups_to_scale(&graph)
        .iter()
        .flat_map(|group| ClsSet::from_layer_group(&graph, group))
        .collect();
    let relu_flags = is_relu_activation_present_in_cls_sets(&graph, &cls_sets);

    let mut scaled = model.clone();
    let mut infos = Vec::with_capacity(cls_sets.len());
    for (set, flags) in cls_sets.iter().zip(relu_flags) {
        let modules = set
            .ops()
            .into_iter()
            .map(|op| {
                let op = graph.op(op);
                op.module().ok_or_else(|| {
                    CleError::Structural(format!("{} is not backed by a module", op.dotted_name()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let scale = scale_cls_set(&mut scaled, &modules)?;
        let refs = modules
            .iter()
            .map(|id| ModuleRef::new(&scaled, *id))
            .collect::<Result<Vec<_>>>()?;
        let cls_pair_info_list = refs
            .windows(2)
            .zip(scale.arrays())
            .zip(flags)
            .map(|((layers, factor), relu)| ClsSetLayerPairInfo {
                layer1: layers[0].clone(),
                layer2: layers[1].clone(),
                scale_factor: factor.to_vec(),
                relu_activation_between_layers: relu,
            })
            .collect();
        debug!(
            "scaled cls set {}",
            refs.iter().map(|r| r.name.as_str()).collect::<Vec<_>>().join(" -> ")
        );
        infos.push(ClsSetInfo { cls_pair_info_list });
    }

    let (model, relocation) = save_and_load(&scaled)?;
    for info in infos.iter_mut() {
        info.rebind(&relocation)?;
    }
    info!("scaled {} cls set(s) in '{}'", infos.len(), model.name());
    Ok(Rewritten {
        model,
        relocation,
        result: infos,
    })
}
