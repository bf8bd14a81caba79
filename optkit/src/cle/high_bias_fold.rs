//! High-bias fold: after scaling, moves the part of a layer's bias that the next layer can
//! absorb through its weights.
use std::collections::HashMap;

use anyhow::{Result, anyhow};
use tracing::{debug, error, info};

use crate::{
    kernel::{self, BnParamsHighBiasFold, LayerParams},
    layers::{BatchNorm, Layer},
    model::{Model, ModuleId, RebindError},
    tensor::Tensor,
};

use super::{
    FoldPosition, FoldedPair,
    scaling::{ClsSetInfo, ClsSetLayerPairInfo, layer_params},
};

fn has_bias(layer: &Layer) -> bool {
    match layer {
        Layer::Convolution(conv) => conv.bias.is_some(),
        Layer::Dense(dense) => dense.bias.is_some(),
        _ => false,
    }
}

fn set_bias(layer: &mut Layer, bias: Option<Vec<f32>>) {
    let bias = bias.map(|b| Tensor::new(vec![b.len()], b));
    match layer {
        Layer::Convolution(conv) => conv.bias = bias,
        Layer::Dense(dense) => dense.bias = bias,
        _ => {}
    }
}

/// Batchnorms folded into the output of a layer, keyed by that layer's name
fn output_batchnorms<'a>(
    model: &'a Model,
    folded_pairs: &[FoldedPair],
) -> Result<HashMap<String, &'a BatchNorm>> {
    let mut map = HashMap::new();
    for pair in folded_pairs
        .iter()
        .filter(|p| p.position == FoldPosition::Output)
    {
        let id = pair.bn.resolve_in(model)?;
        let module = model
            .module(id)
            .ok_or(RebindError::UnknownId(id))?;
        match &module.layer {
            Layer::BatchNorm(bn) => {
                map.insert(pair.conv.name.clone(), bn);
            }
            other => {
                return Err(anyhow!(
                    "folded batchnorm '{}' is now a {other}",
                    pair.bn.name
                ));
            }
        }
    }
    Ok(map)
}

fn fold_pair(
    model: &mut Model,
    pair: &ClsSetLayerPairInfo,
    bn: &BatchNorm,
    prev: ModuleId,
    curr: ModuleId,
) -> Result<()> {
    let scale = &pair.scale_factor;
    let bn_params = BnParamsHighBiasFold {
        gamma: bn
            .gamma
            .get_data()
            .iter()
            .zip(scale)
            .map(|(g, s)| g / s)
            .collect(),
        beta: bn
            .beta
            .get_data()
            .iter()
            .zip(scale)
            .map(|(b, s)| b / s)
            .collect(),
    };
    let marshal = |id: ModuleId, relu: bool| -> Result<LayerParams> {
        let module = model.module(id).ok_or(RebindError::UnknownId(id))?;
        let params = layer_params(&module.name, &module.layer)?;
        Ok(LayerParams {
            weight: params.weight,
            weight_shape: params.weight_shape,
            bias: params.bias,
            activation_is_relu: relu,
        })
    };
    let (prev_params, curr_params) = kernel::update_bias(
        marshal(prev, pair.relu_activation_between_layers)?,
        marshal(curr, false)?,
        &bn_params,
    )?;
    for (id, bias) in [(prev, prev_params.bias), (curr, curr_params.bias)] {
        let module = model.module_mut(id).ok_or(RebindError::UnknownId(id))?;
        set_bias(&mut module.layer, bias);
    }
    Ok(())
}

/// Applies high-bias fold to every layer pair of the scaled cls sets. Only pairs whose
/// first layer had a batchnorm folded into its output, and where both layers carry a
/// bias, are touched.
pub fn bias_fold(
    model: &Model,
    cls_set_infos: &[ClsSetInfo],
    folded_pairs: &[FoldedPair],
) -> Result<Model> {
    let batchnorms = output_batchnorms(model, folded_pairs)?;
    let mut folded = model.clone();
    if batchnorms.is_empty() {
        error!("no batchnorm was folded into the output of a layer, skipping high-bias fold");
        return Ok(folded);
    }

    let mut count = 0;
    for pair in cls_set_infos.iter().flat_map(|i| &i.cls_pair_info_list) {
        let Some(bn) = batchnorms.get(&pair.layer1.name) else {
            debug!("no batchnorm folded into '{}', skipping", pair.layer1.name);
            continue;
        };
        let prev = pair.layer1.resolve_in(model)?;
        let curr = pair.layer2.resolve_in(model)?;
        let biased = [prev, curr].iter().all(|id| {
            model
                .module(*id)
                .is_some_and(|m| has_bias(&m.layer))
        });
        if !biased {
            debug!(
                "'{}' -> '{}' lacks a bias, skipping",
                pair.layer1.name, pair.layer2.name
            );
            continue;
        }
        fold_pair(&mut folded, pair, bn, prev, curr)?;
        count += 1;
    }
    info!("high-bias fold updated {count} layer pair(s)");
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cle::ModuleRef,
        layers::Activation,
        testing::{random_conv, relative_error},
    };

    fn pair_model(relu: bool) -> Model {
        let mut layers = vec![("conv1", Layer::Convolution(random_conv(3, 2, 1, 0)))];
        if relu {
            layers.push(("relu", Layer::Activation(Activation::Relu)));
        }
        layers.push(("conv2", Layer::Convolution(random_conv(2, 3, 1, 1))));
        let mut model = Model::sequential("net", layers).unwrap();
        // the folded batchnorm stays registered without being invoked
        let bn = BatchNorm::new(
            vec![0.1, -0.2, 0.5],
            vec![10.0, 0.5, -4.0],
            vec![0.0; 3],
            vec![1.0; 3],
            1e-5,
        )
        .unwrap();
        model.add_module("bn1", Layer::BatchNorm(bn)).unwrap();
        model
    }

    fn infos(model: &Model, relu: bool) -> (Vec<ClsSetInfo>, Vec<FoldedPair>) {
        let conv1 = ModuleRef::new(model, model.module_id("conv1").unwrap()).unwrap();
        let conv2 = ModuleRef::new(model, model.module_id("conv2").unwrap()).unwrap();
        let bn = ModuleRef::new(model, model.module_id("bn1").unwrap()).unwrap();
        let info = ClsSetInfo {
            cls_pair_info_list: vec![ClsSetLayerPairInfo {
                layer1: conv1.clone(),
                layer2: conv2,
                scale_factor: vec![1.0; 3],
                relu_activation_between_layers: relu,
            }],
        };
        let folded = FoldedPair {
            conv: conv1,
            bn,
            position: FoldPosition::Output,
        };
        (vec![info], vec![folded])
    }

    fn bias(model: &Model, name: &str) -> Vec<f32> {
        match &model.module_by_name(name).unwrap().layer {
            Layer::Convolution(conv) => conv.bias.as_ref().unwrap().get_data().to_vec(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_without_batchnorms_model_is_unchanged() {
        let model = pair_model(false);
        let (infos, _) = infos(&model, false);
        let folded = bias_fold(&model, &infos, &[]).unwrap();
        assert_eq!(bias(&folded, "conv1"), bias(&model, "conv1"));
        assert_eq!(bias(&folded, "conv2"), bias(&model, "conv2"));
    }

    #[test]
    fn test_missing_bias_is_skipped() {
        let mut model = pair_model(false);
        let id = model.module_id("conv2").unwrap();
        if let Layer::Convolution(conv) = &mut model.module_mut(id).unwrap().layer {
            conv.bias = None;
        }
        let (infos, pairs) = infos(&model, false);
        let folded = bias_fold(&model, &infos, &pairs).unwrap();
        assert_eq!(bias(&folded, "conv1"), bias(&model, "conv1"));
    }

    #[test]
    fn test_linear_pair_moves_whole_beta() {
        let model = pair_model(false);
        let (infos, pairs) = infos(&model, false);
        let folded = bias_fold(&model, &infos, &pairs).unwrap();
        let before = bias(&model, "conv1");
        let after = bias(&folded, "conv1");
        for ((b, a), beta) in before.iter().zip(&after).zip([10.0, 0.5, -4.0]) {
            assert!((b - beta - a).abs() < 1e-5);
        }
        // nothing sits between the layers, so the function is unchanged
        let input = Tensor::random_seeded(vec![1, 2, 3, 3], 4);
        let expected = model.forward(&[input.clone()]).unwrap();
        let got = folded.forward(&[input]).unwrap();
        assert!(relative_error(&got[0], &expected[0]) < 1e-4);
    }

    #[test]
    fn test_relu_pair_moves_only_the_safe_part() {
        let model = pair_model(true);
        let (infos, pairs) = infos(&model, true);
        let folded = bias_fold(&model, &infos, &pairs).unwrap();
        let before = bias(&model, "conv1");
        let after = bias(&folded, "conv1");
        // max(0, beta - 3 |gamma|) per channel
        let absorbed = [10.0 - 0.3, 0.0, 0.0];
        for ((b, a), moved) in before.iter().zip(&after).zip(absorbed) {
            assert!((b - moved - a).abs() < 1e-5);
        }
    }

    #[test]
    fn test_stale_name_is_reported() {
        let model = pair_model(false);
        let (mut infos, pairs) = infos(&model, false);
        infos[0].cls_pair_info_list[0].layer2.name = "gone".to_string();
        let err = bias_fold(&model, &infos, &pairs).unwrap_err();
        assert_eq!(
            err.downcast_ref::<RebindError>(),
            Some(&RebindError::MissingName("gone".to_string()))
        );
    }
}
