//! Cross-layer equalization: batchnorm fold, cross-layer scaling and high-bias fold.
//!
//! Each pass consumes a model and hands back a fresh snapshot together with the
//! [`Relocation`] mapping the modules it was given onto the new snapshot. References kept
//! across passes are [`ModuleRef`]s and must be rebound before they are used again.
pub mod bn_fold;
pub mod conv_bn;
pub mod high_bias_fold;
pub mod layer_groups;
pub mod scaling;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    graph::GraphBounds,
    model::{Model, ModuleId, RebindError, Relocation},
    tensor::Shape,
};

pub use bn_fold::{FoldPosition, FoldedPair, fold_all_batch_norms, replace_relu6_with_relu};
pub use conv_bn::{ActivationType, ConvBnInfo, ConvBnPatternHandler};
pub use high_bias_fold::bias_fold;
pub use layer_groups::{ClsSet, find_layer_groups_to_scale};
pub use scaling::{ClsSetInfo, ClsSetLayerPairInfo, ScaleFactor, scale_cls_set, scale_model};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CleError {
    #[error(
        "layer '{name}' ({layer}) cannot be equalized, only convolutions, depthwise convolutions and linear layers can"
    )]
    UnsupportedLayer { name: String, layer: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("structural error: {0}")]
    Structural(String),
}

/// Reference to a module that survives snapshots through its name
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    pub id: ModuleId,
    pub name: String,
}

impl ModuleRef {
    pub fn new(model: &Model, id: ModuleId) -> Result<Self> {
        let module = model
            .module(id)
            .ok_or_else(|| CleError::Structural(format!("module {id} does not exist")))?;
        Ok(Self {
            id,
            name: module.name.clone(),
        })
    }

    pub fn rebind(&mut self, relocation: &Relocation) -> Result<(), RebindError> {
        self.id = relocation.resolve(&self.name)?;
        Ok(())
    }

    /// The id of the referenced module in `model`, looked up by name
    pub fn resolve_in(&self, model: &Model) -> Result<ModuleId, RebindError> {
        model
            .module_id(&self.name)
            .ok_or_else(|| RebindError::MissingName(self.name.clone()))
    }
}

/// Output of a pass producing a new snapshot
pub struct Rewritten<T> {
    pub model: Model,
    pub relocation: Relocation,
    pub result: T,
}

/// One or several module names bounding the equalized region
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpNames {
    Single(String),
    Many(Vec<String>),
}

impl OpNames {
    /// Parses names given as a JSON string or array of strings
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CleError> {
        serde_json::from_value(value.clone()).map_err(|_| {
            CleError::InvalidInput(format!(
                "operation names must be a string or a list of strings, got {value}"
            ))
        })
    }

    pub fn validate(&self) -> Result<Vec<String>, CleError> {
        let names = match self {
            OpNames::Single(name) => vec![name.clone()],
            OpNames::Many(names) => names.clone(),
        };
        if names.is_empty() {
            return Err(CleError::InvalidInput(
                "the list of operation names is empty".to_string(),
            ));
        }
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(CleError::InvalidInput(
                "operation names cannot be empty".to_string(),
            ));
        }
        Ok(names)
    }
}

impl From<&str> for OpNames {
    fn from(name: &str) -> Self {
        OpNames::Single(name.to_string())
    }
}

impl From<Vec<String>> for OpNames {
    fn from(names: Vec<String>) -> Self {
        OpNames::Many(names)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CleReport {
    pub folded_pairs: Vec<FoldedPair>,
    pub cls_set_infos: Vec<ClsSetInfo>,
}

/// Runs the whole equalization pipeline on a model
#[derive(Clone, Debug)]
pub struct Equalizer {
    input_shapes: Vec<Shape>,
    start_ops: Option<OpNames>,
    output_ops: Option<OpNames>,
}

impl Equalizer {
    pub fn new(input_shapes: Vec<Shape>) -> Self {
        Self {
            input_shapes,
            start_ops: None,
            output_ops: None,
        }
    }

    pub fn with_start_ops(mut self, names: impl Into<OpNames>) -> Self {
        self.start_ops = Some(names.into());
        self
    }

    pub fn with_output_ops(mut self, names: impl Into<OpNames>) -> Self {
        self.output_ops = Some(names.into());
        self
    }

    fn bounds(&self) -> Result<GraphBounds, CleError> {
        let names = |ops: &Option<OpNames>| ops.as_ref().map(OpNames::validate).transpose();
        Ok(GraphBounds {
            start_modules: names(&self.start_ops)?.unwrap_or_default(),
            output_modules: names(&self.output_ops)?.unwrap_or_default(),
        })
    }

    /// Batchnorm fold, ReLU6 replacement, cross-layer scaling then high-bias fold
    pub fn equalize(&self, model: &Model) -> Result<(Model, CleReport)> {
        let bounds = self.bounds()?;

        let folded = fold_all_batch_norms(model, &self.input_shapes, &bounds)?;
        let mut folded_pairs = folded.result;
        let mut model = folded.model;

        let replaced = replace_relu6_with_relu(&mut model);
        info!("replaced {replaced} ReLU6 activation(s) with ReLU");

        let scaled = scale_model(&model, &self.input_shapes, &bounds)?;
        for pair in folded_pairs.iter_mut() {
            pair.rebind(&scaled.relocation)?;
        }
        let cls_set_infos = scaled.result;

        let model = bias_fold(&scaled.model, &cls_set_infos, &folded_pairs)?;
        info!(
            "equalized '{}': {} batchnorm(s) folded, {} cls set(s) scaled",
            model.name(),
            folded_pairs.len(),
            cls_set_infos.len()
        );
        Ok((
            model,
            CleReport {
                folded_pairs,
                cls_set_infos,
            },
        ))
    }
}

/// Equalizes the whole model for the given input shapes
pub fn equalize_model(model: &Model, input_shapes: &[Shape]) -> Result<(Model, CleReport)> {
    Equalizer::new(input_shapes.to_vec()).equalize(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::{Activation, BatchNorm, Layer},
        testing::{conv_bn_relu_chain, depthwise_separable_block, random_conv, relative_error},
        tensor::Tensor,
    };

    fn conv_bias(model: &Model, name: &str) -> Vec<f32> {
        match &model.module_by_name(name).unwrap().layer {
            Layer::Convolution(conv) => conv.bias.as_ref().unwrap().get_data().to_vec(),
            other => panic!("'{name}' is a {other}"),
        }
    }

    #[test]
    fn test_names_are_validated_before_any_graph_work() {
        let model = conv_bn_relu_chain(0);
        let err = Equalizer::new(vec![vec![1, 3, 8, 8]])
            .with_start_ops(Vec::<String>::new())
            .equalize(&model)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CleError>(),
            Some(CleError::InvalidInput(_))
        ));
        assert!(OpNames::from("").validate().is_err());
        assert!(OpNames::from_json(&serde_json::json!(12)).is_err());
        assert_eq!(
            OpNames::from_json(&serde_json::json!(["conv1", "conv2"])).unwrap(),
            OpNames::Many(vec!["conv1".to_string(), "conv2".to_string()])
        );
    }

    #[test]
    fn test_equalize_chain_preserves_function() {
        let model = conv_bn_relu_chain(3);
        let input = Tensor::random_seeded(vec![2, 3, 8, 8], 42);
        let expected = model.forward(&[input.clone()]).unwrap();

        let (equalized, report) = equalize_model(&model, &[vec![2, 3, 8, 8]]).unwrap();
        assert_eq!(report.folded_pairs.len(), 2);
        assert_eq!(report.cls_set_infos.len(), 1);
        let pair = &report.cls_set_infos[0].cls_pair_info_list[0];
        assert!(pair.relu_activation_between_layers);
        assert_eq!(pair.layer1.name, "conv1");
        assert_eq!(equalized.module(pair.layer1.id).unwrap().name, "conv1");
        for folded in &report.folded_pairs {
            assert_eq!(equalized.module(folded.bn.id).unwrap().name, folded.bn.name);
        }

        // batchnorm nodes are gone, their modules stay addressable
        assert_eq!(equalized.nodes().len(), 3);
        assert!(equalized.module_by_name("bn1").is_some());

        // gammas are larger than a third of the betas, so nothing moves across the ReLU
        // and the equalized model computes the same function
        let got = equalized.forward(&[input]).unwrap();
        assert!(relative_error(&got[0], &expected[0]) < 1e-4);
    }

    #[test]
    fn test_equalize_depthwise_block() {
        let model = depthwise_separable_block(5);
        let (equalized, report) = equalize_model(&model, &[vec![1, 3, 6, 6]]).unwrap();
        assert_eq!(report.folded_pairs.len(), 4);
        assert_eq!(report.cls_set_infos.len(), 1);
        assert_eq!(report.cls_set_infos[0].cls_pair_info_list.len(), 2);
        assert!(
            equalized
                .modules()
                .all(|(_, m)| {
                    !matches!(m.layer, Layer::Activation(crate::layers::Activation::Relu6))
                })
        );
        let input = Tensor::random_seeded(vec![1, 3, 6, 6], 9);
        assert_eq!(equalized.forward(&[input]).unwrap()[0].shape(), &[1, 5]);
    }

    #[test]
    fn test_equalize_folds_high_bias_into_next_layer() {
        // conv1 outputs stay within 28 in magnitude, so with a standard deviation of 10
        // the normalized values never drop below -3 and the ReLU never clips what moves
        let gamma = vec![0.5, -0.4, 0.8, 0.6];
        let beta = vec![6.0, 5.0, 0.2, 8.0];
        let bn = BatchNorm::new(gamma.clone(), beta.clone(), vec![0.0; 4], vec![100.0; 4], 0.0)
            .unwrap();
        let model = Model::sequential(
            "net",
            [
                ("conv1", Layer::Convolution(random_conv(4, 3, 3, 11))),
                ("bn1", Layer::BatchNorm(bn)),
                ("relu1", Layer::Activation(Activation::Relu)),
                ("conv2", Layer::Convolution(random_conv(2, 4, 1, 12))),
            ],
        )
        .unwrap();
        let shapes = vec![vec![2, 3, 5, 5]];

        let (equalized, report) = Equalizer::new(shapes.clone()).equalize(&model).unwrap();
        assert_eq!(report.folded_pairs.len(), 1);
        assert_eq!(report.cls_set_infos.len(), 1);
        let pair = &report.cls_set_infos[0].cls_pair_info_list[0];
        assert!(pair.relu_activation_between_layers);

        // the same model right before high-bias fold
        let folded = fold_all_batch_norms(&model, &shapes, &GraphBounds::default()).unwrap();
        let scaled = scale_model(&folded.model, &shapes, &GraphBounds::default()).unwrap();
        let before = conv_bias(&scaled.model, "conv1");
        let after = conv_bias(&equalized, "conv1");

        let mut moved_any = false;
        for (c, s) in pair.scale_factor.iter().enumerate() {
            let absorbed = (beta[c] / s - 3.0 * (gamma[c] / s).abs()).max(0.0);
            moved_any |= absorbed > 0.0;
            assert!(
                (before[c] - after[c] - absorbed).abs() < 1e-4 * absorbed.max(1.0),
                "channel {c}: {} -> {}, expected a shrink of {absorbed}",
                before[c],
                after[c]
            );
        }
        assert!(moved_any);
        assert_ne!(conv_bias(&equalized, "conv2"), conv_bias(&scaled.model, "conv2"));

        let input = Tensor::random_seeded(shapes[0].clone(), 13);
        let expected = model.forward(&[input.clone()]).unwrap();
        let got = equalized.forward(&[input]).unwrap();
        assert!(relative_error(&got[0], &expected[0]) < 1e-4);
    }

    #[test]
    fn test_equalize_keeps_intermediate_model_outputs() {
        let mut model = Model::new("net");
        let x = model.add_input();
        let conv1 = model
            .add_module("conv1", Layer::Convolution(random_conv(4, 3, 3, 0)))
            .unwrap();
        let bn1 = model
            .add_module("bn1", Layer::BatchNorm(crate::testing::random_bn(4, 1)))
            .unwrap();
        let relu = model
            .add_module("relu1", Layer::Activation(Activation::Relu))
            .unwrap();
        let conv2 = model
            .add_module("conv2", Layer::Convolution(random_conv(2, 4, 1, 2)))
            .unwrap();
        let c1 = model.call(conv1, vec![x]).unwrap();
        let b1 = model.call(bn1, vec![c1]).unwrap();
        let r1 = model.call(relu, vec![b1]).unwrap();
        let c2 = model.call(conv2, vec![r1.clone()]).unwrap();
        model.set_outputs(vec![r1, c2]);

        let shapes = vec![vec![1, 3, 5, 5]];
        let (equalized, report) = equalize_model(&model, &shapes).unwrap();
        // the tapped ReLU ends the layer group, so conv1 is never rescaled
        assert_eq!(report.folded_pairs.len(), 1);
        assert!(report.cls_set_infos.is_empty());

        let input = Tensor::random_seeded(shapes[0].clone(), 3);
        let expected = model.forward(&[input.clone()]).unwrap();
        let got = equalized.forward(&[input]).unwrap();
        assert_eq!(got.len(), 2);
        for (g, e) in got.iter().zip(&expected) {
            assert!(relative_error(g, e) < 1e-4);
        }
    }
}
