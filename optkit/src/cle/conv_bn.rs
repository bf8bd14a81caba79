//! Associates every convolution and linear layer with the batchnorms and activations
//! directly around it.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    graph::{ConnectedGraph, GraphSearcher, OpId, OpKind, Operation, PatternHandler, PatternType},
    model::ModuleId,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationType {
    #[default]
    NoActivation,
    Relu,
    Relu6,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConvBnInfo {
    pub conv: OpId,
    pub input_bn: Option<OpId>,
    pub output_bn: Option<OpId>,
    pub in_activation_type: ActivationType,
    pub out_activation_type: ActivationType,
}

impl ConvBnInfo {
    fn new(conv: OpId) -> Self {
        Self {
            conv,
            input_bn: None,
            output_bn: None,
            in_activation_type: ActivationType::NoActivation,
            out_activation_type: ActivationType::NoActivation,
        }
    }
}

/// Records batchnorm/activation neighbours of conv and linear layers, one match at a time.
/// Records are keyed by module so that separate matches around the same layer merge.
#[derive(Debug, Default)]
pub struct ConvBnPatternHandler {
    conv_linear_with_bn: BTreeMap<ModuleId, ConvBnInfo>,
}

impl ConvBnPatternHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_records(self) -> BTreeMap<ModuleId, ConvBnInfo> {
        self.conv_linear_with_bn
    }
}

impl PatternHandler for ConvBnPatternHandler {
    fn handle(&mut self, _pattern: &PatternType, ops: &[&Operation]) {
        let mut conv = None;
        let mut bn = None;
        let mut activation = ActivationType::NoActivation;
        for op in ops {
            match op.kind() {
                kind if kind.is_conv_or_linear() => conv = Some(*op),
                OpKind::BatchNorm => bn = Some(op.id()),
                OpKind::Relu6 => activation = ActivationType::Relu6,
                OpKind::Relu => activation = ActivationType::Relu,
                _ => {}
            }
        }
        // functional convolutions have no module to fold into
        let Some((conv, module)) = conv.and_then(|op| op.module().map(|m| (op, m))) else {
            return;
        };
        let mut info = self
            .conv_linear_with_bn
            .get(&module)
            .cloned()
            .unwrap_or_else(|| ConvBnInfo::new(conv.id()));
        let leading = ops[0].kind();
        if leading == OpKind::BatchNorm {
            info.input_bn = bn;
            info.in_activation_type = activation;
        } else if leading.is_conv_or_linear() {
            info.output_bn = bn;
            info.out_activation_type = activation;
        } else if ops.len() >= 3 && ops[1].kind() == OpKind::Linear {
            info.output_bn = bn;
            info.out_activation_type = activation;
        }
        self.conv_linear_with_bn.insert(module, info);
    }
}

/// Patterns a batchnorm can be folded along
pub fn fold_patterns() -> Vec<PatternType> {
    let conv_like = [
        OpKind::Conv,
        OpKind::DepthwiseConv,
        OpKind::GroupedConv,
        OpKind::Linear,
    ];
    let input_foldable = [OpKind::Conv, OpKind::DepthwiseConv];
    let activations = [OpKind::Relu, OpKind::Relu6];
    let bn = [OpKind::BatchNorm];
    let reshapes = [OpKind::Flatten, OpKind::Reshape];
    let linear = [OpKind::Linear];
    [
        PatternType::expand(&[&conv_like, &bn]),
        PatternType::expand(&[&conv_like, &bn, &activations]),
        PatternType::expand(&[&bn, &input_foldable]),
        PatternType::expand(&[&bn, &activations, &input_foldable]),
        PatternType::expand(&[&reshapes, &linear, &bn]),
        PatternType::expand(&[&reshapes, &linear, &bn, &activations]),
    ]
    .concat()
}

pub fn find_all_conv_bn_with_activation(graph: &ConnectedGraph) -> BTreeMap<ModuleId, ConvBnInfo> {
    let mut handler = ConvBnPatternHandler::new();
    GraphSearcher::new(graph, fold_patterns())
        .find_all_patterns_in_graph_apply_actions(&mut handler);
    handler.into_records()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::{Activation, Layer, Reshape},
        model::Model,
        testing::{conv_bn_relu_chain, random_bn, random_conv, random_dense},
    };

    #[test]
    fn test_chain_records() {
        let model = conv_bn_relu_chain(0);
        let graph = ConnectedGraph::build(&model, &[vec![1, 3, 8, 8]]).unwrap();
        let records = find_all_conv_bn_with_activation(&graph);
        assert_eq!(records.len(), 2);

        let conv1 = &records[&model.module_id("conv1").unwrap()];
        assert_eq!(graph.op(conv1.output_bn.unwrap()).dotted_name(), "chain.bn1");
        assert_eq!(conv1.out_activation_type, ActivationType::Relu);
        assert_eq!(conv1.input_bn, None);

        // bn1 is followed by a relu, so it is not recorded as input of conv2
        let conv2 = &records[&model.module_id("conv2").unwrap()];
        assert_eq!(conv2.input_bn, None);
        assert_eq!(graph.op(conv2.output_bn.unwrap()).dotted_name(), "chain.bn2");
        assert_eq!(conv2.out_activation_type, ActivationType::NoActivation);
    }

    #[test]
    fn test_input_and_output_records_merge() {
        let model = Model::sequential(
            "net",
            [
                ("bn0", Layer::BatchNorm(random_bn(3, 0))),
                ("conv", Layer::Convolution(random_conv(4, 3, 1, 1))),
                ("bn1", Layer::BatchNorm(random_bn(4, 2))),
                ("relu6", Layer::Activation(Activation::Relu6)),
            ],
        )
        .unwrap();
        let graph = ConnectedGraph::build(&model, &[vec![1, 3, 4, 4]]).unwrap();
        let records = find_all_conv_bn_with_activation(&graph);
        let conv = &records[&model.module_id("conv").unwrap()];
        assert_eq!(graph.op(conv.input_bn.unwrap()).dotted_name(), "net.bn0");
        assert_eq!(conv.in_activation_type, ActivationType::NoActivation);
        assert_eq!(graph.op(conv.output_bn.unwrap()).dotted_name(), "net.bn1");
        assert_eq!(conv.out_activation_type, ActivationType::Relu6);
    }

    #[test]
    fn test_flatten_dense_idiom() {
        let model = Model::sequential(
            "net",
            [
                ("flatten", Layer::Reshape(Reshape::Flatten { axis: 1 })),
                ("fc", Layer::Dense(random_dense(3, 8, 0))),
                ("bn", Layer::BatchNorm(random_bn(3, 1))),
            ],
        )
        .unwrap();
        let graph = ConnectedGraph::build(&model, &[vec![1, 2, 2, 2]]).unwrap();
        let records = find_all_conv_bn_with_activation(&graph);
        let fc = &records[&model.module_id("fc").unwrap()];
        assert_eq!(graph.op(fc.output_bn.unwrap()).dotted_name(), "net.bn");
    }
}
