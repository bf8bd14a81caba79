use std::fmt;

use serde::{Deserialize, Serialize};

use crate::layers::{Activation, Layer, Pooling, Reshape};

/// Closed set of operation kinds the pattern passes reason about
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpKind {
    Conv,
    DepthwiseConv,
    /// Grouped convolution that is not depthwise
    GroupedConv,
    Linear,
    BatchNorm,
    Relu,
    Relu6,
    PRelu,
    Sigmoid,
    Tanh,
    Pad,
    Identity,
    Dropout,
    Add,
    Concat,
    Flatten,
    Reshape,
    MaxPool,
    AvgPool,
    GlobalAvgPool,
    /// Pseudo operation materialized where an output fans out to several consumers
    Split,
}

impl OpKind {
    pub fn of(layer: &Layer) -> Self {
        match layer {
            Layer::Convolution(conv) if conv.is_depthwise() => OpKind::DepthwiseConv,
            Layer::Convolution(conv) if conv.groups > 1 => OpKind::GroupedConv,
            Layer::Convolution(_) => OpKind::Conv,
            Layer::Dense(_) => OpKind::Linear,
            Layer::BatchNorm(_) => OpKind::BatchNorm,
            Layer::Activation(Activation::Relu) => OpKind::Relu,
            Layer::Activation(Activation::Relu6) => OpKind::Relu6,
            Layer::Activation(Activation::PRelu(_)) => OpKind::PRelu,
            Layer::Activation(Activation::Sigmoid) => OpKind::Sigmoid,
            Layer::Activation(Activation::Tanh) => OpKind::Tanh,
            Layer::Pad(_) => OpKind::Pad,
            Layer::Identity => OpKind::Identity,
            Layer::Dropout(_) => OpKind::Dropout,
            Layer::Add(_) => OpKind::Add,
            Layer::Concat(_) => OpKind::Concat,
            Layer::Reshape(Reshape::Flatten { .. }) => OpKind::Flatten,
            Layer::Reshape(Reshape::Reshape { .. }) => OpKind::Reshape,
            Layer::Pooling(Pooling::Max(_)) => OpKind::MaxPool,
            Layer::Pooling(Pooling::Average(_)) => OpKind::AvgPool,
            Layer::Pooling(Pooling::GlobalAverage) => OpKind::GlobalAvgPool,
        }
    }

    /// Tag used in operation names, e.g. `convolution_3`
    pub fn type_tag(&self) -> &'static str {
        match self {
            OpKind::Conv => "convolution",
            OpKind::DepthwiseConv => "depthwise_convolution",
            OpKind::GroupedConv => "grouped_convolution",
            OpKind::Linear => "linear",
            OpKind::BatchNorm => "batch_norm",
            OpKind::Relu => "relu",
            OpKind::Relu6 => "relu6",
            OpKind::PRelu => "prelu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Pad => "pad",
            OpKind::Identity => "identity",
            OpKind::Dropout => "dropout",
            OpKind::Add => "add",
            OpKind::Concat => "cat",
            OpKind::Flatten => "flatten",
            OpKind::Reshape => "reshape",
            OpKind::MaxPool => "max_pool",
            OpKind::AvgPool => "avg_pool",
            OpKind::GlobalAvgPool => "global_avg_pool",
            OpKind::Split => "Split",
        }
    }

    /// Layers carrying a weight that batchnorm fold and scaling can rewrite
    pub fn is_conv_or_linear(&self) -> bool {
        matches!(
            self,
            OpKind::Conv | OpKind::DepthwiseConv | OpKind::GroupedConv | OpKind::Linear
        )
    }

    pub fn is_activation(&self) -> bool {
        matches!(
            self,
            OpKind::Relu | OpKind::Relu6 | OpKind::PRelu | OpKind::Sigmoid | OpKind::Tanh
        )
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_tag())
    }
}
