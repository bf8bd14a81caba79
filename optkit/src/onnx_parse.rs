//! Import of float ONNX models into a [`Model`].
//!
//! Every node with learnable or configurable state becomes a named module, `Add` and
//! `Concat` become functional calls. Initializers feeding a node are folded into its layer.
use std::{collections::HashMap, path::Path};

use anyhow::{Context, Error, Result, bail, ensure};
use itertools::Itertools;
use tracing::{debug, info};
use tract_onnx::{
    pb::{AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto, tensor_proto::DataType},
    prelude::Framework,
};

use crate::{
    layers::{
        Activation, Add, BatchNorm, Concat, Convolution, Dense, KernelFormat, Layer, Pad,
        Pooling, Reshape, batchnorm::DEFAULT_EPSILON, pooling::Window,
    },
    model::{Edge, Model},
    tensor::Tensor,
};

// Supported operators
const ACTIVATION: [&str; 5] = ["Relu", "Clip", "PRelu", "Sigmoid", "Tanh"];
const CONVOLUTION: [&str; 1] = ["Conv"];
const DOWNSAMPLING: [&str; 3] = ["MaxPool", "AveragePool", "GlobalAveragePool"];
const LINEAR_ALG: [&str; 2] = ["Gemm", "MatMul"];
const NORMALIZATION: [&str; 1] = ["BatchNormalization"];
const RESHAPE: [&str; 2] = ["Flatten", "Reshape"];
const PASSTHROUGH: [&str; 3] = ["Pad", "Identity", "Dropout"];
const FUNCTIONAL: [&str; 2] = ["Add", "Concat"];

fn is_supported(op_type: &str) -> bool {
    let groups: [&[&str]; 8] = [
        &ACTIVATION,
        &CONVOLUTION,
        &DOWNSAMPLING,
        &LINEAR_ALG,
        &NORMALIZATION,
        &RESHAPE,
        &PASSTHROUGH,
        &FUNCTIONAL,
    ];
    groups.iter().any(|ops| ops.contains(&op_type))
}

/// Decoded constant, either float values or integer values depending on its data type
#[derive(Clone, Debug)]
struct Initializer {
    dims: Vec<usize>,
    floats: Vec<f32>,
    ints: Vec<i64>,
}

impl Initializer {
    fn from_proto(proto: &TensorProto) -> Result<Self> {
        let dims = proto
            .dims
            .iter()
            .map(|d| usize::try_from(*d).context("negative initializer dimension"))
            .collect::<Result<Vec<_>>>()?;
        let (mut floats, mut ints) = (vec![], vec![]);
        if proto.data_type == DataType::Float as i32 {
            floats = if proto.float_data.is_empty() {
                decode_raw::<4, f32>(&proto.raw_data, f32::from_le_bytes)
            } else {
                proto.float_data.clone()
            };
        } else if proto.data_type == DataType::Int64 as i32 {
            ints = if proto.int64_data.is_empty() {
                decode_raw::<8, i64>(&proto.raw_data, i64::from_le_bytes)
            } else {
                proto.int64_data.clone()
            };
        } else {
            bail!(
                "initializer '{}' has unsupported data type {}",
                proto.name,
                proto.data_type
            );
        }
        let len = floats.len().max(ints.len());
        ensure!(
            dims.iter().product::<usize>() == len,
            "initializer '{}' has dims {dims:?} but {len} values",
            proto.name
        );
        Ok(Self { dims, floats, ints })
    }

    fn tensor(&self, name: &str) -> Result<Tensor<f32>> {
        ensure!(
            !self.floats.is_empty() || self.dims.iter().product::<usize>() == 0,
            "initializer '{name}' is not a float tensor"
        );
        Ok(Tensor::new(self.dims.clone(), self.floats.clone()))
    }
}

fn decode_raw<const N: usize, T>(raw: &[u8], from_bytes: fn([u8; N]) -> T) -> Vec<T> {
    raw.chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            from_bytes(bytes)
        })
        .collect()
}

fn get_attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|a| a.name == name)
}

fn attr_int(node: &NodeProto, name: &str, default: i64) -> i64 {
    get_attr(node, name).map_or(default, |a| a.i)
}

fn attr_float(node: &NodeProto, name: &str, default: f32) -> f32 {
    get_attr(node, name).map_or(default, |a| a.f)
}

fn attr_ints(node: &NodeProto, name: &str) -> Vec<i64> {
    get_attr(node, name).map_or_else(Vec::new, |a| a.ints.clone())
}

fn to_usize(values: &[i64], what: &str) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|v| usize::try_from(*v).with_context(|| format!("negative {what}: {values:?}")))
        .collect()
}

fn pair(values: &[i64], default: usize, what: &str) -> Result<[usize; 2]> {
    match to_usize(values, what)?.as_slice() {
        [] => Ok([default; 2]),
        [h, w] => Ok([*h, *w]),
        other => bail!("{what} must have two values, got {other:?}"),
    }
}

/// ONNX spatial pads `[h_begin, w_begin, h_end, w_end]`, which is also `[t, l, b, r]`
fn spatial_pads(node: &NodeProto) -> Result<[usize; 4]> {
    match to_usize(&attr_ints(node, "pads"), "pads")?.as_slice() {
        [] => Ok([0; 4]),
        [t, l, b, r] => Ok([*t, *l, *b, *r]),
        other => bail!("pads must have four values, got {other:?}"),
    }
}

fn check_auto_pad(node: &NodeProto) -> Result<()> {
    if let Some(attr) = get_attr(node, "auto_pad") {
        let mode = String::from_utf8_lossy(&attr.s);
        ensure!(
            mode.is_empty() || mode == "NOTSET",
            "node '{}': auto_pad {mode} is unsupported, pads must be explicit",
            node.name
        );
    }
    Ok(())
}

struct Importer<'a> {
    model: Model,
    edges: HashMap<String, Edge>,
    initializers: &'a HashMap<String, Initializer>,
}

impl Importer<'_> {
    fn initializer(&self, node: &NodeProto, position: usize) -> Result<Option<&Initializer>> {
        match node.input.get(position).filter(|name| !name.is_empty()) {
            None => Ok(None),
            Some(name) => self.initializers.get(name).map(Some).ok_or_else(|| {
                Error::msg(format!(
                    "node '{}' ({}): input {position} ('{name}') must be an initializer",
                    node.name, node.op_type
                ))
            }),
        }
    }

    fn required_tensor(&self, node: &NodeProto, position: usize) -> Result<Tensor<f32>> {
        let init = self.initializer(node, position)?.ok_or_else(|| {
            Error::msg(format!(
                "node '{}' ({}) is missing input {position}",
                node.name, node.op_type
            ))
        })?;
        init.tensor(&node.input[position])
    }

    fn optional_tensor(&self, node: &NodeProto, position: usize) -> Result<Option<Tensor<f32>>> {
        self.initializer(node, position)?
            .map(|init| init.tensor(&node.input[position]))
            .transpose()
    }

    fn optional_scalar(&self, node: &NodeProto, position: usize) -> Result<Option<f32>> {
        Ok(self
            .optional_tensor(node, position)?
            .and_then(|t| t.get_data().first().copied()))
    }

    /// Edges of the node inputs computed by the graph, initializers excluded
    fn data_inputs(&self, node: &NodeProto) -> Result<Vec<Edge>> {
        node.input
            .iter()
            .filter(|name| !name.is_empty() && !self.initializers.contains_key(*name))
            .map(|name| {
                self.edges.get(name).cloned().ok_or_else(|| {
                    Error::msg(format!(
                        "node '{}' reads '{name}' before it is produced",
                        node.name
                    ))
                })
            })
            .collect()
    }

    fn layer(&self, node: &NodeProto) -> Result<Layer> {
        let layer = match node.op_type.as_str() {
            "Conv" => Layer::Convolution(self.convolution(node)?),
            "Gemm" => Layer::Dense(self.gemm(node)?),
            "MatMul" => {
                let weight = self.required_tensor(node, 1)?;
                ensure!(weight.rank() == 2, "MatMul weight must be 2D");
                Layer::Dense(Dense::new(weight.permute(&[1, 0])?, None)?)
            }
            "BatchNormalization" => {
                let vector = |position| -> Result<Vec<f32>> {
                    self.required_tensor(node, position).map(Tensor::into_data)
                };
                Layer::BatchNorm(BatchNorm::new(
                    vector(1)?,
                    vector(2)?,
                    vector(3)?,
                    vector(4)?,
                    attr_float(node, "epsilon", DEFAULT_EPSILON),
                )?)
            }
            "Relu" => Layer::Activation(Activation::Relu),
            "Clip" => Layer::Activation(self.clip(node)?),
            "PRelu" => {
                let slope = self.required_tensor(node, 1)?;
                let len = slope.len();
                Layer::Activation(Activation::PRelu(slope.reshape(vec![len])?))
            }
            "Sigmoid" => Layer::Activation(Activation::Sigmoid),
            "Tanh" => Layer::Activation(Activation::Tanh),
            "MaxPool" | "AveragePool" => {
                check_auto_pad(node)?;
                let window = Window {
                    kernel: pair(&attr_ints(node, "kernel_shape"), 1, "kernel_shape")?,
                    stride: pair(&attr_ints(node, "strides"), 1, "strides")?,
                    padding: spatial_pads(node)?,
                };
                if node.op_type == "MaxPool" {
                    Layer::Pooling(Pooling::Max(window))
                } else {
                    Layer::Pooling(Pooling::Average(window))
                }
            }
            "GlobalAveragePool" => Layer::Pooling(Pooling::GlobalAverage),
            "Flatten" => {
                let axis = usize::try_from(attr_int(node, "axis", 1))
                    .context("Flatten with a negative axis is unsupported")?;
                Layer::Reshape(Reshape::Flatten { axis })
            }
            "Reshape" => {
                let shape = self
                    .initializer(node, 1)?
                    .map(|init| init.ints.clone())
                    .filter(|ints| !ints.is_empty())
                    .ok_or_else(|| Error::msg("Reshape needs a constant int64 shape"))?;
                Layer::Reshape(Reshape::Reshape { shape })
            }
            "Pad" => Layer::Pad(self.pad(node)?),
            "Identity" => Layer::Identity,
            "Dropout" => Layer::Dropout(
                self.optional_scalar(node, 1)?
                    .unwrap_or_else(|| attr_float(node, "ratio", 0.5)),
            ),
            "Add" => Layer::Add(Add),
            "Concat" => {
                let axis = usize::try_from(attr_int(node, "axis", 1))
                    .context("Concat with a negative axis is unsupported")?;
                Layer::Concat(Concat { axis })
            }
            other => bail!("Operator '{other}' unsupported, yet."),
        };
        Ok(layer)
    }

    fn convolution(&self, node: &NodeProto) -> Result<Convolution> {
        check_auto_pad(node)?;
        let dilations = attr_ints(node, "dilations");
        ensure!(
            dilations.iter().all(|d| *d == 1),
            "node '{}': dilated convolutions are unsupported",
            node.name
        );
        let groups = usize::try_from(attr_int(node, "group", 1)).context("negative group")?;
        Convolution::with_params(
            self.required_tensor(node, 1)?,
            self.optional_tensor(node, 2)?,
            KernelFormat::OIHW,
            pair(&attr_ints(node, "strides"), 1, "strides")?,
            spatial_pads(node)?,
            groups,
        )
    }

    /// `Y = alpha * A * B' + beta * C`, with `B` stored `[out, in]` once transposed
    fn gemm(&self, node: &NodeProto) -> Result<Dense> {
        ensure!(
            attr_int(node, "transA", 0) == 0,
            "node '{}': Gemm with transA is unsupported",
            node.name
        );
        let (alpha, beta) = (attr_float(node, "alpha", 1.0), attr_float(node, "beta", 1.0));
        let mut weight = self.required_tensor(node, 1)?;
        ensure!(weight.rank() == 2, "Gemm weight must be 2D");
        if attr_int(node, "transB", 0) == 0 {
            weight = weight.permute(&[1, 0])?;
        }
        let weight = weight.map(|w| w * alpha);
        let bias = self.optional_tensor(node, 2)?.map(|b| {
            let len = b.len();
            let b = b.map(|v| v * beta);
            Tensor::new(vec![len], b.into_data())
        });
        Dense::new(weight, bias)
    }

    fn clip(&self, node: &NodeProto) -> Result<Activation> {
        // Bounds moved from attributes to inputs in opset 11
        let min = match self.optional_scalar(node, 1)? {
            Some(min) => Some(min),
            None => get_attr(node, "min").map(|a| a.f),
        };
        let max = match self.optional_scalar(node, 2)? {
            Some(max) => Some(max),
            None => get_attr(node, "max").map(|a| a.f),
        };
        match (min, max) {
            (Some(min), Some(max)) if min == 0.0 && max == 6.0 => Ok(Activation::Relu6),
            (Some(min), None) if min == 0.0 => Ok(Activation::Relu),
            bounds => bail!(
                "node '{}': Clip with bounds {bounds:?} is unsupported",
                node.name
            ),
        }
    }

    fn pad(&self, node: &NodeProto) -> Result<Pad> {
        if let Some(mode) = get_attr(node, "mode") {
            let mode = String::from_utf8_lossy(&mode.s);
            ensure!(
                mode.is_empty() || mode == "constant",
                "node '{}': Pad mode {mode} is unsupported",
                node.name
            );
        }
        // Pads moved from attributes to inputs in opset 11
        let pads = match self.initializer(node, 1)? {
            Some(init) => init.ints.clone(),
            None => attr_ints(node, "pads"),
        };
        let pads = to_usize(&pads, "pads")?;
        let [n_b, c_b, t, l, n_e, c_e, b, r] = pads[..] else {
            bail!("Pad expects 8 values for a 4D input, got {pads:?}");
        };
        ensure!(
            n_b + c_b + n_e + c_e == 0,
            "node '{}': only spatial padding is supported",
            node.name
        );
        let value = match self.optional_scalar(node, 2)? {
            Some(value) => value,
            None => attr_float(node, "value", 0.0),
        };
        Ok(Pad {
            pads: [t, l, b, r],
            value,
        })
    }

    fn import_node(&mut self, index: usize, node: &NodeProto) -> Result<()> {
        let name = if node.name.is_empty() {
            format!("{}_{index}", node.op_type.to_lowercase())
        } else {
            node.name.clone()
        };
        let layer = self
            .layer(node)
            .with_context(|| format!("importing node '{name}' ({})", node.op_type))?;
        let inputs = self.data_inputs(node)?;
        let output = if FUNCTIONAL.contains(&node.op_type.as_str()) {
            ensure!(
                inputs.len() >= 2,
                "node '{name}' ({}) must combine graph tensors, not constants",
                node.op_type
            );
            self.model.call_function(layer, inputs)
        } else {
            let id = self.model.add_module(name.clone(), layer)?;
            self.model.call(id, inputs)?
        };
        debug!("imported {} node '{name}'", node.op_type);
        let produced = node
            .output
            .first()
            .ok_or_else(|| Error::msg(format!("node '{name}' has no output")))?;
        self.edges.insert(produced.clone(), output);
        Ok(())
    }
}

fn graph_of(proto: &ModelProto) -> Result<&GraphProto> {
    proto
        .graph
        .as_ref()
        .ok_or_else(|| Error::msg("ONNX model has no graph"))
}

/// Builds a model from a decoded ONNX protobuf
pub fn model_from_proto(proto: &ModelProto) -> Result<Model> {
    let graph = graph_of(proto)?;
    if let Some(node) = graph.node.iter().find(|n| !is_supported(&n.op_type)) {
        bail!("Operator '{}' unsupported, yet.", node.op_type);
    }
    let initializers = graph
        .initializer
        .iter()
        .map(|init| Ok((init.name.clone(), Initializer::from_proto(init)?)))
        .collect::<Result<HashMap<_, _>>>()?;

    let name = if graph.name.is_empty() {
        "onnx".to_string()
    } else {
        graph.name.clone()
    };
    let mut importer = Importer {
        model: Model::new(name),
        edges: HashMap::new(),
        initializers: &initializers,
    };
    for input in graph
        .input
        .iter()
        .filter(|i| !initializers.contains_key(&i.name))
    {
        let edge = importer.model.add_input();
        importer.edges.insert(input.name.clone(), edge);
    }
    for (index, node) in graph.node.iter().enumerate() {
        importer.import_node(index, node)?;
    }
    let outputs = graph
        .output
        .iter()
        .map(|o| {
            importer
                .edges
                .get(&o.name)
                .cloned()
                .ok_or_else(|| Error::msg(format!("graph output '{}' is never produced", o.name)))
        })
        .collect::<Result<Vec<_>>>()?;
    ensure!(!outputs.is_empty(), "ONNX graph has no outputs");
    let mut model = importer.model;
    model.set_outputs(outputs);
    info!(
        "imported ONNX graph '{}': {} nodes, {} modules, ops [{}]",
        model.name(),
        graph.node.len(),
        model.num_modules(),
        graph.node.iter().map(|n| n.op_type.as_str()).unique().join(", ")
    );
    Ok(model)
}

/// Loads an ONNX file as a float model
pub fn load_model(path: impl AsRef<Path>) -> Result<Model> {
    let path = path.as_ref();
    let proto = tract_onnx::onnx()
        .proto_model_for_path(path)
        .map_err(|e| Error::msg(format!("Failed to load model: {e:?}")))?;
    model_from_proto(&proto).with_context(|| format!("importing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use tract_onnx::pb::ValueInfoProto;

    use super::*;
    use crate::testing::random_vector;

    fn value(name: &str) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn floats(name: &str, dims: &[i64], data: Vec<f32>) -> TensorProto {
        TensorProto {
            name: name.to_string(),
            dims: dims.to_vec(),
            data_type: DataType::Float as i32,
            float_data: data,
            ..Default::default()
        }
    }

    fn raw_floats(name: &str, dims: &[i64], data: &[f32]) -> TensorProto {
        TensorProto {
            name: name.to_string(),
            dims: dims.to_vec(),
            data_type: DataType::Float as i32,
            raw_data: data.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ..Default::default()
        }
    }

    fn int_attr(name: &str, i: i64) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            i,
            ..Default::default()
        }
    }

    fn ints_attr(name: &str, ints: &[i64]) -> AttributeProto {
        AttributeProto {
            name: name.to_string(),
            ints: ints.to_vec(),
            ..Default::default()
        }
    }

    fn node(
        name: &str,
        op_type: &str,
        inputs: &[&str],
        output: &str,
        attribute: Vec<AttributeProto>,
    ) -> NodeProto {
        NodeProto {
            name: name.to_string(),
            op_type: op_type.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            attribute,
            ..Default::default()
        }
    }

    fn model_proto(
        nodes: Vec<NodeProto>,
        initializer: Vec<TensorProto>,
        inputs: &[&str],
        outputs: &[&str],
    ) -> ModelProto {
        ModelProto {
            graph: Some(GraphProto {
                name: "net".to_string(),
                node: nodes,
                initializer,
                input: inputs.iter().map(|i| value(i)).collect(),
                output: outputs.iter().map(|o| value(o)).collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// conv -> bn -> relu -> flatten -> gemm over a `[1, 2, 3, 3]` input
    fn conv_bn_gemm() -> ModelProto {
        let nodes = vec![
            node(
                "conv",
                "Conv",
                &["x", "conv.w", "conv.b"],
                "c",
                vec![ints_attr("pads", &[1, 1, 1, 1]), int_attr("group", 1)],
            ),
            node("bn", "BatchNormalization", &["c", "g", "b", "m", "v"], "n", vec![]),
            node("relu", "Relu", &["n"], "r", vec![]),
            node("flatten", "Flatten", &["r"], "f", vec![int_attr("axis", 1)]),
            node("fc", "Gemm", &["f", "fc.w", "fc.b"], "y", vec![int_attr("transB", 1)]),
        ];
        let initializers = vec![
            floats("conv.w", &[3, 2, 3, 3], random_vector(54, 1)),
            floats("conv.b", &[3], random_vector(3, 2)),
            floats("g", &[3], vec![1.0, 0.5, 2.0]),
            floats("b", &[3], vec![0.1, -0.2, 0.0]),
            floats("m", &[3], vec![0.0, 0.3, -0.1]),
            floats("v", &[3], vec![1.0, 0.25, 4.0]),
            raw_floats("fc.w", &[4, 27], &random_vector(108, 3)),
            floats("fc.b", &[4], random_vector(4, 4)),
        ];
        model_proto(nodes, initializers, &["x"], &["y"])
    }

    #[test]
    fn test_import_maps_nodes_to_modules() {
        let model = model_from_proto(&conv_bn_gemm()).unwrap();
        let names = model.modules().map(|(_, m)| m.name.clone()).collect_vec();
        assert_eq!(names, vec!["conv", "bn", "relu", "flatten", "fc"]);
        let Layer::Convolution(conv) = &model.module_by_name("conv").unwrap().layer else {
            panic!("conv is not a convolution");
        };
        assert_eq!(conv.padding, [1; 4]);
        let Layer::Dense(fc) = &model.module_by_name("fc").unwrap().layer else {
            panic!("fc is not dense");
        };
        assert_eq!((fc.out_features(), fc.in_features()), (4, 27));

        let out = model
            .forward(&[Tensor::random_seeded(vec![1, 2, 3, 3], 5)])
            .unwrap();
        assert_eq!(out[0].get_shape(), vec![1, 4]);
    }

    #[test]
    fn test_gemm_without_transpose_matches_matmul() {
        let w = random_vector(6, 7);
        let gemm = model_proto(
            vec![node("fc", "Gemm", &["x", "w"], "y", vec![])],
            vec![floats("w", &[3, 2], w.clone())],
            &["x"],
            &["y"],
        );
        let matmul = model_proto(
            vec![node("fc", "MatMul", &["x", "w"], "y", vec![])],
            vec![raw_floats("w", &[3, 2], &w)],
            &["x"],
            &["y"],
        );
        let x = Tensor::random_seeded(vec![2, 3], 8);
        let a = model_from_proto(&gemm).unwrap().forward(&[x.clone()]).unwrap();
        let b = model_from_proto(&matmul).unwrap().forward(&[x]).unwrap();
        assert_eq!(a[0].get_shape(), vec![2, 2]);
        assert!(a[0].max_abs_diff(&b[0]) < 1e-6);
    }

    #[test]
    fn test_clip_and_functional_ops() {
        let nodes = vec![
            node("c0", "Clip", &["x", "zero", "six"], "a", vec![]),
            node("", "Relu", &["x"], "b", vec![]),
            node("", "Add", &["a", "b"], "s", vec![]),
            node("", "Concat", &["s", "x"], "y", vec![int_attr("axis", 1)]),
        ];
        let initializers = vec![floats("zero", &[], vec![0.0]), floats("six", &[], vec![6.0])];
        let model = model_from_proto(&model_proto(nodes, initializers, &["x"], &["y"])).unwrap();
        assert!(matches!(
            model.module_by_name("c0").unwrap().layer,
            Layer::Activation(Activation::Relu6)
        ));
        assert!(model.module_by_name("relu_1").is_some());
        assert_eq!(model.num_modules(), 2);

        let x = Tensor::new(vec![1, 2], vec![-1.0, 8.0]);
        let out = model.forward(&[x]).unwrap();
        assert_eq!(out[0].get_data(), &[0.0, 14.0, -1.0, 8.0]);
    }

    #[test]
    fn test_unsupported_operator_is_rejected() {
        let proto = model_proto(
            vec![node("s", "Softmax", &["x"], "y", vec![])],
            vec![],
            &["x"],
            &["y"],
        );
        let err = model_from_proto(&proto).unwrap_err();
        assert!(err.to_string().contains("Softmax"));
    }

    #[test]
    fn test_dangling_output_is_rejected() {
        let proto = model_proto(
            vec![node("r", "Relu", &["x"], "y", vec![])],
            vec![],
            &["x"],
            &["z"],
        );
        assert!(model_from_proto(&proto).is_err());
    }

    #[test]
    fn test_load_model_reports_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.onnx");
        let err = load_model(&missing).unwrap_err();
        assert!(err.to_string().contains("Failed to load model"));

        // only `ir_version = 7` is encoded, the model has no graph
        let bare = dir.path().join("bare.onnx");
        std::fs::write(&bare, [0x08, 0x07]).unwrap();
        let err = load_model(&bare).unwrap_err();
        assert!(format!("{err:#}").contains("bare.onnx"));
        assert!(format!("{err:#}").contains("no graph"));
    }
}
