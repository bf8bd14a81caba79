//! Connected graph: the normalized view of a [`Model`] the pattern passes work on.
//!
//! The graph is built by tracing the model for given input shapes. Every node becomes an
//! [`Operation`], every wire between nodes a [`Product`]. Where one output feeds several
//! consumers a `Split` pseudo operation is inserted so that branch points are explicit.
//! The graph never owns parameters: operations point back to the model through
//! [`ModuleId`]s, which only stay valid as long as the model snapshot they come from.
mod error;
mod op_kind;
pub mod search;

use std::collections::{BTreeMap, HashMap};

use anyhow::{Result, ensure};
use tracing::debug;

use crate::{
    layers::{Layer, OpInfo},
    model::{Callee, Edge, Model, ModelError, ModuleId, NodeId},
    tensor::Shape,
};

pub use error::GraphError;
pub use op_kind::OpKind;
pub use search::{GraphSearcher, PatternHandler, PatternType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("op#{_0}")]
pub struct OpId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
#[display("product#{_0}")]
pub struct ProductId(usize);

#[derive(Clone, Debug)]
pub struct Operation {
    id: OpId,
    name: String,
    dotted_name: String,
    kind: OpKind,
    module: Option<ModuleId>,
    node: Option<NodeId>,
    inputs: Vec<ProductId>,
    output: Option<ProductId>,
    output_shape: Shape,
    feeds_model_output: bool,
}

impl Operation {
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Unique name, `<type tag>_<trace index>`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<model>.<module>`, suffixed with the occurrence index for repeated invocations
    pub fn dotted_name(&self) -> &str {
        &self.dotted_name
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// The module this operation invokes, `None` for functional and split operations
    pub fn module(&self) -> Option<ModuleId> {
        self.module
    }

    /// The model node this operation traces, `None` for split operations
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn inputs(&self) -> &[ProductId] {
        &self.inputs
    }

    /// `None` when nothing in the graph consumes the result
    pub fn output(&self) -> Option<ProductId> {
        self.output
    }

    pub fn output_shape(&self) -> &[usize] {
        &self.output_shape
    }

    /// Whether the result also leaves the graph, read by a model output or by a node
    /// outside the traced bounds. Such results must keep their value under rewrites.
    pub fn feeds_model_output(&self) -> bool {
        self.feeds_model_output
    }
}

#[derive(Clone, Debug)]
pub struct Product {
    id: ProductId,
    name: String,
    shape: Shape,
    producer: Option<OpId>,
    consumers: Vec<OpId>,
}

impl Product {
    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn producer(&self) -> Option<OpId> {
        self.producer
    }

    pub fn consumers(&self) -> &[OpId] {
        &self.consumers
    }

    pub fn is_model_input(&self) -> bool {
        self.producer.is_none()
    }
}

/// Restricts the traced part of a model. Only nodes downstream of a start module and
/// upstream of an output module are kept, an empty list meaning no restriction.
#[derive(Clone, Debug, Default)]
pub struct GraphBounds {
    pub start_modules: Vec<String>,
    pub output_modules: Vec<String>,
}

impl GraphBounds {
    fn is_unbounded(&self) -> bool {
        self.start_modules.is_empty() && self.output_modules.is_empty()
    }

    /// Which nodes of `model` lie within the bounds
    fn select(&self, model: &Model) -> Result<Vec<bool>> {
        let num_nodes = model.nodes().len();
        if self.is_unbounded() {
            return Ok(vec![true; num_nodes]);
        }
        let invoking = |names: &[String]| -> Result<Vec<NodeId>> {
            let mut nodes = Vec::new();
            for name in names {
                let id = model.module_id(name).ok_or_else(|| {
                    GraphError::MissingProducer(format!("module '{name}' does not exist"))
                })?;
                let before = nodes.len();
                nodes.extend(
                    model
                        .nodes()
                        .iter()
                        .enumerate()
                        .filter(|(_, n)| n.module() == Some(id))
                        .map(|(i, _)| i),
                );
                ensure!(
                    nodes.len() > before,
                    GraphError::MissingProducer(format!("module '{name}' is never invoked"))
                );
            }
            Ok(nodes)
        };
        let mut included = vec![true; num_nodes];
        if !self.start_modules.is_empty() {
            let reached = reachable(num_nodes, invoking(&self.start_modules)?, |n| {
                model.consumers(n)
            });
            included.iter_mut().zip(reached).for_each(|(i, r)| *i &= r);
        }
        if !self.output_modules.is_empty() {
            let reached = reachable(num_nodes, invoking(&self.output_modules)?, |n| {
                model.nodes()[n].inputs().iter().filter_map(Edge::node).collect()
            });
            included.iter_mut().zip(reached).for_each(|(i, r)| *i &= r);
        }
        Ok(included)
    }
}

fn reachable(
    num_nodes: usize,
    from: Vec<NodeId>,
    next: impl Fn(NodeId) -> Vec<NodeId>,
) -> Vec<bool> {
    let mut reached = vec![false; num_nodes];
    let mut stack = from;
    while let Some(node) = stack.pop() {
        if !reached[node] {
            reached[node] = true;
            stack.extend(next(node));
        }
    }
    reached
}

#[derive(Clone, Debug)]
pub struct ConnectedGraph {
    model_name: String,
    ops: Vec<Operation>,
    products: Vec<Product>,
    op_index: HashMap<String, OpId>,
    dotted_index: HashMap<String, OpId>,
    ordered_ops: Vec<OpId>,
    starting_ops: Vec<OpId>,
    split_count: usize,
}

impl ConnectedGraph {
    pub fn build(model: &Model, input_shapes: &[Shape]) -> Result<Self> {
        Self::build_bounded(model, input_shapes, &GraphBounds::default())
    }

    pub fn build_bounded(
        model: &Model,
        input_shapes: &[Shape],
        bounds: &GraphBounds,
    ) -> Result<Self> {
        ensure!(
            input_shapes.len() == model.num_inputs(),
            GraphError::InputMismatch {
                expected: model.num_inputs(),
                found: input_shapes.len(),
            }
        );
        let order = model.eval_order().map_err(|e| match e {
            ModelError::Cycle(nodes) => anyhow::Error::from(GraphError::Cycle(nodes)),
            ModelError::DanglingEdge { node, target } => anyhow::Error::from(
                GraphError::MissingProducer(format!("node {node} reads from {target}")),
            ),
            other => anyhow::Error::from(other),
        })?;
        let shapes = infer_shapes(model, input_shapes, &order)?;
        let included = bounds.select(model)?;

        let mut graph = Self {
            model_name: model.name().to_string(),
            ops: Vec::new(),
            products: Vec::new(),
            op_index: HashMap::new(),
            dotted_index: HashMap::new(),
            ordered_ops: Vec::new(),
            starting_ops: Vec::new(),
            split_count: 0,
        };

        let mut node_ops: HashMap<NodeId, OpId> = HashMap::new();
        let mut occurrences: HashMap<ModuleId, usize> = HashMap::new();
        for (trace_index, &node_id) in order.iter().filter(|n| included[**n]).enumerate() {
            let (layer, module) = node_layer(model, node_id)?;
            let kind = OpKind::of(layer);
            let name = format!("{}_{}", kind.type_tag(), trace_index);
            let dotted_name = match module {
                Some(id) => {
                    let occurrence = occurrences.entry(id).or_default();
                    let base = format!("{}.{}", model.name(), module_name(model, id)?);
                    let dotted = match *occurrence {
                        0 => base,
                        n => format!("{base}_{n}"),
                    };
                    *occurrence += 1;
                    dotted
                }
                None => format!("{}.{}", model.name(), name),
            };
            let shape = shapes[node_id].clone();
            let id = graph.push_op(name, dotted_name, kind, module, Some(node_id), shape)?;
            graph.ops[id.0].feeds_model_output = model
                .outputs()
                .iter()
                .any(|edge| edge.node() == Some(node_id))
                || model.consumers(node_id).iter().any(|c| !included[*c]);
            node_ops.insert(node_id, id);
        }

        // distinct consumers of every wire, in trace order
        let mut consumers: BTreeMap<(Option<NodeId>, usize), Vec<OpId>> = BTreeMap::new();
        let traced: Vec<(NodeId, OpId)> = graph
            .ops
            .iter()
            .filter_map(|op| op.node.map(|n| (n, op.id)))
            .collect();
        for &(node_id, op_id) in &traced {
            for edge in model.nodes()[node_id].inputs() {
                let list = consumers.entry((edge.node(), edge.index())).or_default();
                if !list.contains(&op_id) {
                    list.push(op_id);
                }
            }
        }

        let mut wire_products: HashMap<(Option<NodeId>, usize), ProductId> = HashMap::new();
        let mut boundary_inputs = model.num_inputs();
        let mut splits_after: HashMap<OpId, OpId> = HashMap::new();
        for ((producer_node, index), consumer_ops) in consumers {
            let producer_op = producer_node.and_then(|n| node_ops.get(&n).copied());
            let product = match (producer_node, producer_op) {
                (None, _) => graph.push_product(
                    format!("input_{index}"),
                    input_shapes[index].clone(),
                    None,
                    consumer_ops,
                ),
                (Some(node), None) => {
                    // producer excluded by the bounds, the wire becomes an input of the graph
                    let name = format!("input_{boundary_inputs}");
                    boundary_inputs += 1;
                    graph.push_product(name, shapes[node].clone(), None, consumer_ops)
                }
                (Some(_), Some(producer)) if consumer_ops.len() == 1 => {
                    let name = format!(
                        "{}_to_{}",
                        graph.ops[producer.0].name, graph.ops[consumer_ops[0].0].name
                    );
                    let shape = graph.ops[producer.0].output_shape.clone();
                    let product = graph.push_product(name, shape, Some(producer), consumer_ops);
                    graph.ops[producer.0].output = Some(product);
                    product
                }
                (Some(_), Some(producer)) => {
                    let split = graph.insert_split(producer, consumer_ops)?;
                    splits_after.insert(producer, split);
                    graph.ops[split.0].output.ok_or_else(|| {
                        GraphError::MissingProducer(format!(
                            "split after {} has no output",
                            graph.ops[producer.0].name
                        ))
                    })?
                }
            };
            wire_products.insert((producer_node, index), product);
        }

        for &(node_id, op_id) in &traced {
            let inputs = model.nodes()[node_id]
                .inputs()
                .iter()
                .map(|edge| {
                    wire_products.get(&(edge.node(), edge.index())).copied().ok_or_else(|| {
                        GraphError::MissingProducer(format!("no product feeds node {node_id}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            graph.ops[op_id.0].inputs = inputs;
        }

        for (_, op_id) in traced {
            graph.ordered_ops.push(op_id);
            if let Some(split) = splits_after.get(&op_id) {
                graph.ordered_ops.push(*split);
            }
        }
        graph.starting_ops = graph
            .ordered_ops
            .iter()
            .copied()
            .filter(|id| {
                graph.ops[id.0]
                    .inputs
                    .iter()
                    .any(|p| graph.products[p.0].is_model_input())
            })
            .collect();

        debug!(
            "traced '{}': {} ops, {} products, {} splits",
            graph.model_name,
            graph.ops.len(),
            graph.products.len(),
            graph.split_count
        );
        Ok(graph)
    }

    fn push_op(
        &mut self,
        name: String,
        dotted_name: String,
        kind: OpKind,
        module: Option<ModuleId>,
        node: Option<NodeId>,
        output_shape: Shape,
    ) -> Result<OpId> {
        let id = OpId(self.ops.len());
        ensure!(
            !self.op_index.contains_key(&name),
            GraphError::DuplicateName(name)
        );
        ensure!(
            !self.dotted_index.contains_key(&dotted_name),
            GraphError::DuplicateName(dotted_name)
        );
        self.op_index.insert(name.clone(), id);
        self.dotted_index.insert(dotted_name.clone(), id);
        self.ops.push(Operation {
            id,
            name,
            dotted_name,
            kind,
            module,
            node,
            inputs: Vec::new(),
            output: None,
            output_shape,
            feeds_model_output: false,
        });
        Ok(id)
    }

    fn push_product(
        &mut self,
        name: String,
        shape: Shape,
        producer: Option<OpId>,
        consumers: Vec<OpId>,
    ) -> ProductId {
        let id = ProductId(self.products.len());
        self.products.push(Product {
            id,
            name,
            shape,
            producer,
            consumers,
        });
        id
    }

    /// Inserts `Split_<k>` between `producer` and its consumers
    fn insert_split(&mut self, producer: OpId, consumers: Vec<OpId>) -> Result<OpId> {
        let name = format!("Split_{}", self.split_count);
        self.split_count += 1;
        let shape = self.ops[producer.0].output_shape.clone();
        let dotted = format!("{}.{}", self.model_name, name);
        let split = self.push_op(name.clone(), dotted, OpKind::Split, None, None, shape.clone())?;
        let into_split = self.push_product(
            format!("{}__to__{}", self.ops[producer.0].name, name),
            shape.clone(),
            Some(producer),
            vec![split],
        );
        self.ops[producer.0].output = Some(into_split);
        self.ops[split.0].inputs = vec![into_split];
        let out_of_split =
            self.push_product(format!("{name}__to__multiple_ops"), shape, Some(split), consumers);
        self.ops[split.0].output = Some(out_of_split);
        Ok(split)
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn op(&self, id: OpId) -> &Operation {
        &self.ops[id.0]
    }

    pub fn product(&self, id: ProductId) -> &Product {
        &self.products[id.0]
    }

    pub fn get_all_ops(&self) -> BTreeMap<&str, &Operation> {
        self.ops.iter().map(|op| (op.name.as_str(), op)).collect()
    }

    pub fn get_op(&self, name: &str) -> Option<&Operation> {
        self.op_index.get(name).map(|id| self.op(*id))
    }

    /// Looks an operation up by its dotted name, e.g. `resnet.layer1.conv1`
    pub fn get_op_from_module_name(&self, dotted_name: &str) -> Option<&Operation> {
        self.dotted_index.get(dotted_name).map(|id| self.op(*id))
    }

    pub fn get_all_products(&self) -> BTreeMap<&str, &Product> {
        self.products.iter().map(|p| (p.name.as_str(), p)).collect()
    }

    /// Operations in topological order, ties broken by trace order, splits right after
    /// their producer
    pub fn ordered_ops(&self) -> impl Iterator<Item = &Operation> {
        self.ordered_ops.iter().map(|id| self.op(*id))
    }

    /// Operations reading at least one input of the graph
    pub fn starting_ops(&self) -> impl Iterator<Item = &Operation> {
        self.starting_ops.iter().map(|id| self.op(*id))
    }

    pub fn split_count(&self) -> usize {
        self.split_count
    }

    /// Operations reading the output of `op`
    pub fn consumers(&self, op: &Operation) -> &[OpId] {
        op.output
            .map(|p| self.product(p).consumers())
            .unwrap_or(&[])
    }

    /// Pairs each module with the activation module directly consuming its output
    pub fn module_activation_pairs(&self) -> Vec<(ModuleId, ModuleId)> {
        self.ordered_ops()
            .filter_map(|op| {
                let module = op.module?;
                let [consumer] = self.consumers(op) else {
                    return None;
                };
                let consumer = self.op(*consumer);
                match (consumer.kind.is_activation(), consumer.module) {
                    (true, Some(activation)) => Some((module, activation)),
                    _ => None,
                }
            })
            .collect()
    }
}

fn node_layer(model: &Model, node: NodeId) -> Result<(&Layer, Option<ModuleId>)> {
    Ok(match model.nodes()[node].callee() {
        Callee::Module(id) => {
            let module = model.module(*id).ok_or(ModelError::UnknownModule(*id))?;
            (&module.layer, Some(*id))
        }
        Callee::Function(layer) => (layer, None),
    })
}

fn module_name(model: &Model, id: ModuleId) -> Result<&str> {
    Ok(model
        .module(id)
        .ok_or(ModelError::UnknownModule(id))?
        .name
        .as_str())
}

/// Output shape of every node, in the order the nodes run
fn infer_shapes(model: &Model, input_shapes: &[Shape], order: &[NodeId]) -> Result<Vec<Shape>> {
    let mut shapes: Vec<Option<Shape>> = vec![None; model.nodes().len()];
    for &node_id in order {
        let node = &model.nodes()[node_id];
        let (layer, _) = node_layer(model, node_id)?;
        let inputs = node
            .inputs()
            .iter()
            .map(|edge| {
                let shape = match edge.node() {
                    Some(n) => shapes[n].clone(),
                    None => input_shapes.get(edge.index()).cloned(),
                };
                shape.ok_or_else(|| GraphError::MissingProducer(format!("no shape for {edge:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let shape = layer.output_shape(&inputs).map_err(|e| GraphError::Shape {
            op: format!("node {node_id} ({layer})"),
            reason: e.to_string(),
        })?;
        shapes[node_id] = Some(shape);
    }
    Ok(shapes.into_iter().map(Option::unwrap_or_default).collect())
}
