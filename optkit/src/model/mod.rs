//! The native model: an arena of named modules plus the graph of nodes invoking them.
//!
//! A module may be invoked by several nodes, and a module no node invokes stays in the
//! arena (batchnorm fold leaves the folded batchnorms there so their statistics can still
//! be looked up by name).
mod error;
mod node;
pub mod snapshot;

use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    layers::{Evaluate, Layer},
    tensor::Tensor,
};

pub use error::ModelError;
pub use node::{Callee, Edge, Node, NodeId};
pub use snapshot::{RebindError, Relocation, save_and_load};

/// Handle of a module inside one snapshot of a [`Model`]. Ids are reassigned when a
/// snapshot is reloaded, names are not.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[display("#{_0}")]
pub struct ModuleId(pub(crate) usize);

#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    /// Hierarchical name, e.g. `layer1.0.conv1`
    pub name: String,
    pub layer: Layer,
}

#[derive(Clone, Debug)]
pub struct Model {
    name: String,
    modules: Vec<Module>,
    /// Rebuilt whenever modules are added or the model is reloaded
    module_index: HashMap<String, ModuleId>,
    nodes: Vec<Node>,
    num_inputs: usize,
    outputs: Vec<Edge>,
}

/// Intercepts the calls a forward pass makes, see [`Model::forward_with`]
pub trait ForwardHook {
    fn call_module(
        &mut self,
        _id: ModuleId,
        module: &Module,
        inputs: &[&Tensor<f32>],
    ) -> Result<Tensor<f32>> {
        module.layer.evaluate(inputs)
    }

    fn call_function(
        &mut self,
        _node: NodeId,
        layer: &Layer,
        inputs: &[&Tensor<f32>],
    ) -> Result<Tensor<f32>> {
        layer.evaluate(inputs)
    }
}

/// Evaluates every call directly
pub struct DirectCall;

impl ForwardHook for DirectCall {}

impl Model {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
            module_index: HashMap::new(),
            nodes: Vec::new(),
            num_inputs: 0,
            outputs: Vec::new(),
        }
    }

    /// A single-input chain of freshly added modules, the last one being the output
    pub fn sequential<S: Into<String>>(
        name: impl Into<String>,
        layers: impl IntoIterator<Item = (S, Layer)>,
    ) -> Result<Self> {
        let mut model = Self::new(name);
        let mut edge = model.add_input();
        for (name, layer) in layers {
            let id = model.add_module(name, layer)?;
            edge = model.call(id, vec![edge])?;
        }
        model.set_outputs(vec![edge]);
        Ok(model)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_input(&mut self) -> Edge {
        self.num_inputs += 1;
        Edge::new_at_edge(self.num_inputs - 1)
    }

    pub fn add_module(&mut self, name: impl Into<String>, layer: Layer) -> Result<ModuleId> {
        let name = name.into();
        ensure!(
            !name.is_empty(),
            ModelError::ParameterError("module names cannot be empty".to_string())
        );
        ensure!(
            !self.module_index.contains_key(&name),
            ModelError::DuplicateModule(name)
        );
        let id = ModuleId(self.modules.len());
        self.module_index.insert(name.clone(), id);
        self.modules.push(Module { name, layer });
        Ok(id)
    }

    /// Adds a node invoking `module` and returns the edge carrying its output
    pub fn call(&mut self, module: ModuleId, inputs: Vec<Edge>) -> Result<Edge> {
        ensure!(
            module.0 < self.modules.len(),
            ModelError::UnknownModule(module)
        );
        self.nodes.push(Node {
            callee: Callee::Module(module),
            inputs,
        });
        Ok(Edge::new(self.nodes.len() - 1))
    }

    pub fn call_function(&mut self, layer: Layer, inputs: Vec<Edge>) -> Edge {
        self.nodes.push(Node {
            callee: Callee::Function(layer),
            inputs,
        });
        Edge::new(self.nodes.len() - 1)
    }

    pub fn set_outputs(&mut self, outputs: Vec<Edge>) {
        self.outputs = outputs;
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn outputs(&self) -> &[Edge] {
        &self.outputs
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn modules(&self) -> impl Iterator<Item = (ModuleId, &Module)> {
        self.modules
            .iter()
            .enumerate()
            .map(|(i, m)| (ModuleId(i), m))
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.0)
    }

    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.modules.get_mut(id.0)
    }

    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.module_index.get(name).copied()
    }

    pub fn module_by_name(&self, name: &str) -> Option<&Module> {
        self.module_id(name).and_then(|id| self.module(id))
    }

    /// Swaps the layer of `id`, returning the previous one
    pub fn replace_layer(&mut self, id: ModuleId, layer: Layer) -> Result<Layer> {
        let module = self
            .module_mut(id)
            .ok_or(ModelError::UnknownModule(id))?;
        Ok(std::mem::replace(&mut module.layer, layer))
    }

    /// Removes `node` from the invocation graph, wiring its consumers (and the model
    /// outputs) to the node's first input instead. The invoked module, if any, is kept.
    pub fn bypass_node(&mut self, node: NodeId) -> Result<()> {
        let replacement = self
            .nodes
            .get(node)
            .and_then(|n| n.inputs.first())
            .cloned()
            .ok_or_else(|| {
                ModelError::ParameterError(format!("node {node} does not exist or has no input"))
            })?;
        let removed = Edge::new(node);
        for edge in self.edges_mut() {
            if *edge == removed {
                *edge = replacement.clone();
            }
        }
        self.nodes.remove(node);
        for edge in self.edges_mut() {
            if let Some(n) = edge.node {
                if n > node {
                    edge.node = Some(n - 1);
                }
            }
        }
        Ok(())
    }

    fn edges_mut(&mut self) -> impl Iterator<Item = &mut Edge> {
        self.nodes
            .iter_mut()
            .flat_map(|n| n.inputs.iter_mut())
            .chain(self.outputs.iter_mut())
    }

    /// Nodes the consume the output of `node`, in node order and without repetition
    pub fn consumers(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|e| e.node == Some(node)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Order in which nodes can run: every node after the nodes it reads from, ties broken by
    /// the position of the node in the model.
    pub fn eval_order(&self) -> Result<Vec<NodeId>, ModelError> {
        let mut pending = vec![0usize; self.nodes.len()];
        let mut consumers: Vec<Vec<NodeId>> = vec![Vec::new(); self.nodes.len()];
        for (id, node) in self.nodes.iter().enumerate() {
            for edge in &node.inputs {
                match edge.node {
                    Some(producer) if producer < self.nodes.len() => {
                        pending[id] += 1;
                        consumers[producer].push(id);
                    }
                    Some(producer) => {
                        return Err(ModelError::DanglingEdge {
                            node: id,
                            target: format!("node {producer}"),
                        });
                    }
                    None if edge.index >= self.num_inputs => {
                        return Err(ModelError::DanglingEdge {
                            node: id,
                            target: format!("model input {}", edge.index),
                        });
                    }
                    None => {}
                }
            }
        }
        let mut ready: BTreeSet<NodeId> = (0..self.nodes.len())
            .filter(|i| pending[*i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for &consumer in &consumers[id] {
                pending[consumer] -= 1;
                if pending[consumer] == 0 {
                    ready.insert(consumer);
                }
            }
        }
        if order.len() != self.nodes.len() {
            let stuck = (0..self.nodes.len()).filter(|i| pending[*i] > 0).collect();
            return Err(ModelError::Cycle(stuck));
        }
        Ok(order)
    }

    pub fn forward(&self, inputs: &[Tensor<f32>]) -> Result<Vec<Tensor<f32>>> {
        self.forward_with(inputs, &mut DirectCall)
    }

    /// Runs the model, routing every module call and function call through `hook`
    pub fn forward_with<H: ForwardHook>(
        &self,
        inputs: &[Tensor<f32>],
        hook: &mut H,
    ) -> Result<Vec<Tensor<f32>>> {
        ensure!(
            inputs.len() == self.num_inputs,
            ModelError::ParameterError(format!(
                "expected {} inputs, got {}",
                self.num_inputs,
                inputs.len()
            ))
        );
        let mut values: Vec<Option<Tensor<f32>>> = vec![None; self.nodes.len()];
        for id in self.eval_order()? {
            let node = &self.nodes[id];
            let args = node
                .inputs
                .iter()
                .map(|edge| Self::value(inputs, &values, edge))
                .collect::<Result<Vec<_>>>()?;
            let out = match &node.callee {
                Callee::Module(module_id) => {
                    let module = self
                        .module(*module_id)
                        .ok_or(ModelError::UnknownModule(*module_id))?;
                    hook.call_module(*module_id, module, &args)?
                }
                Callee::Function(layer) => hook.call_function(id, layer, &args)?,
            };
            values[id] = Some(out);
        }
        self.outputs
            .iter()
            .map(|edge| Self::value(inputs, &values, edge).cloned())
            .collect()
    }

    fn value<'a>(
        inputs: &'a [Tensor<f32>],
        values: &'a [Option<Tensor<f32>>],
        edge: &Edge,
    ) -> Result<&'a Tensor<f32>> {
        let value = match edge.node {
            Some(node) => values.get(node).and_then(|v| v.as_ref()),
            None => inputs.get(edge.index),
        };
        value.ok_or_else(|| anyhow::anyhow!("no value available for edge {edge:?}"))
    }

    pub(crate) fn from_parts(
        name: String,
        modules: Vec<Module>,
        nodes: Vec<Node>,
        num_inputs: usize,
        outputs: Vec<Edge>,
    ) -> Result<Self> {
        let mut module_index = HashMap::with_capacity(modules.len());
        for (i, module) in modules.iter().enumerate() {
            ensure!(
                module_index.insert(module.name.clone(), ModuleId(i)).is_none(),
                ModelError::DuplicateModule(module.name.clone())
            );
        }
        Ok(Self {
            name,
            modules,
            module_index,
            nodes,
            num_inputs,
            outputs,
        })
    }
}
