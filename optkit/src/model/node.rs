use serde::{Deserialize, Serialize};

use crate::layers::Layer;

use super::ModuleId;

pub type NodeId = usize;

/// Represents a link between an input wire of a node and the output wire of
/// another node, or an input of the model.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Edge {
    // Reference to the node linked to this wire, will be `None` if the wire is an input of
    // the model
    pub(crate) node: Option<NodeId>,
    // The index of the model input when `node` is `None`, 0 otherwise since nodes have a
    // single output wire
    pub(crate) index: usize,
}

impl Edge {
    pub fn new(node: NodeId) -> Self {
        Self {
            node: Some(node),
            index: 0,
        }
    }

    /// Edge when the wire is an input of the model
    pub fn new_at_edge(index: usize) -> Self {
        Self { node: None, index }
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// What a node invokes when it runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    /// A named module of the model, which may be invoked by several nodes
    Module(ModuleId),
    /// A parameter-free function such as an addition or a concatenation
    Function(Layer),
}

/// Represents one invocation in a model
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub(crate) callee: Callee,
    pub(crate) inputs: Vec<Edge>,
}

impl Node {
    pub fn callee(&self) -> &Callee {
        &self.callee
    }

    pub fn inputs(&self) -> &[Edge] {
        &self.inputs
    }

    pub fn module(&self) -> Option<ModuleId> {
        match self.callee {
            Callee::Module(id) => Some(id),
            Callee::Function(_) => None,
        }
    }
}
