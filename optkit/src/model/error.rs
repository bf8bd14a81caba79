//! Module containing code defining the [`ModelError`] type.

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

use super::{ModuleId, NodeId};

#[derive(Debug, Clone, PartialEq)]
/// Errors relating to [`super::Model`].
pub enum ModelError {
    /// Error variant returned when parameters passed to a model are incorrect,
    /// i.e. input tensor count is wrong or types don't line up.
    ParameterError(String),
    /// Two modules share the same name.
    DuplicateModule(String),
    /// A module id that does not belong to this model.
    UnknownModule(ModuleId),
    /// An edge of `node` points to a node or model input that does not exist.
    DanglingEdge { node: NodeId, target: String },
    /// Nodes that can never run because they (transitively) depend on themselves.
    Cycle(Vec<NodeId>),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ModelError::ParameterError(s) => write!(f, "Incorrect Parameters fed to Model: {}", s),
            ModelError::DuplicateModule(name) => write!(f, "Module name '{name}' is already used"),
            ModelError::UnknownModule(id) => write!(f, "Module {id} does not exist in the model"),
            ModelError::DanglingEdge { node, target } => {
                write!(f, "Node {node} reads from {target}, which does not exist")
            }
            ModelError::Cycle(nodes) => write!(f, "Cycle detected through nodes {nodes:?}"),
        }
    }
}

impl Error for ModelError {}
