use crate::model::NodeId;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("cycle detected through nodes {0:?}, cyclic graphs are not supported")]
    Cycle(Vec<NodeId>),
    #[error("model takes {expected} input(s) but {found} input shape(s) were given")]
    InputMismatch { expected: usize, found: usize },
    #[error("operation name '{0}' is not unique")]
    DuplicateName(String),
    #[error("cannot infer the output shape of {op}: {reason}")]
    Shape { op: String, reason: String },
    #[error("missing producer: {0}")]
    MissingProducer(String),
}
