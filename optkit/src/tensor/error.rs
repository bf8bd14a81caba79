//! Error enum for the [`super::Tensor`] type and its related operations

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorError {
    ParameterError(String),
    ShapeMismatch { expected: Vec<usize>, found: Vec<usize> },
}

impl Display for TensorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            TensorError::ParameterError(s) => {
                write!(f, "Parameters to Tensor method were incorrect: {}", s)
            }
            TensorError::ShapeMismatch { expected, found } => {
                write!(f, "Tensor shape mismatch: expected {expected:?}, found {found:?}")
            }
        }
    }
}

impl Error for TensorError {}
