//! Post-training optimization of float models: a connected-graph view of a [`Model`],
//! cross-layer equalization and quantization simulation.
pub mod cle;
pub mod config;
pub mod graph;
pub mod kernel;
pub mod layers;
pub mod model;
pub mod onnx_parse;
pub mod quantization;
pub mod tensor;
pub mod testing;

pub use cle::{CleReport, Equalizer, equalize_model};
pub use config::QuantSimConfig;
pub use graph::{ConnectedGraph, GraphBounds};
pub use model::{Model, ModuleId};
pub use onnx_parse::load_model;
pub use quantization::{EncodingFile, QcQuantizeOpMode, QuantizationSimModel};
pub use tensor::{Shape, Tensor};
