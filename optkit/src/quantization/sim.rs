//! A model with every call routed through quantize-dequantize wrappers.
use std::{collections::BTreeMap, path::Path};

use anyhow::{Result, ensure};
use tracing::{debug, info};

use crate::{
    config::QuantSimConfig,
    graph::OpKind,
    layers::{Evaluate, Layer},
    model::{Callee, ForwardHook, Model, Module, ModuleId, NodeId},
    tensor::Tensor,
};

use super::{
    EncodingFile, EncodingRecord, QcQuantizeOpMode, QcQuantizeStandalone, QcQuantizeWrapper,
    QuantizerError, TensorQuantizer,
};

/// Where a named quantizer lives
#[derive(Clone, Debug, PartialEq)]
enum Slot {
    Param(ModuleId, String),
    Input(ModuleId),
    Output(ModuleId),
    Standalone(NodeId),
}

struct SimHook<'a> {
    wrappers: &'a mut BTreeMap<ModuleId, QcQuantizeWrapper>,
    standalone: &'a mut BTreeMap<NodeId, QcQuantizeStandalone>,
}

impl ForwardHook for SimHook<'_> {
    fn call_module(
        &mut self,
        id: ModuleId,
        module: &Module,
        inputs: &[&Tensor<f32>],
    ) -> Result<Tensor<f32>> {
        match self.wrappers.get_mut(&id) {
            Some(wrapper) => wrapper.forward(&module.layer, inputs),
            None => module.layer.evaluate(inputs),
        }
    }

    fn call_function(
        &mut self,
        node: NodeId,
        layer: &Layer,
        inputs: &[&Tensor<f32>],
    ) -> Result<Tensor<f32>> {
        match self.standalone.get_mut(&node) {
            Some(op) => op.forward(layer, inputs),
            None => layer.evaluate(inputs),
        }
    }
}

pub struct QuantizationSimModel {
    model: Model,
    config: QuantSimConfig,
    wrappers: BTreeMap<ModuleId, QcQuantizeWrapper>,
    standalone: BTreeMap<NodeId, QcQuantizeStandalone>,
}

impl QuantizationSimModel {
    /// Wraps every module of `model` and puts an output quantizer behind every functional
    /// call. Functional calls are named like the operations of the connected graph.
    pub fn new(model: Model, config: QuantSimConfig) -> Result<Self> {
        let config = config.validate()?;
        let wrappers = model
            .modules()
            .map(|(id, module)| {
                let wrapper = QcQuantizeWrapper::new(&module.name, &module.layer, &config)?;
                Ok((id, wrapper))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let mut standalone = BTreeMap::new();
        for (trace_index, node_id) in model.eval_order()?.into_iter().enumerate() {
            if let Callee::Function(layer) = model.nodes()[node_id].callee() {
                let name = format!("{}_{}", OpKind::of(layer).type_tag(), trace_index);
                standalone.insert(node_id, QcQuantizeStandalone::new(name, &config)?);
            }
        }
        info!(
            "quantization sim for '{}': {} wrapped module(s), {} functional op(s)",
            model.name(),
            wrappers.len(),
            standalone.len()
        );
        Ok(Self {
            model,
            config,
            wrappers,
            standalone,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn into_model(self) -> Model {
        self.model
    }

    pub fn config(&self) -> &QuantSimConfig {
        &self.config
    }

    pub fn wrapper(&self, module_name: &str) -> Option<&QcQuantizeWrapper> {
        self.wrappers.get(&self.model.module_id(module_name)?)
    }

    pub fn wrapper_mut(&mut self, module_name: &str) -> Option<&mut QcQuantizeWrapper> {
        let id = self.model.module_id(module_name)?;
        self.wrappers.get_mut(&id)
    }

    pub fn standalone_ops(&self) -> impl Iterator<Item = &QcQuantizeStandalone> {
        self.standalone.values()
    }

    pub fn set_mode(&mut self, mode: QcQuantizeOpMode) {
        self.wrappers.values_mut().for_each(|w| w.set_mode(mode));
        self.standalone.values_mut().for_each(|s| s.set_mode(mode));
    }

    pub fn set_training(&mut self, training: bool) {
        self.wrappers.values_mut().for_each(|w| w.set_training(training));
        self.standalone
            .values_mut()
            .for_each(|s| s.set_training(training));
    }

    pub fn reset_encodings(&mut self) {
        self.wrappers.values_mut().for_each(QcQuantizeWrapper::reset_encodings);
        self.standalone
            .values_mut()
            .for_each(QcQuantizeStandalone::reset_encodings);
    }

    pub fn forward(&mut self, inputs: &[Tensor<f32>]) -> Result<Vec<Tensor<f32>>> {
        let mut hook = SimHook {
            wrappers: &mut self.wrappers,
            standalone: &mut self.standalone,
        };
        self.model.forward_with(inputs, &mut hook)
    }

    /// Collects statistics over whatever `forward_passes` runs through the model, computes
    /// the encodings and leaves every quantizer active
    pub fn compute_encodings<F>(&mut self, forward_passes: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.set_mode(QcQuantizeOpMode::Analysis);
        forward_passes(self)?;
        self.wrappers
            .values_mut()
            .for_each(QcQuantizeWrapper::compute_encoding);
        self.standalone
            .values_mut()
            .for_each(QcQuantizeStandalone::compute_encoding);
        self.set_mode(QcQuantizeOpMode::Active);
        info!("computed encodings for '{}'", self.model.name());
        Ok(())
    }

    fn module_name(&self, id: ModuleId) -> &str {
        self.model.module(id).map_or("", |m| m.name.as_str())
    }

    fn slots(&self) -> Vec<(String, Slot)> {
        let mut slots = Vec::new();
        for (id, wrapper) in &self.wrappers {
            let name = self.module_name(*id);
            for param in wrapper.param_quantizers().keys() {
                slots.push((format!("{name}.{param}"), Slot::Param(*id, param.clone())));
            }
            slots.push((format!("{name}.input"), Slot::Input(*id)));
            slots.push((format!("{name}.output"), Slot::Output(*id)));
        }
        for (node, op) in &self.standalone {
            slots.push((format!("{}.output", op.name()), Slot::Standalone(*node)));
        }
        slots
    }

    /// Names of every quantizer, `<module>.<param>`, `<module>.input` or `<name>.output`
    pub fn quantizer_names(&self) -> Vec<String> {
        self.slots().into_iter().map(|(name, _)| name).collect()
    }

    /// The quantizer called `name`, or the only one whose name ends with `.<name>`
    fn resolve(&self, name: &str) -> Result<Slot, QuantizerError> {
        let slots = self.slots();
        if let Some((_, slot)) = slots.iter().find(|(n, _)| n == name) {
            return Ok(slot.clone());
        }
        let suffix = format!(".{name}");
        let mut matches: Vec<_> = slots
            .into_iter()
            .filter(|(n, _)| n.ends_with(&suffix))
            .collect();
        match matches.len() {
            0 => Err(QuantizerError::NotFound(name.to_string())),
            1 => Ok(matches.remove(0).1),
            _ => Err(QuantizerError::Ambiguous {
                name: name.to_string(),
                candidates: matches.into_iter().map(|(n, _)| n).collect(),
            }),
        }
    }

    pub fn find_quantizer(&self, name: &str) -> Result<&TensorQuantizer, QuantizerError> {
        let missing = || QuantizerError::NotFound(name.to_string());
        match self.resolve(name)? {
            Slot::Param(id, param) => self
                .wrappers
                .get(&id)
                .and_then(|w| w.param_quantizers().get(&param))
                .ok_or_else(missing),
            Slot::Input(id) => self
                .wrappers
                .get(&id)
                .map(|w| w.input_quantizer())
                .ok_or_else(missing),
            Slot::Output(id) => self
                .wrappers
                .get(&id)
                .map(|w| w.output_quantizer())
                .ok_or_else(missing),
            Slot::Standalone(node) => self
                .standalone
                .get(&node)
                .map(|s| s.output_quantizer())
                .ok_or_else(missing),
        }
    }

    pub fn find_quantizer_mut(
        &mut self,
        name: &str,
    ) -> Result<&mut TensorQuantizer, QuantizerError> {
        let missing = || QuantizerError::NotFound(name.to_string());
        match self.resolve(name)? {
            Slot::Param(id, param) => self
                .wrappers
                .get_mut(&id)
                .and_then(|w| w.param_quantizer_mut(&param))
                .ok_or_else(missing),
            Slot::Input(id) => self
                .wrappers
                .get_mut(&id)
                .map(|w| w.input_quantizer_mut())
                .ok_or_else(missing),
            Slot::Output(id) => self
                .wrappers
                .get_mut(&id)
                .map(|w| w.output_quantizer_mut())
                .ok_or_else(missing),
            Slot::Standalone(node) => self
                .standalone
                .get_mut(&node)
                .map(|s| s.output_quantizer_mut())
                .ok_or_else(missing),
        }
    }

    /// Every computed encoding of enabled quantizers
    pub fn export_encodings(&self) -> EncodingFile {
        let mut file = EncodingFile::default();
        let enabled = |q: &TensorQuantizer| q.enabled.then(|| EncodingRecord::of(q)).flatten();
        for (id, wrapper) in &self.wrappers {
            let name = self.module_name(*id);
            for (param, quantizer) in wrapper.param_quantizers() {
                if let Some(record) = enabled(quantizer) {
                    file.param_encodings
                        .insert(format!("{name}.{param}"), vec![record]);
                }
            }
            if let Some(record) = enabled(wrapper.input_quantizer()) {
                file.activation_encodings
                    .insert(format!("{name}.input"), vec![record]);
            }
            if let Some(record) = enabled(wrapper.output_quantizer()) {
                file.activation_encodings.insert(name.to_string(), vec![record]);
            }
        }
        for op in self.standalone.values() {
            if let Some(record) = enabled(op.output_quantizer()) {
                file.activation_encodings.insert(op.name().to_string(), vec![record]);
            }
        }
        file
    }

    pub fn export(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = self.export_encodings();
        file.save(&path)?;
        info!(
            "exported {} parameter and {} activation encoding(s) to {}",
            file.param_encodings.len(),
            file.activation_encodings.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Freezes the quantizers `file` has an encoding for. Every parameter encoding in the
    /// file must belong to a wrapped module.
    pub fn load_and_freeze_encodings(&mut self, file: &EncodingFile) -> Result<usize> {
        let known = self.quantizer_names();
        for key in file.param_encodings.keys() {
            ensure!(known.contains(key), QuantizerError::NotFound(key.clone()));
        }
        let mut frozen = 0;
        for (id, wrapper) in self.wrappers.iter_mut() {
            let name = self
                .model
                .module(*id)
                .map(|m| m.name.clone())
                .unwrap_or_default();
            frozen += wrapper.set_and_freeze_param_encoding(&name, file)?;
            if let Some(record) = file.activation_encoding(&format!("{name}.input")) {
                wrapper.input_quantizer_mut().freeze_encoding(record.to_encoding())?;
                frozen += 1;
            }
            if let Some(record) = file.activation_encoding(&name) {
                wrapper.output_quantizer_mut().freeze_encoding(record.to_encoding())?;
                frozen += 1;
            }
        }
        for op in self.standalone.values_mut() {
            if let Some(record) = file.activation_encoding(op.name()) {
                let record = record.to_encoding();
                op.output_quantizer_mut().freeze_encoding(record)?;
                frozen += 1;
            }
        }
        debug!("froze {frozen} encoding(s)");
        Ok(frozen)
    }
}
