//! Snapshot of a [`Model`] to a name-keyed external representation and back.
//!
//! Nodes refer to modules by name in the snapshot, and reloading assigns fresh ids in
//! name order. Any [`ModuleId`] obtained before a snapshot must therefore go through the
//! [`Relocation`] returned alongside the reloaded model before being used again.
use std::{
    collections::{BTreeMap, HashMap},
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::layers::Layer;

use super::{Callee, Edge, Model, Module, ModuleId, Node};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RebindError {
    #[error("module '{0}' no longer exists after the graph was reloaded")]
    MissingName(String),
    #[error("module {0} was not part of the snapshot being relocated")]
    UnknownId(ModuleId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum SavedCallee {
    Module(String),
    Function(Layer),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SavedNode {
    callee: SavedCallee,
    inputs: Vec<Edge>,
}

/// External form of a model: modules are keyed and referenced by name only
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SavedModel {
    name: String,
    modules: BTreeMap<String, Layer>,
    nodes: Vec<SavedNode>,
    num_inputs: usize,
    outputs: Vec<Edge>,
}

impl SavedModel {
    pub fn from_model(model: &Model) -> Result<Self> {
        let modules = model
            .modules
            .iter()
            .map(|m| (m.name.clone(), m.layer.clone()))
            .collect();
        let nodes = model
            .nodes
            .iter()
            .map(|node| {
                let callee = match &node.callee {
                    Callee::Module(id) => SavedCallee::Module(
                        model
                            .module(*id)
                            .map(|m| m.name.clone())
                            .ok_or(super::ModelError::UnknownModule(*id))?,
                    ),
                    Callee::Function(layer) => SavedCallee::Function(layer.clone()),
                };
                Ok(SavedNode {
                    callee,
                    inputs: node.inputs.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            name: model.name.clone(),
            modules,
            nodes,
            num_inputs: model.num_inputs,
            outputs: model.outputs.clone(),
        })
    }

    /// Rebuilds a model, assigning module ids in name order
    pub fn into_model(self) -> Result<Model> {
        let ids: HashMap<&str, ModuleId> = self
            .modules
            .keys()
            .enumerate()
            .map(|(i, name)| (name.as_str(), ModuleId(i)))
            .collect();
        let nodes = self
            .nodes
            .into_iter()
            .map(|node| {
                let callee = match node.callee {
                    SavedCallee::Module(name) => Callee::Module(
                        *ids
                            .get(name.as_str())
                            .ok_or(RebindError::MissingName(name.clone()))?,
                    ),
                    SavedCallee::Function(layer) => Callee::Function(layer),
                };
                Ok(Node {
                    callee,
                    inputs: node.inputs,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let modules = self
            .modules
            .into_iter()
            .map(|(name, layer)| Module { name, layer })
            .collect();
        Model::from_parts(self.name, modules, nodes, self.num_inputs, self.outputs)
    }
}

/// Maps the names and ids of one snapshot onto the ids of the next one
#[derive(Clone, Debug, Default)]
pub struct Relocation {
    ids: HashMap<String, ModuleId>,
    previous: HashMap<ModuleId, String>,
}

impl Relocation {
    /// The id of `name` in the reloaded model
    pub fn resolve(&self, name: &str) -> Result<ModuleId, RebindError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| RebindError::MissingName(name.to_string()))
    }

    /// The id, in the reloaded model, of the module `old` designated before the snapshot
    pub fn relocate(&self, old: ModuleId) -> Result<ModuleId, RebindError> {
        let name = self.previous.get(&old).ok_or(RebindError::UnknownId(old))?;
        self.resolve(name)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Serializes `model` and reloads it, returning the fresh model and how to move
/// previously held ids over to it.
pub fn save_and_load(model: &Model) -> Result<(Model, Relocation)> {
    let bytes = rmp_serde::to_vec_named(&SavedModel::from_model(model)?)
        .context("serializing model snapshot")?;
    let saved: SavedModel =
        rmp_serde::from_slice(&bytes).context("deserializing model snapshot")?;
    let reloaded = saved.into_model()?;
    let relocation = Relocation {
        ids: reloaded
            .modules()
            .map(|(id, m)| (m.name.clone(), id))
            .collect(),
        previous: model.modules().map(|(id, m)| (id, m.name.clone())).collect(),
    };
    debug!(
        "reloaded model '{}' snapshot ({} bytes, {} modules)",
        reloaded.name(),
        bytes.len(),
        relocation.len()
    );
    Ok((reloaded, relocation))
}

impl Model {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        rmp_serde::encode::write_named(&mut BufWriter::new(file), &SavedModel::from_model(self)?)
            .with_context(|| format!("writing model to {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let saved: SavedModel = rmp_serde::from_read(BufReader::new(file))
            .with_context(|| format!("reading model from {}", path.display()))?;
        saved.into_model()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layers::Activation,
        tensor::Tensor,
        testing::random_conv,
    };

    fn model() -> Model {
        Model::sequential(
            "net",
            [
                ("zconv", Layer::Convolution(random_conv(3, 2, 1, 1))),
                ("relu", Layer::Activation(Activation::Relu)),
                ("aconv", Layer::Convolution(random_conv(2, 3, 1, 2))),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_reload_reassigns_ids_but_keeps_names() {
        let model = model();
        let old = model.module_id("zconv").unwrap();
        assert_eq!(old, ModuleId(0));

        let (reloaded, relocation) = save_and_load(&model).unwrap();
        let new = relocation.relocate(old).unwrap();
        assert_eq!(new, ModuleId(2));
        assert_eq!(reloaded.module(new).unwrap().name, "zconv");
        assert_eq!(relocation.resolve("aconv").unwrap(), ModuleId(0));

        let input = Tensor::random_seeded(vec![1, 2, 4, 4], 3);
        let expected = model.forward(&[input.clone()]).unwrap();
        let got = reloaded.forward(&[input]).unwrap();
        assert_eq!(expected, got);
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let (_, relocation) = save_and_load(&model()).unwrap();
        assert_eq!(
            relocation.resolve("gone"),
            Err(RebindError::MissingName("gone".to_string()))
        );
        assert_eq!(
            relocation.relocate(ModuleId(17)),
            Err(RebindError::UnknownId(ModuleId(17)))
        );
    }

    #[test]
    fn test_file_round_trip() {
        let model = model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.msgpack");
        model.save(&path).unwrap();
        let loaded = Model::load(&path).unwrap();
        let conv = loaded.module_by_name("aconv").unwrap();
        assert_eq!(conv.layer, model.module_by_name("aconv").unwrap().layer);
        let input = Tensor::random_seeded(vec![2, 2, 3, 3], 11);
        assert_eq!(model.forward(&[input.clone()]).unwrap(), loaded.forward(&[input]).unwrap());
    }
}
