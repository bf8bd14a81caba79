//! JSON encoding files, as consumed by downstream inference engines.
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{Encoding, TensorQuantizer};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EncodingRecord {
    pub min: f32,
    pub max: f32,
    pub scale: f32,
    pub offset: i64,
    pub bitwidth: u8,
    pub is_symmetric: bool,
}

impl EncodingRecord {
    pub fn new(encoding: &Encoding, is_symmetric: bool) -> Self {
        Self {
            min: encoding.min,
            max: encoding.max,
            scale: encoding.delta,
            offset: encoding.offset,
            bitwidth: encoding.bitwidth,
            is_symmetric,
        }
    }

    /// The record of a quantizer's encoding, if it has one
    pub fn of(quantizer: &TensorQuantizer) -> Option<Self> {
        quantizer
            .encoding()
            .map(|e| Self::new(e, quantizer.use_symmetric_encodings))
    }

    pub fn to_encoding(&self) -> Encoding {
        Encoding {
            min: self.min,
            max: self.max,
            delta: self.scale,
            offset: self.offset,
            bitwidth: self.bitwidth,
        }
    }
}

/// Parameter encodings keyed by `<module>.<param>`, activation encodings keyed by module
/// or operation name
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodingFile {
    pub activation_encodings: BTreeMap<String, Vec<EncodingRecord>>,
    pub param_encodings: BTreeMap<String, Vec<EncodingRecord>>,
}

impl EncodingFile {
    pub fn param_encoding(&self, key: &str) -> Option<&EncodingRecord> {
        self.param_encodings.get(key).and_then(|records| records.first())
    }

    pub fn activation_encoding(&self, key: &str) -> Option<&EncodingRecord> {
        self.activation_encodings
            .get(key)
            .and_then(|records| records.first())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("writing encodings to {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("reading encodings from {}", path.display()))
    }
}
