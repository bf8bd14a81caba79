//! Quantization simulation settings.
use std::{env, fs::File, io::BufReader, path::Path};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::quantization::{QuantScheme, RoundingMode, check_bitwidth};

pub const PARAM_BW_VAR: &str = "OPTKIT_PARAM_BW";
pub const OUTPUT_BW_VAR: &str = "OPTKIT_OUTPUT_BW";

fn bitwidth_from_env(var: &str) -> u8 {
    match env::var(var).ok().map(|v| v.parse::<u8>()) {
        None => 8,
        Some(Ok(bw)) if check_bitwidth(bw).is_ok() => bw,
        Some(_) => {
            warn!("ignoring invalid {var}, using 8 bits");
            8
        }
    }
}

/// Bitwidth of parameter quantizers when the configuration does not set one
pub static DEFAULT_PARAM_BW: Lazy<u8> = Lazy::new(|| bitwidth_from_env(PARAM_BW_VAR));
/// Bitwidth of activation quantizers when the configuration does not set one
pub static DEFAULT_OUTPUT_BW: Lazy<u8> = Lazy::new(|| bitwidth_from_env(OUTPUT_BW_VAR));

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantSimConfig {
    pub default_param_bw: u8,
    pub default_output_bw: u8,
    pub round_mode: RoundingMode,
    pub quant_scheme: QuantScheme,
    pub use_symmetric_encodings: bool,
    pub is_output_quantized: bool,
}

impl Default for QuantSimConfig {
    fn default() -> Self {
        Self {
            default_param_bw: *DEFAULT_PARAM_BW,
            default_output_bw: *DEFAULT_OUTPUT_BW,
            round_mode: RoundingMode::Nearest,
            quant_scheme: QuantScheme::default(),
            use_symmetric_encodings: false,
            is_output_quantized: true,
        }
    }
}

impl QuantSimConfig {
    pub fn validate(self) -> Result<Self> {
        check_bitwidth(self.default_param_bw).context("invalid parameter bitwidth")?;
        check_bitwidth(self.default_output_bw).context("invalid output bitwidth")?;
        Ok(self)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let config: Self = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        config.validate()
    }
}
