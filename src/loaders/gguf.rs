//! GGUF transformer checkpoints

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use log::debug;

use crate::loaders::sd3_remapper::{filter_expected, remap_sd3_transformer, sd3_transformer_keys, Sd3TransformerConfig};
use crate::models::{Component, ComponentSlot};

/// Tensor counts per stored GGML type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GgufStats {
    pub by_type: BTreeMap<String, usize>,
}

impl fmt::Display for GgufStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.by_type.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", parts.join(" "))
    }
}

/// Decode every tensor of a GGUF container, dequantized to `dtype`
pub fn load_gguf_state_dict(path: &Path, dtype: DType, device: &Device) -> Result<(HashMap<String, Tensor>, GgufStats)> {
    let mut file = File::open(path).with_context(|| format!("Failed to open gguf: {}", path.display()))?;
    let content = gguf_file::Content::read(&mut file)
        .with_context(|| format!("Failed to read gguf: {}", path.display()))?;

    let mut stats = GgufStats::default();
    let mut state_dict = HashMap::with_capacity(content.tensor_infos.len());
    let names: Vec<String> = content.tensor_infos.keys().cloned().collect();
    for name in names {
        let qtensor = content
            .tensor(&mut file, &name, device)
            .with_context(|| format!("Failed to read tensor: {}", name))?;
        *stats.by_type.entry(format!("{:?}", qtensor.dtype())).or_insert(0) += 1;
        let tensor = qtensor.dequantize(device)?.to_dtype(dtype)?;
        state_dict.insert(name, tensor);
    }
    Ok((state_dict, stats))
}

/// Load a GGUF SD3 transformer into diffusers naming
///
/// Only names the transformer expects are applied; the rest are counted as
/// skipped and logged.
pub fn load_gguf_transformer(path: &Path, config: &Sd3TransformerConfig, dtype: DType, device: &Device) -> Result<Component> {
    let (state_dict, stats) = load_gguf_state_dict(path, dtype, device)?;
    let remapped = remap_sd3_transformer(state_dict)?;
    let expected = sd3_transformer_keys(config);
    let (weights, applied, skipped) = filter_expected(remapped, &expected);
    debug!(
        "Load model: type=Unet/Transformer applied={} skipped={} stats={} compute={:?}",
        applied, skipped, stats, dtype
    );
    Ok(Component::from_state_dict(
        ComponentSlot::Transformer,
        path.display().to_string(),
        weights,
        dtype,
    ))
}
