//! Remap original SD3 (MMDiT) tensor names to the diffusers transformer layout

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::Tensor;
use log::{debug, info};
use serde::Deserialize;

const PREFIXES: [&str; 2] = ["model.diffusion_model.", "diffusion_model."];

/// Transformer hyper-parameters that decide which tensor names exist
#[derive(Debug, Clone, Deserialize)]
pub struct Sd3TransformerConfig {
    pub num_layers: usize,
    /// `"rms_norm"` when the attention uses q/k normalization
    #[serde(default)]
    pub qk_norm: Option<String>,
    /// Blocks carrying a second self-attention (SD3.5 medium)
    #[serde(default)]
    pub dual_attention_layers: Vec<usize>,
}

impl Sd3TransformerConfig {
    pub fn medium() -> Self {
        Self {
            num_layers: 24,
            qk_norm: None,
            dual_attention_layers: Vec::new(),
        }
    }

    pub fn large() -> Self {
        Self {
            num_layers: 38,
            qk_norm: Some("rms_norm".to_string()),
            dual_attention_layers: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read transformer config: {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| "Failed to parse transformer config")
    }

    /// Read the config when present, otherwise fall back to the medium layout
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                debug!("Transformer config: using defaults ({})", e);
                Self::medium()
            }
        }
    }

    /// Infer from the original tensor names
    pub fn from_checkpoint_keys<'a, I: IntoIterator<Item = &'a String>>(keys: I) -> Self {
        let mut num_layers = 0;
        let mut qk_norm = false;
        let mut dual = HashSet::new();
        for key in keys {
            let Some(rest) = key.strip_prefix("joint_blocks.") else {
                continue;
            };
            let Some((idx, tail)) = rest.split_once('.') else {
                continue;
            };
            let Ok(idx) = idx.parse::<usize>() else {
                continue;
            };
            num_layers = num_layers.max(idx + 1);
            qk_norm |= tail.contains(".ln_q.");
            if tail.starts_with("x_block.attn2.") {
                dual.insert(idx);
            }
        }
        let mut dual_attention_layers: Vec<usize> = dual.into_iter().collect();
        dual_attention_layers.sort_unstable();
        Self {
            num_layers,
            qk_norm: qk_norm.then(|| "rms_norm".to_string()),
            dual_attention_layers,
        }
    }

    fn has_qk_norm(&self) -> bool {
        self.qk_norm.is_some()
    }
}

/// Strip the checkpoint's wrapper prefix from every tensor name
pub fn check_and_strip_prefix(weights: HashMap<String, Tensor>) -> HashMap<String, Tensor> {
    let Some(prefix) = PREFIXES.iter().find(|p| weights.keys().any(|k| k.starts_with(*p))) else {
        return weights;
    };
    debug!("Stripping '{}' prefix from weights", prefix);
    weights
        .into_iter()
        .map(|(key, tensor)| {
            let key = key.strip_prefix(prefix).map(str::to_string).unwrap_or(key);
            (key, tensor)
        })
        .collect()
}

/// `[shift, scale]` → `[scale, shift]` along the output dimension
fn swap_scale_shift(tensor: &Tensor) -> Result<Tensor> {
    let parts = tensor.chunk(2, 0)?;
    Ok(Tensor::cat(&[&parts[1], &parts[0]], 0)?)
}

struct Remap {
    source: HashMap<String, Tensor>,
    target: HashMap<String, Tensor>,
}

impl Remap {
    fn rename(&mut self, from: &str, to: &str) {
        for suffix in ["weight", "bias"] {
            if let Some(t) = self.source.remove(&format!("{}.{}", from, suffix)) {
                self.target.insert(format!("{}.{}", to, suffix), t);
            }
        }
    }

    fn rename_exact(&mut self, from: &str, to: &str) {
        if let Some(t) = self.source.remove(from) {
            self.target.insert(to.to_string(), t);
        }
    }

    fn split_qkv(&mut self, from: &str, to: [&str; 3]) -> Result<()> {
        for suffix in ["weight", "bias"] {
            if let Some(t) = self.source.remove(&format!("{}.{}", from, suffix)) {
                let parts = t.chunk(3, 0)?;
                for (name, part) in to.iter().zip(parts) {
                    self.target.insert(format!("{}.{}", name, suffix), part);
                }
            }
        }
        Ok(())
    }

    fn swapped(&mut self, from: &str, to: &str) -> Result<()> {
        for suffix in ["weight", "bias"] {
            if let Some(t) = self.source.remove(&format!("{}.{}", from, suffix)) {
                self.target.insert(format!("{}.{}", to, suffix), swap_scale_shift(&t)?);
            }
        }
        Ok(())
    }
}

/// Convert an original SD3 transformer state dict to diffusers names
///
/// Names the conversion does not know are kept as they are so that the caller
/// can report them as skipped.
pub fn remap_sd3_transformer(weights: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let source = check_and_strip_prefix(weights);
    let config = Sd3TransformerConfig::from_checkpoint_keys(source.keys());
    let mut m = Remap {
        source,
        target: HashMap::new(),
    };

    m.rename_exact("pos_embed", "pos_embed.pos_embed");
    m.rename("x_embedder.proj", "pos_embed.proj");
    m.rename("t_embedder.mlp.0", "time_text_embed.timestep_embedder.linear_1");
    m.rename("t_embedder.mlp.2", "time_text_embed.timestep_embedder.linear_2");
    m.rename("y_embedder.mlp.0", "time_text_embed.text_embedder.linear_1");
    m.rename("y_embedder.mlp.2", "time_text_embed.text_embedder.linear_2");
    m.rename("context_embedder", "context_embedder");

    for i in 0..config.num_layers {
        let src = format!("joint_blocks.{}", i);
        let dst = format!("transformer_blocks.{}", i);
        let last = i + 1 == config.num_layers;

        m.split_qkv(
            &format!("{src}.x_block.attn.qkv"),
            [&format!("{dst}.attn.to_q"), &format!("{dst}.attn.to_k"), &format!("{dst}.attn.to_v")],
        )?;
        m.split_qkv(
            &format!("{src}.context_block.attn.qkv"),
            [&format!("{dst}.attn.add_q_proj"), &format!("{dst}.attn.add_k_proj"), &format!("{dst}.attn.add_v_proj")],
        )?;
        m.rename(&format!("{src}.x_block.attn.ln_q"), &format!("{dst}.attn.norm_q"));
        m.rename(&format!("{src}.x_block.attn.ln_k"), &format!("{dst}.attn.norm_k"));
        m.rename(&format!("{src}.context_block.attn.ln_q"), &format!("{dst}.attn.norm_added_q"));
        m.rename(&format!("{src}.context_block.attn.ln_k"), &format!("{dst}.attn.norm_added_k"));
        m.rename(&format!("{src}.x_block.attn.proj"), &format!("{dst}.attn.to_out.0"));
        m.rename(&format!("{src}.context_block.attn.proj"), &format!("{dst}.attn.to_add_out"));

        m.split_qkv(
            &format!("{src}.x_block.attn2.qkv"),
            [&format!("{dst}.attn2.to_q"), &format!("{dst}.attn2.to_k"), &format!("{dst}.attn2.to_v")],
        )?;
        m.rename(&format!("{src}.x_block.attn2.ln_q"), &format!("{dst}.attn2.norm_q"));
        m.rename(&format!("{src}.x_block.attn2.ln_k"), &format!("{dst}.attn2.norm_k"));
        m.rename(&format!("{src}.x_block.attn2.proj"), &format!("{dst}.attn2.to_out.0"));

        m.rename(&format!("{src}.x_block.adaLN_modulation.1"), &format!("{dst}.norm1.linear"));
        if last {
            m.swapped(&format!("{src}.context_block.adaLN_modulation.1"), &format!("{dst}.norm1_context.linear"))?;
        } else {
            m.rename(&format!("{src}.context_block.adaLN_modulation.1"), &format!("{dst}.norm1_context.linear"));
        }

        m.rename(&format!("{src}.x_block.mlp.fc1"), &format!("{dst}.ff.net.0.proj"));
        m.rename(&format!("{src}.x_block.mlp.fc2"), &format!("{dst}.ff.net.2"));
        m.rename(&format!("{src}.context_block.mlp.fc1"), &format!("{dst}.ff_context.net.0.proj"));
        m.rename(&format!("{src}.context_block.mlp.fc2"), &format!("{dst}.ff_context.net.2"));
    }

    m.rename("final_layer.linear", "proj_out");
    m.swapped("final_layer.adaLN_modulation.1", "norm_out.linear")?;

    let converted = m.target.len();
    let leftover = m.source.len();
    let mut remapped = m.target;
    remapped.extend(m.source);
    info!(
        "Remapped SD3 transformer: layers={} converted={} unknown={}",
        config.num_layers, converted, leftover
    );
    Ok(remapped)
}

/// The diffusers tensor names a transformer with this config expects
pub fn sd3_transformer_keys(config: &Sd3TransformerConfig) -> HashSet<String> {
    let mut keys = HashSet::new();
    let mut linear = |name: String| {
        keys.insert(format!("{}.weight", name));
        keys.insert(format!("{}.bias", name));
    };
    linear("pos_embed.proj".to_string());
    linear("time_text_embed.timestep_embedder.linear_1".to_string());
    linear("time_text_embed.timestep_embedder.linear_2".to_string());
    linear("time_text_embed.text_embedder.linear_1".to_string());
    linear("time_text_embed.text_embedder.linear_2".to_string());
    linear("context_embedder".to_string());
    linear("norm_out.linear".to_string());
    linear("proj_out".to_string());

    for i in 0..config.num_layers {
        let b = format!("transformer_blocks.{}", i);
        let last = i + 1 == config.num_layers;
        for name in ["to_q", "to_k", "to_v", "add_q_proj", "add_k_proj", "add_v_proj", "to_out.0"] {
            linear(format!("{b}.attn.{name}"));
        }
        linear(format!("{b}.norm1.linear"));
        linear(format!("{b}.norm1_context.linear"));
        linear(format!("{b}.ff.net.0.proj"));
        linear(format!("{b}.ff.net.2"));
        if !last {
            linear(format!("{b}.attn.to_add_out"));
            linear(format!("{b}.ff_context.net.0.proj"));
            linear(format!("{b}.ff_context.net.2"));
        }
        if config.dual_attention_layers.contains(&i) {
            for name in ["to_q", "to_k", "to_v", "to_out.0"] {
                linear(format!("{b}.attn2.{name}"));
            }
        }
    }
    keys.insert("pos_embed.pos_embed".to_string());

    if config.has_qk_norm() {
        for i in 0..config.num_layers {
            let b = format!("transformer_blocks.{}", i);
            for name in ["norm_q", "norm_k", "norm_added_q", "norm_added_k"] {
                keys.insert(format!("{b}.attn.{name}.weight"));
            }
            if config.dual_attention_layers.contains(&i) {
                keys.insert(format!("{b}.attn2.norm_q.weight"));
                keys.insert(format!("{b}.attn2.norm_k.weight"));
            }
        }
    }
    keys
}

/// Keep the tensors the transformer expects; returns (kept, applied, skipped)
pub fn filter_expected(
    weights: HashMap<String, Tensor>,
    expected: &HashSet<String>,
) -> (HashMap<String, Tensor>, usize, usize) {
    let mut kept = HashMap::new();
    let mut skipped = 0;
    for (name, tensor) in weights {
        if expected.contains(&name) {
            kept.insert(name, tensor);
        } else {
            skipped += 1;
        }
    }
    let applied = kept.len();
    (kept, applied, skipped)
}
