//! Runtime options loaded from a YAML file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::memory::OffloadMode;

/// Sentinel used by every override option to mean "no override"
pub const NONE: &str = "None";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub device: String,
    pub dtype: String,
    /// Root for hub downloads and locally mirrored repositories
    pub cache_dir: Option<PathBuf>,
    pub models: ModelDirs,
    pub overrides: OverrideOptions,
    pub quantization: QuantizationOptions,
    pub prompt: PromptOptions,
    pub offload_mode: OffloadMode,
    pub upscaler: UpscalerOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: "cuda:0".to_string(),
            dtype: "bf16".to_string(),
            cache_dir: None,
            models: ModelDirs::default(),
            overrides: OverrideOptions::default(),
            quantization: QuantizationOptions::default(),
            prompt: PromptOptions::default(),
            offload_mode: OffloadMode::None,
            upscaler: UpscalerOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelDirs {
    pub unet_dir: Option<PathBuf>,
    pub text_encoder_dir: Option<PathBuf>,
    pub vae_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideOptions {
    pub unet: String,
    pub text_encoder: String,
    pub vae: String,
}

impl Default for OverrideOptions {
    fn default() -> Self {
        Self {
            unet: NONE.to_string(),
            text_encoder: NONE.to_string(),
            vae: NONE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationOptions {
    /// Subset of "Model" and "Text Encoder"
    pub modules: Vec<String>,
    /// fp8, nf4 or fp4
    pub quant_type: String,
    pub storage: String,
}

impl Default for QuantizationOptions {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            quant_type: "nf4".to_string(),
            storage: "uint8".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PooledMode {
    /// Project the hidden state found at the first end-of-text token
    Weighted,
    /// Dedicated pooling pass over the plain prompt text
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptOptions {
    pub mean_norm: bool,
    pub textencoder_cache: bool,
    pub pooled: PooledMode,
    pub zeros_prompt_pad: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            mean_norm: false,
            textencoder_cache: true,
            pooled: PooledMode::Standard,
            zeros_prompt_pad: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscalerOptions {
    pub tile_size: usize,
    pub tile_overlap: usize,
    pub unload: bool,
}

impl Default for UpscalerOptions {
    fn default() -> Self {
        Self {
            tile_size: 192,
            tile_overlap: 8,
            unload: false,
        }
    }
}

impl Options {
    pub fn candle_dtype(&self) -> candle_core::DType {
        match self.dtype.to_lowercase().as_str() {
            "f32" | "fp32" | "float32" => candle_core::DType::F32,
            "f16" | "fp16" | "float16" => candle_core::DType::F16,
            _ => candle_core::DType::BF16,
        }
    }
}

pub fn load_options(path: &Path) -> Result<Options> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let options: Options = serde_yaml::from_str(&config_str)
        .with_context(|| "Failed to parse YAML config")?;

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
device: cpu
prompt:
  mean_norm: true
  pooled: weighted
upscaler:
  tile_size: 256
offload_mode: balanced
"#;
        let options: Options = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.device, "cpu");
        assert!(options.prompt.mean_norm);
        assert!(options.prompt.textencoder_cache);
        assert_eq!(options.prompt.pooled, PooledMode::Weighted);
        assert_eq!(options.upscaler.tile_size, 256);
        assert_eq!(options.upscaler.tile_overlap, 8);
        assert_eq!(options.offload_mode, OffloadMode::Balanced);
        assert_eq!(options.overrides.unet, NONE);
    }

    #[test]
    fn test_load_options_from_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("options.yaml");
        fs::write(&path, "dtype: f16\nquantization:\n  modules: [Model]\n  quant_type: fp8\n")?;
        let options = load_options(&path)?;
        assert_eq!(options.candle_dtype(), candle_core::DType::F16);
        assert_eq!(options.quantization.modules, vec!["Model".to_string()]);
        assert_eq!(options.quantization.quant_type, "fp8");
        Ok(())
    }
}
