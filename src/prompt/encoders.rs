//! Candle-backed text encoders and tokenizers
//!
//! CLIP-L / CLIP-G use `stable_diffusion::clip` with an optional separate text
//! projection. T5-XXL uses `t5::T5EncoderModel`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use candle_core::{Device, IndexOp, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};
use candle_transformers::models::stable_diffusion::clip;
use candle_transformers::models::t5;
use log::{info, warn};
use tokenizers::Tokenizer;

use super::engine::TextEncoderSet;
use super::provider::{PromptTokenizer, SequenceEncoder, TextTransformer, WeightedClipProvider};
use crate::loaders::RepoFetcher;
use crate::models::{Component, ComponentSlot, HiddenStateSelection, Pipeline};

const CLIP_BOS: &str = "<|startoftext|>";
const CLIP_EOS: &str = "<|endoftext|>";
/// Default sequence length for T5 conditioning
pub const T5_MAX_LENGTH: usize = 256;

/// `tokenizers` based tokenizer for CLIP
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    bos: u32,
    eos: u32,
    pad: u32,
}

impl HfTokenizer {
    /// `pad_token` defaults to the end-of-text token
    pub fn from_file(path: &Path, pad_token: Option<&str>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load CLIP tokenizer: {}: {}", path.display(), e))?;
        let bos = tokenizer.token_to_id(CLIP_BOS).unwrap_or(49406);
        let eos = tokenizer.token_to_id(CLIP_EOS).unwrap_or(49407);
        let pad = pad_token.and_then(|t| tokenizer.token_to_id(t)).unwrap_or(eos);
        Ok(Self { tokenizer, bos, eos, pad })
    }
}

impl PromptTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Tokenization failed: {:?}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn bos_id(&self) -> u32 {
        self.bos
    }

    fn eos_id(&self) -> u32 {
        self.eos
    }

    fn pad_id(&self) -> u32 {
        self.pad
    }

    fn added_tokens(&self) -> Vec<String> {
        self.tokenizer
            .get_added_tokens_decoder()
            .values()
            .filter(|t| !t.special)
            .map(|t| t.content.clone())
            .collect()
    }
}

/// CLIP text transformer with the pieces the weighted encoder needs
pub struct ClipTextEncoder {
    model: clip::ClipTextTransformer,
    final_layer_norm: LayerNorm,
    projection: Option<Linear>,
    eos: u32,
    device: Device,
}

impl ClipTextEncoder {
    /// Build from weights laid out as `text_model.*` plus optional `text_projection`
    pub fn new(vb: VarBuilder, config: &clip::Config, hidden_size: usize, projection_dim: Option<usize>, eos: u32) -> Result<Self> {
        let device = vb.device().clone();
        let final_layer_norm = candle_nn::layer_norm(hidden_size, 1e-5, vb.pp("text_model").pp("final_layer_norm"))?;
        let projection = match projection_dim {
            Some(dim) if vb.contains_tensor("text_projection.weight") => {
                Some(candle_nn::linear_no_bias(hidden_size, dim, vb.pp("text_projection"))?)
            }
            _ => None,
        };
        let model = clip::ClipTextTransformer::new(vb, config)?;
        Ok(Self {
            model,
            final_layer_norm,
            projection,
            eos,
            device,
        })
    }

    /// CLIP-L as used by SD 1.x, SDXL and SD3
    pub fn clip_l(component: &Component, device: &Device) -> Result<Self> {
        let vb = text_encoder_vb(component, device)?;
        info!("Load model: type=TextEncoder name=clip-l origin={}", component.origin);
        Self::new(vb, &clip::Config::v1_5(), 768, Some(768), 49407)
    }

    /// OpenCLIP ViT-bigG as used by SDXL and SD3
    pub fn clip_g(component: &Component, device: &Device) -> Result<Self> {
        let vb = text_encoder_vb(component, device)?;
        info!("Load model: type=TextEncoder name=clip-g origin={}", component.origin);
        Self::new(vb, &clip::Config::sdxl2(), 1280, Some(1280), 49407)
    }
}

impl TextTransformer for ClipTextEncoder {
    fn hidden_states(&mut self, ids: &Tensor, selection: HiddenStateSelection) -> Result<Tensor> {
        let until_layer = -(selection.layer_from_end.max(1) as isize);
        let (normed, hidden) = self.model.forward_until_encoder_layer(ids, usize::MAX, until_layer)?;
        match (selection.final_norm, selection.layer_from_end <= 1) {
            (true, true) => Ok(normed),
            (true, false) => Ok(self.final_layer_norm.forward(&hidden)?),
            (false, _) => Ok(hidden),
        }
    }

    fn pooled(&mut self, ids: &Tensor) -> Result<Tensor> {
        let (normed, _) = self.model.forward_until_encoder_layer(ids, usize::MAX, -1)?;
        let row = ids.i(0)?.to_vec1::<u32>()?;
        let eos = super::provider::first_eos_position(&row, self.eos);
        let pooled = normed.i((.., eos, ..))?;
        self.project(&pooled)
    }

    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        match &self.projection {
            Some(projection) => Ok(projection.forward(hidden)?),
            None => Ok(hidden.clone()),
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Strip whichever single-file prefix this text encoder uses
fn text_encoder_vb(component: &Component, device: &Device) -> Result<VarBuilder<'static>> {
    let vb = component.var_builder(device)?;
    if vb.contains_tensor("text_model.embeddings.token_embedding.weight") {
        return Ok(vb);
    }
    for prefix in component.slot.single_file_prefixes() {
        for inner in ["", "transformer."] {
            let prefix = format!("{}{}", prefix, inner);
            let candidate = vb.pp(prefix.trim_end_matches('.'));
            if candidate.contains_tensor("text_model.embeddings.token_embedding.weight") {
                return Ok(candidate);
            }
        }
    }
    Err(anyhow!("Text encoder weights not found: {}", component.origin))
}

pub type ClipProvider = WeightedClipProvider<HfTokenizer, ClipTextEncoder>;

/// Pair a CLIP component with its tokenizer
pub fn clip_provider(component: &Component, tokenizer: &Path, device: &Device) -> Result<ClipProvider> {
    let (model, pad) = match component.slot {
        ComponentSlot::TextEncoder => (ClipTextEncoder::clip_l(component, device)?, None),
        ComponentSlot::TextEncoder2 => (ClipTextEncoder::clip_g(component, device)?, Some("!")),
        slot => return Err(anyhow!("Not a CLIP text encoder slot: {}", slot)),
    };
    let tokenizer = HfTokenizer::from_file(tokenizer, pad)?;
    Ok(WeightedClipProvider::new(component.slot, tokenizer, model))
}

/// T5-XXL encoder for SD3 and Flux
pub struct T5TextEncoder {
    model: t5::T5EncoderModel,
    tokenizer: Tokenizer,
    max_length: usize,
    hidden_size: usize,
    device: Device,
}

impl T5TextEncoder {
    pub fn xxl_config() -> t5::Config {
        t5::Config {
            vocab_size: 32128,
            d_model: 4096,
            d_kv: 64,
            d_ff: 10240,
            num_layers: 24,
            num_decoder_layers: Some(24),
            num_heads: 64,
            relative_attention_num_buckets: 32,
            relative_attention_max_distance: 128,
            dropout_rate: 0.1,
            layer_norm_epsilon: 1e-6,
            initializer_factor: 1.0,
            feed_forward_proj: t5::ActivationWithOptionalGating {
                gated: true,
                activation: candle_nn::Activation::NewGelu,
            },
            use_cache: true,
            tie_word_embeddings: true,
            decoder_start_token_id: Some(0),
            eos_token_id: 1,
            is_decoder: false,
            is_encoder_decoder: false,
            pad_token_id: 0,
        }
    }

    pub fn load(component: &Component, tokenizer: &Path, max_length: usize, device: &Device) -> Result<Self> {
        let config = Self::xxl_config();
        let mut vb = component.var_builder(device)?;
        if !vb.contains_tensor("shared.weight") {
            if let Some(prefix) = component
                .slot
                .single_file_prefixes()
                .iter()
                .map(|p| p.trim_end_matches('.'))
                .find(|p| vb.pp(*p).contains_tensor("shared.weight"))
            {
                vb = vb.pp(prefix);
            }
        }
        info!("Load model: type=TextEncoder name=t5 origin={}", component.origin);
        let model = t5::T5EncoderModel::load(vb, &config).context("Failed to load T5 encoder")?;
        let tokenizer = Tokenizer::from_file(tokenizer).map_err(|e| anyhow!("Failed to load T5 tokenizer: {}", e))?;
        Ok(Self {
            model,
            tokenizer,
            max_length,
            hidden_size: config.d_model,
            device: device.clone(),
        })
    }
}

impl SequenceEncoder for T5TextEncoder {
    fn encode(&mut self, text: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {:?}", e))?;
        let mut ids = encoding.get_ids().to_vec();
        ids.truncate(self.max_length);
        ids.resize(self.max_length, 0);
        let ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&ids)?)
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

/// Tokenizer files for the text encoders of a pipeline
#[derive(Debug, Clone, Default)]
pub struct TokenizerFiles {
    pub clip_l: Option<PathBuf>,
    pub clip_g: Option<PathBuf>,
    pub t5: Option<PathBuf>,
}

impl TokenizerFiles {
    /// Fetch `tokenizer*/tokenizer.json` from a diffusers repository; missing files stay unset
    pub fn fetch(fetcher: &dyn RepoFetcher, repo_id: &str) -> Self {
        let get = |folder: &str| match fetcher.fetch(repo_id, &format!("{}/tokenizer.json", folder)) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Tokenizer not found: repo={} folder={} {}", repo_id, folder, e);
                None
            }
        };
        Self {
            clip_l: get("tokenizer"),
            clip_g: get("tokenizer_2"),
            t5: get("tokenizer_3"),
        }
    }
}

/// Build the encoder set for the text encoders present in `pipe`
pub fn load_text_encoders(pipe: &Pipeline, tokenizers: &TokenizerFiles, device: &Device) -> Result<TextEncoderSet> {
    let mut set = TextEncoderSet::new();
    if let (Some(component), Some(tokenizer)) = (pipe.component(ComponentSlot::TextEncoder), &tokenizers.clip_l) {
        set = set.with_clip(clip_provider(component, tokenizer, device)?);
    }
    if let (Some(component), Some(tokenizer)) = (pipe.component(ComponentSlot::TextEncoder2), &tokenizers.clip_g) {
        set = set.with_clip(clip_provider(component, tokenizer, device)?);
    }
    if let (Some(component), Some(tokenizer)) = (pipe.component(ComponentSlot::TextEncoder3), &tokenizers.t5) {
        set = set.with_t5(T5TextEncoder::load(component, tokenizer, T5_MAX_LENGTH, device)?);
    }
    Ok(set)
}
