//! Weighted multi-encoder prompt conditioning
//!
//! Turns the prompts of a request into the embedding tensors each model family
//! expects: CLIP sequence embeddings with per-token attention weights, pooled
//! vectors, T5 sequences for SD3/Flux, negative conditioning of equal length.

use std::time::Instant;

use anyhow::{anyhow, Result};
use candle_core::{IndexOp, Tensor, D};
use log::{debug, info, warn};

use super::attention::{expand_textual_inversion, normalize_weights, parse_prompt_attention, split_on_break, WeightedSegment};
use super::cache::{CacheKey, PromptEmbeddingCache};
use super::provider::{first_eos_position, pad_features, pad_sequence, zero_window, EmbeddingsProvider, SequenceEncoder, WINDOW_LEN};
use super::schedule::resolve_schedule;
use super::split::{split_prompts, SplitPrompt};
use crate::adapters::pad_to_len;
use crate::config::{PooledMode, PromptOptions};
use crate::interrupt::Interrupt;
use crate::memory::{move_model, release, DeviceTier, Devices, OffloadMode};
use crate::models::{ComponentSlot, HiddenStateSelection, ModelFamily, Pipeline};
use crate::request::ProcessingRequest;

/// Width of CLIP-L; wider last encoders produce a pooled vector
const CLIP_L_WIDTH: usize = 768;
const T5_WIDTH: usize = 4096;

/// Conditioning tensors for one request, batch first
#[derive(Debug, Clone)]
pub struct EmbeddingSet {
    pub positive: Tensor,
    pub positive_pooled: Option<Tensor>,
    /// Absent for families without negative conditioning
    pub negative: Option<Tensor>,
    pub negative_pooled: Option<Tensor>,
}

/// The text encoders of a pipeline in slot order
#[derive(Default)]
pub struct TextEncoderSet {
    pub clip: Vec<Box<dyn EmbeddingsProvider>>,
    pub t5: Option<Box<dyn SequenceEncoder>>,
}

impl TextEncoderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clip(mut self, provider: impl EmbeddingsProvider + 'static) -> Self {
        self.clip.push(Box::new(provider));
        self
    }

    pub fn with_t5(mut self, encoder: impl SequenceEncoder + 'static) -> Self {
        self.t5 = Some(Box::new(encoder));
        self
    }
}

/// Weighted segments, embeddings and framed token ids per encoder
struct EncodedPrompt {
    segments: Vec<Vec<WeightedSegment>>,
    embeds: Vec<Tensor>,
    ids: Vec<Vec<u32>>,
}

fn joined_text(segments: &[WeightedSegment]) -> String {
    segments
        .iter()
        .filter(|s| !s.is_control())
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode each BREAK chunk separately and join them along the sequence axis
fn encode_chunks(
    provider: &mut dyn EmbeddingsProvider,
    segments: &[WeightedSegment],
    selection: HiddenStateSelection,
) -> Result<(Tensor, Vec<u32>)> {
    let chunks = split_on_break(segments);
    if chunks.is_empty() {
        return provider.weighted_embeddings(&[WeightedSegment::new("", 1.0)], selection);
    }
    let mut embeds = Vec::with_capacity(chunks.len());
    let mut ids = Vec::new();
    for chunk in &chunks {
        let (z, chunk_ids) = provider.weighted_embeddings(chunk, selection)?;
        embeds.push(z);
        ids.extend(chunk_ids);
    }
    Ok((Tensor::cat(&embeds, 1)?, ids))
}

/// Concatenate per-encoder embeddings along features, zero-padding sequence lengths
fn concat_features(embeds: &[Tensor]) -> Result<Tensor> {
    let mut max_len = 0;
    for embed in embeds {
        max_len = max_len.max(embed.dim(1)?);
    }
    let padded = embeds.iter().map(|e| pad_sequence(e, max_len)).collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&padded, D::Minus1)?)
}

/// Zero-pad each entry to the longest sequence and stack along the batch axis
fn fix_length(entries: &[Tensor]) -> Result<Tensor> {
    let mut max_len = 0;
    for entry in entries {
        max_len = max_len.max(entry.dim(1)?);
    }
    let padded = entries.iter().map(|e| pad_sequence(e, max_len)).collect::<Result<Vec<_>>>()?;
    Ok(Tensor::cat(&padded, 0)?)
}

fn stack_optional(entries: &[Option<Tensor>], sequence: bool) -> Result<Option<Tensor>> {
    let present: Option<Vec<Tensor>> = entries.iter().cloned().collect();
    match present {
        Some(tensors) if !tensors.is_empty() => {
            if sequence {
                Ok(Some(fix_length(&tensors)?))
            } else {
                Ok(Some(Tensor::cat(&tensors, 0)?))
            }
        }
        _ => Ok(None),
    }
}

/// Session-owned prompt encoder with its single-slot cache
pub struct PromptEncoder {
    options: PromptOptions,
    offload: OffloadMode,
    devices: Devices,
    interrupt: Interrupt,
    cache: PromptEmbeddingCache,
}

impl PromptEncoder {
    pub fn new(options: PromptOptions, offload: OffloadMode, devices: Devices, interrupt: Interrupt) -> Self {
        Self {
            options,
            offload,
            devices,
            interrupt,
            cache: PromptEmbeddingCache::new(),
        }
    }

    pub fn cache(&self) -> &PromptEmbeddingCache {
        &self.cache
    }

    /// Encode the prompts of `request` into `request.embeddings`
    ///
    /// Unsupported families and interrupted runs return without embeddings.
    pub fn encode_prompts(&mut self, pipe: &mut Pipeline, encoders: &mut TextEncoderSet, request: &mut ProcessingRequest) -> Result<()> {
        let family = pipe.family;
        if !family.supports_prompt_weighting() {
            warn!("Prompt parser not supported: family={}", family);
            return Ok(());
        }

        let key = CacheKey::for_request(request, family);
        if self.options.textencoder_cache {
            if let Some(cached) = self.cache.get(&key) {
                request.embeddings = Some(cached.embeddings.clone());
                request.scheduled_prompt = cached.scheduled;
                return Ok(());
            }
        }

        let start = Instant::now();
        for slot in ComponentSlot::TEXT_ENCODERS {
            if let Some(component) = pipe.component_mut(slot) {
                move_model(component, DeviceTier::Compute, &self.devices)?;
            }
        }
        let encoded = self.encode_batch(encoders, request, family);
        for slot in ComponentSlot::TEXT_ENCODERS {
            if let Some(component) = pipe.component_mut(slot) {
                release(component, self.offload, &self.devices)?;
            }
        }

        let Some((embeddings, scheduled)) = encoded? else {
            return Ok(());
        };
        debug!(
            "Prompt encode: family={} batch={} positive={:?} pooled={:?} negative={:?} scheduled={} time={:.2}",
            family,
            request.prompts.len(),
            embeddings.positive.dims(),
            embeddings.positive_pooled.as_ref().map(|t| t.dims().to_vec()),
            embeddings.negative.as_ref().map(|t| t.dims().to_vec()),
            scheduled,
            start.elapsed().as_secs_f32()
        );
        request.embeddings = Some(embeddings.clone());
        request.scheduled_prompt = scheduled;
        if self.options.textencoder_cache && request.batch_size == 1 {
            self.cache.store(key, embeddings, scheduled);
        } else {
            self.cache.clear();
        }
        Ok(())
    }

    fn encode_batch(
        &self,
        encoders: &mut TextEncoderSet,
        request: &ProcessingRequest,
        family: ModelFamily,
    ) -> Result<Option<(EmbeddingSet, bool)>> {
        let prompts = if request.prompts.is_empty() {
            vec![String::new()]
        } else {
            request.prompts.clone()
        };
        let negatives = pad_to_len(&request.negative_prompts, prompts.len(), String::new());

        let mut scheduled = false;
        let mut entries: Vec<EmbeddingSet> = Vec::with_capacity(prompts.len());
        for i in 0..prompts.len() {
            if self.interrupt.is_set() {
                info!("Prompt encode: interrupted at={}/{}", i, prompts.len());
                return Ok(None);
            }
            let positive = resolve_schedule(&prompts[i], request.steps);
            let negative = resolve_schedule(&negatives[i], request.steps);
            scheduled |= positive.scheduled || negative.scheduled;

            if i > 0 && prompts[i] == prompts[i - 1] && negatives[i] == negatives[i - 1] {
                let previous = entries[i - 1].clone();
                entries.push(previous);
                continue;
            }
            entries.push(self.weighted_text_embeddings(encoders, &positive.prompt, &negative.prompt, family, request.clip_skip)?);
        }

        let positive = fix_length(&entries.iter().map(|e| e.positive.clone()).collect::<Vec<_>>())?;
        let positive_pooled = stack_optional(&entries.iter().map(|e| e.positive_pooled.clone()).collect::<Vec<_>>(), false)?;
        let negative = stack_optional(&entries.iter().map(|e| e.negative.clone()).collect::<Vec<_>>(), true)?;
        let negative_pooled = stack_optional(&entries.iter().map(|e| e.negative_pooled.clone()).collect::<Vec<_>>(), false)?;
        Ok(Some((
            EmbeddingSet {
                positive,
                positive_pooled,
                negative,
                negative_pooled,
            },
            scheduled,
        )))
    }

    fn parse_for(&self, provider: &dyn EmbeddingsProvider, text: &str) -> Vec<WeightedSegment> {
        let text = expand_textual_inversion(text, &provider.added_tokens());
        let mut segments = parse_prompt_attention(&text);
        if self.options.mean_norm {
            normalize_weights(&mut segments);
        }
        segments
    }

    fn encode_positive(
        &self,
        providers: &mut [Box<dyn EmbeddingsProvider>],
        prompt: &SplitPrompt,
        selection: HiddenStateSelection,
    ) -> Result<EncodedPrompt> {
        let mut encoded = EncodedPrompt {
            segments: Vec::new(),
            embeds: Vec::new(),
            ids: Vec::new(),
        };
        for (i, provider) in providers.iter_mut().enumerate() {
            let text = if i == 0 { &prompt.primary } else { &prompt.secondary };
            let segments = self.parse_for(&**provider, text);
            let (z, ids) = encode_chunks(&mut **provider, &segments, selection)?;
            encoded.segments.push(segments);
            encoded.embeds.push(z);
            encoded.ids.push(ids);
        }
        Ok(encoded)
    }

    /// Negatives are encoded in one pass; BREAK has no effect on them
    fn encode_negative(
        &self,
        providers: &mut [Box<dyn EmbeddingsProvider>],
        prompt: &SplitPrompt,
        selection: HiddenStateSelection,
    ) -> Result<EncodedPrompt> {
        let mut encoded = EncodedPrompt {
            segments: Vec::new(),
            embeds: Vec::new(),
            ids: Vec::new(),
        };
        for (i, provider) in providers.iter_mut().enumerate() {
            let text = if i == 0 { &prompt.primary } else { &prompt.secondary };
            let segments: Vec<WeightedSegment> = self
                .parse_for(&**provider, text)
                .into_iter()
                .filter(|s| !s.is_control())
                .collect();
            let (z, ids) = provider.weighted_embeddings(&segments, selection)?;
            encoded.segments.push(segments);
            encoded.embeds.push(z);
            encoded.ids.push(ids);
        }
        Ok(encoded)
    }

    fn pooled(
        &self,
        providers: &mut [Box<dyn EmbeddingsProvider>],
        family: ModelFamily,
        encoded: &EncodedPrompt,
        pooled_text: &str,
    ) -> Result<Option<Tensor>> {
        let last = providers.len() - 1;
        if family == ModelFamily::Sd3 {
            let first_text = joined_text(&encoded.segments[0]);
            let last_text = joined_text(&encoded.segments[last]);
            let first = providers[0].pooled_embeddings(&first_text)?;
            let second = providers[last].pooled_embeddings(&last_text)?;
            return Ok(Some(Tensor::cat(&[first, second], D::Minus1)?));
        }

        let embed = &encoded.embeds[last];
        if embed.dim(D::Minus1)? <= CLIP_L_WIDTH {
            return Ok(None);
        }
        match self.options.pooled {
            PooledMode::Weighted => {
                let position = first_eos_position(&encoded.ids[last], providers[last].eos_id());
                let row = embed.i((.., position, ..))?;
                Ok(Some(providers[last].project(&row)?))
            }
            PooledMode::Standard => match providers[last].pooled_embeddings(pooled_text) {
                Ok(pooled) => Ok(Some(pooled)),
                Err(e) => {
                    warn!("Prompt encode: pooled embeddings failed: {}", e);
                    Ok(None)
                }
            },
        }
    }

    /// Encoded empty prompt across all encoders, one window long
    fn empty_embedding(&self, providers: &mut [Box<dyn EmbeddingsProvider>], selection: HiddenStateSelection) -> Result<Tensor> {
        let mut embeds = Vec::with_capacity(providers.len());
        for provider in providers.iter_mut() {
            let (z, _) = provider.weighted_embeddings(&[WeightedSegment::new("", 1.0)], selection)?;
            embeds.push(z);
        }
        concat_features(&embeds)
    }

    /// Embeddings for a single positive/negative pair
    pub fn weighted_text_embeddings(
        &self,
        encoders: &mut TextEncoderSet,
        prompt: &str,
        negative_prompt: &str,
        family: ModelFamily,
        clip_skip: usize,
    ) -> Result<EmbeddingSet> {
        let sd3 = family == ModelFamily::Sd3;
        let positive = split_prompts(prompt, sd3);
        let negative = split_prompts(negative_prompt, sd3);
        let selection = family.hidden_state_selection(clip_skip);
        let TextEncoderSet { clip, t5 } = encoders;

        if family == ModelFamily::Flux {
            let t5 = t5.as_mut().ok_or_else(|| anyhow!("T5 text encoder not loaded"))?;
            let clip = clip.first_mut().ok_or_else(|| anyhow!("CLIP text encoder not loaded"))?;
            return Ok(EmbeddingSet {
                positive: t5.encode(&positive.secondary)?,
                positive_pooled: Some(clip.pooled_embeddings(&positive.primary)?),
                negative: None,
                negative_pooled: None,
            });
        }

        let count = family.weighted_encoder_count().min(clip.len());
        if count == 0 {
            return Err(anyhow!("No text encoders for family: {}", family));
        }
        let providers = &mut clip[..count];

        let encoded_positive = self.encode_positive(providers, &positive, selection)?;
        let encoded_negative = self.encode_negative(providers, &negative, selection)?;
        let mut prompt_embeds = concat_features(&encoded_positive.embeds)?;
        let mut negative_embeds = concat_features(&encoded_negative.embeds)?;

        let pooled = self.pooled(providers, family, &encoded_positive, &positive.secondary)?;
        let negative_pooled = self.pooled(providers, family, &encoded_negative, &negative.secondary)?;

        let (positive_len, negative_len) = (prompt_embeds.dim(1)?, negative_embeds.dim(1)?);
        if positive_len != negative_len {
            let empty = if self.options.zeros_prompt_pad || sd3 {
                zero_window(prompt_embeds.dim(D::Minus1)?, prompt_embeds.dtype(), prompt_embeds.device())?
            } else {
                self.empty_embedding(providers, selection)?
            };
            let repeats = (positive_len.max(negative_len) - positive_len.min(negative_len)) / WINDOW_LEN;
            if repeats > 0 {
                let padding = Tensor::cat(&vec![empty; repeats], 1)?;
                if positive_len < negative_len {
                    prompt_embeds = Tensor::cat(&[&prompt_embeds, &padding], 1)?;
                } else {
                    negative_embeds = Tensor::cat(&[&negative_embeds, &padding], 1)?;
                }
            }
        }

        if sd3 {
            let width = t5.as_ref().map(|t| t.hidden_size()).unwrap_or(T5_WIDTH);
            prompt_embeds = pad_features(&prompt_embeds, width)?;
            negative_embeds = pad_features(&negative_embeds, width)?;
            match t5.as_mut() {
                Some(t5) => {
                    let t5_positive = t5.encode(&positive.tertiary)?;
                    let t5_negative = t5.encode(&negative.tertiary)?;
                    prompt_embeds = Tensor::cat(&[&prompt_embeds, &t5_positive], D::Minus2)?;
                    negative_embeds = Tensor::cat(&[&negative_embeds, &t5_negative], D::Minus2)?;
                }
                None => debug!("Prompt encode: T5 text encoder not loaded, using CLIP embeddings only"),
            }
        }

        Ok(EmbeddingSet {
            positive: prompt_embeds,
            positive_pooled: pooled,
            negative: Some(negative_embeds),
            negative_pooled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::provider::testing::provider;

    fn encoder(options: PromptOptions) -> PromptEncoder {
        PromptEncoder::new(options, OffloadMode::None, Devices::cpu(), Interrupt::new())
    }

    fn sdxl_set() -> TextEncoderSet {
        TextEncoderSet::new()
            .with_clip(provider(ComponentSlot::TextEncoder, 4))
            .with_clip(provider(ComponentSlot::TextEncoder2, 6))
    }

    #[test]
    fn test_sd15_shapes() -> Result<()> {
        let engine = encoder(PromptOptions::default());
        let mut set = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 4));
        let out = engine.weighted_text_embeddings(&mut set, "a (cat:1.2)", "blurry", ModelFamily::Sd15, 1)?;
        assert_eq!(out.positive.dims(), &[1, 77, 4]);
        assert!(out.positive_pooled.is_none());
        assert_eq!(out.negative.as_ref().map(|t| t.dims().to_vec()), Some(vec![1, 77, 4]));
        Ok(())
    }

    #[test]
    fn test_break_extends_sequence_and_pads_negative() -> Result<()> {
        let engine = encoder(PromptOptions::default());
        let mut set = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 4));
        let out = engine.weighted_text_embeddings(&mut set, "(a cat:1.5) BREAK a dog", "", ModelFamily::Sd15, 1)?;
        assert_eq!(out.positive.dims(), &[1, 154, 4]);
        assert_eq!(out.negative.map(|t| t.dims().to_vec()), Some(vec![1, 154, 4]));
        Ok(())
    }

    #[test]
    fn test_zero_padding_for_negative() -> Result<()> {
        let options = PromptOptions { zeros_prompt_pad: true, ..PromptOptions::default() };
        let engine = encoder(options);
        let mut set = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 4));
        let out = engine.weighted_text_embeddings(&mut set, "a BREAK b", "", ModelFamily::Sd15, 1)?;
        let negative = out.negative.ok_or_else(|| anyhow!("negative missing"))?;
        let tail = negative.i((.., 77.., ..))?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(tail, 0.0);
        Ok(())
    }

    #[test]
    fn test_sdxl_concatenates_features_and_pools() -> Result<()> {
        let engine = encoder(PromptOptions { pooled: PooledMode::Weighted, ..PromptOptions::default() });
        let mut set = TextEncoderSet::new()
            .with_clip(provider(ComponentSlot::TextEncoder, 768))
            .with_clip(provider(ComponentSlot::TextEncoder2, 1280));
        let out = engine.weighted_text_embeddings(&mut set, "a cat TE2: a painting", "", ModelFamily::Sdxl, 1)?;
        assert_eq!(out.positive.dims(), &[1, 77, 2048]);
        let pooled = out.positive_pooled.ok_or_else(|| anyhow!("pooled missing"))?;
        assert_eq!(pooled.dims(), &[1, 1280]);
        Ok(())
    }

    #[test]
    fn test_small_last_encoder_has_no_pooled() -> Result<()> {
        let engine = encoder(PromptOptions::default());
        let mut set = sdxl_set();
        let out = engine.weighted_text_embeddings(&mut set, "a cat", "", ModelFamily::Sdxl, 2)?;
        assert_eq!(out.positive.dims(), &[1, 77, 10]);
        assert!(out.positive_pooled.is_none());
        Ok(())
    }

    struct FixedT5;

    impl SequenceEncoder for FixedT5 {
        fn encode(&mut self, _text: &str) -> Result<Tensor> {
            Ok(Tensor::ones((1, 16, 12), candle_core::DType::F32, &candle_core::Device::Cpu)?)
        }
        fn hidden_size(&self) -> usize {
            12
        }
    }

    #[test]
    fn test_sd3_joins_t5_sequence() -> Result<()> {
        let engine = encoder(PromptOptions::default());
        let mut set = sdxl_set().with_t5(FixedT5);
        let out = engine.weighted_text_embeddings(&mut set, "a cat", "ugly", ModelFamily::Sd3, 1)?;
        assert_eq!(out.positive.dims(), &[1, 77 + 16, 12]);
        assert_eq!(out.positive_pooled.map(|t| t.dims().to_vec()), Some(vec![1, 10]));
        assert_eq!(out.negative.map(|t| t.dims().to_vec()), Some(vec![1, 93, 12]));
        Ok(())
    }

    #[test]
    fn test_flux_has_no_negative() -> Result<()> {
        let engine = encoder(PromptOptions::default());
        let mut set = TextEncoderSet::new()
            .with_clip(provider(ComponentSlot::TextEncoder, 4))
            .with_t5(FixedT5);
        let out = engine.weighted_text_embeddings(&mut set, "a cat", "ugly", ModelFamily::Flux, 1)?;
        assert_eq!(out.positive.dims(), &[1, 16, 12]);
        assert!(out.negative.is_none());
        assert_eq!(out.positive_pooled.map(|t| t.dims().to_vec()), Some(vec![1, 4]));
        Ok(())
    }

    #[test]
    fn test_encode_prompts_batch_and_cache() -> Result<()> {
        let mut engine = encoder(PromptOptions::default());
        let mut pipe = Pipeline::new(ModelFamily::Sd15, "repo/sd15");
        let mut set = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 4));

        let mut request = ProcessingRequest::new("a cat", "");
        request.prompts = vec!["a cat".to_string(), "a cat".to_string(), "a BREAK long dog".to_string()];
        request.batch_size = 3;
        engine.encode_prompts(&mut pipe, &mut set, &mut request)?;
        let embeddings = request.embeddings.clone().ok_or_else(|| anyhow!("no embeddings"))?;
        assert_eq!(embeddings.positive.dims(), &[3, 154, 4]);
        // batches larger than one are never cached
        assert!(engine.cache().is_empty());

        let mut single = ProcessingRequest::new("[dog:cat:5]", "");
        engine.encode_prompts(&mut pipe, &mut set, &mut single)?;
        assert!(single.scheduled_prompt);
        assert!(!engine.cache().is_empty());
        let key = CacheKey::for_request(&single, ModelFamily::Sd15);
        assert!(engine.cache().get(&key).is_some());
        Ok(())
    }

    #[test]
    fn test_unsupported_family_and_interrupt() -> Result<()> {
        let interrupt = Interrupt::new();
        let mut engine = PromptEncoder::new(PromptOptions::default(), OffloadMode::Model, Devices::cpu(), interrupt.clone());
        let mut set = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 4));

        let mut pipe = Pipeline::new(ModelFamily::Other, "repo/other");
        let mut request = ProcessingRequest::new("a cat", "");
        engine.encode_prompts(&mut pipe, &mut set, &mut request)?;
        assert!(request.embeddings.is_none());

        let mut pipe = Pipeline::new(ModelFamily::Sd15, "repo/sd15");
        interrupt.interrupt();
        engine.encode_prompts(&mut pipe, &mut set, &mut request)?;
        assert!(request.embeddings.is_none());
        Ok(())
    }

    #[test]
    fn test_clip_skip_selects_layer() -> Result<()> {
        let engine = encoder(PromptOptions::default());
        let mut one = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 2));
        let mut two = TextEncoderSet::new().with_clip(provider(ComponentSlot::TextEncoder, 2));
        let a = engine.weighted_text_embeddings(&mut one, "cat", "", ModelFamily::Sd15, 1)?.positive;
        let b = engine.weighted_text_embeddings(&mut two, "cat", "", ModelFamily::Sd15, 2)?.positive;
        // the stand-in encoder scales by the layer offset
        let ratio = (b.i((0, 1, 0))?.to_scalar::<f32>()? / a.i((0, 1, 0))?.to_scalar::<f32>()?) as f64;
        assert!((ratio - 2.0).abs() < 1e-6);
        Ok(())
    }
}
