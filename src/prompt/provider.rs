//! Tokenizer and text-encoder seams used by the prompt engine
//!
//! A `WeightedClipProvider` turns weighted text segments into embeddings the
//! way compel does: tokens are laid out in 75-token windows framed by BOS/EOS,
//! each window is encoded separately and the per-token weight scales the
//! distance from the empty-prompt embedding.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use super::attention::WeightedSegment;
use crate::models::{ComponentSlot, HiddenStateSelection};

/// Tokens per window, excluding the BOS/EOS frame
pub const WINDOW_TOKENS: usize = 75;
/// Framed window length fed to CLIP text encoders
pub const WINDOW_LEN: usize = WINDOW_TOKENS + 2;

pub trait PromptTokenizer {
    /// Token ids without special tokens
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn bos_id(&self) -> u32;
    fn eos_id(&self) -> u32;
    fn pad_id(&self) -> u32;
    /// Tokens added on top of the base vocabulary, such as textual inversions
    fn added_tokens(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A CLIP style text transformer working on framed `[1, 77]` windows
pub trait TextTransformer {
    /// `[1, seq, hidden]` at the selected layer
    fn hidden_states(&mut self, ids: &Tensor, selection: HiddenStateSelection) -> Result<Tensor>;
    /// `[1, proj]` pooled output for the sequence
    fn pooled(&mut self, ids: &Tensor) -> Result<Tensor>;
    /// Apply the text projection to `[n, hidden]` rows
    fn project(&self, hidden: &Tensor) -> Result<Tensor>;
    fn device(&self) -> &Device;
}

/// One text encoder as seen by the prompt engine
pub trait EmbeddingsProvider {
    fn slot(&self) -> ComponentSlot;
    fn added_tokens(&self) -> Vec<String>;
    fn eos_id(&self) -> u32;
    /// Weighted embeddings `[1, windows * 77, hidden]` plus the framed token ids
    fn weighted_embeddings(&mut self, segments: &[WeightedSegment], selection: HiddenStateSelection) -> Result<(Tensor, Vec<u32>)>;
    /// Pooled embedding `[1, proj]` of the plain text
    fn pooled_embeddings(&mut self, text: &str) -> Result<Tensor>;
    fn project(&self, hidden: &Tensor) -> Result<Tensor>;
}

/// A T5 style encoder producing plain sequence embeddings
pub trait SequenceEncoder {
    /// `[1, seq, hidden]`
    fn encode(&mut self, text: &str) -> Result<Tensor>;
    fn hidden_size(&self) -> usize;
}

/// Frame a token window as `BOS tokens EOS pad..` of length 77
pub fn frame_window(tokens: &[u32], bos: u32, eos: u32, pad: u32) -> Vec<u32> {
    let mut ids = Vec::with_capacity(WINDOW_LEN);
    ids.push(bos);
    ids.extend(tokens.iter().take(WINDOW_TOKENS));
    ids.push(eos);
    ids.resize(WINDOW_LEN, pad);
    ids
}

pub struct WeightedClipProvider<T, M> {
    slot: ComponentSlot,
    tokenizer: T,
    model: M,
}

impl<T: PromptTokenizer, M: TextTransformer> WeightedClipProvider<T, M> {
    pub fn new(slot: ComponentSlot, tokenizer: T, model: M) -> Self {
        Self { slot, tokenizer, model }
    }

    fn ids_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, self.model.device())?.unsqueeze(0)?)
    }

    fn tokens_with_weights(&self, segments: &[WeightedSegment]) -> Result<(Vec<u32>, Vec<f32>)> {
        let mut tokens = Vec::new();
        let mut weights = Vec::new();
        for segment in segments.iter().filter(|s| !s.is_control()) {
            let ids = self.tokenizer.encode(&segment.text)?;
            weights.extend(std::iter::repeat(segment.weight).take(ids.len()));
            tokens.extend(ids);
        }
        Ok((tokens, weights))
    }
}

impl<T: PromptTokenizer, M: TextTransformer> EmbeddingsProvider for WeightedClipProvider<T, M> {
    fn slot(&self) -> ComponentSlot {
        self.slot
    }

    fn added_tokens(&self) -> Vec<String> {
        self.tokenizer.added_tokens()
    }

    fn eos_id(&self) -> u32 {
        self.tokenizer.eos_id()
    }

    fn weighted_embeddings(&mut self, segments: &[WeightedSegment], selection: HiddenStateSelection) -> Result<(Tensor, Vec<u32>)> {
        let (bos, eos, pad) = (self.tokenizer.bos_id(), self.tokenizer.eos_id(), self.tokenizer.pad_id());
        let (tokens, weights) = self.tokens_with_weights(segments)?;

        let mut token_windows: Vec<&[u32]> = tokens.chunks(WINDOW_TOKENS).collect();
        let mut weight_windows: Vec<&[f32]> = weights.chunks(WINDOW_TOKENS).collect();
        if token_windows.is_empty() {
            token_windows.push(&[]);
            weight_windows.push(&[]);
        }

        let mut empty: Option<Tensor> = None;
        let mut outputs = Vec::with_capacity(token_windows.len());
        let mut all_ids = Vec::with_capacity(token_windows.len() * WINDOW_LEN);
        for (window, window_weights) in token_windows.iter().zip(weight_windows.iter()) {
            let ids = frame_window(window, bos, eos, pad);
            let z = self.model.hidden_states(&self.ids_tensor(&ids)?, selection)?;

            let z = if window_weights.iter().all(|w| *w == 1.0) {
                z
            } else {
                let base = match &empty {
                    Some(base) => base.clone(),
                    None => {
                        let ids = frame_window(&[], bos, eos, pad);
                        let base = self.model.hidden_states(&self.ids_tensor(&ids)?, selection)?;
                        empty = Some(base.clone());
                        base
                    }
                };
                let mut per_token = Vec::with_capacity(WINDOW_LEN);
                per_token.push(1.0f32);
                per_token.extend_from_slice(window_weights);
                per_token.resize(WINDOW_LEN, 1.0);
                let w = Tensor::from_vec(per_token, (1, WINDOW_LEN, 1), z.device())?.to_dtype(z.dtype())?;
                (&base + z.sub(&base)?.broadcast_mul(&w)?)?
            };
            outputs.push(z);
            all_ids.extend(ids);
        }
        Ok((Tensor::cat(&outputs, 1)?, all_ids))
    }

    fn pooled_embeddings(&mut self, text: &str) -> Result<Tensor> {
        let tokens = self.tokenizer.encode(text)?;
        let ids = frame_window(&tokens, self.tokenizer.bos_id(), self.tokenizer.eos_id(), self.tokenizer.pad_id());
        let ids = self.ids_tensor(&ids)?;
        self.model.pooled(&ids)
    }

    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        self.model.project(hidden)
    }
}

/// Position of the first end-of-text token, or the last position
pub fn first_eos_position(ids: &[u32], eos: u32) -> usize {
    ids.iter().position(|id| *id == eos).unwrap_or(ids.len().saturating_sub(1))
}

/// Zero-pad `[b, seq, hidden]` along the sequence axis
pub fn pad_sequence(tensor: &Tensor, len: usize) -> Result<Tensor> {
    let (b, seq, hidden) = tensor.dims3()?;
    if seq >= len {
        return Ok(tensor.clone());
    }
    let zeros = Tensor::zeros((b, len - seq, hidden), tensor.dtype(), tensor.device())?;
    Ok(Tensor::cat(&[tensor, &zeros], 1)?)
}

/// Zero-pad `[b, seq, hidden]` along the feature axis
pub fn pad_features(tensor: &Tensor, width: usize) -> Result<Tensor> {
    let (b, seq, hidden) = tensor.dims3()?;
    if hidden >= width {
        return Ok(tensor.clone());
    }
    let zeros = Tensor::zeros((b, seq, width - hidden), tensor.dtype(), tensor.device())?;
    Ok(Tensor::cat(&[tensor, &zeros], 2)?)
}

/// Zero embeddings `[1, 77, hidden]`
pub fn zero_window(hidden: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((1, WINDOW_LEN, hidden), dtype, device)?)
}
