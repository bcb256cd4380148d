//! Prompt parsing and weighted text-encoder conditioning

pub mod attention;
pub mod cache;
pub mod encoders;
pub mod engine;
pub mod provider;
pub mod schedule;
pub mod split;

pub use attention::{
    expand_textual_inversion, normalize_weights, parse_prompt_attention, split_on_break, WeightedSegment, BREAK, CONTROL_WEIGHT,
};
pub use cache::{CacheKey, PromptEmbeddingCache};
pub use encoders::{load_text_encoders, ClipTextEncoder, HfTokenizer, T5TextEncoder, TokenizerFiles};
pub use engine::{EmbeddingSet, PromptEncoder, TextEncoderSet};
pub use provider::{EmbeddingsProvider, PromptTokenizer, SequenceEncoder, TextTransformer, WeightedClipProvider};
pub use schedule::{resolve_schedule, PromptSchedule};
pub use split::{split_prompts, SplitPrompt};
