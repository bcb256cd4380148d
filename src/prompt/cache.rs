//! Single-slot prompt embedding cache owned by the encoding session

use log::debug;

use super::engine::EmbeddingSet;
use crate::models::ModelFamily;
use crate::request::ProcessingRequest;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    pub prompts: Vec<String>,
    pub negative_prompts: Vec<String>,
    pub clip_skip: usize,
    pub steps: usize,
    pub family: ModelFamily,
}

impl CacheKey {
    pub fn for_request(request: &ProcessingRequest, family: ModelFamily) -> Self {
        Self {
            prompts: request.prompts.clone(),
            negative_prompts: request.negative_prompts.clone(),
            clip_skip: request.clip_skip,
            steps: request.steps,
            family,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedEmbeddings {
    pub embeddings: EmbeddingSet,
    pub scheduled: bool,
}

/// Holds the embeddings of the last encoded request; any other key misses
#[derive(Debug, Default)]
pub struct PromptEmbeddingCache {
    entry: Option<(CacheKey, CachedEmbeddings)>,
}

impl PromptEmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CachedEmbeddings> {
        match &self.entry {
            Some((cached, value)) if cached == key => {
                debug!("Prompt cache: hit");
                Some(value)
            }
            _ => None,
        }
    }

    /// Replace the slot
    pub fn store(&mut self, key: CacheKey, embeddings: EmbeddingSet, scheduled: bool) {
        self.entry = Some((key, CachedEmbeddings { embeddings, scheduled }));
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}
