//! Per-generation request state shared by the adapter injector and prompt engine

use std::collections::BTreeMap;

use candle_core::Tensor;
use image::DynamicImage;

use crate::adapters::AdapterImage;
use crate::prompt::EmbeddingSet;

/// Extra arguments forwarded to the pipeline call
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    /// Images per adapter, after optional face cropping
    pub ip_adapter_image: Option<Vec<Vec<DynamicImage>>>,
}

/// A single generation request
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    pub width: usize,
    pub height: usize,
    pub batch_size: usize,
    pub steps: usize,
    pub clip_skip: usize,
    pub prompts: Vec<String>,
    pub negative_prompts: Vec<String>,

    // Image-prompt adapter overrides; when set they win over call arguments
    pub ip_adapter_names: Option<Vec<String>>,
    pub ip_adapter_scales: Option<Vec<f32>>,
    pub ip_adapter_crops: Option<Vec<bool>>,
    pub ip_adapter_starts: Option<Vec<f32>>,
    pub ip_adapter_ends: Option<Vec<f32>>,
    pub ip_adapter_images: Option<Vec<AdapterImage>>,
    pub ip_adapter_masks: Option<Vec<AdapterImage>>,
    /// Per-layer scale structure replacing the static scales
    pub ip_adapter_layers: Option<serde_json::Value>,

    pub task_args: TaskArgs,
    /// Binarized `[n, 1, h, w]` masks per adapter
    pub cross_attention_masks: Option<Vec<Tensor>>,
    /// Audit values written into the image metadata
    pub extra_generation_params: BTreeMap<String, String>,

    pub embeddings: Option<EmbeddingSet>,
    /// Set when a prompt schedule changed the text between the first and final step
    pub scheduled_prompt: bool,
}

impl Default for ProcessingRequest {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            batch_size: 1,
            steps: 20,
            clip_skip: 1,
            prompts: vec![String::new()],
            negative_prompts: vec![String::new()],
            ip_adapter_names: None,
            ip_adapter_scales: None,
            ip_adapter_crops: None,
            ip_adapter_starts: None,
            ip_adapter_ends: None,
            ip_adapter_images: None,
            ip_adapter_masks: None,
            ip_adapter_layers: None,
            task_args: TaskArgs::default(),
            cross_attention_masks: None,
            extra_generation_params: BTreeMap::new(),
            embeddings: None,
            scheduled_prompt: false,
        }
    }
}

impl ProcessingRequest {
    pub fn new(prompt: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            prompts: vec![prompt.into()],
            negative_prompts: vec![negative.into()],
            ..Self::default()
        }
    }

    /// Drop every image-prompt adapter input and result from the request
    pub fn clear_adapter_state(&mut self) {
        self.ip_adapter_images = None;
        self.ip_adapter_masks = None;
        self.task_args.ip_adapter_image = None;
        self.cross_attention_masks = None;
        self.extra_generation_params.remove("IP Adapter");
    }
}
