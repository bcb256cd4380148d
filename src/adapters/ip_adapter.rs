//! Image-prompt adapter injection for SD 1.5 and SDXL pipelines

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Result;
use candle_core::DType;
use log::{debug, error, info};

use crate::adapters::images::{crop_images, get_images, preprocess_masks, AdapterImage, FaceDetector, FeatureExtractor};
use crate::error::AdapterError;
use crate::loaders::hub::{fetch_component_files, RepoFetcher};
use crate::memory::{move_model, DeviceTier, Devices};
use crate::models::{Component, ComponentSlot, ModelFamily, Pipeline};
use crate::request::ProcessingRequest;

pub const BASE_REPO: &str = "h94/IP-Adapter";

/// Display name to weight file; SDXL adapters carry the `SDXL` suffix
pub const ADAPTERS: [(&str, &str); 11] = [
    ("None", "none"),
    ("Base", "ip-adapter_sd15.safetensors"),
    ("Base ViT-G", "ip-adapter_sd15_vit-G.safetensors"),
    ("Light", "ip-adapter_sd15_light.safetensors"),
    ("Plus", "ip-adapter-plus_sd15.safetensors"),
    ("Plus Face", "ip-adapter-plus-face_sd15.safetensors"),
    ("Full Face", "ip-adapter-full-face_sd15.safetensors"),
    ("Base SDXL", "ip-adapter_sdxl.safetensors"),
    ("Base ViT-H SDXL", "ip-adapter_sdxl_vit-h.safetensors"),
    ("Plus ViT-H SDXL", "ip-adapter-plus_sdxl_vit-h.safetensors"),
    ("Plus Face ViT-H SDXL", "ip-adapter-plus-face_sdxl_vit-h.safetensors"),
];

pub fn adapter_weight_name(name: &str) -> Option<&'static str> {
    ADAPTERS.iter().find(|(n, _)| *n == name).map(|(_, w)| *w)
}

/// Adapter names usable with a family, `"None"` first
pub fn adapters_for_family(family: ModelFamily) -> Vec<&'static str> {
    ADAPTERS
        .iter()
        .map(|(n, _)| *n)
        .filter(|n| match family {
            _ if *n == "None" => true,
            ModelFamily::Sdxl => n.ends_with("SDXL"),
            ModelFamily::Sd15 => !n.ends_with("SDXL"),
            _ => false,
        })
        .collect()
}

/// Repository folder holding adapter weights for a family
fn weight_subfolder(family: ModelFamily) -> &'static str {
    if family == ModelFamily::Sd15 {
        "models"
    } else {
        "sdxl_models"
    }
}

/// Image encoder `(repo, subfolder)` selected by the adapter's display name
pub fn image_encoder_for(name: &str, family: ModelFamily) -> Result<(&'static str, &'static str), AdapterError> {
    if !name.contains("ViT") {
        let subfolder = if family == ModelFamily::Sd15 {
            "models/image_encoder"
        } else {
            "sdxl_models/image_encoder"
        };
        Ok((BASE_REPO, subfolder))
    } else if name.contains("ViT-H") {
        Ok((BASE_REPO, "models/image_encoder"))
    } else if name.contains("ViT-G") {
        Ok((BASE_REPO, "sdxl_models/image_encoder"))
    } else {
        Err(AdapterError::UnknownEncoder(name.to_string()))
    }
}

/// Repeat the last element until `values` is `len` long; longer lists are kept
pub fn pad_to_len<T: Clone>(values: &[T], len: usize, fallback: T) -> Vec<T> {
    let mut out = values.to_vec();
    let last = out.last().cloned().unwrap_or(fallback);
    while out.len() < len {
        out.push(last.clone());
    }
    out
}

/// Call-site adapter arguments
#[derive(Debug, Clone)]
pub struct AdapterArgs {
    pub names: Vec<String>,
    pub scales: Vec<f32>,
    pub crops: Vec<bool>,
    pub starts: Vec<f32>,
    pub ends: Vec<f32>,
    pub images: Vec<AdapterImage>,
}

impl Default for AdapterArgs {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            scales: vec![1.0],
            crops: vec![false],
            starts: vec![0.0],
            ends: vec![1.0],
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttachedAdapter {
    pub name: String,
    pub weight_name: &'static str,
    pub path: PathBuf,
}

/// Adapter weights hooked into the denoiser's cross-attention
#[derive(Debug, Clone)]
pub struct IpAdapterAttachment {
    pub repo: String,
    pub subfolder: String,
    pub adapters: Vec<AttachedAdapter>,
    pub scales: Vec<f32>,
    pub layer_scales: Option<serde_json::Value>,
}

impl IpAdapterAttachment {
    pub fn set_scales(&mut self, scales: &[f32]) {
        self.scales = scales.to_vec();
        self.layer_scales = None;
    }

    pub fn set_layer_scales(&mut self, layers: serde_json::Value) {
        self.layer_scales = Some(layers);
    }
}

/// Result of removing an adapter from a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// Scales were zeroed and the cross-attention hook removed
    Detached,
    /// No adapter was attached
    NothingAttached,
}

/// Attaches image-prompt adapters, owning the loaded image-encoder key
pub struct IpAdapterInjector<'a> {
    fetcher: &'a dyn RepoFetcher,
    devices: Devices,
    dtype: DType,
    face_detector: Option<Box<dyn FaceDetector + 'a>>,
    loaded_encoder: Option<String>,
}

impl<'a> IpAdapterInjector<'a> {
    pub fn new(fetcher: &'a dyn RepoFetcher, devices: Devices, dtype: DType) -> Self {
        Self {
            fetcher,
            devices,
            dtype,
            face_detector: None,
            loaded_encoder: None,
        }
    }

    pub fn with_face_detector(mut self, detector: Box<dyn FaceDetector + 'a>) -> Self {
        self.face_detector = Some(detector);
        self
    }

    /// `repo/subfolder` of the image encoder currently on the pipeline
    pub fn loaded_encoder(&self) -> Option<&str> {
        self.loaded_encoder.as_deref()
    }

    /// Zero the adapter scales and remove the hook; never fails
    pub fn unapply(&self, pipe: &mut Pipeline) -> DetachOutcome {
        if pipe.ip_adapter.is_none() {
            return DetachOutcome::NothingAttached;
        }
        pipe.set_ip_adapter_scale(&[0.0]);
        pipe.ip_adapter = None;
        DetachOutcome::Detached
    }

    fn detach_and_clear(&self, pipe: &mut Pipeline, request: &mut ProcessingRequest) {
        let outcome = self.unapply(pipe);
        debug!("IP adapter: unapply={:?}", outcome);
        request.clear_adapter_state();
    }

    fn ensure_image_encoder(&mut self, pipe: &mut Pipeline, repo: &str, subfolder: &str) -> Result<()> {
        if pipe.feature_extractor.is_none() {
            debug!("IP adapter load: feature extractor");
            pipe.feature_extractor = Some(FeatureExtractor::default());
        }
        let key = format!("{}/{}", repo, subfolder);
        if pipe.image_encoder.is_none() || self.loaded_encoder.as_deref() != Some(key.as_str()) {
            debug!("IP adapter load: image encoder=\"{}\"", key);
            let files = fetch_component_files(self.fetcher, ComponentSlot::ImageEncoder, repo, subfolder, None)?;
            pipe.image_encoder = Some(Component::from_files(ComponentSlot::ImageEncoder, key.as_str(), files, self.dtype));
            self.loaded_encoder = Some(key);
        }
        if let Some(encoder) = pipe.image_encoder.as_mut() {
            move_model(encoder, DeviceTier::Compute, &self.devices)?;
        }
        Ok(())
    }

    fn attach(&self, family: ModelFamily, names: &[String], weights: &[&'static str]) -> Result<IpAdapterAttachment> {
        let subfolder = weight_subfolder(family);
        let mut adapters = Vec::with_capacity(weights.len());
        for (name, weight_name) in names.iter().zip(weights) {
            let path = self.fetcher.fetch(BASE_REPO, &format!("{}/{}", subfolder, weight_name))?;
            adapters.push(AttachedAdapter {
                name: name.clone(),
                weight_name: *weight_name,
                path,
            });
        }
        Ok(IpAdapterAttachment {
            repo: BASE_REPO.to_string(),
            subfolder: subfolder.to_string(),
            adapters,
            scales: Vec::new(),
            layer_scales: None,
        })
    }

    /// Attach the requested adapters to the pipeline
    ///
    /// Returns false, after logging, when nothing was attached. Request
    /// overrides take precedence over the call arguments.
    pub fn apply(&mut self, pipe: &mut Pipeline, request: &mut ProcessingRequest, args: AdapterArgs) -> bool {
        let requested = request.ip_adapter_names.clone().unwrap_or(args.names);
        let (names, weights): (Vec<String>, Vec<&'static str>) = requested
            .into_iter()
            .filter_map(|name| {
                let weight = adapter_weight_name(&name)?;
                (weight != "none").then_some((name, weight))
            })
            .unzip();
        if weights.is_empty() {
            self.detach_and_clear(pipe, request);
            return false;
        }

        let family = pipe.family;
        if !family.supports_ip_adapter() {
            error!("IP adapter: {}", AdapterError::UnsupportedFamily(family));
            self.detach_and_clear(pipe, request);
            return false;
        }

        let scales = request.ip_adapter_scales.clone().unwrap_or(args.scales);
        let crops = request.ip_adapter_crops.clone().unwrap_or(args.crops);
        let starts = request.ip_adapter_starts.clone().unwrap_or(args.starts);
        let ends = request.ip_adapter_ends.clone().unwrap_or(args.ends);
        let image_inputs = request.ip_adapter_images.clone().unwrap_or(args.images);

        let mut images = get_images(&image_inputs);
        if image_inputs.is_empty() {
            error!("IP adapter: no init images");
        }
        let mut masks = request
            .ip_adapter_masks
            .as_deref()
            .map(get_images)
            .unwrap_or_default();

        images.truncate(weights.len());
        masks.truncate(weights.len());
        if !masks.is_empty() && masks.len() != images.len() {
            let e = AdapterError::MaskMismatch {
                images: images.len(),
                masks: masks.len(),
            };
            error!("IP adapter: {}", e);
            return false;
        }

        let mut scales = pad_to_len(&scales, images.len(), 1.0);
        let crops = pad_to_len(&crops, images.len(), false);
        let starts = pad_to_len(&starts, images.len(), 0.0);
        let ends = pad_to_len(&ends, images.len(), 1.0);
        request.ip_adapter_scales = Some(scales.clone());
        request.ip_adapter_crops = Some(crops.clone());
        request.ip_adapter_starts = Some(starts.clone());
        request.ip_adapter_ends = Some(ends.clone());

        if images.is_empty() {
            error!("IP adapter: no image provided");
            self.detach_and_clear(pipe, request);
            return false;
        }

        for name in &names {
            let (repo, subfolder) = match image_encoder_for(name, family) {
                Ok(encoder) => encoder,
                Err(e) => {
                    error!("IP adapter: {}", e);
                    return false;
                }
            };
            if let Err(e) = self.ensure_image_encoder(pipe, repo, subfolder) {
                error!("IP adapter: failed to load image encoder: {}", e);
                return false;
            }
        }

        let t0 = Instant::now();
        let mask_tensors = match masks
            .iter()
            .map(|group| preprocess_masks(group, request.height, request.width, self.devices.device(DeviceTier::Compute)))
            .collect::<Result<Vec<_>>>()
        {
            Ok(tensors) => tensors,
            Err(e) => {
                error!("IP adapter: failed to process masks: {}", e);
                return false;
            }
        };

        let mut attachment = match self.attach(family, &names, &weights) {
            Ok(attachment) => attachment,
            Err(e) => {
                error!(
                    "IP adapter failed to load: repo=\"{}\" folder=\"{}\" weights={:?} names={:?} {}",
                    BASE_REPO,
                    weight_subfolder(family),
                    weights,
                    names,
                    e
                );
                return false;
            }
        };

        let audit = match request.ip_adapter_layers.clone() {
            Some(layers) => {
                let audit = format!("{}:{}", names.join(";"), layers);
                attachment.set_layer_scales(layers);
                pipe.ip_adapter = Some(attachment);
                audit
            }
            None => {
                for (scale, start) in scales.iter_mut().zip(&starts) {
                    if *start > 0.0 {
                        *scale = 0.0;
                    }
                }
                pipe.ip_adapter = Some(attachment);
                pipe.set_ip_adapter_scale(&scales);
                names
                    .iter()
                    .zip(&scales)
                    .zip(starts.iter().zip(&ends))
                    .map(|((name, scale), (start, end))| {
                        let stem = Path::new(name).file_stem().and_then(|s| s.to_str()).unwrap_or(name);
                        format!("{}:{:?}:{:?}:{:?}", stem, scale, start, end)
                    })
                    .collect::<Vec<_>>()
                    .join(";")
            }
        };

        let image_count = images.len();
        request.task_args.ip_adapter_image = Some(crop_images(images, &crops, self.face_detector.as_deref()));
        let has_masks = !mask_tensors.is_empty();
        if has_masks {
            request.cross_attention_masks = Some(mask_tensors);
        }
        request.extra_generation_params.insert("IP Adapter".to_string(), audit.clone());
        info!(
            "IP adapter: {} image={} mask={} time={:.2}",
            audit,
            image_count,
            has_masks,
            t0.elapsed().as_secs_f32()
        );
        true
    }
}
