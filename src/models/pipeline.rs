//! The assembled inference pipeline and its sub-modules

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::adapters::{FeatureExtractor, IpAdapterAttachment};
use crate::memory::{quantize_state_dict, DeviceTier, Devices, Placeable, QuantizationConfig, QuantizedStateDict};
use crate::models::ModelFamily;

/// Named sub-module positions of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentSlot {
    TextEncoder,
    TextEncoder2,
    TextEncoder3,
    Transformer,
    Unet,
    Vae,
    ImageEncoder,
}

impl ComponentSlot {
    pub const TEXT_ENCODERS: [ComponentSlot; 3] = [
        ComponentSlot::TextEncoder,
        ComponentSlot::TextEncoder2,
        ComponentSlot::TextEncoder3,
    ];

    /// Repository subfolder holding this sub-module
    pub fn subfolder(&self) -> &'static str {
        match self {
            ComponentSlot::TextEncoder => "text_encoder",
            ComponentSlot::TextEncoder2 => "text_encoder_2",
            ComponentSlot::TextEncoder3 => "text_encoder_3",
            ComponentSlot::Transformer => "transformer",
            ComponentSlot::Unet => "unet",
            ComponentSlot::Vae => "vae",
            ComponentSlot::ImageEncoder => "image_encoder",
        }
    }

    /// Tensor-name prefixes marking this sub-module inside a single-file checkpoint
    pub fn single_file_prefixes(&self) -> &'static [&'static str] {
        match self {
            ComponentSlot::TextEncoder => &["text_encoders.clip_l.", "text_encoder.", "cond_stage_model.", "conditioner.embedders.0."],
            ComponentSlot::TextEncoder2 => &["text_encoders.clip_g.", "text_encoder_2.", "conditioner.embedders.1."],
            ComponentSlot::TextEncoder3 => &["text_encoders.t5xxl.", "text_encoder_3."],
            ComponentSlot::Transformer => &["model.diffusion_model.joint_blocks.", "model.diffusion_model.double_blocks.", "transformer."],
            ComponentSlot::Unet => &["model.diffusion_model.input_blocks.", "unet."],
            ComponentSlot::Vae => &["first_stage_model.", "vae."],
            ComponentSlot::ImageEncoder => &["image_encoder."],
        }
    }
}

impl fmt::Display for ComponentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.subfolder())
    }
}

/// Where the weights of a sub-module come from
pub enum WeightSource {
    /// Safetensors files read lazily through memory maps
    Files(Vec<PathBuf>),
    /// Tensors already decoded into memory
    StateDict(HashMap<String, Tensor>),
    /// Tensors quantized at load time
    Quantized(QuantizedStateDict),
}

impl WeightSource {
    pub fn describe(&self) -> String {
        match self {
            WeightSource::Files(files) => format!("files={}", files.len()),
            WeightSource::StateDict(dict) => format!("tensors={}", dict.len()),
            WeightSource::Quantized(dict) => format!("quantized={} kept={}", dict.quantized.len(), dict.passthrough.len()),
        }
    }
}

/// A sub-module of the pipeline
pub struct Component {
    pub slot: ComponentSlot,
    /// Human readable origin such as a repo path or file name
    pub origin: String,
    pub weights: WeightSource,
    pub dtype: DType,
    pub quantization: Option<QuantizationConfig>,
    /// Config file accompanying single-file weights
    pub config_path: Option<PathBuf>,
    tier: DeviceTier,
}

impl Component {
    pub fn from_files(slot: ComponentSlot, origin: impl Into<String>, files: Vec<PathBuf>, dtype: DType) -> Self {
        Self {
            slot,
            origin: origin.into(),
            weights: WeightSource::Files(files),
            dtype,
            quantization: None,
            config_path: None,
            tier: DeviceTier::Holding,
        }
    }

    pub fn from_state_dict(slot: ComponentSlot, origin: impl Into<String>, tensors: HashMap<String, Tensor>, dtype: DType) -> Self {
        Self {
            slot,
            origin: origin.into(),
            weights: WeightSource::StateDict(tensors),
            dtype,
            quantization: None,
            config_path: None,
            tier: DeviceTier::Holding,
        }
    }

    pub fn with_quantization(mut self, config: QuantizationConfig) -> Self {
        self.quantization = Some(config);
        self
    }

    pub fn with_config(mut self, config_path: PathBuf) -> Self {
        self.config_path = Some(config_path);
        self
    }

    /// Decode file-backed weights and apply the quantization config if one is set
    pub fn materialize(&mut self, device: &Device) -> Result<()> {
        let weights = std::mem::replace(&mut self.weights, WeightSource::Files(Vec::new()));
        let tensors = match weights {
            WeightSource::Files(files) => {
                let mut tensors = HashMap::new();
                for file in &files {
                    let loaded = candle_core::safetensors::load(file, device)
                        .with_context(|| format!("Failed to read weights: {}", file.display()))?;
                    tensors.extend(loaded);
                }
                tensors
            }
            WeightSource::StateDict(tensors) => tensors,
            quantized @ WeightSource::Quantized(_) => {
                self.weights = quantized;
                return Ok(());
            }
        };
        self.weights = match &self.quantization {
            Some(config) => WeightSource::Quantized(quantize_state_dict(tensors, config)?),
            None => WeightSource::StateDict(tensors),
        };
        Ok(())
    }

    /// A var builder over this component's weights on the given device
    pub fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>> {
        let vb = match &self.weights {
            WeightSource::Files(files) => unsafe { VarBuilder::from_mmaped_safetensors(files, self.dtype, device)? },
            WeightSource::StateDict(tensors) => VarBuilder::from_tensors(tensors.clone(), self.dtype, device),
            WeightSource::Quantized(dict) => {
                let mut tensors = HashMap::new();
                for name in dict.quantized.keys().chain(dict.passthrough.keys()) {
                    tensors.insert(name.clone(), dict.get(name, device, self.dtype)?);
                }
                VarBuilder::from_tensors(tensors, self.dtype, device)
            }
        };
        Ok(vb)
    }
}

impl Placeable for Component {
    fn label(&self) -> &str {
        self.slot.subfolder()
    }

    fn tier(&self) -> DeviceTier {
        self.tier
    }

    fn place(&mut self, tier: DeviceTier, devices: &Devices) -> Result<()> {
        let device = devices.device(tier);
        if let WeightSource::StateDict(tensors) = &mut self.weights {
            for tensor in tensors.values_mut() {
                *tensor = tensor.to_device(device)?;
            }
        }
        // File-backed and quantized weights are materialized on demand on the target device
        self.tier = tier;
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("slot", &self.slot)
            .field("origin", &self.origin)
            .field("weights", &self.weights.describe())
            .field("dtype", &self.dtype)
            .field("quantized", &self.quantization.is_some())
            .field("tier", &self.tier)
            .finish()
    }
}

/// The constructed inference pipeline
#[derive(Debug)]
pub struct Pipeline {
    pub family: ModelFamily,
    /// Repository id or local path the pipeline was built from
    pub source: String,
    pub variant: Option<String>,
    pub components: BTreeMap<ComponentSlot, Component>,
    pub feature_extractor: Option<FeatureExtractor>,
    pub image_encoder: Option<Component>,
    pub ip_adapter: Option<IpAdapterAttachment>,
}

impl Pipeline {
    pub fn new(family: ModelFamily, source: impl Into<String>) -> Self {
        Self {
            family,
            source: source.into(),
            variant: None,
            components: BTreeMap::new(),
            feature_extractor: None,
            image_encoder: None,
            ip_adapter: None,
        }
    }

    pub fn component(&self, slot: ComponentSlot) -> Option<&Component> {
        self.components.get(&slot)
    }

    pub fn component_mut(&mut self, slot: ComponentSlot) -> Option<&mut Component> {
        self.components.get_mut(&slot)
    }

    /// Insert or replace a sub-module; the old one is dropped, never kept alongside
    pub fn set_component(&mut self, component: Component) -> Option<Component> {
        self.components.insert(component.slot, component)
    }

    pub fn has_component(&self, slot: ComponentSlot) -> bool {
        self.components.contains_key(&slot)
    }

    /// Set per-adapter scales on an attached image-prompt adapter
    pub fn set_ip_adapter_scale(&mut self, scales: &[f32]) -> bool {
        match self.ip_adapter.as_mut() {
            Some(adapter) => {
                adapter.set_scales(scales);
                true
            }
            None => false,
        }
    }

    /// Place every sub-module on a tier
    pub fn place_all(&mut self, tier: DeviceTier, devices: &Devices) -> Result<()> {
        for component in self.components.values_mut() {
            crate::memory::move_model(component, tier, devices)?;
        }
        if let Some(encoder) = self.image_encoder.as_mut() {
            crate::memory::move_model(encoder, tier, devices)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_replacement_is_exclusive() -> Result<()> {
        let device = Device::Cpu;
        let mut pipe = Pipeline::new(ModelFamily::Sd3, "repo/sd3");
        let mut tensors = HashMap::new();
        tensors.insert("w".to_string(), Tensor::zeros(2, DType::F32, &device)?);
        pipe.set_component(Component::from_state_dict(ComponentSlot::Vae, "a", tensors.clone(), DType::F32));
        let old = pipe.set_component(Component::from_state_dict(ComponentSlot::Vae, "b", tensors, DType::F32));
        assert_eq!(old.map(|c| c.origin), Some("a".to_string()));
        assert_eq!(pipe.components.len(), 1);
        assert_eq!(pipe.component(ComponentSlot::Vae).unwrap().origin, "b");
        Ok(())
    }

    #[test]
    fn test_component_placement() -> Result<()> {
        let devices = Devices::cpu();
        let mut tensors = HashMap::new();
        tensors.insert("w".to_string(), Tensor::zeros(2, DType::F32, &devices.compute)?);
        let mut pipe = Pipeline::new(ModelFamily::Sdxl, "repo/sdxl");
        pipe.set_component(Component::from_state_dict(ComponentSlot::TextEncoder, "te", tensors, DType::F32));
        assert_eq!(pipe.component(ComponentSlot::TextEncoder).unwrap().tier(), DeviceTier::Holding);
        pipe.place_all(DeviceTier::Compute, &devices)?;
        assert_eq!(pipe.component(ComponentSlot::TextEncoder).unwrap().tier(), DeviceTier::Compute);
        Ok(())
    }

    #[test]
    fn test_materialize_quantized_state_dict() -> Result<()> {
        use crate::config::QuantizationOptions;
        let device = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert("ff.net.2.weight".to_string(), Tensor::ones((2, 32), DType::F32, &device)?);
        let options = QuantizationOptions { modules: vec!["Model".to_string()], quant_type: "fp8".to_string(), storage: "uint8".to_string() };
        let config = QuantizationConfig::from_options(&options, DType::F32).unwrap();
        let mut component = Component::from_state_dict(ComponentSlot::Transformer, "t", tensors, DType::F32).with_quantization(config);
        component.materialize(&device)?;
        match &component.weights {
            WeightSource::Quantized(dict) => assert!(dict.quantized.contains_key("ff.net.2.weight")),
            _ => panic!("expected quantized weights"),
        }
        let vb = component.var_builder(&device)?;
        assert!(vb.contains_tensor("ff.net.2.weight"));
        Ok(())
    }
}
