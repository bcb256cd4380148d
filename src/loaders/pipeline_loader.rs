//! Pipeline assembly: overrides, quantization, missing sub-modules, construction

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::DType;
use log::{debug, error, info};

use crate::config::{Options, NONE};
use crate::error::LoadError;
use crate::loaders::checkpoint::{missing_components, path_to_repo, safetensor_keys, scan_models, CheckpointFormat, CheckpointRef};
use crate::loaders::gguf::load_gguf_transformer;
use crate::loaders::hub::{fetch_component_files, LocalFetcher, RepoFetcher};
use crate::loaders::sd3_remapper::Sd3TransformerConfig;
use crate::memory::{Devices, DeviceTier, QuantizationConfig};
use crate::models::{Component, ComponentSlot, ModelFamily, Pipeline};

/// Config shipped for single-file autoencoders
pub const VAE_CONFIG: &str = "configs/flux/vae/config.json";
/// Transformer layout used to filter GGUF tensors
pub const TRANSFORMER_CONFIG: &str = "configs/sd3/transformer/config.json";

/// Which alternate sub-modules are active, owned by the session
#[derive(Debug, Default, Clone)]
pub struct LoadState {
    pub loaded_unet: Option<String>,
    pub loaded_text_encoder: Option<String>,
    pub loaded_vae: Option<String>,
    pub failed_unets: Vec<String>,
}

/// Pre-built sub-modules handed to the pipeline constructor
#[derive(Debug, Default)]
pub struct OverrideBag {
    pub components: BTreeMap<ComponentSlot, Component>,
    pub variant: Option<String>,
}

impl OverrideBag {
    pub fn contains(&self, slot: ComponentSlot) -> bool {
        self.components.contains_key(&slot)
    }

    pub fn insert(&mut self, component: Component) {
        self.components.insert(component.slot, component);
    }

    /// Slot names already filled, for logging
    pub fn preloaded(&self) -> Vec<&'static str> {
        self.components.keys().map(|s| s.subfolder()).collect()
    }
}

/// Sub-modules a pipeline of the given family is built from
pub fn family_slots(family: ModelFamily) -> &'static [ComponentSlot] {
    use ComponentSlot::*;
    match family {
        ModelFamily::Sd15 | ModelFamily::StableCascade => &[TextEncoder, Unet, Vae],
        ModelFamily::Sdxl => &[TextEncoder, TextEncoder2, Unet, Vae],
        ModelFamily::Sd3 => &[TextEncoder, TextEncoder2, TextEncoder3, Transformer, Vae],
        ModelFamily::Flux => &[TextEncoder, TextEncoder2, Transformer, Vae],
        ModelFamily::Other => &[],
    }
}

fn denoiser_slot(family: ModelFamily) -> ComponentSlot {
    if family.denoiser_is_transformer() {
        ComponentSlot::Transformer
    } else {
        ComponentSlot::Unet
    }
}

/// The two pipeline construction entry points
pub trait PipelineConstructor {
    fn from_single_file(&self, path: &Path, family: ModelFamily, bag: OverrideBag) -> Result<Pipeline>;
    fn from_pretrained(&self, repo_id: &str, family: ModelFamily, bag: OverrideBag) -> Result<Pipeline>;
}

/// Builds pipelines out of weight files, filling every slot the bag leaves empty
pub struct ComponentPipelineConstructor<'a> {
    fetcher: &'a dyn RepoFetcher,
    dtype: DType,
}

impl<'a> ComponentPipelineConstructor<'a> {
    pub fn new(fetcher: &'a dyn RepoFetcher, dtype: DType) -> Self {
        Self { fetcher, dtype }
    }
}

impl PipelineConstructor for ComponentPipelineConstructor<'_> {
    fn from_single_file(&self, path: &Path, family: ModelFamily, bag: OverrideBag) -> Result<Pipeline> {
        let keys = safetensor_keys(path)?;
        let mut pipe = Pipeline::new(family, path.display().to_string());
        pipe.variant = bag.variant.clone();
        let origin = path.display().to_string();
        for slot in family_slots(family) {
            if bag.contains(*slot) {
                continue;
            }
            let present = keys
                .iter()
                .any(|k| slot.single_file_prefixes().iter().any(|p| k.starts_with(p)));
            if present {
                pipe.set_component(Component::from_files(*slot, origin.clone(), vec![path.to_path_buf()], self.dtype));
            }
        }
        for component in bag.components.into_values() {
            pipe.set_component(component);
        }
        Ok(pipe)
    }

    fn from_pretrained(&self, repo_id: &str, family: ModelFamily, bag: OverrideBag) -> Result<Pipeline> {
        let local;
        let (fetcher, repo): (&dyn RepoFetcher, &str) = if Path::new(repo_id).is_dir() {
            local = LocalFetcher::new(repo_id);
            (&local, "")
        } else {
            (self.fetcher, repo_id)
        };
        let mut pipe = Pipeline::new(family, repo_id);
        pipe.variant = bag.variant.clone();
        for slot in family_slots(family) {
            if bag.contains(*slot) {
                continue;
            }
            let files = fetch_component_files(fetcher, *slot, repo, slot.subfolder(), bag.variant.as_deref())?;
            pipe.set_component(Component::from_files(*slot, repo_id, files, self.dtype));
        }
        for component in bag.components.into_values() {
            pipe.set_component(component);
        }
        Ok(pipe)
    }
}

/// Override names found in the configured model folders
#[derive(Debug, Default, Clone)]
pub struct ModelIndex {
    pub unets: BTreeMap<String, PathBuf>,
    pub text_encoders: BTreeMap<String, PathBuf>,
    pub vaes: BTreeMap<String, PathBuf>,
}

impl ModelIndex {
    pub fn scan(options: &Options) -> Self {
        let scan = |dir: &Option<PathBuf>| dir.as_deref().map(scan_models).unwrap_or_default();
        Self {
            unets: scan(&options.models.unet_dir),
            text_encoders: scan(&options.models.text_encoder_dir),
            vaes: scan(&options.models.vae_dir),
        }
    }
}

fn lookup<'a>(index: &'a BTreeMap<String, PathBuf>, kind: &'static str, name: &str) -> Result<&'a PathBuf> {
    index.get(name).ok_or_else(|| {
        LoadError::UnknownOverride {
            kind,
            name: name.to_string(),
        }
        .into()
    })
}

/// Assembles pipelines from resolved checkpoints
pub struct ModelLoader<'a> {
    fetcher: &'a dyn RepoFetcher,
    constructor: &'a dyn PipelineConstructor,
    pub index: ModelIndex,
    pub state: LoadState,
    devices: Devices,
    dtype: DType,
}

impl<'a> ModelLoader<'a> {
    pub fn new(
        fetcher: &'a dyn RepoFetcher,
        constructor: &'a dyn PipelineConstructor,
        index: ModelIndex,
        devices: Devices,
        dtype: DType,
    ) -> Self {
        Self {
            fetcher,
            constructor,
            index,
            state: LoadState::default(),
            devices,
            dtype,
        }
    }

    fn transformer_config(&self) -> Sd3TransformerConfig {
        Sd3TransformerConfig::load_or_default(Path::new(TRANSFORMER_CONFIG))
    }

    fn load_denoiser(&self, family: ModelFamily, path: &Path) -> Result<Component> {
        let slot = denoiser_slot(family);
        match CheckpointFormat::from_path(path) {
            Some(CheckpointFormat::SingleFile) => Ok(Component::from_files(
                slot,
                path.display().to_string(),
                vec![path.to_path_buf()],
                self.dtype,
            )),
            Some(CheckpointFormat::Gguf) => load_gguf_transformer(
                path,
                &self.transformer_config(),
                self.dtype,
                self.devices.device(DeviceTier::Holding),
            ),
            _ => Err(LoadError::UnsupportedFormat(path.to_path_buf()).into()),
        }
    }

    fn load_text_encoder(&self, name: &str) -> Result<Component> {
        let path = lookup(&self.index.text_encoders, "text encoder", name)?;
        let lower = name.to_lowercase();
        let (slot, variant) = if lower.contains("vit-l") {
            (ComponentSlot::TextEncoder, "vit-l")
        } else if lower.contains("vit-g") {
            (ComponentSlot::TextEncoder2, "vit-g")
        } else {
            (ComponentSlot::TextEncoder3, "t5")
        };
        debug!("Load model: variant=\"{}\" te=\"{}\"", variant, name);
        Ok(Component::from_files(slot, name, vec![path.clone()], self.dtype))
    }

    /// Alternate denoiser, text encoder and autoencoder chosen in the options
    ///
    /// A failing override is logged and its option reset to `"None"`.
    pub fn load_overrides(&mut self, bag: &mut OverrideBag, family: ModelFamily, options: &mut Options) {
        let unet = options.overrides.unet.clone();
        if unet != NONE {
            let loaded = lookup(&self.index.unets, "unet", &unet)
                .cloned()
                .and_then(|path| self.load_denoiser(family, &path));
            match loaded {
                Ok(component) => {
                    debug!("Load model: type={} unet=\"{}\" fmt={}", family, unet, component.weights.describe());
                    bag.insert(component);
                    self.state.loaded_unet = Some(unet);
                }
                Err(e) => {
                    error!("Load model: type={} failed to load UNet: {}", family, e);
                    options.overrides.unet = NONE.to_string();
                    self.state.failed_unets.push(unet);
                }
            }
        }

        let te = options.overrides.text_encoder.clone();
        if te != NONE {
            match self.load_text_encoder(&te) {
                Ok(component) => {
                    bag.insert(component);
                    self.state.loaded_text_encoder = Some(te);
                }
                Err(e) => {
                    error!("Load model: type={} failed to load text encoder: {}", family, e);
                    options.overrides.text_encoder = NONE.to_string();
                }
            }
        }

        let vae = options.overrides.vae.clone();
        if vae != NONE && vae != "Automatic" {
            let loaded = lookup(&self.index.vaes, "vae", &vae).map(|path| {
                Component::from_files(ComponentSlot::Vae, vae.as_str(), vec![path.clone()], self.dtype)
                    .with_config(PathBuf::from(VAE_CONFIG))
            });
            match loaded {
                Ok(component) => {
                    debug!("Load model: type={} vae=\"{}\"", family, vae);
                    bag.insert(component);
                    self.state.loaded_vae = Some(vae);
                }
                Err(e) => {
                    error!("Load model: type={} failed to load VAE: {}", family, e);
                    options.overrides.vae = NONE.to_string();
                }
            }
        }
    }

    /// Quantized denoiser and T5 for the slots the overrides left empty
    pub fn load_quants(&mut self, bag: &mut OverrideBag, repo_id: &str, family: ModelFamily, options: &mut Options) {
        let Some(config) = QuantizationConfig::from_options(&options.quantization, self.dtype) else {
            return;
        };
        let q = &options.quantization;
        let result = (|| -> Result<()> {
            let denoiser = denoiser_slot(family);
            if q.modules.iter().any(|m| m == "Model") && !bag.contains(denoiser) {
                let files = fetch_component_files(self.fetcher, denoiser, repo_id, denoiser.subfolder(), None)?;
                bag.insert(Component::from_files(denoiser, repo_id, files, self.dtype).with_quantization(config.clone()));
                debug!("Quantization: module={} dtype={} storage={}", denoiser, q.quant_type, q.storage);
            }
            if family.uses_t5() && q.modules.iter().any(|m| m == "Text Encoder") && !bag.contains(ComponentSlot::TextEncoder3) {
                let slot = ComponentSlot::TextEncoder3;
                let files = fetch_component_files(self.fetcher, slot, repo_id, slot.subfolder(), Some("fp16"))?;
                bag.insert(Component::from_files(slot, repo_id, files, self.dtype).with_quantization(config.clone()));
                debug!("Quantization: module=t5 dtype={} storage={}", q.quant_type, q.storage);
            }
            Ok(())
        })();
        if let Err(e) = result {
            error!("Load model: type={} failed to load quantized modules: {}", family, e);
            options.quantization.modules.clear();
        }
    }

    /// Text encoders the checkpoint lacks, pulled from the family's fallback repo
    pub fn load_missing(&self, bag: &mut OverrideBag, checkpoint: &CheckpointRef, path: &Path) -> Result<()> {
        let Some(repo_id) = checkpoint.family.fallback_repo(checkpoint.size_mb()) else {
            return Ok(());
        };
        let keys = match checkpoint.format {
            CheckpointFormat::SingleFile => safetensor_keys(path)?,
            _ => Vec::new(),
        };
        for slot in missing_components(&keys) {
            if bag.contains(slot) {
                continue;
            }
            let variant = (slot == ComponentSlot::TextEncoder3).then_some("fp16");
            match fetch_component_files(self.fetcher, slot, repo_id, slot.subfolder(), variant) {
                Ok(files) => {
                    debug!("Load model: type={} missing={} repo=\"{}\"", checkpoint.family, slot, repo_id);
                    bag.insert(Component::from_files(slot, repo_id, files, self.dtype));
                }
                Err(e) => error!("Load model: type={} missing={} repo=\"{}\" {}", checkpoint.family, slot, repo_id, e),
            }
        }
        Ok(())
    }

    /// Construct a pipeline for a resolved checkpoint
    pub fn load(&mut self, checkpoint: &CheckpointRef, options: &mut Options) -> Result<Pipeline> {
        let family = checkpoint.family;
        if family == ModelFamily::Other {
            return Err(LoadError::UnsupportedFamily(family).into());
        }
        let mut repo_id = path_to_repo(&checkpoint.name);
        let mut bag = OverrideBag::default();
        self.load_overrides(&mut bag, family, options);
        self.load_quants(&mut bag, &repo_id, family, options);

        let pipe = match (checkpoint.local_path(), checkpoint.format) {
            (Some(path), CheckpointFormat::SingleFile) => {
                self.load_missing(&mut bag, checkpoint, path)?;
                debug!("Load model: type={} preloaded={:?}", family, bag.preloaded());
                self.constructor.from_single_file(path, family, bag)
            }
            (Some(path), CheckpointFormat::Gguf) => {
                let transformer = load_gguf_transformer(
                    path,
                    &self.transformer_config(),
                    self.dtype,
                    self.devices.device(DeviceTier::Holding),
                )?;
                bag.insert(transformer);
                self.load_missing(&mut bag, checkpoint, path)?;
                bag.variant = Some("fp16".to_string());
                if let Some(fallback) = family.fallback_repo(checkpoint.size_mb()) {
                    repo_id = fallback.to_string();
                }
                debug!("Load model: type={} preloaded={:?}", family, bag.preloaded());
                self.constructor.from_pretrained(&repo_id, family, bag)
            }
            (Some(path), _) => {
                bag.variant = Some("fp16".to_string());
                debug!("Load model: type={} preloaded={:?}", family, bag.preloaded());
                self.constructor.from_pretrained(&path.display().to_string(), family, bag)
            }
            (None, _) => {
                bag.variant = Some("fp16".to_string());
                debug!("Load model: type={} preloaded={:?}", family, bag.preloaded());
                self.constructor.from_pretrained(&checkpoint.repo_id, family, bag)
            }
        }
        .with_context(|| format!("Load model: type={} failed to construct pipeline", family))?;

        info!(
            "Load model: type={} source={} components={}",
            family,
            pipe.source,
            pipe.components.len()
        );
        Ok(pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;

    /// Records what the loader asked for instead of building anything
    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<(String, String, Vec<&'static str>, Option<String>)>>,
    }

    impl PipelineConstructor for Recorder {
        fn from_single_file(&self, path: &Path, family: ModelFamily, bag: OverrideBag) -> Result<Pipeline> {
            self.calls.borrow_mut().push(("single".into(), path.display().to_string(), bag.preloaded(), bag.variant.clone()));
            let mut pipe = Pipeline::new(family, path.display().to_string());
            for c in bag.components.into_values() {
                pipe.set_component(c);
            }
            Ok(pipe)
        }

        fn from_pretrained(&self, repo_id: &str, family: ModelFamily, bag: OverrideBag) -> Result<Pipeline> {
            self.calls.borrow_mut().push(("pretrained".into(), repo_id.to_string(), bag.preloaded(), bag.variant.clone()));
            Ok(Pipeline::new(family, repo_id))
        }
    }

    fn write_weights(path: &Path, names: &[&str]) -> Result<()> {
        let mut tensors = HashMap::new();
        for name in names {
            tensors.insert(name.to_string(), Tensor::zeros(4, DType::F32, &Device::Cpu)?);
        }
        fs::create_dir_all(path.parent().unwrap())?;
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    #[test]
    fn test_single_file_pulls_missing_encoders() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ckpt_path = dir.path().join("sd3_custom.safetensors");
        write_weights(&ckpt_path, &["model.diffusion_model.joint_blocks.0.x_block.attn.qkv.weight"])?;

        let hub = dir.path().join("hub/stabilityai/stable-diffusion-3-medium");
        write_weights(&hub.join("text_encoder/model.safetensors"), &["a"])?;
        write_weights(&hub.join("text_encoder_2/model.safetensors"), &["a"])?;
        write_weights(&hub.join("text_encoder_3/model.fp16.safetensors"), &["a"])?;

        let fetcher = LocalFetcher::new(dir.path().join("hub"));
        let recorder = Recorder::default();
        let mut loader = ModelLoader::new(&fetcher, &recorder, ModelIndex::default(), Devices::cpu(), DType::F32);
        let checkpoint = crate::loaders::checkpoint::resolve(ckpt_path.to_str().unwrap())?;
        let mut options = Options::default();
        let pipe = loader.load(&checkpoint, &mut options)?;

        let calls = recorder.calls.borrow();
        assert_eq!(calls[0].0, "single");
        assert_eq!(calls[0].2, vec!["text_encoder", "text_encoder_2", "text_encoder_3"]);
        assert_eq!(pipe.family, ModelFamily::Sd3);
        Ok(())
    }

    #[test]
    fn test_failed_override_resets_option() -> Result<()> {
        let fetcher = LocalFetcher::new("/nonexistent");
        let recorder = Recorder::default();
        let mut loader = ModelLoader::new(&fetcher, &recorder, ModelIndex::default(), Devices::cpu(), DType::F32);

        let mut options = Options::default();
        options.overrides.unet = "missing-unet".to_string();
        options.overrides.text_encoder = "t5-missing".to_string();
        options.overrides.vae = "Automatic".to_string();

        let mut bag = OverrideBag::default();
        loader.load_overrides(&mut bag, ModelFamily::Sd3, &mut options);
        assert!(bag.components.is_empty());
        assert_eq!(options.overrides.unet, NONE);
        assert_eq!(options.overrides.text_encoder, NONE);
        assert_eq!(options.overrides.vae, "Automatic");
        assert_eq!(loader.state.failed_unets, vec!["missing-unet".to_string()]);
        Ok(())
    }

    #[test]
    fn test_text_encoder_override_slot_by_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut index = ModelIndex::default();
        for name in ["clip-vit-l-14", "clip-vit-g-14", "t5xxl_fp16"] {
            let path = dir.path().join(format!("{}.safetensors", name));
            fs::write(&path, b"x")?;
            index.text_encoders.insert(name.to_string(), path);
        }
        let fetcher = LocalFetcher::new(dir.path());
        let recorder = Recorder::default();
        let loader = ModelLoader::new(&fetcher, &recorder, index, Devices::cpu(), DType::F32);
        assert_eq!(loader.load_text_encoder("clip-vit-l-14")?.slot, ComponentSlot::TextEncoder);
        assert_eq!(loader.load_text_encoder("clip-vit-g-14")?.slot, ComponentSlot::TextEncoder2);
        assert_eq!(loader.load_text_encoder("t5xxl_fp16")?.slot, ComponentSlot::TextEncoder3);
        Ok(())
    }

    #[test]
    fn test_quantization_skips_overridden_slots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = dir.path().join("org/sd3");
        write_weights(&repo.join("transformer/diffusion_pytorch_model.safetensors"), &["a"])?;
        write_weights(&repo.join("text_encoder_3/model.fp16.safetensors"), &["a"])?;

        let fetcher = LocalFetcher::new(dir.path());
        let recorder = Recorder::default();
        let mut loader = ModelLoader::new(&fetcher, &recorder, ModelIndex::default(), Devices::cpu(), DType::F32);
        let mut options = Options::default();
        options.quantization.modules = vec!["Model".to_string(), "Text Encoder".to_string()];
        options.quantization.quant_type = "fp8".to_string();

        let mut bag = OverrideBag::default();
        bag.insert(Component::from_files(ComponentSlot::TextEncoder3, "override", Vec::new(), DType::F32));
        loader.load_quants(&mut bag, "org/sd3", ModelFamily::Sd3, &mut options);

        assert!(bag.components[&ComponentSlot::Transformer].quantization.is_some());
        assert!(bag.components[&ComponentSlot::TextEncoder3].quantization.is_none());
        Ok(())
    }

    #[test]
    fn test_repository_uses_fp16_variant() -> Result<()> {
        let fetcher = LocalFetcher::new("/nonexistent");
        let recorder = Recorder::default();
        let mut loader = ModelLoader::new(&fetcher, &recorder, ModelIndex::default(), Devices::cpu(), DType::F32);
        let checkpoint = crate::loaders::checkpoint::resolve("stabilityai/stable-diffusion-xl-base-1.0")?;
        let mut options = Options::default();
        loader.load(&checkpoint, &mut options)?;
        let calls = recorder.calls.borrow();
        assert_eq!(calls[0].0, "pretrained");
        assert_eq!(calls[0].1, "stabilityai/stable-diffusion-xl-base-1.0");
        assert_eq!(calls[0].3.as_deref(), Some("fp16"));
        Ok(())
    }

    #[test]
    fn test_component_constructor_from_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for slot in family_slots(ModelFamily::Sd15) {
            write_weights(&dir.path().join(slot.subfolder()).join("model.safetensors"), &["a"])?;
        }
        let fetcher = LocalFetcher::new("/nonexistent");
        let constructor = ComponentPipelineConstructor::new(&fetcher, DType::F32);
        let pipe = constructor.from_pretrained(dir.path().to_str().unwrap(), ModelFamily::Sd15, OverrideBag::default())?;
        assert_eq!(pipe.components.len(), 3);
        assert!(pipe.has_component(ComponentSlot::Unet));
        Ok(())
    }
}
