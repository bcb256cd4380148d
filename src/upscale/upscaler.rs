//! Tiled super-resolution with a per-path network cache

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use image::DynamicImage;
use log::{debug, error, info};

use super::image_tensor::{image_to_tensor, tensor_to_image};
use super::tiling::{reflect_pad, tile_offsets, TileAccumulator};
use crate::config::UpscalerOptions;
use crate::error::UpscaleError;
use crate::interrupt::Interrupt;
use crate::memory::Devices;

/// Parameter groups tried in order when reading upscaler checkpoints
pub const PARAM_PREFIXES: [Option<&str>; 3] = [Some("params_ema"), Some("params"), None];

/// A super-resolution network with a fixed attention window
pub trait UpscaleNetwork {
    /// Output size multiplier
    fn scale(&self) -> usize;
    /// Input sides must be multiples of this
    fn window_size(&self) -> usize;
    /// `[b, 3, h, w]` in `[0, 1]` to `[b, 3, h * scale, w * scale]`
    fn forward(&self, x: &Tensor) -> Result<Tensor>;
}

/// Builds a network of one architecture from checkpoint weights
pub trait NetworkArchitecture {
    fn name(&self) -> &str;
    fn build(&self, vb: VarBuilder<'static>, scale: usize) -> Result<Box<dyn UpscaleNetwork>>;
}

/// Tile progress; a no-op without the `progress-bar` feature
struct TileProgress {
    #[cfg(feature = "progress-bar")]
    bar: indicatif::ProgressBar,
}

impl TileProgress {
    #[cfg(feature = "progress-bar")]
    fn new(total: usize) -> Self {
        let bar = indicatif::ProgressBar::new(total as u64);
        if let Ok(style) = indicatif::ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message("Upscaling");
        Self { bar }
    }

    #[cfg(not(feature = "progress-bar"))]
    fn new(_total: usize) -> Self {
        Self {}
    }

    fn inc(&self) {
        #[cfg(feature = "progress-bar")]
        self.bar.inc(1);
    }

    fn finish(self) {
        #[cfg(feature = "progress-bar")]
        self.bar.finish_and_clear();
    }
}

/// Run `network` tile by tile over an already padded `[b, c, h, w]` image
///
/// Rows stop on interrupt, tiles also stop on skip. Whatever has been
/// accumulated is returned; untouched regions stay zero.
pub fn tiled_inference(img: &Tensor, network: &dyn UpscaleNetwork, tile: usize, overlap: usize, interrupt: &Interrupt) -> Result<Tensor> {
    let (b, c, h, w) = img.dims4()?;
    let window = network.window_size();
    let scale = network.scale();
    let tile = tile.min(h).min(w);
    if window == 0 || tile % window != 0 {
        return Err(UpscaleError::TileNotAligned { tile, window }.into());
    }

    let rows = tile_offsets(h, tile, overlap)?;
    let cols = tile_offsets(w, tile, overlap)?;
    debug!(
        "Upscaler tiles: tile={} overlap={} rows={} cols={} scale={}",
        tile,
        overlap,
        rows.len(),
        cols.len(),
        scale
    );

    let mut acc = TileAccumulator::new((b, c, h * scale, w * scale), img.device())?;
    let progress = TileProgress::new(rows.len() * cols.len());
    'rows: for &y in &rows {
        if interrupt.is_interrupted() {
            break;
        }
        for &x in &cols {
            if interrupt.is_set() {
                break 'rows;
            }
            let patch = img.narrow(2, y, tile)?.narrow(3, x, tile)?;
            let out = network.forward(&patch)?;
            acc.add(&out, y * scale, x * scale)?;
            progress.inc();
        }
    }
    progress.finish();
    acc.finish()
}

/// Pad, tile, blend and crop an image tensor to exactly `input size * scale`
pub fn upscale_tensor(img: &Tensor, network: &dyn UpscaleNetwork, options: &UpscalerOptions, interrupt: &Interrupt) -> Result<Tensor> {
    let (_, _, h, w) = img.dims4()?;
    let scale = network.scale();
    let padded = reflect_pad(img, network.window_size().max(1))?;
    let output = tiled_inference(&padded, network, options.tile_size, options.tile_overlap, interrupt)?;
    Ok(output.narrow(2, 0, h * scale)?.narrow(3, 0, w * scale)?)
}

/// Load a checkpoint as a name to tensor map
fn read_checkpoint(path: &Path, devices: &Devices) -> Result<HashMap<String, Tensor>> {
    let device = &devices.holding;
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read weights: {}", path.display())),
        _ => {
            let tensors = candle_core::pickle::read_all(path)
                .with_context(|| format!("Failed to read weights: {}", path.display()))?;
            Ok(tensors.into_iter().collect())
        }
    }
}

/// Tiled upscaler owning its loaded networks
pub struct TiledUpscaler {
    options: UpscalerOptions,
    architectures: Vec<Box<dyn NetworkArchitecture>>,
    models: HashMap<PathBuf, Box<dyn UpscaleNetwork>>,
    devices: Devices,
    dtype: DType,
    interrupt: Interrupt,
    scale: usize,
}

impl TiledUpscaler {
    pub fn new(options: UpscalerOptions, devices: Devices, dtype: DType, interrupt: Interrupt) -> Self {
        Self {
            options,
            architectures: Vec::new(),
            models: HashMap::new(),
            devices,
            dtype,
            interrupt,
            scale: 4,
        }
    }

    /// Architectures are probed in registration order
    pub fn with_architecture(mut self, architecture: impl NetworkArchitecture + 'static) -> Self {
        self.architectures.push(Box::new(architecture));
        self
    }

    pub fn with_scale(mut self, scale: usize) -> Self {
        self.scale = scale;
        self
    }

    pub fn is_loaded(&self, path: &Path) -> bool {
        self.models.contains_key(path)
    }

    /// Load once per path; every architecture is tried with each parameter prefix
    pub fn load_model(&mut self, path: &Path) -> Option<&dyn UpscaleNetwork> {
        if self.models.contains_key(path) {
            debug!("Upscaler cached: model={}", path.display());
            return self.models.get(path).map(|m| m.as_ref());
        }
        let tensors = match read_checkpoint(path, &self.devices) {
            Ok(tensors) => tensors,
            Err(e) => {
                error!("Upscaler load failed: model={} {}", path.display(), e);
                return None;
            }
        };
        for architecture in &self.architectures {
            for prefix in PARAM_PREFIXES {
                let vb = VarBuilder::from_tensors(tensors.clone(), self.dtype, &self.devices.compute);
                let vb = match prefix {
                    Some(prefix) => vb.pp(prefix),
                    None => vb,
                };
                match architecture.build(vb, self.scale) {
                    Ok(network) => {
                        info!(
                            "Upscaler loaded: type={} model={} param={}",
                            architecture.name(),
                            path.display(),
                            prefix.unwrap_or("None")
                        );
                        self.models.insert(path.to_path_buf(), network);
                        return self.models.get(path).map(|m| m.as_ref());
                    }
                    Err(e) => error!(
                        "Upscaler invalid parameters: type={} model={} param={} {}",
                        architecture.name(),
                        path.display(),
                        prefix.unwrap_or("None"),
                        e
                    ),
                }
            }
        }
        None
    }

    pub fn unload(&mut self, path: &Path) -> bool {
        let removed = self.models.remove(path).is_some();
        if removed {
            debug!("Upscaler unloaded: model={}", path.display());
        }
        removed
    }

    /// Upscale with the network at `path`; the input comes back unchanged if it cannot be loaded
    pub fn do_upscale(&mut self, image: &DynamicImage, path: &Path) -> Result<DynamicImage> {
        let (options, interrupt, device) = (self.options.clone(), self.interrupt.clone(), self.devices.compute.clone());
        let Some(network) = self.load_model(path) else {
            return Ok(image.clone());
        };
        let input = image_to_tensor(image, &device)?;
        let output = upscale_tensor(&input, network, &options, &interrupt)?;
        let result = tensor_to_image(&output)?;
        if self.options.unload {
            self.unload(path);
        }
        Ok(result)
    }
}
