//! Typed errors for the loader, adapter and upscaler seams

use std::path::PathBuf;

use crate::models::{ComponentSlot, ModelFamily};

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("Unsupported checkpoint format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("File not found: {0}")]
    MissingFile(PathBuf),
    #[error("Unknown {kind} override: {name}")]
    UnknownOverride { kind: &'static str, name: String },
    #[error("No weights for {slot} in repo={repo} subfolder={subfolder}")]
    ComponentNotFound {
        slot: ComponentSlot,
        repo: String,
        subfolder: String,
    },
    #[error("Model family {0} cannot be loaded from this source")]
    UnsupportedFamily(ModelFamily),
}

#[derive(thiserror::Error, Debug)]
pub enum AdapterError {
    #[error("model={0} not supported")]
    UnsupportedFamily(ModelFamily),
    #[error("unknown model type: {0}")]
    UnknownEncoder(String),
    #[error("image and mask count mismatch: images={images} masks={masks}")]
    MaskMismatch { images: usize, masks: usize },
    #[error("failed to decode image: {0}")]
    ImageDecode(String),
}

#[derive(thiserror::Error, Debug)]
pub enum UpscaleError {
    #[error("tile size {tile} should be a multiple of window size {window}")]
    TileNotAligned { tile: usize, window: usize },
    #[error("tile overlap {overlap} must be smaller than tile size {tile}")]
    ZeroStride { tile: usize, overlap: usize },
}
