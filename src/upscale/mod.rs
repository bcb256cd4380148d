//! Tiled super-resolution post-processing

pub mod image_tensor;
pub mod tiling;
pub mod upscaler;

pub use image_tensor::{image_to_tensor, save_image, tensor_to_image};
pub use tiling::{reflect_pad, tile_offsets, TileAccumulator};
pub use upscaler::{tiled_inference, upscale_tensor, NetworkArchitecture, TiledUpscaler, UpscaleNetwork, PARAM_PREFIXES};
