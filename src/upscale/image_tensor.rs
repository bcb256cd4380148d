//! Conversions between RGB images and `[1, 3, H, W]` tensors in `[0, 1]`

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, RgbImage};

pub fn image_to_tensor(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let rgb = image.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let tensor = Tensor::from_vec(rgb.into_raw(), (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?;
    Ok((tensor / 255.0)?.unsqueeze(0)?)
}

/// Clamp to `[0, 1]`, scale and round back to 8-bit RGB
pub fn tensor_to_image(tensor: &Tensor) -> Result<DynamicImage> {
    let tensor = tensor.squeeze(0)?.to_dtype(DType::F32)?.clamp(0f32, 1f32)?;
    let tensor = (tensor * 255.0)?.round()?.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let img = RgbImage::from_raw(width as u32, height as u32, data).context("Failed to create image buffer")?;
    Ok(DynamicImage::ImageRgb8(img))
}

pub fn save_image<P: AsRef<Path>>(image: &DynamicImage, path: P) -> Result<()> {
    let path = path.as_ref();
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    image
        .save_with_format(path, format)
        .with_context(|| format!("Failed to save image: {}", path.display()))
}
