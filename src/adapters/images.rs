//! Adapter image inputs, masks and CLIP preprocessing

use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine;
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use log::error;

use crate::error::AdapterError;

/// One adapter image input as it arrives with a request
#[derive(Debug, Clone)]
pub enum AdapterImage {
    Image(DynamicImage),
    /// Base64 payload, optionally with a `data:` url header
    Base64(String),
    Path(PathBuf),
    /// Several images feeding the same adapter
    List(Vec<AdapterImage>),
}

impl From<DynamicImage> for AdapterImage {
    fn from(image: DynamicImage) -> Self {
        AdapterImage::Image(image)
    }
}

pub fn decode_base64_image(payload: &str) -> Result<DynamicImage> {
    let data = match payload.split_once(";base64,") {
        Some((_, data)) if payload.starts_with("data:") => data,
        _ => payload,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| AdapterError::ImageDecode(e.to_string()))?;
    let image = image::load_from_memory(&bytes).map_err(|e| AdapterError::ImageDecode(e.to_string()))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

fn decode_into(input: &AdapterImage, out: &mut Vec<DynamicImage>) {
    match input {
        AdapterImage::Image(image) => out.push(image.clone()),
        AdapterImage::Base64(payload) => match decode_base64_image(payload) {
            Ok(image) => out.push(image),
            Err(e) => error!("IP adapter: unknown input: {}", e),
        },
        AdapterImage::Path(path) => match image::open(path) {
            Ok(image) => out.push(image),
            Err(e) => error!("IP adapter: unknown input: file={} {}", path.display(), e),
        },
        AdapterImage::List(items) => {
            for item in items {
                decode_into(item, out);
            }
        }
    }
}

/// Decode request inputs into one image list per adapter
///
/// Inputs that fail to decode are logged and dropped; an adapter whose inputs
/// all failed gets no entry.
pub fn get_images(inputs: &[AdapterImage]) -> Vec<Vec<DynamicImage>> {
    let mut images = Vec::with_capacity(inputs.len());
    for input in inputs {
        let mut decoded = Vec::new();
        decode_into(input, &mut decoded);
        if !decoded.is_empty() {
            images.push(decoded);
        }
    }
    images
}

/// Grayscale, resize to the generation size and binarize at 0.5
///
/// Returns `[n, 1, height, width]` with values in {0, 1}.
pub fn preprocess_masks(masks: &[DynamicImage], height: usize, width: usize, device: &Device) -> Result<Tensor> {
    let mut tensors = Vec::with_capacity(masks.len());
    for mask in masks {
        let luma = mask
            .resize_exact(width as u32, height as u32, FilterType::Triangle)
            .to_luma8();
        let data: Vec<f32> = luma
            .into_raw()
            .into_iter()
            .map(|v| if v as f32 / 255.0 >= 0.5 { 1.0 } else { 0.0 })
            .collect();
        tensors.push(Tensor::from_vec(data, (1, 1, height, width), device)?);
    }
    Ok(Tensor::cat(&tensors, 0)?)
}

/// Finds face regions for optional adapter image cropping
pub trait FaceDetector {
    /// Crops of the faces found, best match first
    fn faces(&self, image: &DynamicImage) -> Result<Vec<DynamicImage>>;
}

/// Replace each adapter's images with face crops where cropping is requested
///
/// The originals are kept unless a face is found in every image of that adapter.
pub fn crop_images(images: Vec<Vec<DynamicImage>>, crops: &[bool], detector: Option<&dyn FaceDetector>) -> Vec<Vec<DynamicImage>> {
    let mut out = Vec::with_capacity(images.len());
    for (i, group) in images.into_iter().enumerate() {
        if !crops.get(i).copied().unwrap_or(false) {
            out.push(group);
            continue;
        }
        let Some(detector) = detector else {
            error!("IP adapter: failed to crop image: no face detector");
            out.push(group);
            continue;
        };
        let mut cropped = Vec::with_capacity(group.len());
        for image in &group {
            match detector.faces(image) {
                Ok(faces) => cropped.extend(faces.into_iter().next()),
                Err(e) => error!("IP adapter: failed to crop image: {}", e),
            }
        }
        if cropped.len() == group.len() {
            out.push(cropped);
        } else {
            error!("IP adapter: failed to crop image: source={} faces={}", group.len(), cropped.len());
            out.push(group);
        }
    }
    out
}

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// CLIP image preprocessing for the adapter image encoder
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self {
            size: 224,
            mean: CLIP_MEAN,
            std: CLIP_STD,
        }
    }
}

impl FeatureExtractor {
    /// Shortest side to `size`, center crop, normalize; returns `[n, 3, size, size]`
    pub fn preprocess(&self, images: &[DynamicImage], device: &Device) -> Result<Tensor> {
        let size = self.size;
        let mut batch = Vec::with_capacity(images.len());
        for image in images {
            let (w, h) = (image.width().max(1), image.height().max(1));
            let scale = size as f32 / w.min(h) as f32;
            let (rw, rh) = (
                ((w as f32 * scale).round() as u32).max(size),
                ((h as f32 * scale).round() as u32).max(size),
            );
            let resized = image.resize_exact(rw, rh, FilterType::CatmullRom);
            let cropped = resized.crop_imm((rw - size) / 2, (rh - size) / 2, size, size).to_rgb8();

            let pixels = Tensor::from_vec(cropped.into_raw(), (size as usize, size as usize, 3), device)?
                .permute((2, 0, 1))?
                .to_dtype(DType::F32)?;
            let pixels = (pixels / 255.0)?;
            let mean = Tensor::new(&self.mean, device)?.reshape((3, 1, 1))?;
            let std = Tensor::new(&self.std, device)?.reshape((3, 1, 1))?;
            batch.push(pixels.broadcast_sub(&mean)?.broadcast_div(&std)?);
        }
        Tensor::stack(&batch, 0).context("Failed to stack adapter images")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn png_base64(image: &DynamicImage) -> String {
        let mut bytes = std::io::Cursor::new(Vec::new());
        image.write_to(&mut bytes, image::ImageOutputFormat::Png).unwrap();
        base64::engine::general_purpose::STANDARD.encode(bytes.into_inner())
    }

    #[test]
    fn test_get_images_flattens_inputs() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([10, 20, 30])));
        let encoded = png_base64(&img);
        let inputs = vec![
            AdapterImage::Image(img.clone()),
            AdapterImage::List(vec![
                AdapterImage::Base64(format!("data:image/png;base64,{}", encoded)),
                AdapterImage::Base64(encoded),
            ]),
            AdapterImage::Base64("!!not base64!!".to_string()),
        ];
        let images = get_images(&inputs);
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].len(), 1);
        assert_eq!(images[1].len(), 2);
        assert_eq!(images[1][0].to_rgb8().get_pixel(0, 0), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_masks_are_binarized() -> Result<()> {
        let mut mask = GrayImage::new(4, 4);
        for x in 0..4 {
            for y in 0..4 {
                mask.put_pixel(x, y, Luma([if x < 2 { 200 } else { 30 }]));
            }
        }
        let masks = preprocess_masks(&[DynamicImage::ImageLuma8(mask)], 8, 8, &Device::Cpu)?;
        assert_eq!(masks.dims(), &[1, 1, 8, 8]);
        let values = masks.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|v| *v == 0.0 || *v == 1.0));
        assert_eq!(values[0], 1.0);
        assert_eq!(values[7], 0.0);
        Ok(())
    }

    #[test]
    fn test_feature_extractor_shape() -> Result<()> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([255, 255, 255])));
        let pixels = FeatureExtractor::default().preprocess(&[img.clone(), img], &Device::Cpu)?;
        assert_eq!(pixels.dims(), &[2, 3, 224, 224]);
        let first = pixels.flatten_all()?.to_vec1::<f32>()?[0];
        assert!((first - (1.0 - CLIP_MEAN[0]) / CLIP_STD[0]).abs() < 2e-2);
        Ok(())
    }

    struct CenterFace;

    impl FaceDetector for CenterFace {
        fn faces(&self, image: &DynamicImage) -> Result<Vec<DynamicImage>> {
            if image.width() < 4 {
                return Ok(Vec::new());
            }
            Ok(vec![image.crop_imm(1, 1, 2, 2)])
        }
    }

    #[test]
    fn test_crop_keeps_originals_without_all_faces() {
        let big = DynamicImage::ImageRgb8(RgbImage::new(8, 8));
        let small = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let images = vec![vec![big.clone()], vec![big, small], vec![DynamicImage::ImageRgb8(RgbImage::new(8, 8))]];
        let out = crop_images(images, &[true, true, false], Some(&CenterFace));
        assert_eq!(out[0][0].width(), 2);
        assert_eq!(out[1][0].width(), 8);
        assert_eq!(out[2][0].width(), 8);
    }
}
