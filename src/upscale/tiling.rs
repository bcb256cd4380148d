//! Tile layout, reflection padding and overlap-add accumulation

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

use crate::error::UpscaleError;

/// Top-left offsets covering `len` with `tile`-sized tiles at stride `tile - overlap`
///
/// The last offset is always `len - tile` so no tile crosses the edge.
pub fn tile_offsets(len: usize, tile: usize, overlap: usize) -> Result<Vec<usize>> {
    if overlap >= tile {
        return Err(UpscaleError::ZeroStride { tile, overlap }.into());
    }
    let stride = tile - overlap;
    let last = len.saturating_sub(tile);
    let mut offsets: Vec<usize> = (0..last).step_by(stride).collect();
    offsets.push(last);
    Ok(offsets)
}

fn reflect_axis(img: &Tensor, axis: usize, target: usize) -> Result<Tensor> {
    let len = img.dim(axis)?;
    if target <= len {
        return Ok(img.narrow(axis, 0, target)?);
    }
    let reversed: Vec<u32> = (0..len as u32).rev().collect();
    let flipped = img.contiguous()?.index_select(&Tensor::new(reversed.as_slice(), img.device())?, axis)?;
    let mut parts = vec![img.clone()];
    let mut total = len;
    let mut forward = false;
    while total < target {
        parts.push(if forward { img.clone() } else { flipped.clone() });
        forward = !forward;
        total += len;
    }
    Ok(Tensor::cat(&parts, axis)?.narrow(axis, 0, target)?)
}

/// Mirror `[b, c, h, w]` at the bottom and right edge so both sides grow to the
/// next multiple of `window`; an aligned side still gains a full window
pub fn reflect_pad(img: &Tensor, window: usize) -> Result<Tensor> {
    let (_, _, h, w) = img.dims4()?;
    let padded_h = (h / window + 1) * window;
    let padded_w = (w / window + 1) * window;
    let img = reflect_axis(img, 2, padded_h)?;
    reflect_axis(&img, 3, padded_w)
}

/// Output and weight buffers for overlap-add blending
pub struct TileAccumulator {
    output: Tensor,
    weight: Tensor,
}

impl TileAccumulator {
    pub fn new(shape: (usize, usize, usize, usize), device: &Device) -> Result<Self> {
        Ok(Self {
            output: Tensor::zeros(shape, DType::F32, device)?,
            weight: Tensor::zeros(shape, DType::F32, device)?,
        })
    }

    /// Add `patch` at `(y, x)` and count it in the weight buffer
    pub fn add(&mut self, patch: &Tensor, y: usize, x: usize) -> Result<()> {
        let patch = patch.to_dtype(DType::F32)?;
        let (b, c, h, w) = patch.dims4()?;
        let ranges = [0..b, 0..c, y..y + h, x..x + w];
        let current = self.output.narrow(2, y, h)?.narrow(3, x, w)?;
        self.output = self.output.slice_assign(&ranges, &(current + &patch)?)?;
        let counted = (self.weight.narrow(2, y, h)?.narrow(3, x, w)? + 1.0)?;
        self.weight = self.weight.slice_assign(&ranges, &counted)?;
        Ok(())
    }

    /// Average overlaps; positions no tile reached stay zero
    pub fn finish(self) -> Result<Tensor> {
        Ok(self.output.div(&self.weight.maximum(1f32)?)?)
    }
}
