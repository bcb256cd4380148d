// Weight quantization for pipeline sub-modules loaded with a quantization config

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor};
use log::{debug, info};

use crate::config::QuantizationOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantBits {
    Eight,
    Four,
}

/// Quantization applied to a sub-module at construction time
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizationConfig {
    pub bits: QuantBits,
    /// fp8, nf4 or fp4 as requested by the user
    pub quant_type: String,
    pub storage: String,
    pub compute_dtype: DType,
    pub exclude_patterns: Vec<String>,
}

impl QuantizationConfig {
    /// Build the config requested by the options, None when no module asks for it
    pub fn from_options(options: &QuantizationOptions, compute_dtype: DType) -> Option<Self> {
        if options.modules.is_empty() {
            return None;
        }
        let quant_type = options.quant_type.to_lowercase();
        let bits = match quant_type.as_str() {
            "fp8" => QuantBits::Eight,
            "nf4" | "fp4" => QuantBits::Four,
            other => {
                log::warn!("Quantization: unknown type={} using 4-bit", other);
                QuantBits::Four
            }
        };
        Some(Self {
            bits,
            quant_type,
            storage: options.storage.clone(),
            compute_dtype,
            exclude_patterns: vec![
                "norm".to_string(),
                "embed".to_string(),
                "pos_embed".to_string(),
                "proj_out".to_string(),
            ],
        })
    }

    pub fn load_in_8bit(&self) -> bool {
        self.bits == QuantBits::Eight
    }

    pub fn load_in_4bit(&self) -> bool {
        self.bits == QuantBits::Four
    }

    pub fn ggml_dtype(&self) -> GgmlDType {
        match self.bits {
            QuantBits::Eight => GgmlDType::Q8_0,
            QuantBits::Four => GgmlDType::Q4_0,
        }
    }

    /// Check if a tensor should be quantized
    fn should_quantize(&self, name: &str, tensor: &Tensor) -> bool {
        if self.exclude_patterns.iter().any(|p| name.contains(p.as_str())) {
            return false;
        }
        if !name.ends_with(".weight") || tensor.rank() < 2 {
            return false;
        }
        // ggml blocks run along the last dimension
        let block = self.ggml_dtype().block_size();
        tensor.dims().last().map(|d| d % block == 0).unwrap_or(false)
    }
}

/// A state dict split into quantized matrices and tensors kept at full precision
pub struct QuantizedStateDict {
    pub quantized: HashMap<String, Arc<QTensor>>,
    pub passthrough: HashMap<String, Tensor>,
}

impl QuantizedStateDict {
    pub fn len(&self) -> usize {
        self.quantized.len() + self.passthrough.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a weight, dequantizing when needed
    pub fn get(&self, name: &str, device: &Device, dtype: DType) -> Result<Tensor> {
        if let Some(qtensor) = self.quantized.get(name) {
            return Ok(qtensor.dequantize(device)?.to_dtype(dtype)?);
        }
        match self.passthrough.get(name) {
            Some(tensor) => Ok(tensor.to_device(device)?.to_dtype(dtype)?),
            None => anyhow::bail!("Weight {} not found", name),
        }
    }
}

/// Quantize an entire state dict
pub fn quantize_state_dict(
    weights: HashMap<String, Tensor>,
    config: &QuantizationConfig,
) -> Result<QuantizedStateDict> {
    let total = weights.len();
    let mut quantized = HashMap::new();
    let mut passthrough = HashMap::new();

    for (name, tensor) in weights {
        if config.should_quantize(&name, &tensor) {
            let src = tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
            let qtensor = QTensor::quantize(&src, config.ggml_dtype())?;
            quantized.insert(name, Arc::new(qtensor));
        } else {
            passthrough.insert(name, tensor);
        }
    }

    debug!(
        "Quantization: type={} storage={} quantized={} kept={}",
        config.quant_type,
        config.storage,
        quantized.len(),
        passthrough.len()
    );
    info!("Quantized {} of {} weights", quantized.len(), total);
    Ok(QuantizedStateDict { quantized, passthrough })
}
