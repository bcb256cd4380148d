//! Device placement and weight quantization for pipeline sub-modules

pub mod offload;
pub mod quantization;

pub use offload::{move_model, release, DeviceTier, Devices, OffloadMode, Placeable};
pub use quantization::{quantize_state_dict, QuantBits, QuantizationConfig, QuantizedStateDict};
