//! Device placement for pipeline sub-modules
//!
//! Sub-modules live either on the compute device or on a holding device
//! (normally CPU memory). Moves are explicit and synchronous: move in,
//! compute, move out.

use anyhow::Result;
use candle_core::Device;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// When sub-modules are returned to the holding tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffloadMode {
    /// Keep everything resident on the compute device
    #[default]
    None,
    /// Move each whole sub-module out after it has been used
    Model,
    /// Same as model but also called between stages
    Sequential,
    /// Rebalance everything before and after each stage
    Balanced,
}

impl OffloadMode {
    pub fn name(&self) -> &'static str {
        match self {
            OffloadMode::None => "none",
            OffloadMode::Model => "model",
            OffloadMode::Sequential => "sequential",
            OffloadMode::Balanced => "balanced",
        }
    }

    /// Whether sub-modules go back to the holding tier after use
    pub fn releases_after_use(&self) -> bool {
        !matches!(self, OffloadMode::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTier {
    Compute,
    Holding,
}

/// The pair of devices sub-modules move between
#[derive(Debug, Clone)]
pub struct Devices {
    pub compute: Device,
    pub holding: Device,
}

impl Devices {
    pub fn cpu() -> Self {
        Self {
            compute: Device::Cpu,
            holding: Device::Cpu,
        }
    }

    /// Parse "cpu", "cuda" or "cuda:N", falling back to CPU if CUDA is unavailable
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_lowercase();
        if name == "cpu" {
            return Self::cpu();
        }
        let ordinal = name
            .strip_prefix("cuda")
            .map(|rest| rest.trim_start_matches(':'))
            .and_then(|rest| if rest.is_empty() { Some(0) } else { rest.parse::<usize>().ok() });
        match ordinal {
            Some(ordinal) => match Device::new_cuda(ordinal) {
                Ok(device) => Self {
                    compute: device,
                    holding: Device::Cpu,
                },
                Err(e) => {
                    warn!("CUDA device {} not available: {}. Using CPU.", ordinal, e);
                    Self::cpu()
                }
            },
            None => {
                warn!("Unknown device '{}'. Using CPU.", name);
                Self::cpu()
            }
        }
    }

    pub fn device(&self, tier: DeviceTier) -> &Device {
        match tier {
            DeviceTier::Compute => &self.compute,
            DeviceTier::Holding => &self.holding,
        }
    }
}

/// Anything that can be moved between the compute and holding tiers
pub trait Placeable {
    fn label(&self) -> &str;
    fn tier(&self) -> DeviceTier;
    fn place(&mut self, tier: DeviceTier, devices: &Devices) -> Result<()>;
}

/// Move a sub-module to a tier if it is not already there
///
/// Returns true when a move happened.
pub fn move_model<P: Placeable + ?Sized>(item: &mut P, tier: DeviceTier, devices: &Devices) -> Result<bool> {
    if item.tier() == tier {
        return Ok(false);
    }
    debug!("Offload: module={} target={:?}", item.label(), tier);
    item.place(tier, devices)?;
    Ok(true)
}

/// Return a sub-module to the holding tier if the offload mode asks for it
pub fn release<P: Placeable + ?Sized>(item: &mut P, mode: OffloadMode, devices: &Devices) -> Result<bool> {
    if !mode.releases_after_use() {
        return Ok(false);
    }
    move_model(item, DeviceTier::Holding, devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        tier: DeviceTier,
        moves: usize,
    }

    impl Placeable for Dummy {
        fn label(&self) -> &str {
            "dummy"
        }
        fn tier(&self) -> DeviceTier {
            self.tier
        }
        fn place(&mut self, tier: DeviceTier, _devices: &Devices) -> Result<()> {
            self.tier = tier;
            self.moves += 1;
            Ok(())
        }
    }

    #[test]
    fn test_move_and_release() -> Result<()> {
        let devices = Devices::cpu();
        let mut item = Dummy { tier: DeviceTier::Holding, moves: 0 };

        assert!(move_model(&mut item, DeviceTier::Compute, &devices)?);
        assert!(!move_model(&mut item, DeviceTier::Compute, &devices)?);
        assert_eq!(item.moves, 1);

        assert!(!release(&mut item, OffloadMode::None, &devices)?);
        assert_eq!(item.tier, DeviceTier::Compute);
        assert!(release(&mut item, OffloadMode::Balanced, &devices)?);
        assert_eq!(item.tier, DeviceTier::Holding);
        Ok(())
    }

    #[test]
    fn test_device_names() {
        assert!(Devices::from_name("cpu").compute.is_cpu());
        // Unknown names fall back to the CPU
        assert!(Devices::from_name("tpu").compute.is_cpu());
    }
}
