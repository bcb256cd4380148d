//! Model family tags
//!
//! The family is resolved once when a checkpoint is resolved or a pipeline is
//! constructed, and passed explicitly to everything that behaves differently
//! per family.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Sd15,
    Sdxl,
    Sd3,
    Flux,
    StableCascade,
    Other,
}

/// Which hidden state of a text transformer becomes the prompt embedding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiddenStateSelection {
    /// 1 = output of the last layer, 2 = penultimate, ...
    pub layer_from_end: usize,
    /// Apply the encoder's final layer norm to the selected state
    pub final_norm: bool,
}

impl ModelFamily {
    pub fn name(&self) -> &'static str {
        match self {
            ModelFamily::Sd15 => "sd",
            ModelFamily::Sdxl => "sdxl",
            ModelFamily::Sd3 => "sd3",
            ModelFamily::Flux => "f1",
            ModelFamily::StableCascade => "sc",
            ModelFamily::Other => "other",
        }
    }

    /// Guess the family from tensor names of a single-file checkpoint
    pub fn detect_from_keys<'a, I>(keys: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sdxl = false;
        let mut sd15 = false;
        for key in keys {
            let key = key.strip_prefix("model.diffusion_model.").unwrap_or(key);
            if key.starts_with("joint_blocks.") {
                return Some(ModelFamily::Sd3);
            }
            if key.starts_with("double_blocks.") || key.starts_with("single_blocks.") {
                return Some(ModelFamily::Flux);
            }
            if key.starts_with("conditioner.embedders.1.") {
                sdxl = true;
            }
            if key.starts_with("cond_stage_model.") {
                sd15 = true;
            }
        }
        if sdxl {
            Some(ModelFamily::Sdxl)
        } else if sd15 {
            Some(ModelFamily::Sd15)
        } else {
            None
        }
    }

    /// Guess the family from a repository id or checkpoint name
    pub fn detect_from_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("stable-diffusion-3") || name.contains("sd3") {
            ModelFamily::Sd3
        } else if name.contains("flux") {
            ModelFamily::Flux
        } else if name.contains("cascade") {
            ModelFamily::StableCascade
        } else if name.contains("xl") {
            ModelFamily::Sdxl
        } else if name.contains("stable-diffusion") || name.contains("sd15") || name.contains("v1-5") {
            ModelFamily::Sd15
        } else {
            ModelFamily::Other
        }
    }

    /// Families with the image-prompt adapter hooks
    pub fn supports_ip_adapter(&self) -> bool {
        matches!(self, ModelFamily::Sd15 | ModelFamily::Sdxl)
    }

    /// Families the weighted prompt parser knows how to condition
    pub fn supports_prompt_weighting(&self) -> bool {
        !matches!(self, ModelFamily::Other)
    }

    /// Number of CLIP-style encoders taking part in weighted encoding
    pub fn weighted_encoder_count(&self) -> usize {
        match self {
            ModelFamily::Sd15 | ModelFamily::StableCascade | ModelFamily::Flux => 1,
            ModelFamily::Sdxl | ModelFamily::Sd3 => 2,
            ModelFamily::Other => 0,
        }
    }

    /// Whether a T5 style encoder contributes sequence embeddings
    pub fn uses_t5(&self) -> bool {
        matches!(self, ModelFamily::Sd3 | ModelFamily::Flux)
    }

    /// The denoiser slot name used by this family
    pub fn denoiser_is_transformer(&self) -> bool {
        matches!(self, ModelFamily::Sd3 | ModelFamily::Flux)
    }

    /// Map a user clip-skip to the hidden state the encoders return
    pub fn hidden_state_selection(&self, clip_skip: usize) -> HiddenStateSelection {
        let clip_skip = clip_skip.max(1);
        match self {
            ModelFamily::StableCascade => HiddenStateSelection {
                layer_from_end: clip_skip,
                final_norm: false,
            },
            ModelFamily::Sdxl | ModelFamily::Sd3 => HiddenStateSelection {
                layer_from_end: clip_skip + 1,
                final_norm: false,
            },
            _ => HiddenStateSelection {
                layer_from_end: clip_skip,
                final_norm: true,
            },
        }
    }

    /// Hub repository used to fill sub-modules missing from a single file
    pub fn fallback_repo(&self, size_mb: u64) -> Option<&'static str> {
        match self {
            ModelFamily::Sd3 if size_mb > 15000 => Some("stabilityai/stable-diffusion-3.5-large"),
            ModelFamily::Sd3 => Some("stabilityai/stable-diffusion-3-medium"),
            _ => None,
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_keys() {
        let sd3 = ["model.diffusion_model.joint_blocks.0.x_block.attn.qkv.weight"];
        assert_eq!(ModelFamily::detect_from_keys(sd3), Some(ModelFamily::Sd3));

        let sdxl = ["conditioner.embedders.0.transformer.x", "conditioner.embedders.1.model.y"];
        assert_eq!(ModelFamily::detect_from_keys(sdxl), Some(ModelFamily::Sdxl));

        let sd15 = ["cond_stage_model.transformer.text_model.x", "model.diffusion_model.input_blocks.0.0.weight"];
        assert_eq!(ModelFamily::detect_from_keys(sd15), Some(ModelFamily::Sd15));

        let flux = ["double_blocks.0.img_attn.qkv.weight"];
        assert_eq!(ModelFamily::detect_from_keys(flux), Some(ModelFamily::Flux));

        assert_eq!(ModelFamily::detect_from_keys(["vae.decoder.conv_in.weight"]), None);
    }

    #[test]
    fn test_detect_from_name() {
        assert_eq!(ModelFamily::detect_from_name("stabilityai/stable-diffusion-3-medium"), ModelFamily::Sd3);
        assert_eq!(ModelFamily::detect_from_name("stabilityai/stable-diffusion-xl-base-1.0"), ModelFamily::Sdxl);
        assert_eq!(ModelFamily::detect_from_name("black-forest-labs/FLUX.1-dev"), ModelFamily::Flux);
        assert_eq!(ModelFamily::detect_from_name("runwayml/stable-diffusion-v1-5"), ModelFamily::Sd15);
        assert_eq!(ModelFamily::detect_from_name("some/video-model"), ModelFamily::Other);
    }

    #[test]
    fn test_fallback_repo_size_threshold() {
        assert_eq!(ModelFamily::Sd3.fallback_repo(16000), Some("stabilityai/stable-diffusion-3.5-large"));
        assert_eq!(ModelFamily::Sd3.fallback_repo(15000), Some("stabilityai/stable-diffusion-3-medium"));
        assert_eq!(ModelFamily::Sdxl.fallback_repo(16000), None);
    }

    #[test]
    fn test_hidden_state_selection() {
        let sel = ModelFamily::Sd15.hidden_state_selection(1);
        assert_eq!(sel, HiddenStateSelection { layer_from_end: 1, final_norm: true });
        let sel = ModelFamily::Sdxl.hidden_state_selection(1);
        assert_eq!(sel, HiddenStateSelection { layer_from_end: 2, final_norm: false });
        let sel = ModelFamily::StableCascade.hidden_state_selection(2);
        assert_eq!(sel, HiddenStateSelection { layer_from_end: 2, final_norm: false });
        // zero is treated as the default of one
        assert_eq!(ModelFamily::Sd15.hidden_state_selection(0).layer_from_end, 1);
    }
}
