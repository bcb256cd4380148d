//! Checkpoint resolution: format, family, size and missing sub-modules

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::quantized::gguf_file;
use candle_core::safetensors::MmapedSafetensors;
use log::{debug, warn};

use crate::models::{ComponentSlot, ModelFamily};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// One `.safetensors` archive holding the whole pipeline or a part of it
    SingleFile,
    /// GGUF container with a quantized denoiser
    Gguf,
    /// Local diffusers-style directory of sub-module folders
    Directory,
    /// Hub repository id
    Repository,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(CheckpointFormat::Directory);
        }
        match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
            Some(ext) if ext == "safetensors" => Some(CheckpointFormat::SingleFile),
            Some(ext) if ext == "gguf" => Some(CheckpointFormat::Gguf),
            _ => None,
        }
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointFormat::SingleFile => "safetensors",
            CheckpointFormat::Gguf => "gguf",
            CheckpointFormat::Directory => "diffusers",
            CheckpointFormat::Repository => "hub",
        };
        f.write_str(name)
    }
}

/// A model identified by path or repository id
#[derive(Debug, Clone)]
pub struct CheckpointRef {
    pub name: String,
    pub path: Option<PathBuf>,
    pub repo_id: String,
    pub format: CheckpointFormat,
    pub size_bytes: u64,
    pub family: ModelFamily,
}

impl CheckpointRef {
    pub fn size_mb(&self) -> u64 {
        self.size_bytes / 1024 / 1024
    }

    /// The local path, if it still exists on disk
    pub fn local_path(&self) -> Option<&Path> {
        self.path.as_deref().filter(|p| p.exists())
    }
}

/// Map a checkpoint name or hub cache folder to an `org/name` repository id
pub fn path_to_repo(name: &str) -> String {
    let mut repo = name.replace('\\', "/");
    if let Some(idx) = repo.rfind("models--") {
        repo = repo[idx..].split('/').next().unwrap_or_default().to_string();
    }
    let parts: Vec<&str> = repo.split('/').filter(|p| !p.is_empty()).collect();
    let repo = if parts.len() > 1 {
        parts[parts.len() - 2..].join("/")
    } else {
        parts.join("/")
    };
    repo.replace("models--", "").replace("--", "/")
}

/// Tensor names stored in a safetensors archive
pub fn safetensor_keys(path: &Path) -> Result<Vec<String>> {
    let st = unsafe { MmapedSafetensors::new(path) }
        .with_context(|| format!("Failed to open safetensors: {}", path.display()))?;
    Ok(st.tensors().into_iter().map(|(name, _)| name).collect())
}

/// Tensor names stored in a GGUF container
pub fn gguf_keys(path: &Path) -> Result<Vec<String>> {
    let mut file = File::open(path).with_context(|| format!("Failed to open gguf: {}", path.display()))?;
    let content = gguf_file::Content::read(&mut file)
        .with_context(|| format!("Failed to read gguf header: {}", path.display()))?;
    Ok(content.tensor_infos.keys().cloned().collect())
}

fn family_from_model_index(dir: &Path) -> Option<ModelFamily> {
    let text = fs::read_to_string(dir.join("model_index.json")).ok()?;
    let json: serde_json::Value = serde_json::from_str(&text).ok()?;
    let class = json.get("_class_name")?.as_str()?;
    let family = match class {
        c if c.starts_with("StableDiffusion3") => ModelFamily::Sd3,
        c if c.starts_with("Flux") => ModelFamily::Flux,
        c if c.starts_with("StableCascade") => ModelFamily::StableCascade,
        c if c.starts_with("StableDiffusionXL") => ModelFamily::Sdxl,
        c if c.starts_with("StableDiffusion") => ModelFamily::Sd15,
        _ => ModelFamily::Other,
    };
    Some(family)
}

/// Resolve a checkpoint name or path
///
/// An existing file is classified by extension and probed for its family, an
/// existing directory is read as a diffusers layout, anything else is treated
/// as a hub repository id.
pub fn resolve(name_or_path: &str) -> Result<CheckpointRef> {
    let path = PathBuf::from(name_or_path);
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name_or_path)
        .to_string();

    if !path.exists() {
        let repo_id = path_to_repo(name_or_path);
        let family = ModelFamily::detect_from_name(&repo_id);
        debug!("Resolve: repo={} family={}", repo_id, family);
        return Ok(CheckpointRef {
            name: name_or_path.to_string(),
            path: None,
            repo_id,
            format: CheckpointFormat::Repository,
            size_bytes: 0,
            family,
        });
    }

    let format = CheckpointFormat::from_path(&path)
        .ok_or_else(|| crate::error::LoadError::UnsupportedFormat(path.clone()))?;
    let (size_bytes, family) = match format {
        CheckpointFormat::Directory => {
            let family = family_from_model_index(&path).unwrap_or_else(|| ModelFamily::detect_from_name(name_or_path));
            (0, family)
        }
        _ => {
            let size = fs::metadata(&path)?.len();
            let keys = if format == CheckpointFormat::Gguf {
                gguf_keys(&path)?
            } else {
                safetensor_keys(&path)?
            };
            let family = ModelFamily::detect_from_keys(keys.iter().map(String::as_str))
                .unwrap_or_else(|| ModelFamily::detect_from_name(&name));
            (size, family)
        }
    };

    let checkpoint = CheckpointRef {
        repo_id: path_to_repo(&name),
        name,
        path: Some(path),
        format,
        size_bytes,
        family,
    };
    debug!(
        "Resolve: file={:?} format={} family={} size={}MB",
        checkpoint.path,
        checkpoint.format,
        checkpoint.family,
        checkpoint.size_mb()
    );
    Ok(checkpoint)
}

/// Text-encoder slots with no tensors in the given key set
pub fn missing_components<S: AsRef<str>>(keys: &[S]) -> Vec<ComponentSlot> {
    ComponentSlot::TEXT_ENCODERS
        .into_iter()
        .filter(|slot| {
            !keys.iter().any(|k| {
                let k = k.as_ref();
                slot.single_file_prefixes().iter().any(|p| k.starts_with(p))
            })
        })
        .collect()
}

/// Index loadable weight files under a directory by file stem
pub fn scan_models(dir: &Path) -> BTreeMap<String, PathBuf> {
    let mut found = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Scan models: folder={} {}", current.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if !matches!(
                CheckpointFormat::from_path(&path),
                Some(CheckpointFormat::SingleFile | CheckpointFormat::Gguf)
            ) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.insert(stem.to_string(), path.clone());
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;

    #[test]
    fn test_path_to_repo() {
        assert_eq!(path_to_repo("stabilityai/stable-diffusion-3-medium"), "stabilityai/stable-diffusion-3-medium");
        assert_eq!(
            path_to_repo("/cache/models--stabilityai--stable-diffusion-3.5-large/snapshots/abc"),
            "stabilityai/stable-diffusion-3.5-large"
        );
        assert_eq!(path_to_repo("C:\\models\\org\\name"), "org/name");
        assert_eq!(path_to_repo("sd3_medium"), "sd3_medium");
    }

    #[test]
    fn test_resolve_repository() -> Result<()> {
        let ckpt = resolve("stabilityai/stable-diffusion-3-medium")?;
        assert_eq!(ckpt.format, CheckpointFormat::Repository);
        assert_eq!(ckpt.family, ModelFamily::Sd3);
        assert!(ckpt.local_path().is_none());
        Ok(())
    }

    #[test]
    fn test_resolve_single_file_detects_family() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("custom.safetensors");
        let mut tensors = HashMap::new();
        let t = Tensor::zeros((2, 2), DType::F32, &Device::Cpu)?;
        tensors.insert("model.diffusion_model.joint_blocks.0.x_block.attn.qkv.weight".to_string(), t.clone());
        tensors.insert("text_encoders.clip_l.transformer.text_model.final_layer_norm.weight".to_string(), t);
        candle_core::safetensors::save(&tensors, &path)?;

        let ckpt = resolve(path.to_str().unwrap())?;
        assert_eq!(ckpt.format, CheckpointFormat::SingleFile);
        assert_eq!(ckpt.family, ModelFamily::Sd3);
        assert!(ckpt.size_bytes > 0);

        let keys = safetensor_keys(&path)?;
        assert_eq!(missing_components(&keys), vec![ComponentSlot::TextEncoder2, ComponentSlot::TextEncoder3]);
        Ok(())
    }

    #[test]
    fn test_unsupported_extension() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("weights.ckpt");
        fs::write(&path, b"pickle")?;
        assert!(resolve(path.to_str().unwrap()).is_err());
        Ok(())
    }

    #[test]
    fn test_scan_models() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("t5"))?;
        fs::write(dir.path().join("t5/t5xxl_fp16.safetensors"), b"x")?;
        fs::write(dir.path().join("sd3_q8.gguf"), b"x")?;
        fs::write(dir.path().join("notes.txt"), b"x")?;
        let found = scan_models(dir.path());
        assert_eq!(found.len(), 2);
        assert!(found.contains_key("t5xxl_fp16"));
        assert!(found.contains_key("sd3_q8"));
        Ok(())
    }

    #[test]
    fn test_missing_components_empty_keys() {
        let keys: Vec<String> = Vec::new();
        assert_eq!(missing_components(&keys).len(), 3);
    }
}
