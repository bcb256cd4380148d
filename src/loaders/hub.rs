//! Repository access for sub-modules pulled from the hub

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiBuilder};
use log::debug;

use crate::error::LoadError;
use crate::models::ComponentSlot;

/// Resolves files of a repository to local paths
pub trait RepoFetcher {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf>;
}

/// Downloads through the hugging face hub cache
pub struct HubFetcher {
    api: Api,
}

impl HubFetcher {
    pub fn new(cache_dir: Option<&Path>) -> Result<Self> {
        let api = match cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.to_path_buf()).build()?,
            None => Api::new()?,
        };
        Ok(Self { api })
    }
}

impl RepoFetcher for HubFetcher {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        let repo = self.api.model(repo_id.to_string());
        repo.get(filename)
            .with_context(|| format!("Failed to fetch {}/{}", repo_id, filename))
    }
}

/// Serves repositories mirrored under a local directory as `<root>/<repo_id>/<file>`
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl RepoFetcher for LocalFetcher {
    fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        let path = self.root.join(repo_id).join(filename);
        if path.is_file() {
            Ok(path)
        } else {
            Err(LoadError::MissingFile(path).into())
        }
    }
}

/// Weight file stems used by diffusers and transformers checkpoints
const WEIGHT_STEMS: [&str; 2] = ["diffusion_pytorch_model", "model"];

fn weight_name(stem: &str, variant: Option<&str>) -> String {
    match variant {
        Some(variant) => format!("{}.{}.safetensors", stem, variant),
        None => format!("{}.safetensors", stem),
    }
}

/// Shard file names listed in a safetensors index
fn shards_from_index(index_path: &Path) -> Result<Vec<String>> {
    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(index_path)?)
        .with_context(|| format!("Failed to parse index: {}", index_path.display()))?;
    let weight_map = json
        .get("weight_map")
        .and_then(|m| m.as_object())
        .with_context(|| format!("No weight_map in {}", index_path.display()))?;
    let shards: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Ok(shards.into_iter().collect())
}

/// Locate the safetensors files of one sub-module in a repository subfolder
///
/// A sharded index is preferred over a single file, and the requested variant
/// over the default weights.
pub fn fetch_component_files(
    fetcher: &dyn RepoFetcher,
    slot: ComponentSlot,
    repo_id: &str,
    subfolder: &str,
    variant: Option<&str>,
) -> Result<Vec<PathBuf>> {
    let variants: Vec<Option<&str>> = match variant {
        Some(v) => vec![Some(v), None],
        None => vec![None],
    };
    for stem in WEIGHT_STEMS {
        for variant in &variants {
            let name = weight_name(stem, *variant);
            let index = format!("{}/{}.index.json", subfolder, name);
            if let Ok(index_path) = fetcher.fetch(repo_id, &index) {
                let mut files = Vec::new();
                for shard in shards_from_index(&index_path)? {
                    files.push(fetcher.fetch(repo_id, &format!("{}/{}", subfolder, shard))?);
                }
                debug!("Fetch: repo={} folder={} shards={}", repo_id, subfolder, files.len());
                return Ok(files);
            }
            if let Ok(path) = fetcher.fetch(repo_id, &format!("{}/{}", subfolder, name)) {
                debug!("Fetch: repo={} file={}", repo_id, path.display());
                return Ok(vec![path]);
            }
        }
    }
    Err(LoadError::ComponentNotFound {
        slot,
        repo: repo_id.to_string(),
        subfolder: subfolder.to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_prefers_variant_single_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = dir.path().join("org/model");
        touch(&repo.join("text_encoder/model.safetensors"));
        touch(&repo.join("text_encoder/model.fp16.safetensors"));

        let fetcher = LocalFetcher::new(dir.path());
        let files = fetch_component_files(&fetcher, ComponentSlot::TextEncoder, "org/model", "text_encoder", Some("fp16"))?;
        assert_eq!(files, vec![repo.join("text_encoder/model.fp16.safetensors")]);

        let files = fetch_component_files(&fetcher, ComponentSlot::TextEncoder, "org/model", "text_encoder", None)?;
        assert_eq!(files, vec![repo.join("text_encoder/model.safetensors")]);
        Ok(())
    }

    #[test]
    fn test_sharded_index() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let repo = dir.path().join("org/model");
        let folder = repo.join("transformer");
        touch(&folder.join("diffusion_pytorch_model-00001-of-00002.safetensors"));
        touch(&folder.join("diffusion_pytorch_model-00002-of-00002.safetensors"));
        fs::write(
            folder.join("diffusion_pytorch_model.safetensors.index.json"),
            r#"{"weight_map": {"a": "diffusion_pytorch_model-00001-of-00002.safetensors",
                               "b": "diffusion_pytorch_model-00002-of-00002.safetensors",
                               "c": "diffusion_pytorch_model-00001-of-00002.safetensors"}}"#,
        )?;

        let fetcher = LocalFetcher::new(dir.path());
        let files = fetch_component_files(&fetcher, ComponentSlot::Transformer, "org/model", "transformer", None)?;
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_component() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = LocalFetcher::new(dir.path());
        let err = fetch_component_files(&fetcher, ComponentSlot::Vae, "org/none", "vae", None).unwrap_err();
        assert!(err.to_string().contains("vae"));
    }
}
