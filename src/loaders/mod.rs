pub mod checkpoint;
pub mod gguf;
pub mod hub;
pub mod pipeline_loader;
pub mod sd3_remapper;

pub use checkpoint::{missing_components, path_to_repo, resolve, safetensor_keys, scan_models, CheckpointFormat, CheckpointRef};
pub use gguf::{load_gguf_state_dict, load_gguf_transformer, GgufStats};
pub use hub::{fetch_component_files, HubFetcher, LocalFetcher, RepoFetcher};
pub use pipeline_loader::{ComponentPipelineConstructor, LoadState, ModelIndex, ModelLoader, OverrideBag, PipelineConstructor};
pub use sd3_remapper::{remap_sd3_transformer, sd3_transformer_keys, Sd3TransformerConfig};
