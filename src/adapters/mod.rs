//! Image-prompt adapters attached to a constructed pipeline

pub mod images;
pub mod ip_adapter;

pub use images::{crop_images, decode_base64_image, get_images, preprocess_masks, AdapterImage, FaceDetector, FeatureExtractor};
pub use ip_adapter::{
    adapter_weight_name, adapters_for_family, image_encoder_for, pad_to_len, AdapterArgs, AttachedAdapter, DetachOutcome,
    IpAdapterAttachment, IpAdapterInjector, ADAPTERS, BASE_REPO,
};
