use std::fs;
use std::path::Path;

use anyhow::Result;
use candle_core::DType;
use image::{DynamicImage, RgbImage};

use sdforge::adapters::{AdapterArgs, AdapterImage, IpAdapterInjector, BASE_REPO};
use sdforge::loaders::LocalFetcher;
use sdforge::memory::Devices;
use sdforge::{ModelFamily, Pipeline, ProcessingRequest};

fn mirror_sd15_adapter(root: &Path) -> Result<()> {
    let repo = root.join(BASE_REPO);
    fs::create_dir_all(repo.join("models/image_encoder"))?;
    fs::write(repo.join("models/image_encoder/model.safetensors"), b"")?;
    fs::write(repo.join("models/ip-adapter_sd15.safetensors"), b"")?;
    Ok(())
}

fn image() -> AdapterImage {
    AdapterImage::Image(DynamicImage::ImageRgb8(RgbImage::new(8, 8)))
}

#[test]
fn test_base_adapter_attaches_on_sd15() -> Result<()> {
    let dir = tempfile::tempdir()?;
    mirror_sd15_adapter(dir.path())?;
    let fetcher = LocalFetcher::new(dir.path());
    let mut injector = IpAdapterInjector::new(&fetcher, Devices::cpu(), DType::F32);
    let mut pipe = Pipeline::new(ModelFamily::Sd15, "runwayml/stable-diffusion-v1-5");
    let mut request = ProcessingRequest::new("a cat", "");

    let args = AdapterArgs {
        names: vec!["Base".to_string()],
        scales: vec![1.0],
        starts: vec![0.0],
        images: vec![image()],
        ..AdapterArgs::default()
    };
    assert!(injector.apply(&mut pipe, &mut request, args));

    let attachment = pipe.ip_adapter.as_ref().expect("adapter attached");
    assert_eq!(attachment.scales, vec![1.0]);
    assert_eq!(attachment.adapters[0].weight_name, "ip-adapter_sd15.safetensors");
    assert!(pipe.image_encoder.is_some());
    assert_eq!(injector.loaded_encoder(), Some("h94/IP-Adapter/models/image_encoder"));
    assert!(request.extra_generation_params.contains_key("IP Adapter"));
    assert_eq!(request.task_args.ip_adapter_image.as_ref().map(|i| i.len()), Some(1));
    Ok(())
}

#[test]
fn test_short_parameter_lists_repeat_last_value() -> Result<()> {
    let dir = tempfile::tempdir()?;
    mirror_sd15_adapter(dir.path())?;
    fs::write(dir.path().join(BASE_REPO).join("models/ip-adapter_sd15_light.safetensors"), b"")?;
    let fetcher = LocalFetcher::new(dir.path());
    let mut injector = IpAdapterInjector::new(&fetcher, Devices::cpu(), DType::F32);
    let mut pipe = Pipeline::new(ModelFamily::Sd15, "sd15");
    let mut request = ProcessingRequest::new("a cat", "");

    let args = AdapterArgs {
        names: vec!["Base".to_string(), "Light".to_string()],
        scales: vec![0.6],
        crops: vec![false],
        starts: vec![0.0],
        ends: vec![0.8],
        images: vec![image(), image()],
    };
    assert!(injector.apply(&mut pipe, &mut request, args));
    assert_eq!(request.ip_adapter_scales, Some(vec![0.6, 0.6]));
    assert_eq!(request.ip_adapter_crops, Some(vec![false, false]));
    assert_eq!(request.ip_adapter_starts, Some(vec![0.0, 0.0]));
    assert_eq!(request.ip_adapter_ends, Some(vec![0.8, 0.8]));
    Ok(())
}

#[test]
fn test_delayed_start_zeroes_scale() -> Result<()> {
    let dir = tempfile::tempdir()?;
    mirror_sd15_adapter(dir.path())?;
    let fetcher = LocalFetcher::new(dir.path());
    let mut injector = IpAdapterInjector::new(&fetcher, Devices::cpu(), DType::F32);
    let mut pipe = Pipeline::new(ModelFamily::Sd15, "sd15");
    let mut request = ProcessingRequest::new("a cat", "");

    let args = AdapterArgs {
        names: vec!["Base".to_string()],
        scales: vec![0.7],
        starts: vec![0.3],
        images: vec![image()],
        ..AdapterArgs::default()
    };
    assert!(injector.apply(&mut pipe, &mut request, args));
    assert_eq!(pipe.ip_adapter.as_ref().map(|a| a.scales.clone()), Some(vec![0.0]));
    // the requested scale is kept for the denoise loop to restore at the start step
    assert_eq!(request.ip_adapter_scales, Some(vec![0.7]));
    Ok(())
}

#[test]
fn test_no_adapter_detaches_and_clears_request() -> Result<()> {
    let dir = tempfile::tempdir()?;
    mirror_sd15_adapter(dir.path())?;
    let fetcher = LocalFetcher::new(dir.path());
    let mut injector = IpAdapterInjector::new(&fetcher, Devices::cpu(), DType::F32);
    let mut pipe = Pipeline::new(ModelFamily::Sd15, "sd15");
    let mut request = ProcessingRequest::new("a cat", "");

    let args = AdapterArgs {
        names: vec!["Base".to_string()],
        images: vec![image()],
        ..AdapterArgs::default()
    };
    assert!(injector.apply(&mut pipe, &mut request, args));
    assert!(request.task_args.ip_adapter_image.is_some());

    for names in [Vec::new(), vec!["None".to_string()]] {
        let args = AdapterArgs {
            names,
            ..AdapterArgs::default()
        };
        assert!(!injector.apply(&mut pipe, &mut request, args));
        assert!(pipe.ip_adapter.is_none());
        assert!(request.task_args.ip_adapter_image.is_none());
        assert!(!request.extra_generation_params.contains_key("IP Adapter"));
    }
    Ok(())
}

#[test]
fn test_missing_weights_fail_without_attaching() -> Result<()> {
    let dir = tempfile::tempdir()?;
    mirror_sd15_adapter(dir.path())?;
    let fetcher = LocalFetcher::new(dir.path());
    let mut injector = IpAdapterInjector::new(&fetcher, Devices::cpu(), DType::F32);
    let mut pipe = Pipeline::new(ModelFamily::Sd15, "sd15");
    let mut request = ProcessingRequest::new("a cat", "");

    let args = AdapterArgs {
        names: vec!["Plus".to_string()],
        images: vec![image()],
        ..AdapterArgs::default()
    };
    assert!(!injector.apply(&mut pipe, &mut request, args));
    assert!(pipe.ip_adapter.is_none());
    Ok(())
}
