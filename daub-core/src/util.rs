use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::DynamicImage;

use crate::{ComputeDevice, DeviceMap, DeviceProfile};

pub fn select_best_device(profile: DeviceProfile, device_map: DeviceMap) -> Result<Device> {
    match (profile.device, device_map) {
        (ComputeDevice::Cpu, _) | (_, DeviceMap::ForceCpu) => Ok(Device::Cpu),
        (ComputeDevice::Accelerator, DeviceMap::Ordinal(ordinal)) if cuda_is_available() => {
            Ok(Device::new_cuda(ordinal)?)
        }
        (ComputeDevice::Accelerator, DeviceMap::Ordinal(ordinal)) if metal_is_available() => {
            Ok(Device::new_metal(ordinal)?)
        }
        (ComputeDevice::Accelerator, _) => {
            anyhow::bail!("accelerator requested but this build has neither cuda nor metal enabled")
        }
    }
}

/// Converts a `u8` tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let pixels = img.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(pixels, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?
        .to_device(device)?
        .to_dtype(dtype)?;
    Ok(tensor)
}
