//! Image-prompt adapter: turns a reference image into extra context tokens.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, VarBuilder};
use candle_transformers::models::clip::text_model::Activation;
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use hf_hub::api::sync::Api;
use hf_hub::Repo;
use image::{imageops::FilterType, DynamicImage};

use crate::registry::IP_ADAPTER_REPO;
use crate::ModelFamily;

const CLIP_IMAGE_SIZE: u32 = 224;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];
const NUM_TOKENS: usize = 4;

#[derive(Debug, Clone)]
pub struct IpAdapterFiles {
    pub adapter: PathBuf,
    pub image_encoder: PathBuf,
}

impl IpAdapterFiles {
    pub fn fetch(api: &Api, adapter_name: &str, family: ModelFamily) -> Result<Self> {
        let repo = api.repo(Repo::model(IP_ADAPTER_REPO.to_string()));
        let adapter = repo
            .get(adapter_name)
            .with_context(|| format!("failed to get {adapter_name}"))?;
        let image_encoder = repo
            .get(&format!("{}/image_encoder/model.safetensors", encoder_dir(family)))
            .context("failed to get the adapter image encoder")?;
        Ok(Self {
            adapter,
            image_encoder,
        })
    }
}

fn encoder_dir(family: ModelFamily) -> &'static str {
    match family {
        ModelFamily::Sd15 => "models",
        ModelFamily::Xl => "sdxl_models",
    }
}

/// (vision config, UNet cross-attention width)
fn dims(family: ModelFamily) -> (ClipVisionConfig, usize) {
    let (embed_dim, layers, intermediate, projection, cross) = match family {
        // OpenCLIP ViT-H/14
        ModelFamily::Sd15 => (1280, 32, 5120, 1024, 768),
        // OpenCLIP ViT-bigG/14
        ModelFamily::Xl => (1664, 48, 8192, 1280, 2048),
    };
    let config = ClipVisionConfig {
        embed_dim,
        activation: Activation::QuickGelu,
        intermediate_size: intermediate,
        num_hidden_layers: layers,
        num_attention_heads: 16,
        projection_dim: projection,
        num_channels: 3,
        image_size: CLIP_IMAGE_SIZE as usize,
        patch_size: 14,
    };
    (config, cross)
}

pub struct ImagePromptEncoder {
    vision: ClipVisionTransformer,
    visual_projection: Linear,
    proj: Linear,
    norm: LayerNorm,
    cross_attention_dim: usize,
    device: Device,
    dtype: DType,
}

impl ImagePromptEncoder {
    pub fn load(
        files: &IpAdapterFiles,
        family: ModelFamily,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (config, cross_attention_dim) = dims(family);
        let encoder_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.image_encoder], dtype, device)
                .context("failed to build image encoder var builder")?
        };
        let vision = ClipVisionTransformer::new(encoder_vb.pp("vision_model"), &config)
            .context("failed to load image encoder")?;
        let visual_projection = linear_no_bias(
            config.embed_dim,
            config.projection_dim,
            encoder_vb.pp("visual_projection"),
        )?;

        let adapter_vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&files.adapter], dtype, device)
                .context("failed to build adapter var builder")?
        };
        let proj_vb = adapter_vb.pp("image_proj");
        let proj = linear(
            config.projection_dim,
            NUM_TOKENS * cross_attention_dim,
            proj_vb.pp("proj"),
        )?;
        let norm = layer_norm(cross_attention_dim, 1e-5, proj_vb.pp("norm"))?;

        Ok(Self {
            vision,
            visual_projection,
            proj,
            norm,
            cross_attention_dim,
            device: device.clone(),
            dtype,
        })
    }

    fn project(&self, embeds: &Tensor) -> Result<Tensor> {
        let tokens = self
            .proj
            .forward(embeds)?
            .reshape(((), NUM_TOKENS, self.cross_attention_dim))?;
        Ok(self.norm.forward(&tokens)?)
    }

    /// Returns `(conditional, unconditional)` token sets of shape
    /// (1, 4, cross_attention_dim); the unconditional set projects a zero
    /// image embedding.
    pub fn encode(&self, image: &DynamicImage) -> Result<(Tensor, Tensor)> {
        let pixels = preprocess(image, &self.device)?.to_dtype(self.dtype)?;
        let embeds = self
            .visual_projection
            .forward(&self.vision.forward(&pixels)?)?;
        let cond = self.project(&embeds)?;
        let uncond = self.project(&embeds.zeros_like()?)?;
        Ok((cond, uncond))
    }
}

/// Resize-and-center-crop to 224x224, then CLIP normalization.
fn preprocess(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let size = CLIP_IMAGE_SIZE;
    let image = image.resize_to_fill(size, size, FilterType::CatmullRom).to_rgb8();
    let side = size as usize;
    let pixels = Tensor::from_vec(image.into_raw(), (side, side, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?;
    let mean = Tensor::new(&CLIP_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
    Ok(pixels.unsqueeze(0)?.to_device(device)?)
}
