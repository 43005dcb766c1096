//! Stable diffusion (1.5 and XL) pipelines on candle.

use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::sync::{Api, ApiBuilder};
use image::DynamicImage;
use tokenizers::Tokenizer;

pub mod ip_adapter;
pub mod lora;
pub mod scheduler;
pub mod weights;

use ip_adapter::{ImagePromptEncoder, IpAdapterFiles};
use scheduler::LcmSchedulerConfig;
use weights::ModelFiles;

use crate::{
    image_to_tensor, select_best_device, tensor_to_image, Backend, DeviceMap, DeviceProfile,
    DiffusionPipeline, EngineConfig, Generator, ModelFamily, PipelineCall, PipelineKind,
    Precision,
};

/// Backend fetching weights through the Hugging Face hub cache.
pub struct CandleBackend {
    api: Api,
    cache_dir: PathBuf,
    device_map: DeviceMap,
    use_flash_attn: bool,
}

impl CandleBackend {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(config.cache_dir.clone())
            .with_token(config.hf_token.clone())
            .build()
            .context("failed to create hf hub API")?;
        Ok(Self {
            api,
            cache_dir: config.cache_dir.clone(),
            device_map: config.device_map,
            use_flash_attn: config.use_flash_attn,
        })
    }
}

impl Backend for CandleBackend {
    type Pipeline = SdPipeline;

    fn from_pretrained(
        &self,
        backend_id: &str,
        family: ModelFamily,
        kind: PipelineKind,
        precision: Precision,
    ) -> Result<SdPipeline> {
        let files = ModelFiles::fetch(&self.api, backend_id, family, kind, precision)?;
        Ok(SdPipeline {
            api: self.api.clone(),
            backend_id: backend_id.to_string(),
            family,
            kind,
            precision,
            files,
            fused_dir: self.cache_dir.join("fused"),
            device_map: self.device_map,
            use_flash_attn: self.use_flash_attn,
            ip_adapter: None,
            ip_scale: 1.0,
            scheduler: None,
            lora: None,
            fused_unet: None,
            models: None,
        })
    }
}

/// Lets f32 matmuls run on tensor cores, like torch's `allow_tf32`. Returns
/// whether the device is affected.
fn enable_tf32(device: &Device) -> bool {
    if !device.is_cuda() {
        return false;
    }
    candle_core::cuda::set_gemm_reduced_precision_f32(true);
    true
}

struct TextEncoder {
    model: ClipTextTransformer,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_len: usize,
}

impl TextEncoder {
    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let ids = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&ids)?)
    }
}

/// Models materialized on a device by [`SdPipeline::to`].
struct Models {
    device: Device,
    dtype: DType,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    text_encoders: Vec<TextEncoder>,
    image_prompt: Option<ImagePromptEncoder>,
}

pub struct SdPipeline {
    api: Api,
    backend_id: String,
    family: ModelFamily,
    kind: PipelineKind,
    precision: Precision,
    files: ModelFiles,
    fused_dir: PathBuf,
    device_map: DeviceMap,
    use_flash_attn: bool,
    ip_adapter: Option<IpAdapterFiles>,
    ip_scale: f64,
    scheduler: Option<LcmSchedulerConfig>,
    lora: Option<(String, PathBuf)>,
    fused_unet: Option<PathBuf>,
    models: Option<Models>,
}

impl SdPipeline {
    fn sd_config(&self) -> StableDiffusionConfig {
        match self.family {
            ModelFamily::Sd15 => StableDiffusionConfig::v1_5(None, None, None),
            ModelFamily::Xl => StableDiffusionConfig::sdxl(None, None, None),
        }
    }

    fn vae_scale(&self) -> f64 {
        match self.family {
            ModelFamily::Sd15 => 0.18215,
            ModelFamily::Xl => 0.13025,
        }
    }

    /// Context for the UNet, unconditional rows first when guidance is on.
    fn text_embeddings(
        &self,
        models: &Models,
        call: &PipelineCall<'_>,
        use_guidance: bool,
    ) -> Result<Tensor> {
        let encode = |prompt: &str| -> Result<Tensor> {
            let per_encoder = models
                .text_encoders
                .iter()
                .map(|encoder| encoder.encode(prompt, &models.device))
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::cat(&per_encoder, D::Minus1)?)
        };
        let mut cond = encode(call.prompt)?;
        let mut uncond = if use_guidance {
            Some(encode(call.negative_prompt)?)
        } else {
            None
        };

        if let (Some(encoder), Some(reference)) = (&models.image_prompt, call.ip_adapter_image) {
            let (ip_cond, ip_uncond) = encoder.encode(reference)?;
            cond = Tensor::cat(&[&cond, &(ip_cond * self.ip_scale)?], 1)?;
            if let Some(text) = uncond.take() {
                uncond = Some(Tensor::cat(&[&text, &(ip_uncond * self.ip_scale)?], 1)?);
            }
        }

        match uncond {
            Some(uncond) => Ok(Tensor::cat(&[uncond, cond], 0)?),
            None => Ok(cond),
        }
    }
}

impl DiffusionPipeline for SdPipeline {
    fn load_ip_adapter(&mut self, adapter_name: &str) -> Result<()> {
        self.ip_adapter = Some(IpAdapterFiles::fetch(&self.api, adapter_name, self.family)?);
        Ok(())
    }

    fn set_ip_adapter_scale(&mut self, scale: f64) {
        self.ip_scale = scale;
    }

    fn use_lcm_scheduler(&mut self) -> Result<()> {
        self.scheduler = Some(LcmSchedulerConfig::from_base_config(&self.files.scheduler_config)?);
        Ok(())
    }

    fn load_lora_weights(&mut self, lora_id: &str) -> Result<()> {
        let path = weights::fetch_lora(&self.api, lora_id)?;
        self.lora = Some((lora_id.to_string(), path));
        Ok(())
    }

    fn fuse_lora(&mut self) -> Result<()> {
        let (lora_id, lora_path) = self.lora.as_ref().context("no LoRA weights loaded")?;
        let target = self
            .fused_dir
            .join(weights::fused_unet_name(&self.backend_id, lora_id, self.precision));

        if !target.exists() {
            std::fs::create_dir_all(&self.fused_dir)
                .with_context(|| format!("failed to create {}", self.fused_dir.display()))?;
            let mut unet = candle_core::safetensors::load(&self.files.unet, &Device::Cpu)
                .context("failed to read UNet weights")?;
            let lora_weights = candle_core::safetensors::load(lora_path, &Device::Cpu)
                .context("failed to read LoRA weights")?;
            let count = lora::fuse(&mut unet, lora_weights)?;

            // never leave a half-written file under the final name
            let partial = target.with_extension("partial");
            candle_core::safetensors::save(&unet, &partial)?;
            std::fs::rename(&partial, &target)?;
            tracing::info!(count, path = %target.display(), "fused LoRA into UNet");
        }

        self.fused_unet = Some(target);
        Ok(())
    }

    fn to(&mut self, profile: DeviceProfile) -> Result<()> {
        // free the previous placement before allocating the new one
        self.models = None;

        let device =
            select_best_device(profile, self.device_map).context("failed to set up device")?;
        if enable_tf32(&device) {
            tracing::debug!("fp32 matmuls may use tf32");
        }
        let dtype = profile.precision.dtype();
        let sd_config = self.sd_config();

        let unet_weights = self.fused_unet.as_ref().unwrap_or(&self.files.unet);
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, self.use_flash_attn, dtype)
            .context("failed to load UNet")?;
        let vae = sd_config
            .build_vae(&self.files.vae, &device, dtype)
            .context("failed to load VAE")?;

        let clip_configs = std::iter::once(&sd_config.clip).chain(sd_config.clip2.as_ref());
        let text_encoders = clip_configs
            .zip(&self.files.text_encoders)
            .map(|(clip_config, files)| -> Result<TextEncoder> {
                let model = stable_diffusion::build_clip_transformer(
                    clip_config,
                    &files.weights,
                    &device,
                    dtype,
                )
                .context("failed to load text encoder")?;
                let tokenizer = Tokenizer::from_file(&files.tokenizer)
                    .map_err(Error::msg)
                    .context("failed to load tokenizer")?;
                let pad = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
                let pad_id = *tokenizer
                    .get_vocab(true)
                    .get(pad)
                    .with_context(|| format!("tokenizer has no `{pad}` token"))?;
                Ok(TextEncoder {
                    model,
                    tokenizer,
                    pad_id,
                    max_len: clip_config.max_position_embeddings,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let image_prompt = self
            .ip_adapter
            .as_ref()
            .map(|files| ImagePromptEncoder::load(files, self.family, &device, dtype))
            .transpose()?;

        self.models = Some(Models {
            device,
            dtype,
            unet,
            vae,
            text_encoders,
            image_prompt,
        });
        Ok(())
    }

    fn run(&mut self, call: PipelineCall<'_>, generator: &mut Generator) -> Result<DynamicImage> {
        self.kind.check(&call)?;
        let models = self
            .models
            .as_ref()
            .context("pipeline has not been moved to a device")?;
        let scheduler = self
            .scheduler
            .as_ref()
            .context("no scheduler configured")?
            .build(call.num_inference_steps)?;
        let (device, dtype) = (&models.device, models.dtype);

        // VAE posterior sampling draws from the device rng
        if let (Some(seed), false) = (generator.seed(), device.is_cpu()) {
            device.set_seed(seed)?;
        }

        let use_guidance = call.guidance_scale > 1.0;
        let embeddings = self.text_embeddings(models, &call, use_guidance)?;
        let vae_scale = self.vae_scale();

        let (start, mut latents) = match call.image {
            Some(image) => {
                let start = scheduler.start_index(call.strength);
                let image = image_to_tensor(image, device, dtype)?;
                let latents = (models.vae.encode(&image)?.sample()? * vae_scale)?;
                let noise = generator.randn(latents.dims(), device, dtype)?;
                let latents = scheduler.add_noise(&latents, &noise, scheduler.timesteps()[start])?;
                (start, latents)
            }
            None => {
                let shape = (1, 4, call.height as usize / 8, call.width as usize / 8);
                (0, generator.randn(shape, device, dtype)?)
            }
        };

        for (index, &timestep) in scheduler.timesteps().iter().enumerate().skip(start) {
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let noise_pred = models.unet.forward(&input, timestep as f64, &embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * call.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, index, &latents, generator)?;
            tracing::debug!(index, timestep, "denoising step done");
        }

        let decoded = models.vae.decode(&(latents / vae_scale)?)?;
        let image = ((decoded / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .clamp(0f32, 1f32)?;
        let image = (image * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}
