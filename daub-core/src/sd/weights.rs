use std::path::PathBuf;

use anyhow::{Context, Result};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::Repo;

use crate::{ModelFamily, PipelineKind, Precision};

const SD15_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const XL_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const XL_TOKENIZER_2_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
/// SDXL's own VAE overflows in fp16.
const XL_FP16_VAE_REPO: &str = "madebyollin/sdxl-vae-fp16-fix";

const LORA_WEIGHT_NAME: &str = "pytorch_lora_weights.safetensors";

/// Local paths of every file a stable diffusion pipeline needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub text_encoders: Vec<TextEncoderFiles>,
    pub scheduler_config: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TextEncoderFiles {
    pub weights: PathBuf,
    pub tokenizer: PathBuf,
}

/// Fetches `<stem>.fp16.safetensors` when reduced precision is requested and
/// the variant is published, `<stem>.safetensors` otherwise.
fn get_variant(repo: &ApiRepo, stem: &str, precision: Precision) -> Result<PathBuf> {
    if precision == Precision::Reduced {
        match repo.get(&format!("{stem}.{precision}.safetensors")) {
            Ok(path) => return Ok(path),
            Err(err) => tracing::debug!(stem, %err, "no fp16 variant, using full weights"),
        }
    }
    repo.get(&format!("{stem}.safetensors"))
        .with_context(|| format!("failed to get {stem}.safetensors"))
}

fn tokenizer(api: &Api, repo: &str) -> Result<PathBuf> {
    api.model(repo.to_string())
        .get("tokenizer.json")
        .with_context(|| format!("failed to get tokenizer from {repo}"))
}

impl ModelFiles {
    pub fn fetch(
        api: &Api,
        backend_id: &str,
        family: ModelFamily,
        kind: PipelineKind,
        precision: Precision,
    ) -> Result<Self> {
        let repo = api.repo(Repo::model(backend_id.to_string()));
        tracing::debug!(model = backend_id, ?kind, "fetching weights");

        let unet = get_variant(&repo, "unet/diffusion_pytorch_model", precision)?;
        let vae = match (family, precision) {
            (ModelFamily::Xl, Precision::Reduced) => api
                .model(XL_FP16_VAE_REPO.to_string())
                .get("diffusion_pytorch_model.safetensors")
                .context("failed to get the fp16-safe SDXL VAE")?,
            _ => get_variant(&repo, "vae/diffusion_pytorch_model", precision)?,
        };
        let scheduler_config = repo
            .get("scheduler/scheduler_config.json")
            .context("failed to get scheduler config")?;

        let mut text_encoders = vec![TextEncoderFiles {
            weights: get_variant(&repo, "text_encoder/model", precision)?,
            tokenizer: tokenizer(
                api,
                match family {
                    ModelFamily::Sd15 => SD15_TOKENIZER_REPO,
                    ModelFamily::Xl => XL_TOKENIZER_REPO,
                },
            )?,
        }];
        if family == ModelFamily::Xl {
            text_encoders.push(TextEncoderFiles {
                weights: get_variant(&repo, "text_encoder_2/model", precision)?,
                tokenizer: tokenizer(api, XL_TOKENIZER_2_REPO)?,
            });
        }

        Ok(Self {
            unet,
            vae,
            text_encoders,
            scheduler_config,
        })
    }
}

pub fn fetch_lora(api: &Api, lora_id: &str) -> Result<PathBuf> {
    api.model(lora_id.to_string())
        .get(LORA_WEIGHT_NAME)
        .with_context(|| format!("failed to get {LORA_WEIGHT_NAME} from {lora_id}"))
}

/// File-name-safe cache key for a fused UNet.
pub fn fused_unet_name(backend_id: &str, lora_id: &str, precision: Precision) -> String {
    let sanitize = |id: &str| id.replace(['/', '\\', ':'], "--");
    format!("{}+{}.{precision}.safetensors", sanitize(backend_id), sanitize(lora_id))
}
