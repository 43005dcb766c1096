use anyhow::Result;
use image::DynamicImage;

use crate::{DeviceProfile, Generator, ModelFamily, Precision};

/// Which conditioning a pipeline is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    ImageToImage,
    TextToImage,
}

impl PipelineKind {
    /// Image-to-image pipelines need an input image and text-to-image ones
    /// must not get one.
    pub fn check(self, call: &PipelineCall<'_>) -> Result<()> {
        match (self, call.image.is_some()) {
            (Self::ImageToImage, false) => anyhow::bail!("image-to-image call without an image"),
            (Self::TextToImage, true) => anyhow::bail!("text-to-image call with an input image"),
            _ => Ok(()),
        }
    }
}

/// Arguments of one generation call, already validated and decoded.
#[derive(Debug, Clone, Copy)]
pub struct PipelineCall<'a> {
    pub prompt: &'a str,
    pub negative_prompt: &'a str,
    /// Present for image-to-image calls, already resized to `width`x`height`.
    pub image: Option<&'a DynamicImage>,
    /// Reference image for image-prompt conditioning.
    pub ip_adapter_image: Option<&'a DynamicImage>,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
    pub strength: f64,
}

/// A diffusion library able to fetch and assemble pipelines.
pub trait Backend {
    type Pipeline: DiffusionPipeline;

    /// Fetches base weights for `backend_id`, preferring the weight variant for
    /// `precision` when one is published.
    fn from_pretrained(
        &self,
        backend_id: &str,
        family: ModelFamily,
        kind: PipelineKind,
        precision: Precision,
    ) -> Result<Self::Pipeline>;
}

/// An assembled-in-place pipeline. Calls follow the builder order: adapters,
/// scheduler, LoRA, then `to`, after which `run` may be called repeatedly.
pub trait DiffusionPipeline {
    fn load_ip_adapter(&mut self, adapter_name: &str) -> Result<()>;

    fn set_ip_adapter_scale(&mut self, scale: f64);

    /// Replaces the scheduler with the LCM one, inheriting the base config.
    fn use_lcm_scheduler(&mut self) -> Result<()>;

    fn load_lora_weights(&mut self, lora_id: &str) -> Result<()>;

    /// Merges the loaded LoRA into the base weights. Not reversible.
    fn fuse_lora(&mut self) -> Result<()>;

    fn to(&mut self, profile: DeviceProfile) -> Result<()>;

    fn run(&mut self, call: PipelineCall<'_>, generator: &mut Generator) -> Result<DynamicImage>;
}
