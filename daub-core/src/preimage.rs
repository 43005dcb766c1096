use image::DynamicImage;

use crate::{
    adapter_config_for, Backend, DaubError, DeviceProfile, DiffusionPipeline, EngineConfig,
    Generator, LoadStage, PipelineCall, PipelineKind, Result,
};

pub const DEFAULT_PREIMAGE_MODEL: &str = "Lykon/dreamshaper-7";
pub const PREIMAGE_STEPS: usize = 6;
const PREIMAGE_GUIDANCE_SCALE: f64 = 1.0;

/// One-off text-to-image generation.
///
/// Builds a fresh pipeline on every call and drops it before returning, so no
/// second model stays resident next to the live session.
pub struct PreimageGenerator<'a, B: Backend> {
    backend: &'a B,
    canvas: (u32, u32),
}

impl<'a, B: Backend> PreimageGenerator<'a, B> {
    pub fn new(backend: &'a B, config: &EngineConfig) -> Self {
        Self {
            backend,
            canvas: config.canvas_size(),
        }
    }

    pub fn generate_default(&self, prompt: &str) -> Result<DynamicImage> {
        self.generate(prompt, DEFAULT_PREIMAGE_MODEL)
    }

    pub fn generate(&self, prompt: &str, backend_id: &str) -> Result<DynamicImage> {
        let profile = DeviceProfile::ACCELERATED_FP16;
        let adapters = adapter_config_for(backend_id);
        tracing::info!(model = backend_id, "building text-to-image pipeline");

        let mut pipeline = self
            .backend
            .from_pretrained(
                backend_id,
                adapters.family,
                PipelineKind::TextToImage,
                profile.precision,
            )
            .map_err(DaubError::load(backend_id, LoadStage::BaseWeights))?;
        pipeline
            .load_lora_weights(adapters.lora_id)
            .and_then(|()| pipeline.fuse_lora())
            .map_err(DaubError::load(backend_id, LoadStage::ConsistencyLora))?;
        pipeline
            .use_lcm_scheduler()
            .map_err(DaubError::load(backend_id, LoadStage::Scheduler))?;
        pipeline
            .to(profile)
            .map_err(DaubError::load(backend_id, LoadStage::DeviceTransfer))?;

        let (width, height) = self.canvas;
        let mut generator = Generator::new();
        generator.manual_seed(rand::random());
        let image = pipeline
            .run(
                PipelineCall {
                    prompt,
                    negative_prompt: "",
                    image: None,
                    ip_adapter_image: None,
                    width,
                    height,
                    num_inference_steps: PREIMAGE_STEPS,
                    guidance_scale: PREIMAGE_GUIDANCE_SCALE,
                    strength: 1.0,
                },
                &mut generator,
            )
            .map_err(DaubError::Inference);

        drop(pipeline);
        tracing::info!(model = backend_id, "text-to-image pipeline released");
        image
    }
}
