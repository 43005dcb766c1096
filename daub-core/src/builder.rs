//! Assembles inference sessions: base weights, adapters, LCM scheduler, fused
//! consistency LoRA, device placement.

use crate::{
    adapter_config_for, Backend, DaubError, DeviceProfile, DiffusionPipeline, EngineConfig,
    ImageSource, InferenceSession, LoadStage, PipelineKind, Result,
};

pub struct PipelineBuilder<'a, B: Backend> {
    backend: &'a B,
    profile: DeviceProfile,
    canvas: (u32, u32),
}

impl<'a, B: Backend> PipelineBuilder<'a, B> {
    pub fn new(backend: &'a B, profile: DeviceProfile, config: &EngineConfig) -> Self {
        Self {
            backend,
            profile,
            canvas: config.canvas_size(),
        }
    }

    /// Either returns a ready session or fails without leaving anything
    /// resident.
    pub fn build(
        &self,
        backend_id: &str,
        use_image_prompt: bool,
        reference_image: Option<&ImageSource>,
    ) -> Result<InferenceSession<B::Pipeline>> {
        let reference = match (use_image_prompt, reference_image) {
            (true, None) => return Err(DaubError::MissingReferenceImage),
            (true, Some(source)) => Some(
                source
                    .decode()
                    .map_err(DaubError::load(backend_id, LoadStage::ReferenceImage))?,
            ),
            (false, _) => None,
        };

        if !self.profile.is_reproducible() {
            tracing::warn!(
                model = backend_id,
                "CPU sessions are not reproducible, identical requests may give different images"
            );
        }

        let adapters = adapter_config_for(backend_id);
        tracing::info!(
            model = backend_id,
            family = ?adapters.family,
            precision = %self.profile.precision,
            "building pipeline"
        );

        let mut pipeline = self
            .backend
            .from_pretrained(
                backend_id,
                adapters.family,
                PipelineKind::ImageToImage,
                self.profile.precision,
            )
            .map_err(DaubError::load(backend_id, LoadStage::BaseWeights))?;

        if reference.is_some() {
            let name = adapters.image_prompt_adapter_name.ok_or_else(|| {
                DaubError::load(backend_id, LoadStage::ImagePromptAdapter)(anyhow::anyhow!(
                    "no image-prompt adapter is published for this model family"
                ))
            })?;
            pipeline
                .load_ip_adapter(name)
                .map_err(DaubError::load(backend_id, LoadStage::ImagePromptAdapter))?;
            tracing::debug!(adapter = name, "image-prompt adapter loaded");
        }

        pipeline
            .use_lcm_scheduler()
            .map_err(DaubError::load(backend_id, LoadStage::Scheduler))?;

        pipeline
            .load_lora_weights(adapters.lora_id)
            .and_then(|()| pipeline.fuse_lora())
            .map_err(DaubError::load(backend_id, LoadStage::ConsistencyLora))?;
        tracing::debug!(lora = adapters.lora_id, "consistency LoRA fused");

        pipeline
            .to(self.profile)
            .map_err(DaubError::load(backend_id, LoadStage::DeviceTransfer))?;

        Ok(InferenceSession::new(
            backend_id,
            adapters,
            self.profile,
            self.canvas,
            pipeline,
            reference,
        ))
    }
}
