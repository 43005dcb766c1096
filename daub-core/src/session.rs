use std::time::Instant;

use image::{imageops::FilterType, DynamicImage};

use crate::{
    AdapterConfig, DaubError, DeviceProfile, DiffusionPipeline, GenerationRequest,
    GenerationResult, Generator, PipelineCall, Result,
};

/// A built image-to-image pipeline plus its generator.
///
/// Calls must be serialized by the owner; `infer` takes `&mut self` so a
/// single owner cannot race on the generator.
pub struct InferenceSession<P: DiffusionPipeline> {
    backend_id: String,
    adapters: AdapterConfig,
    profile: DeviceProfile,
    canvas: (u32, u32),
    pipeline: P,
    generator: Generator,
    reference_image: Option<DynamicImage>,
}

impl<P: DiffusionPipeline> InferenceSession<P> {
    pub(crate) fn new(
        backend_id: &str,
        adapters: AdapterConfig,
        profile: DeviceProfile,
        canvas: (u32, u32),
        pipeline: P,
        reference_image: Option<DynamicImage>,
    ) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            adapters,
            profile,
            canvas,
            pipeline,
            generator: Generator::new(),
            reference_image,
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn adapters(&self) -> AdapterConfig {
        self.adapters
    }

    /// Results repeat for identical requests only when
    /// [`DeviceProfile::is_reproducible`] holds.
    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Output size of every generated image.
    pub fn canvas_size(&self) -> (u32, u32) {
        self.canvas
    }

    pub fn uses_image_prompt(&self) -> bool {
        self.reference_image.is_some()
    }

    pub fn infer(&mut self, request: &GenerationRequest) -> Result<GenerationResult> {
        request.validate()?;

        let (width, height) = self.canvas;
        let image = request
            .input_image
            .decode()
            .map_err(DaubError::Inference)?
            .resize_exact(width, height, FilterType::CatmullRom);

        if self.reference_image.is_some() {
            self.pipeline.set_ip_adapter_scale(request.ip_scale);
        }
        self.generator.manual_seed(request.seed);

        let call = PipelineCall {
            prompt: &request.prompt,
            negative_prompt: &request.negative_prompt,
            image: Some(&image),
            ip_adapter_image: self.reference_image.as_ref(),
            width,
            height,
            num_inference_steps: request.steps,
            guidance_scale: request.guidance_scale,
            strength: request.strength,
        };

        let start = Instant::now();
        let image = self
            .pipeline
            .run(call, &mut self.generator)
            .map_err(DaubError::Inference)?;
        let elapsed = start.elapsed();
        tracing::info!(
            model = %self.backend_id,
            steps = request.steps,
            seed = request.seed,
            "inference took {:.2}s",
            elapsed.as_secs_f64()
        );

        Ok(GenerationResult { image, elapsed })
    }

    /// Tears the pipeline down now, freeing its device memory.
    pub fn release(self) {
        tracing::info!(model = %self.backend_id, "releasing pipeline");
        drop(self);
    }
}
