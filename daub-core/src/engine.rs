use image::DynamicImage;

use crate::{
    registry, select_profile, Backend, DeviceProfile, EngineConfig, HardwareProbe, ImageSource,
    InferenceSession, PipelineBuilder, PreimageGenerator, Result,
};

/// Owns the backend and at most one live session.
pub struct Engine<B: Backend> {
    backend: B,
    config: EngineConfig,
    profile: DeviceProfile,
    session: Option<InferenceSession<B::Pipeline>>,
}

impl<B: Backend> Engine<B> {
    /// Validates `config` and picks the device profile once for the process.
    pub fn new(backend: B, config: EngineConfig, probe: &dyn HardwareProbe) -> Result<Self> {
        config.validate()?;
        let profile = select_profile(probe, config.device_map)?;
        Ok(Self {
            backend,
            config,
            profile,
            session: None,
        })
    }

    pub fn list_models() -> Vec<&'static str> {
        registry::list_models()
    }

    pub fn profile(&self) -> DeviceProfile {
        self.profile
    }

    /// Switches to `display_name`. An unknown name leaves the current session
    /// untouched; otherwise the current session is released before the new one
    /// is built, so two pipelines are never resident together.
    pub fn select_model(
        &mut self,
        display_name: &str,
    ) -> Result<&mut InferenceSession<B::Pipeline>> {
        let descriptor = registry::resolve(display_name)?;

        if let Some(previous) = self.session.take() {
            previous.release();
        }

        let reference = self.config.reference_image.clone().map(ImageSource::Path);
        let session = PipelineBuilder::new(&self.backend, self.profile, &self.config).build(
            descriptor.backend_id,
            self.config.use_image_prompt,
            reference.as_ref(),
        )?;
        Ok(self.session.insert(session))
    }

    pub fn session(&mut self) -> Option<&mut InferenceSession<B::Pipeline>> {
        self.session.as_mut()
    }

    /// Releases the live session, if any.
    pub fn unload(&mut self) {
        if let Some(session) = self.session.take() {
            session.release();
        }
    }

    pub fn generate_preimage(&self, prompt: &str, display_name: &str) -> Result<DynamicImage> {
        let descriptor = registry::resolve(display_name)?;
        PreimageGenerator::new(&self.backend, &self.config).generate(prompt, descriptor.backend_id)
    }
}
