pub mod builder;
pub mod config;
pub mod device_map;
mod engine;
mod error;
pub mod generator;
pub mod loader;
mod preimage;
pub mod registry;
pub mod sd;
mod session;
mod util;

use std::path::PathBuf;
use std::time::Duration;

pub use builder::PipelineBuilder;
pub use config::EngineConfig;
pub use device_map::*;
pub use engine::Engine;
pub use error::{DaubError, LoadStage, Result};
pub use generator::Generator;
use image::DynamicImage;
pub use loader::*;
pub use preimage::{PreimageGenerator, DEFAULT_PREIMAGE_MODEL, PREIMAGE_STEPS};
pub use registry::{
    adapter_config_for, list_models, resolve, AdapterConfig, ModelDescriptor, ModelFamily,
};
pub use sd::CandleBackend;
pub use session::InferenceSession;
pub(crate) use util::*;

/// An image as handed over by the caller: a file, encoded bytes, or pixels.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Decoded(DynamicImage),
}

impl ImageSource {
    pub fn decode(&self) -> anyhow::Result<DynamicImage> {
        match self {
            Self::Path(path) => Ok(image::ImageReader::open(path)?
                .with_guessed_format()?
                .decode()?),
            Self::Bytes(bytes) => Ok(image::load_from_memory(bytes)?),
            Self::Decoded(image) => Ok(image.clone()),
        }
    }
}

impl From<DynamicImage> for ImageSource {
    fn from(image: DynamicImage) -> Self {
        Self::Decoded(image)
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

pub const DEFAULT_STEPS: usize = 4;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 1.0;
pub const DEFAULT_STRENGTH: f64 = 0.9;

/// One image-to-image generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub input_image: ImageSource,
    pub steps: usize,
    pub guidance_scale: f64,
    pub strength: f64,
    pub seed: u64,
    /// Influence of the reference image; ignored by sessions built without
    /// image-prompt conditioning.
    pub ip_scale: f64,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, input_image: impl Into<ImageSource>, seed: u64) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            input_image: input_image.into(),
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            strength: DEFAULT_STRENGTH,
            seed,
            ip_scale: 1.0,
        }
    }

    /// Checked before any decoding or backend work.
    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(DaubError::InvalidParameters("steps must be at least 1".to_string()));
        }
        if !(self.strength > 0.0 && self.strength <= 1.0) {
            return Err(DaubError::InvalidParameters(format!(
                "strength must be in (0, 1], got {}",
                self.strength
            )));
        }
        if !(self.guidance_scale >= 0.0 && self.guidance_scale.is_finite()) {
            return Err(DaubError::InvalidParameters(format!(
                "guidance_scale must be a finite value >= 0, got {}",
                self.guidance_scale
            )));
        }
        if !self.ip_scale.is_finite() {
            return Err(DaubError::InvalidParameters(format!(
                "ip_scale must be finite, got {}",
                self.ip_scale
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    /// Wall-clock time of the backend call.
    pub elapsed: Duration,
}
