use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{DaubError, DeviceMap, Result};

pub const CACHE_DIR_ENV: &str = "DAUB_CACHE_DIR";

/// Engine settings, passed explicitly to everything that loads weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hugging Face hub cache, also holds fused LoRA weights.
    pub cache_dir: PathBuf,
    pub device_map: DeviceMap,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub use_image_prompt: bool,
    pub reference_image: Option<PathBuf>,
    pub use_flash_attn: bool,
    pub hf_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("models"),
            device_map: DeviceMap::default(),
            canvas_width: 512,
            canvas_height: 512,
            use_image_prompt: false,
            reference_image: None,
            use_flash_attn: false,
            hf_token: None,
        }
    }
}

impl EngineConfig {
    /// Defaults, with the cache directory taken from `DAUB_CACHE_DIR` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV) {
            config.cache_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sides = [
            ("canvas_width", self.canvas_width),
            ("canvas_height", self.canvas_height),
        ];
        for (name, value) in sides {
            if value == 0 || value % 8 != 0 {
                return Err(DaubError::Config(format!(
                    "{name} must be a positive multiple of 8, got {value}"
                )));
            }
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(DaubError::Config("cache_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn canvas_size(&self) -> (u32, u32) {
        (self.canvas_width, self.canvas_height)
    }
}
