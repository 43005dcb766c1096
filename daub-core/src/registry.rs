//! Static table of selectable models and the adapters each one needs.

use crate::{DaubError, Result};

/// Backend id of the one XL-family base model.
pub const XL_BASE_ID: &str = "stabilityai/stable-diffusion-xl-base-1.0";

/// Repository holding both image-prompt adapter variants.
pub const IP_ADAPTER_REPO: &str = "h94/IP-Adapter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelDescriptor {
    pub display_name: &'static str,
    pub backend_id: &'static str,
}

const fn model(display_name: &'static str, backend_id: &'static str) -> ModelDescriptor {
    ModelDescriptor {
        display_name,
        backend_id,
    }
}

static MODELS: [ModelDescriptor; 6] = [
    model("Dreamshaper7", "Lykon/dreamshaper-7"),
    model("Dreamshaper8", "Lykon/dreamshaper-8"),
    model("AbsoluteReality", "Lykon/absolute-reality-1.81"),
    model("RevAnimated", "danbrown/RevAnimated-v1-2-2"),
    model("Protogen", "darkstorm2150/Protogen_x5.8_Official_Release"),
    model("SDXL", XL_BASE_ID),
];

/// Architecture family, which decides the adapter pair and the UNet layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Sd15,
    Xl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterConfig {
    pub family: ModelFamily,
    pub lora_id: &'static str,
    /// Weight path inside [`IP_ADAPTER_REPO`].
    pub image_prompt_adapter_name: Option<&'static str>,
}

const SD15_ADAPTERS: AdapterConfig = AdapterConfig {
    family: ModelFamily::Sd15,
    lora_id: "latent-consistency/lcm-lora-sdv1-5",
    image_prompt_adapter_name: Some("models/ip-adapter_sd15.safetensors"),
};

const XL_ADAPTERS: AdapterConfig = AdapterConfig {
    family: ModelFamily::Xl,
    lora_id: "latent-consistency/lcm-lora-sdxl",
    image_prompt_adapter_name: Some("sdxl_models/ip-adapter_sdxl.safetensors"),
};

/// Display names in selection order.
pub fn list_models() -> Vec<&'static str> {
    MODELS.iter().map(|m| m.display_name).collect()
}

pub fn models() -> &'static [ModelDescriptor] {
    &MODELS
}

pub fn resolve(display_name: &str) -> Result<ModelDescriptor> {
    MODELS
        .iter()
        .find(|m| m.display_name == display_name)
        .copied()
        .ok_or_else(|| DaubError::UnknownModel(display_name.to_string()))
}

/// Exact match on the XL base id; anything else, registered or not, gets the
/// SD 1.5 pair.
pub fn adapter_config_for(backend_id: &str) -> AdapterConfig {
    if backend_id == XL_BASE_ID {
        XL_ADAPTERS
    } else {
        SD15_ADAPTERS
    }
}
