use std::fmt;

/// Pipeline builder step that failed while assembling a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    BaseWeights,
    ImagePromptAdapter,
    ReferenceImage,
    Scheduler,
    ConsistencyLora,
    DeviceTransfer,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::BaseWeights => "loading base weights",
            Self::ImagePromptAdapter => "loading the image-prompt adapter",
            Self::ReferenceImage => "decoding the reference image",
            Self::Scheduler => "swapping in the LCM scheduler",
            Self::ConsistencyLora => "fusing the consistency LoRA",
            Self::DeviceTransfer => "moving the pipeline to the device",
        };
        f.write_str(stage)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaubError {
    #[error("unknown model `{0}`")]
    UnknownModel(String),

    #[error("failed to load `{model}` while {stage}")]
    ModelLoad {
        model: String,
        stage: LoadStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("image-prompt conditioning requested without a reference image")]
    MissingReferenceImage,

    #[error("invalid generation parameters: {0}")]
    InvalidParameters(String),

    #[error("inference failed")]
    Inference(#[source] anyhow::Error),

    #[error("no usable accelerator: {0}")]
    HardwareUnsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DaubError {
    pub(crate) fn load(model: &str, stage: LoadStage) -> impl FnOnce(anyhow::Error) -> Self + '_ {
        move |source| Self::ModelLoad {
            model: model.to_string(),
            stage,
            source,
        }
    }
}

pub type Result<T, E = DaubError> = std::result::Result<T, E>;
