use thiserror::Error;

/// Failures raised by the network mechanics and the compression techniques.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("layer `{0}` not found")]
    LayerNotFound(String),
    #[error("duplicate layer name `{0}`")]
    DuplicateLayer(String),
    #[error("shape mismatch at layer `{layer}`: {reason}")]
    ShapeMismatch { layer: String, reason: String },
    #[error("technique `{technique}` cannot transform layer `{layer}`: {reason}")]
    UnsupportedLayer {
        technique: String,
        layer: String,
        reason: String,
    },
    #[error("invalid parameter for `{technique}`: {reason}")]
    InvalidParameter { technique: String, reason: String },
    #[error("split `{0}` contains no examples")]
    EmptySplit(String),
    #[error("tensor data error: {0}")]
    Tensor(String),
    #[error("factorisation failed: {0}")]
    Linalg(String),
}

impl EngineError {
    pub fn shape(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::ShapeMismatch {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(
        technique: impl Into<String>,
        layer: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EngineError::UnsupportedLayer {
            technique: technique.into(),
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}
