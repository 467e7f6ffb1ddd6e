use std::path::PathBuf;

/// Errors raised while reading a checkpoint and matching it against the
/// network definition.
#[derive(Debug, thiserror::Error)]
pub enum WeightsError {
    #[error("unsupported checkpoint format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("missing tensor {0}")]
    MissingTensor(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unexpected tensors in checkpoint: {}", .0.join(", "))]
    UnexpectedTensors(Vec<String>),

    #[error("key {key} does not carry the `{prefix}.` prefix shared by the other keys")]
    InconsistentPrefix { prefix: String, key: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, WeightsError>;
