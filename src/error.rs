use thiserror::Error;

/// Errors raised while configuring or running a distillation step.
#[derive(Debug, Error)]
pub enum DistillError {
    /// Rejected before any step runs.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Option present in the configuration surface but not implemented.
    #[error("unsupported option: {0}")]
    Unsupported(String),

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("tch error: {0}")]
    Tch(#[from] tch::TchError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Failure reported by an external collaborator (text encoder, reward function).
    #[error(transparent)]
    External(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DistillError>;

impl DistillError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DistillError::InvalidConfig(msg.into())
    }
}
