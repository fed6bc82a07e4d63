use thiserror::Error;

pub type Result<T, E = KpConvError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum KpConvError {
    #[error("unknown block name in the architecture definition: {0}")]
    UnknownBlock(String),

    #[error("unknown influence function type: {0}")]
    UnknownInfluence(String),

    #[error("unknown aggregation mode: {0}, should be 'closest' or 'sum'")]
    UnknownAggregation(String),

    #[error("unknown fixed kernel points mode: {0}")]
    UnknownFixedKernelPoints(String),

    #[error("unknown rotation augmentation: {0}")]
    UnknownRotation(String),

    #[error("unknown offset loss: {0}")]
    UnknownOffsetLoss(String),

    #[error("only accepted input feature dimensions are 1, 2, 3, 4, 5 and 7, got {0}")]
    UnsupportedFeatureDim(usize),

    #[error("equivariant block but features dimension {0} is not a factor of 3")]
    EquivariantWidth(usize),

    #[error("cannot generate {num_kpoints} kernel points in dimension {dimension}: {reason}")]
    InvalidKernel {
        num_kpoints: usize,
        dimension: usize,
        reason: &'static str,
    },

    #[error("neighbor index {value} at ({row}, {col}) is out of range, shadow index is {max}")]
    IndexOutOfRange {
        row: usize,
        col: usize,
        value: usize,
        max: usize,
    },

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch lengths sum to {actual} but the cloud holds {expected} points")]
    BatchLengthMismatch { expected: usize, actual: usize },

    #[error("expected {expected} layers, got {actual}")]
    LayerCount { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
