use thiserror::Error;

/// Errors raised while building scores, accumulating, merging or stepping the optimizer.
#[derive(Debug, Error)]
pub enum CrfError {
    #[error("label {label} out of range [0, {num_labels})")]
    InvalidLabel { label: usize, num_labels: usize },
    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("non-finite value in {0}")]
    NonFiniteValue(&'static str),
    #[error("line search failed (info = {info}): {reason}")]
    LineSearchFailure { info: i32, reason: &'static str },
    #[error("non-positive inverse Hessian diagonal estimate: {0}")]
    DivergentHessianDiagonal(f64),
    #[error("no training sequences were accumulated")]
    EmptyTrainingSet,
    #[error("unknown label: {0}")]
    UnknownLabel(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("iteration {iteration}: {source}")]
    Iteration {
        iteration: usize,
        #[source]
        source: Box<CrfError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to write checkpoint: {0}")]
    CheckpointWrite(#[from] bson::ser::Error),
    #[error("failed to read checkpoint: {0}")]
    CheckpointRead(#[from] bson::de::Error),
}

impl CrfError {
    /// Tags an error with the driver iteration it surfaced in.
    pub fn at_iteration(self, iteration: usize) -> Self {
        match self {
            e @ CrfError::Iteration { .. } => e,
            e => CrfError::Iteration {
                iteration,
                source: Box::new(e),
            },
        }
    }

    /// The error with any iteration tag stripped.
    pub fn kind(&self) -> &CrfError {
        match self {
            CrfError::Iteration { source, .. } => source.kind(),
            e => e,
        }
    }
}

pub type Result<T> = std::result::Result<T, CrfError>;

pub(crate) fn ensure_finite(what: &'static str, values: &[f64]) -> Result<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(CrfError::NonFiniteValue(what))
    }
}
