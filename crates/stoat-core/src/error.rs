use crate::shape::Shape;

/// All errors that can occur within Stoat.
///
/// One enum for the whole workspace keeps propagation simple: tensor kernels,
/// the graph, and the trainer all speak the same error type. The trainer
/// pattern-matches on the two recoverable classes (`OutOfMemory`,
/// `Numerical`); everything else bubbles up with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between operands (e.g., adding [2,3] to [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Operands of one graph operation live on different devices.
    /// Always a caller bug, never retried.
    #[error("device mismatch: {lhs} vs {rhs}")]
    DeviceMismatch { lhs: String, rhs: String },

    /// DType mismatch between tensors in a binary operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Dimension index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: usize, rank: usize },

    /// Narrow/slice operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Tried to read a scalar from a non-scalar tensor.
    #[error("not a scalar: tensor has shape {shape}")]
    NotAScalar { shape: Shape },

    /// Element count mismatch when creating a tensor from a slice.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Matrix multiplication dimension mismatch.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    MatmulShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// A device allocation would exceed the device's memory budget.
    ///
    /// Recoverable: the trainer responds by doubling its batch-split factor
    /// and retrying the step with smaller segments.
    #[error("out of memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: String,
        requested: usize,
        available: usize,
    },

    /// A NaN or non-finite value surfaced where a finite number was required
    /// (typically the loss). Recoverable: the trainer skips the batch.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// Two modules registered under the same logical name.
    /// Fatal configuration error.
    #[error("duplicate module registration: '{0}'")]
    DuplicateModule(String),

    /// I/O failure (checkpoint files, corpus files, validator channel).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Whether the trainer may recover from this error locally.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. } | Error::Numerical(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
