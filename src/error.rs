use thiserror::Error;

/// Everything that can go wrong while building or differentiating a graph.
///
/// None of these are recoverable in the sense of being retried: each one is a
/// logic error in how the graph was built or used, and is handed straight back
/// to the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AutogradError {
    #[error("cannot backward through a non-differentiable tensor")]
    NonDifferentiableBackward,

    #[error("cannot zero the gradient of a non-differentiable tensor")]
    NonDifferentiableZeroGradient,

    /// A differentiable tensor was reached by a backward pass after its
    /// gradient was cleared by a value assignment.
    #[error("gradient of {identifier} was cleared by a value assignment; zero it before backward")]
    ClearedGradient { identifier: String },

    /// A gradient could not be broadcast onto the accumulator it was meant for.
    #[error("gradient of shape {actual:?} does not broadcast to shape {expected:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("shapes {left:?} and {right:?} cannot be broadcast together")]
    IncompatibleShapes { left: Vec<usize>, right: Vec<usize> },

    #[error("cannot reshape array of shape {from:?} into shape {to:?}")]
    InvalidReshape { from: Vec<usize>, to: Vec<usize> },

    #[error("expected rank {expected}, got rank {actual}")]
    RankMismatch { expected: String, actual: usize },

    #[error("axis {axis} is out of bounds for rank {ndim}")]
    AxisOutOfBounds { axis: usize, ndim: usize },

    #[error("invalid permutation {axes:?} for rank {ndim}")]
    InvalidPermutation { axes: Vec<usize>, ndim: usize },

    #[error("index {index} is out of bounds for axis {axis} of length {length}")]
    IndexOutOfBounds {
        index: isize,
        axis: usize,
        length: usize,
    },

    #[error("element {position} is not representable as f32")]
    ElementConversion { position: usize },

    #[error("{operation} takes {expected} operands, got {actual}")]
    ArityMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{operation} of an empty array has no identity")]
    EmptyReduction { operation: &'static str },

    #[error("backward exceeded the maximum depth of {maximum_depth}")]
    DepthLimitExceeded { maximum_depth: usize },
}

pub type Result<T> = std::result::Result<T, AutogradError>;
