//! Reverse-mode automatic differentiation over `ndarray` arrays.
//!
//! Build expressions out of [`Tensor`]s with the usual arithmetic operators,
//! then call [`Tensor::backward`] on the result to accumulate gradients into
//! every differentiable tensor it was computed from.

#![allow(mixed_script_confusables)]

pub mod autograd;
pub mod error;

pub use crate::autograd::{
    as_tensor, BackwardConfiguration, Dependency, IntoTensor, Tensor, TensorBuilder, Traversal,
};
pub use crate::error::{AutogradError, Result};
