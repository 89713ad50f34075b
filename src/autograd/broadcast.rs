use ndarray::prelude::*;
use ndarray::Zip;

use crate::error::{AutogradError, Result};

/// The shape two arrays broadcast to, following the usual trailing-axes rule.
pub(super) fn broadcast_shape(left: &[usize], right: &[usize]) -> Result<Vec<usize>> {
    let ndim = left.len().max(right.len());
    let mut shape = Vec::with_capacity(ndim);
    for i in 0..ndim {
        let l = (i + left.len()).checked_sub(ndim).map_or(1, |j| left[j]);
        let r = (i + right.len()).checked_sub(ndim).map_or(1, |j| right[j]);
        let length = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(AutogradError::IncompatibleShapes {
                    left: left.to_vec(),
                    right: right.to_vec(),
                })
            }
        };
        shape.push(length);
    }
    Ok(shape)
}

pub(super) fn broadcast_pair<'a, A>(
    left: &'a ArrayD<A>,
    right: &'a ArrayD<A>,
) -> Result<(ArrayViewD<'a, A>, ArrayViewD<'a, A>)> {
    let shape = broadcast_shape(left.shape(), right.shape())?;
    let incompatible = || AutogradError::IncompatibleShapes {
        left: left.shape().to_vec(),
        right: right.shape().to_vec(),
    };
    let left_view = left.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    let right_view = right.broadcast(IxDyn(&shape)).ok_or_else(incompatible)?;
    Ok((left_view, right_view))
}

/// Elementwise `f(left, right)` over the broadcast of both arrays.
pub(super) fn zip_broadcast<A, B, F>(left: &ArrayD<A>, right: &ArrayD<A>, f: F) -> Result<ArrayD<B>>
where
    A: Copy,
    F: Fn(A, A) -> B,
{
    let (left_view, right_view) = broadcast_pair(left, right)?;
    Ok(Zip::from(left_view)
        .and(right_view)
        .map_collect(|&l, &r| f(l, r)))
}

/// Sums a gradient down to `shape`, undoing whatever broadcasting took an
/// operand of that shape up to the gradient's shape.
pub(super) fn unbroadcast(gradient: ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    let mut gradient = gradient;
    while gradient.ndim() > shape.len() {
        gradient = gradient.sum_axis(Axis(0));
    }
    for (axis, &length) in shape.iter().enumerate() {
        if axis < gradient.ndim() && length == 1 && gradient.shape()[axis] != 1 {
            gradient = gradient.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if gradient.shape() == shape {
        return Ok(gradient);
    }
    // a gradient smaller than its operand, e.g. a scalar seed
    match gradient.broadcast(IxDyn(shape)) {
        Some(view) => Ok(view.to_owned()),
        None => Err(AutogradError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: gradient.shape().to_vec(),
        }),
    }
}

/// Adds `gradient` into `accumulated`, broadcasting it to the accumulator's
/// shape. The accumulator is left untouched when the shapes don't agree.
pub(super) fn accumulate(accumulated: &mut ArrayD<f32>, gradient: &ArrayD<f32>) -> Result<()> {
    match gradient.broadcast(accumulated.raw_dim()) {
        Some(view) => {
            *accumulated += &view;
            Ok(())
        }
        None => Err(AutogradError::ShapeMismatch {
            expected: accumulated.shape().to_vec(),
            actual: gradient.shape().to_vec(),
        }),
    }
}

pub(super) fn reshaped(array: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    array
        .to_shape(IxDyn(shape))
        .map(|reshaped| reshaped.into_owned())
        .map_err(|_| AutogradError::InvalidReshape {
            from: array.shape().to_vec(),
            to: shape.to_vec(),
        })
}
