//! The differentiable operators.
//!
//! Each operator is a small strategy struct implementing [`Operation`]: how to
//! compute its value from the operand arrays, and how to turn the gradient of
//! that value into the gradient owed to each operand. [`apply`] does the graph
//! bookkeeping common to all of them.

use std::rc::Rc;

use log::trace;
use ndarray::prelude::*;
use ndarray::{SliceInfoElem, Zip};

use super::broadcast::{broadcast_pair, reshaped, unbroadcast, zip_broadcast};
use super::{Dependency, Tensor, TensorBuilder};
use crate::error::{AutogradError, Result};

pub trait Operation {
    fn name(&self) -> &'static str;
    /// How many operands `forward` and `backward` expect.
    fn arity(&self) -> usize;
    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>>;
    /// The gradient owed to `inputs[arg_index]`, given the gradient of the
    /// output. `out_gradient` is always shaped like the output.
    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>>;
}

/// Runs `operation` forward on the operands' current values and wires the
/// result into the graph.
///
/// The result is differentiable iff some operand is, and gets one dependency
/// per differentiable operand (twice for an operand passed twice). The
/// gradient functions see the operand values as they were here, so later
/// in-place changes to an operand don't leak into them.
pub fn apply<O>(operation: O, inputs: &[Tensor]) -> Result<Tensor>
where
    O: Operation + 'static,
{
    if inputs.len() != operation.arity() {
        return Err(AutogradError::ArityMismatch {
            operation: operation.name(),
            expected: operation.arity(),
            actual: inputs.len(),
        });
    }
    let arrays = inputs
        .iter()
        .map(|input| input.borrow_array().clone())
        .collect::<Vec<_>>();
    let array = operation.forward(&arrays)?;
    if !inputs.iter().any(Tensor::requires_gradient) {
        return Ok(TensorBuilder::new(array).build());
    }

    let output_shape = array.shape().to_vec();
    let operation = Rc::new(operation);
    let arrays = Rc::new(arrays);
    let dependencies = inputs
        .iter()
        .enumerate()
        .filter(|(_, input)| input.requires_gradient())
        .map(|(arg_index, input)| {
            let operation = Rc::clone(&operation);
            let arrays = Rc::clone(&arrays);
            let output_shape = output_shape.clone();
            Dependency::new(input.clone(), move |out_gradient| {
                let out_gradient = conform(out_gradient, &output_shape)?;
                operation.backward(&out_gradient, &arrays, arg_index)
            })
        })
        .collect::<Vec<_>>();
    trace!(
        "{} over {} operands ({} differentiable)",
        operation.name(),
        inputs.len(),
        dependencies.len()
    );
    Ok(TensorBuilder::new(array)
        .requires_gradient(true)
        .dependencies(dependencies)
        .build())
}

// An upstream gradient need only broadcast to the output (a scalar seed, say).
fn conform(out_gradient: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    if out_gradient.shape() == shape {
        return Ok(out_gradient.clone());
    }
    out_gradient
        .broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| AutogradError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: out_gradient.shape().to_vec(),
        })
}

fn check_axis(axis: usize, ndim: usize) -> Result<Axis> {
    if axis < ndim {
        Ok(Axis(axis))
    } else {
        Err(AutogradError::AxisOutOfBounds { axis, ndim })
    }
}

fn other_index(arg_index: usize) -> usize {
    match arg_index {
        0 => 1,
        _ => 0,
    }
}

pub struct Addition {}

impl Operation for Addition {
    fn name(&self) -> &'static str {
        "addition"
    }

    fn arity(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        zip_broadcast(&inputs[0], &inputs[1], |a, b| a + b)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        // Addition just passes the gradient through to both branches.
        unbroadcast(out_gradient.clone(), inputs[arg_index].shape())
    }
}

pub struct Subtraction {}

impl Operation for Subtraction {
    fn name(&self) -> &'static str {
        "subtraction"
    }

    fn arity(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        zip_broadcast(&inputs[0], &inputs[1], |a, b| a - b)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let gradient = match arg_index {
            0 => out_gradient.clone(),
            _ => -out_gradient,
        };
        unbroadcast(gradient, inputs[arg_index].shape())
    }
}

pub struct Multiplication {}

impl Operation for Multiplication {
    fn name(&self) -> &'static str {
        "multiplication"
    }

    fn arity(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        zip_broadcast(&inputs[0], &inputs[1], |a, b| a * b)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        // d/dx(xy) = y
        let other = &inputs[other_index(arg_index)];
        let gradient = zip_broadcast(out_gradient, other, |g, y| g * y)?;
        unbroadcast(gradient, inputs[arg_index].shape())
    }
}

pub struct Division {}

impl Operation for Division {
    fn name(&self) -> &'static str {
        "division"
    }

    fn arity(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        zip_broadcast(&inputs[0], &inputs[1], |a, b| a / b)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let (numerator, denominator) = (&inputs[0], &inputs[1]);
        let gradient = match arg_index {
            // d/dx(x/y) = 1/y
            0 => zip_broadcast(out_gradient, denominator, |g, y| g / y)?,
            // d/dy(x/y) = −x/y²
            _ => {
                let scaled = zip_broadcast(out_gradient, numerator, |g, x| g * x)?;
                zip_broadcast(&scaled, denominator, |gx, y| -gx / (y * y))?
            }
        };
        unbroadcast(gradient, inputs[arg_index].shape())
    }
}

pub struct Power {}

impl Operation for Power {
    fn name(&self) -> &'static str {
        "power"
    }

    fn arity(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        zip_broadcast(&inputs[0], &inputs[1], f32::powf)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let (base, exponent) = broadcast_pair(&inputs[0], &inputs[1])?;
        let local = match arg_index {
            // d/dx xⁿ = n xⁿ⁻¹
            0 => Zip::from(base)
                .and(exponent)
                .map_collect(|&x, &n| n * x.powf(n - 1.)),
            // d/dn xⁿ = xⁿ ln x
            _ => Zip::from(base)
                .and(exponent)
                .map_collect(|&x, &n| x.powf(n) * x.ln()),
        };
        let gradient = zip_broadcast(out_gradient, &local, |g, l| g * l)?;
        unbroadcast(gradient, inputs[arg_index].shape())
    }
}

pub struct Negation {}

impl Operation for Negation {
    fn name(&self) -> &'static str {
        "negation"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        Ok(-&inputs[0])
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        _inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        Ok(-out_gradient)
    }
}

pub struct NaturalLogarithm {}

impl Operation for NaturalLogarithm {
    fn name(&self) -> &'static str {
        "natural logarithm"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        Ok(inputs[0].mapv(f32::ln))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        zip_broadcast(out_gradient, &inputs[0], |g, x| g / x)
    }
}

pub struct Exponentiation {}

impl Operation for Exponentiation {
    fn name(&self) -> &'static str {
        "exponentiation"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        Ok(inputs[0].mapv(f32::exp))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        zip_broadcast(out_gradient, &inputs[0], |g, x| g * x.exp())
    }
}

pub struct MatrixMultiplication {}

#[derive(Clone, Copy)]
enum Side {
    Left,
    Right,
}

// A vector on the left acts as a row, on the right as a column.
fn as_matrix(array: &ArrayD<f32>, side: Side) -> Result<ArrayView2<'_, f32>> {
    let view = match (array.ndim(), side) {
        (1, Side::Left) => array.view().insert_axis(Axis(0)),
        (1, Side::Right) => array.view().insert_axis(Axis(1)),
        (2, _) => array.view(),
        (ndim, _) => {
            return Err(AutogradError::RankMismatch {
                expected: "1 or 2".to_owned(),
                actual: ndim,
            })
        }
    };
    view.into_dimensionality::<Ix2>()
        .map_err(|_| AutogradError::RankMismatch {
            expected: "1 or 2".to_owned(),
            actual: array.ndim(),
        })
}

fn matrix_operands<'a>(
    inputs: &'a [ArrayD<f32>],
) -> Result<(ArrayView2<'a, f32>, ArrayView2<'a, f32>)> {
    let a = as_matrix(&inputs[0], Side::Left)?;
    let b = as_matrix(&inputs[1], Side::Right)?;
    if a.ncols() != b.nrows() {
        return Err(AutogradError::IncompatibleShapes {
            left: inputs[0].shape().to_vec(),
            right: inputs[1].shape().to_vec(),
        });
    }
    Ok((a, b))
}

impl Operation for MatrixMultiplication {
    fn name(&self) -> &'static str {
        "matrix multiplication"
    }

    fn arity(&self) -> usize {
        2
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let (a, b) = matrix_operands(inputs)?;
        // vector operands lose the axis they were given
        let mut shape = inputs[0].shape()[..inputs[0].ndim() - 1].to_vec();
        if inputs[1].ndim() == 2 {
            shape.push(inputs[1].shape()[1]);
        }
        reshaped(&a.dot(&b).into_dyn(), &shape)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let (a, b) = matrix_operands(inputs)?;
        let out_gradient = reshaped(out_gradient, &[a.nrows(), b.ncols()])?
            .into_dimensionality::<Ix2>()
            .map_err(|_| AutogradError::RankMismatch {
                expected: "2".to_owned(),
                actual: out_gradient.ndim(),
            })?;
        // matrix multiplication is not commutative; separate cases for
        // out_gradient @ B^T and A^T @ out_gradient
        let gradient = match arg_index {
            0 => out_gradient.dot(&b.t()),
            _ => a.t().dot(&out_gradient),
        };
        reshaped(&gradient.into_dyn(), inputs[arg_index].shape())
    }
}

// Puts a reduced axis back so the gradient lines up with the input again.
fn expand_reduced(
    reduced: &ArrayD<f32>,
    axis: Option<usize>,
    shape: &[usize],
) -> Result<ArrayD<f32>> {
    let restored = match axis {
        Some(axis) => reduced.view().insert_axis(Axis(axis)),
        None => reduced.view(),
    };
    restored
        .broadcast(IxDyn(shape))
        .map(|view| view.to_owned())
        .ok_or_else(|| AutogradError::ShapeMismatch {
            expected: shape.to_vec(),
            actual: reduced.shape().to_vec(),
        })
}

pub struct Summation {
    axis: Option<usize>,
}

impl Summation {
    pub fn new(axis: Option<usize>) -> Self {
        Self { axis }
    }
}

impl Operation for Summation {
    fn name(&self) -> &'static str {
        "summation"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = &inputs[0];
        match self.axis {
            Some(axis) => Ok(x.sum_axis(check_axis(axis, x.ndim())?)),
            None => Ok(arr0(x.sum()).into_dyn()),
        }
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        // every summand moves the sum one-for-one
        expand_reduced(out_gradient, self.axis, inputs[0].shape())
    }
}

// A NaN anywhere in a lane makes that lane's extreme NaN.
fn extremum(
    x: &ArrayD<f32>,
    axis: Option<usize>,
    operation: &'static str,
    pick: fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>> {
    let propagate = move |acc: f32, element: f32| {
        if acc.is_nan() || element.is_nan() {
            f32::NAN
        } else {
            pick(acc, element)
        }
    };
    match axis {
        Some(axis) => {
            let axis = check_axis(axis, x.ndim())?;
            if x.len_of(axis) == 0 {
                return Err(AutogradError::EmptyReduction { operation });
            }
            // lanes are non-empty here
            Ok(x.map_axis(axis, |lane| {
                lane.iter().copied().reduce(propagate).unwrap_or(f32::NAN)
            }))
        }
        None => x
            .iter()
            .copied()
            .reduce(propagate)
            .map(|extreme| arr0(extreme).into_dyn())
            .ok_or(AutogradError::EmptyReduction { operation }),
    }
}

// Every position holding the extreme value gets the full gradient, ties
// included. A NaN extreme sends it to the NaN positions.
fn extremum_backward(
    out_gradient: &ArrayD<f32>,
    x: &ArrayD<f32>,
    extreme: &ArrayD<f32>,
    axis: Option<usize>,
) -> Result<ArrayD<f32>> {
    let extreme = expand_reduced(extreme, axis, x.shape())?;
    let out_gradient = expand_reduced(out_gradient, axis, x.shape())?;
    let mut gradient = Array::zeros(x.raw_dim());
    Zip::from(&mut gradient)
        .and(x)
        .and(&extreme)
        .and(&out_gradient)
        .for_each(|g, &x, &e, &o| {
            if x == e || (x.is_nan() && e.is_nan()) {
                *g = o
            }
        });
    Ok(gradient)
}

pub struct Maximum {
    axis: Option<usize>,
}

impl Maximum {
    pub fn new(axis: Option<usize>) -> Self {
        Self { axis }
    }
}

impl Operation for Maximum {
    fn name(&self) -> &'static str {
        "maximum"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        extremum(&inputs[0], self.axis, self.name(), f32::max)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let extreme = self.forward(inputs)?;
        extremum_backward(out_gradient, &inputs[0], &extreme, self.axis)
    }
}

pub struct Minimum {
    axis: Option<usize>,
}

impl Minimum {
    pub fn new(axis: Option<usize>) -> Self {
        Self { axis }
    }
}

impl Operation for Minimum {
    fn name(&self) -> &'static str {
        "minimum"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        extremum(&inputs[0], self.axis, self.name(), f32::min)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let extreme = self.forward(inputs)?;
        extremum_backward(out_gradient, &inputs[0], &extreme, self.axis)
    }
}

pub struct Transpose {
    axes: Option<Vec<usize>>,
}

impl Transpose {
    /// `None` reverses the axes.
    pub fn new(axes: Option<Vec<usize>>) -> Self {
        Self { axes }
    }

    fn permutation(&self, ndim: usize) -> Result<Vec<usize>> {
        let Some(axes) = &self.axes else {
            return Ok((0..ndim).rev().collect());
        };
        let mut seen = vec![false; ndim];
        let valid = axes.len() == ndim
            && axes
                .iter()
                .all(|&axis| axis < ndim && !std::mem::replace(&mut seen[axis], true));
        if valid {
            Ok(axes.clone())
        } else {
            Err(AutogradError::InvalidPermutation {
                axes: axes.clone(),
                ndim,
            })
        }
    }
}

impl Operation for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let axes = self.permutation(inputs[0].ndim())?;
        Ok(inputs[0]
            .view()
            .permuted_axes(axes)
            .as_standard_layout()
            .into_owned())
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let axes = self.permutation(inputs[0].ndim())?;
        let mut inverse = vec![0; axes.len()];
        for (i, &axis) in axes.iter().enumerate() {
            inverse[axis] = i;
        }
        Ok(out_gradient
            .view()
            .permuted_axes(inverse)
            .as_standard_layout()
            .into_owned())
    }
}

pub struct Reshape {
    new_shape: Vec<usize>,
}

impl Reshape {
    pub fn new(new_shape: Vec<usize>) -> Self {
        Self { new_shape }
    }
}

impl Operation for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        reshaped(&inputs[0], &self.new_shape)
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        reshaped(out_gradient, inputs[0].shape())
    }
}

pub struct Clip {
    minimum: Option<f32>,
    maximum: Option<f32>,
}

impl Clip {
    pub fn new(minimum: Option<f32>, maximum: Option<f32>) -> Self {
        Self { minimum, maximum }
    }

    fn clip(&self, x: f32) -> f32 {
        let x = self.minimum.map_or(x, |minimum| x.max(minimum));
        self.maximum.map_or(x, |maximum| x.min(maximum))
    }

    fn within(&self, x: f32) -> bool {
        self.minimum.map_or(true, |minimum| x >= minimum)
            && self.maximum.map_or(true, |maximum| x <= maximum)
    }
}

impl Operation for Clip {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        Ok(inputs[0].mapv(|x| self.clip(x)))
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        // flat where clipped
        zip_broadcast(out_gradient, &inputs[0], |g, x| {
            if self.within(x) {
                g
            } else {
                0.
            }
        })
    }
}

pub struct Slice {
    elements: Vec<SliceInfoElem>,
}

impl Slice {
    pub fn new(elements: Vec<SliceInfoElem>) -> Self {
        Self { elements }
    }

    // Validates against `shape` (so the slicing below can't panic) and pads
    // with full slices for the axes left unmentioned.
    fn elements_for(&self, shape: &[usize]) -> Result<Vec<SliceInfoElem>> {
        let mut elements = Vec::with_capacity(self.elements.len());
        let mut axis = 0;
        for &element in &self.elements {
            match element {
                SliceInfoElem::NewAxis => {}
                SliceInfoElem::Index(index) => {
                    let length = axis_length(shape, axis)?;
                    let resolved = resolve(index, length);
                    if resolved < 0 || resolved >= length as isize {
                        return Err(AutogradError::IndexOutOfBounds {
                            index,
                            axis,
                            length,
                        });
                    }
                    axis += 1;
                }
                SliceInfoElem::Slice { start, end, step } => {
                    let length = axis_length(shape, axis)?;
                    let bounds = std::iter::once(start).chain(end);
                    for bound in bounds {
                        let resolved = resolve(bound, length);
                        if resolved < 0 || resolved > length as isize {
                            return Err(AutogradError::IndexOutOfBounds {
                                index: bound,
                                axis,
                                length,
                            });
                        }
                    }
                    if step == 0 {
                        return Err(AutogradError::IndexOutOfBounds {
                            index: step,
                            axis,
                            length,
                        });
                    }
                    axis += 1;
                }
            }
            elements.push(element);
        }
        elements.extend((axis..shape.len()).map(|_| SliceInfoElem::from(..)));
        Ok(elements)
    }
}

fn axis_length(shape: &[usize], axis: usize) -> Result<usize> {
    shape
        .get(axis)
        .copied()
        .ok_or(AutogradError::AxisOutOfBounds {
            axis,
            ndim: shape.len(),
        })
}

fn resolve(index: isize, length: usize) -> isize {
    if index < 0 {
        index + length as isize
    } else {
        index
    }
}

impl Operation for Slice {
    fn name(&self) -> &'static str {
        "slice"
    }

    fn arity(&self) -> usize {
        1
    }

    fn forward(&self, inputs: &[ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let elements = self.elements_for(inputs[0].shape())?;
        Ok(inputs[0].slice(elements.as_slice()).to_owned())
    }

    fn backward(
        &self,
        out_gradient: &ArrayD<f32>,
        inputs: &[ArrayD<f32>],
        _arg_index: usize,
    ) -> Result<ArrayD<f32>> {
        let elements = self.elements_for(inputs[0].shape())?;
        let mut gradient = Array::zeros(inputs[0].raw_dim());
        let mut selected = gradient.slice_mut(elements.as_slice());
        if selected.shape() != out_gradient.shape() {
            return Err(AutogradError::ShapeMismatch {
                expected: selected.shape().to_vec(),
                actual: out_gradient.shape().to_vec(),
            });
        }
        selected += out_gradient;
        Ok(gradient)
    }
}

pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    apply(Addition {}, &[a.clone(), b.clone()])
}

pub fn subtract(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    apply(Subtraction {}, &[a.clone(), b.clone()])
}

pub fn multiply(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    apply(Multiplication {}, &[a.clone(), b.clone()])
}

pub fn divide(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    apply(Division {}, &[a.clone(), b.clone()])
}

pub fn power(base: &Tensor, exponent: &Tensor) -> Result<Tensor> {
    apply(Power {}, &[base.clone(), exponent.clone()])
}

pub fn negate(x: &Tensor) -> Result<Tensor> {
    apply(Negation {}, &[x.clone()])
}

pub fn matrix_multiply(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    apply(MatrixMultiplication {}, &[a.clone(), b.clone()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use approx::assert_abs_diff_eq;

    fn variable(array: ArrayD<f32>) -> Tensor {
        TensorBuilder::new(array).requires_gradient(true).build()
    }

    fn constant(array: ArrayD<f32>) -> Tensor {
        TensorBuilder::new(array).build()
    }

    /// Central differences of `f` (reduced to a sum) around `x`, in f64 to
    /// keep the estimate honest.
    fn numerical_gradient<F>(f: F, x: &ArrayD<f32>) -> ArrayD<f32>
    where
        F: Fn(&ArrayD<f32>) -> ArrayD<f32>,
    {
        let ε = 1e-2_f32;
        let mut gradient = Array::zeros(x.raw_dim());
        for (index, g) in gradient.indexed_iter_mut() {
            let mut plus = x.clone();
            plus[index.clone()] += ε;
            let mut minus = x.clone();
            minus[index.clone()] -= ε;
            let f_plus = f(&plus).iter().map(|&v| v as f64).sum::<f64>();
            let f_minus = f(&minus).iter().map(|&v| v as f64).sum::<f64>();
            *g = ((f_plus - f_minus) / (2. * ε as f64)) as f32;
        }
        gradient
    }

    #[test]
    fn test_addition_forward() {
        let a = constant(array![1.].into_dyn());
        let b = constant(array![2.].into_dyn());
        let c = add(&a, &b).expect("same shape");
        assert_eq!(*c.borrow_array(), array![3.].into_dyn());
    }

    #[test]
    fn test_multiplication_forward() {
        let a = constant(array![2.].into_dyn());
        let b = constant(array![3.].into_dyn());
        let c = multiply(&a, &b).expect("same shape");
        assert_eq!(*c.borrow_array(), array![6.].into_dyn());
    }

    #[test]
    fn test_addition_backward() {
        let inputs = [array![1.].into_dyn(), array![2.].into_dyn()];
        let out_gradient = array![1.].into_dyn();
        assert_eq!(
            Addition {}.backward(&out_gradient, &inputs, 0),
            Ok(out_gradient.clone())
        );
        assert_eq!(
            Addition {}.backward(&out_gradient, &inputs, 1),
            Ok(out_gradient.clone())
        );
    }

    #[test]
    fn test_multiplication_backward() {
        let inputs = [array![2.].into_dyn(), array![3.].into_dyn()];
        let out_gradient = array![1.].into_dyn();
        assert_eq!(
            Multiplication {}.backward(&out_gradient, &inputs, 0),
            Ok(array![3.].into_dyn())
        );
        assert_eq!(
            Multiplication {}.backward(&out_gradient, &inputs, 1),
            Ok(array![2.].into_dyn())
        );
    }

    #[test]
    fn test_constant_operands_build_no_graph() {
        let a = constant(array![1., 2.].into_dyn());
        let b = constant(array![3., 4.].into_dyn());
        let c = add(&a, &b).expect("same shape");
        assert!(!c.requires_gradient());
        assert!(c.dependencies().is_empty());
        assert!(c.gradient().is_none());
    }

    #[test]
    fn test_one_dependency_per_differentiable_operand() {
        let x = variable(array![1., 2.].into_dyn());
        let c = constant(array![3., 4.].into_dyn());
        let y = multiply(&x, &c).expect("same shape");
        assert!(y.requires_gradient());
        assert_eq!(y.dependencies().len(), 1);
        assert_eq!(y.dependencies()[0].tensor(), &x);

        let z = add(&x, &x).expect("same shape");
        assert_eq!(z.dependencies().len(), 2);
    }

    #[test]
    fn test_backprop() {
        let a = variable(array![2.0].into_dyn());
        let b = variable(array![3.0].into_dyn());
        let c = variable(array![4.0].into_dyn());

        let mul = multiply(&a, &b).expect("same shape");
        let result = add(&mul, &c).expect("same shape");
        result.backward(None).expect("differentiable");

        assert_eq!(a.gradient(), Some(array![3.0].into_dyn()));
        assert_eq!(b.gradient(), Some(array![2.0].into_dyn()));
        assert_eq!(c.gradient(), Some(array![1.0].into_dyn()));
    }

    #[test]
    fn test_backprop_with_reuse() {
        let a = variable(array![2.0].into_dyn());
        let b = variable(array![3.0].into_dyn());

        // Compute (a * b) + (a + b)
        let mul = multiply(&a, &b).expect("same shape");
        let sum = add(&a, &b).expect("same shape");
        let result = add(&mul, &sum).expect("same shape");
        result.backward(None).expect("differentiable");

        // Gradient for 'a':
        // From (a * b): derivative is b = 3
        // From (a + b): derivative is 1
        // Total: 3 + 1 = 4
        assert_eq!(a.gradient(), Some(array![4.0].into_dyn()));
        // From (a * b): derivative is a = 2; from (a + b): 1
        assert_eq!(b.gradient(), Some(array![3.0].into_dyn()));
    }

    #[test]
    fn test_broadcast_operand_gets_reduced_gradient() {
        let matrix = variable(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let row = variable(array![10., 20., 30.].into_dyn());
        let scale = variable(arr0(2.).into_dyn());

        let shifted = add(&matrix, &row).expect("broadcastable");
        let scaled = multiply(&shifted, &scale).expect("broadcastable");
        scaled.backward(None).expect("differentiable");

        assert_eq!(matrix.gradient(), Some(Array::from_elem((2, 3), 2.).into_dyn()));
        assert_eq!(row.gradient(), Some(array![4., 4., 4.].into_dyn()));
        // Σ (matrix + row) = 21 + 120
        assert_eq!(scale.gradient(), Some(arr0(141.).into_dyn()));
    }

    #[test]
    fn test_incompatible_shapes() {
        let a = variable(array![1., 2., 3.].into_dyn());
        let b = variable(array![1., 2.].into_dyn());
        assert_eq!(
            add(&a, &b).map(|_| ()),
            Err(AutogradError::IncompatibleShapes {
                left: vec![3],
                right: vec![2]
            })
        );
    }

    #[test]
    fn test_subtraction_and_division() {
        let x = variable(array![2., 4.].into_dyn());
        let y = variable(array![1., 8.].into_dyn());
        let difference = subtract(&x, &y).expect("same shape");
        assert_eq!(*difference.borrow_array(), array![1., -4.].into_dyn());
        difference.backward(None).expect("differentiable");
        assert_eq!(x.gradient(), Some(array![1., 1.].into_dyn()));
        assert_eq!(y.gradient(), Some(array![-1., -1.].into_dyn()));

        x.zero_gradient().expect("differentiable");
        y.zero_gradient().expect("differentiable");
        let quotient = divide(&x, &y).expect("same shape");
        assert_eq!(*quotient.borrow_array(), array![2., 0.5].into_dyn());
        quotient.backward(None).expect("differentiable");
        assert_abs_diff_eq!(x.gradient().expect("zeroed"), array![1., 0.125].into_dyn());
        assert_abs_diff_eq!(
            y.gradient().expect("zeroed"),
            array![-2., -4. / 64.].into_dyn()
        );
    }

    #[test]
    fn test_power() {
        let x = variable(array![1., 2., 3.].into_dyn());
        let n = variable(arr0(2.).into_dyn());
        let squared = power(&x, &n).expect("broadcastable");
        assert_abs_diff_eq!(*squared.borrow_array(), array![1., 4., 9.].into_dyn());
        squared.backward(None).expect("differentiable");
        assert_abs_diff_eq!(x.gradient().expect("differentiable"), array![2., 4., 6.].into_dyn());
        // Σ xⁿ ln x
        let expected = 4. * 2_f32.ln() + 9. * 3_f32.ln();
        assert_abs_diff_eq!(
            n.gradient().expect("differentiable"),
            arr0(expected).into_dyn(),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_negation() {
        let x = variable(array![1., -2.].into_dyn());
        let y = negate(&x).expect("unary");
        assert_eq!(*y.borrow_array(), array![-1., 2.].into_dyn());
        y.backward(Some(array![3., 4.].into_dyn())).expect("differentiable");
        assert_eq!(x.gradient(), Some(array![-3., -4.].into_dyn()));
    }

    #[test]
    fn test_logarithm_and_exponential() {
        let x = variable(array![1., 2., 4.].into_dyn());
        let log = apply(NaturalLogarithm {}, &[x.clone()]).expect("unary");
        log.backward(None).expect("differentiable");
        assert_abs_diff_eq!(
            x.gradient().expect("differentiable"),
            array![1., 0.5, 0.25].into_dyn()
        );

        // golden values from PyTorch, as for torch.exp(t).backward(ones_like(t))
        let t = variable(array![[-2.0, -1.0], [1.0, 2.0]].into_dyn());
        let exp = apply(Exponentiation {}, &[t.clone()]).expect("unary");
        exp.backward(None).expect("differentiable");
        assert_abs_diff_eq!(
            t.gradient().expect("differentiable"),
            array![[0.13533528, 0.36787945], [2.71828175, 7.38905621]].into_dyn(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_matrix_multiplication() {
        let a = variable(array![[1., 2.], [3., 4.]].into_dyn());
        let b = variable(array![[5., 6.], [7., 8.]].into_dyn());

        let result = matrix_multiply(&a, &b).expect("inner dimensions agree");
        assert_eq!(
            *result.borrow_array(),
            array![[19., 22.], [43., 50.]].into_dyn()
        );

        result.backward(None).expect("differentiable");
        assert_eq!(
            a.gradient(),
            Some(array![[11., 15.], [11., 15.]].into_dyn())
        );
        assert_eq!(b.gradient(), Some(array![[4., 4.], [6., 6.]].into_dyn()));
    }

    #[test]
    fn test_matrix_multiplication_non_square() {
        let a = variable(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let b = variable(array![[7., 8.], [9., 10.], [11., 12.]].into_dyn());

        let result = matrix_multiply(&a, &b).expect("inner dimensions agree");
        assert_eq!(
            *result.borrow_array(),
            array![[58., 64.], [139., 154.]].into_dyn()
        );

        result.backward(None).expect("differentiable");
        assert_eq!(
            a.gradient(),
            Some(array![[15., 19., 23.], [15., 19., 23.]].into_dyn())
        );
        assert_eq!(
            b.gradient(),
            Some(array![[5., 5.], [7., 7.], [9., 9.]].into_dyn())
        );
    }

    #[test]
    fn test_matrix_vector_products() {
        let m = variable(array![[1., 2.], [3., 4.], [5., 6.]].into_dyn());
        let v = variable(array![1., -1.].into_dyn());
        let product = matrix_multiply(&m, &v).expect("inner dimensions agree");
        assert_eq!(*product.borrow_array(), array![-1., -1., -1.].into_dyn());
        product.backward(None).expect("differentiable");
        assert_eq!(
            m.gradient(),
            Some(array![[1., -1.], [1., -1.], [1., -1.]].into_dyn())
        );
        assert_eq!(v.gradient(), Some(array![9., 12.].into_dyn()));

        let u = variable(array![1., 2., 3.].into_dyn());
        let inner = matrix_multiply(&u, &u).expect("inner dimensions agree");
        assert_eq!(inner.shape(), Vec::<usize>::new());
        assert_eq!(*inner.borrow_array(), arr0(14.).into_dyn());
        inner.backward(None).expect("differentiable");
        assert_eq!(u.gradient(), Some(array![2., 4., 6.].into_dyn()));
    }

    #[test]
    fn test_matrix_multiplication_rejects_mismatched_operands() {
        let a = variable(Array::zeros((2, 3)).into_dyn());
        let b = variable(Array::zeros((2, 3)).into_dyn());
        assert!(matches!(
            matrix_multiply(&a, &b),
            Err(AutogradError::IncompatibleShapes { .. })
        ));
        let c = variable(Array::zeros((2, 3, 4)).into_dyn());
        assert!(matches!(
            matrix_multiply(&c, &b),
            Err(AutogradError::RankMismatch { actual: 3, .. })
        ));
    }

    #[test]
    fn test_sum_of_vector_broadcasts_seed_back() {
        let x = variable(array![1., 2., 3.].into_dyn());
        let y = apply(Summation::new(None), &[x.clone()]).expect("unary");
        assert_eq!(y.shape(), Vec::<usize>::new());
        assert_eq!(*y.borrow_array(), arr0(6.).into_dyn());
        y.backward(Some(arr0(1.).into_dyn())).expect("differentiable");
        assert_eq!(x.gradient(), Some(array![1., 1., 1.].into_dyn()));
    }

    #[test]
    fn test_sum_along_axis() {
        let x = variable(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let rows = apply(Summation::new(Some(1)), &[x.clone()]).expect("axis exists");
        assert_eq!(*rows.borrow_array(), array![6., 15.].into_dyn());
        rows.backward(Some(array![1., 10.].into_dyn()))
            .expect("differentiable");
        assert_eq!(
            x.gradient(),
            Some(array![[1., 1., 1.], [10., 10., 10.]].into_dyn())
        );

        assert_eq!(
            apply(Summation::new(Some(2)), &[x.clone()]).map(|_| ()),
            Err(AutogradError::AxisOutOfBounds { axis: 2, ndim: 2 })
        );
    }

    #[test]
    fn test_maximum_and_minimum() {
        let x = variable(array![[1., 5., 2.], [7., 3., 7.]].into_dyn());
        let maximum = apply(Maximum::new(None), &[x.clone()]).expect("unary");
        assert_eq!(*maximum.borrow_array(), arr0(7.).into_dyn());
        maximum.backward(None).expect("differentiable");
        // ties share in full
        assert_eq!(
            x.gradient(),
            Some(array![[0., 0., 0.], [1., 0., 1.]].into_dyn())
        );

        x.zero_gradient().expect("differentiable");
        let minima = apply(Minimum::new(Some(0)), &[x.clone()]).expect("axis exists");
        assert_eq!(*minima.borrow_array(), array![1., 3., 2.].into_dyn());
        minima
            .backward(Some(array![1., 2., 3.].into_dyn()))
            .expect("differentiable");
        assert_eq!(
            x.gradient(),
            Some(array![[1., 0., 3.], [0., 2., 0.]].into_dyn())
        );
    }

    #[test]
    fn test_wrong_number_of_operands() {
        let x = variable(array![1., 2.].into_dyn());
        assert_eq!(
            apply(Addition {}, &[x.clone()]).map(|_| ()),
            Err(AutogradError::ArityMismatch {
                operation: "addition",
                expected: 2,
                actual: 1
            })
        );
        assert!(matches!(
            apply(Negation {}, &[x.clone(), x.clone()]),
            Err(AutogradError::ArityMismatch {
                expected: 1,
                actual: 2,
                ..
            })
        ));
        assert!(matches!(
            apply(Summation::new(None), &[]),
            Err(AutogradError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn test_extremum_of_empty_array() {
        let empty = variable(Array::<f32, _>::zeros((0, 3)).into_dyn());
        assert_eq!(
            apply(Maximum::new(None), &[empty.clone()]).map(|_| ()),
            Err(AutogradError::EmptyReduction {
                operation: "maximum"
            })
        );
        assert_eq!(
            apply(Minimum::new(Some(0)), &[empty.clone()]).map(|_| ()),
            Err(AutogradError::EmptyReduction {
                operation: "minimum"
            })
        );
        // reducing the non-empty axis leaves an empty result, not an error
        let rows = apply(Maximum::new(Some(1)), &[empty]).expect("axis 1 has length 3");
        assert_eq!(rows.shape(), vec![0]);
    }

    #[test]
    fn test_extremum_propagates_nan() {
        let x = variable(array![[1., f32::NAN, 3.], [4., 5., 6.]].into_dyn());
        let maximum = apply(Maximum::new(None), &[x.clone()]).expect("unary");
        assert!(maximum.borrow_array().iter().all(|value| value.is_nan()));

        let minima = apply(Minimum::new(Some(1)), &[x.clone()]).expect("axis exists");
        let values = minima.borrow_array().iter().copied().collect::<Vec<_>>();
        assert!(values[0].is_nan());
        assert_eq!(values[1], 4.);

        minima.backward(None).expect("differentiable");
        assert_eq!(
            x.gradient(),
            Some(array![[0., 1., 0.], [1., 0., 0.]].into_dyn())
        );
    }

    #[test]
    fn test_transpose() {
        let x = variable(
            Array::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f32).into_dyn(),
        );
        let permuted =
            apply(Transpose::new(Some(vec![1, 2, 0])), &[x.clone()]).expect("permutation");
        assert_eq!(permuted.shape(), vec![3, 4, 2]);
        assert_eq!(
            permuted.borrow_array()[&[2, 1, 1][..]],
            x.borrow_array()[&[1, 2, 1][..]]
        );

        let seed =
            Array::from_shape_fn((3, 4, 2), |(j, k, i)| (i * 100 + j * 10 + k) as f32).into_dyn();
        permuted.backward(Some(seed)).expect("differentiable");
        let gradient = x.gradient().expect("differentiable");
        assert_eq!(gradient[&[1, 2, 3][..]], 123.);

        let reversed = apply(Transpose::new(None), &[x.clone()]).expect("any rank");
        assert_eq!(reversed.shape(), vec![4, 3, 2]);

        assert!(matches!(
            apply(Transpose::new(Some(vec![0, 0, 1])), &[x.clone()]),
            Err(AutogradError::InvalidPermutation { .. })
        ));
    }

    #[test]
    fn test_reshape() {
        let x = variable(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let y = apply(Reshape::new(vec![3, 2]), &[x.clone()]).expect("same size");
        assert_eq!(*y.borrow_array(), array![[1., 2.], [3., 4.], [5., 6.]].into_dyn());
        y.backward(Some(array![[1., 2.], [3., 4.], [5., 6.]].into_dyn()))
            .expect("differentiable");
        assert_eq!(
            x.gradient(),
            Some(array![[1., 2., 3.], [4., 5., 6.]].into_dyn())
        );
        assert_eq!(
            apply(Reshape::new(vec![4]), &[x.clone()]).map(|_| ()),
            Err(AutogradError::InvalidReshape {
                from: vec![2, 3],
                to: vec![4]
            })
        );
    }

    #[test]
    fn test_clip() {
        let x = variable(array![-2., -0.5, 0.5, 2.].into_dyn());
        let y = apply(Clip::new(Some(-1.), Some(1.)), &[x.clone()]).expect("unary");
        assert_eq!(*y.borrow_array(), array![-1., -0.5, 0.5, 1.].into_dyn());
        y.backward(None).expect("differentiable");
        assert_eq!(x.gradient(), Some(array![0., 1., 1., 0.].into_dyn()));

        let rectified = apply(Clip::new(Some(0.), None), &[x.clone()]).expect("unary");
        assert_eq!(*rectified.borrow_array(), array![0., 0., 0.5, 2.].into_dyn());
    }

    #[test]
    fn test_slice() {
        let x = variable(array![[1., 2., 3.], [4., 5., 6.]].into_dyn());
        let elements = vec![
            SliceInfoElem::from(..),
            SliceInfoElem::Slice {
                start: 1,
                end: None,
                step: 1,
            },
        ];
        let y = apply(Slice::new(elements), &[x.clone()]).expect("in bounds");
        assert_eq!(*y.borrow_array(), array![[2., 3.], [5., 6.]].into_dyn());
        y.backward(None).expect("differentiable");
        assert_eq!(
            x.gradient(),
            Some(array![[0., 1., 1.], [0., 1., 1.]].into_dyn())
        );

        // a bare index picks a row
        let row =
            apply(Slice::new(vec![SliceInfoElem::Index(-1)]), &[x.clone()]).expect("in bounds");
        assert_eq!(*row.borrow_array(), array![4., 5., 6.].into_dyn());

        assert_eq!(
            apply(Slice::new(vec![SliceInfoElem::Index(2)]), &[x.clone()]).map(|_| ()),
            Err(AutogradError::IndexOutOfBounds {
                index: 2,
                axis: 0,
                length: 2
            })
        );
    }

    #[test]
    fn test_gradients_against_finite_differences() {
        let mut rng = StdRng::seed_from_u64(7);
        let a_values =
            Array::random_using((3, 4), Uniform::new(0.5_f32, 2.), &mut rng).into_dyn();
        let b_values =
            Array::random_using((4,), Uniform::new(0.5_f32, 2.), &mut rng).into_dyn();
        // non-negative weights keep the logarithm's argument above 3
        let w_values =
            Array::random_using((4, 2), Uniform::new(0_f32, 1.), &mut rng).into_dyn();

        // f(a) = Σ log((a / b) ⋅ w + 3)
        let f = |a: &ArrayD<f32>| {
            let a = variable(a.clone());
            let b = constant(b_values.clone());
            let w = constant(w_values.clone());
            let three = constant(arr0(3.).into_dyn());
            let ratio = divide(&a, &b).expect("broadcastable");
            let product = matrix_multiply(&ratio, &w).expect("inner dimensions agree");
            let shifted = add(&product, &three).expect("broadcastable");
            apply(NaturalLogarithm {}, &[shifted]).expect("unary")
        };

        let a = variable(a_values.clone());
        let b = constant(b_values.clone());
        let w = constant(w_values.clone());
        let three = constant(arr0(3.).into_dyn());
        let ratio = divide(&a, &b).expect("broadcastable");
        let product = matrix_multiply(&ratio, &w).expect("inner dimensions agree");
        let shifted = add(&product, &three).expect("broadcastable");
        let output = apply(NaturalLogarithm {}, &[shifted]).expect("unary");
        let total = apply(Summation::new(None), &[output]).expect("unary");
        total.backward(None).expect("differentiable");

        let numerical = numerical_gradient(|x| f(x).borrow_array().clone(), &a_values);
        assert_abs_diff_eq!(
            a.gradient().expect("differentiable"),
            numerical,
            epsilon = 1e-2
        );
    }
}
