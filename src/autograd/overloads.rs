//! Operator syntax and convenience methods on [`Tensor`].
//!
//! Every entry point coerces its operands with [`IntoTensor`] and hands off to
//! [`super::operations`]. The `std::ops` impls can't return a `Result`, so like
//! `ndarray`'s own operators they panic on incompatible shapes; the named
//! functions in `operations` and the methods below are the fallible forms.
//!
//! Reflected `+ - * /` with an `f32` on the left are operators; reflected
//! power and matrix product are the methods [`Tensor::rpow`] and
//! [`Tensor::rdot`].

use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use ndarray::prelude::*;
use ndarray::SliceInfoElem;

use super::broadcast::zip_broadcast;
use super::operations::{
    self, apply, Clip, Exponentiation, MatrixMultiplication, Maximum, Minimum, NaturalLogarithm,
    Operation, Reshape, Slice, Summation, Transpose,
};
use super::{Tensor, TensorBuilder};
use crate::error::Result;

/// Anything that can stand in as an operand. Tensors pass through as they are
/// (no copy); scalars and arrays become non-differentiable leaves.
pub trait IntoTensor {
    fn into_tensor(self) -> Tensor;
}

impl IntoTensor for Tensor {
    fn into_tensor(self) -> Tensor {
        self
    }
}

impl IntoTensor for &Tensor {
    fn into_tensor(self) -> Tensor {
        self.clone()
    }
}

impl IntoTensor for f32 {
    fn into_tensor(self) -> Tensor {
        TensorBuilder::new(arr0(self)).build()
    }
}

impl<D: Dimension> IntoTensor for Array<f32, D> {
    fn into_tensor(self) -> Tensor {
        TensorBuilder::new(self).build()
    }
}

impl<D: Dimension> IntoTensor for &Array<f32, D> {
    fn into_tensor(self) -> Tensor {
        TensorBuilder::new(self.clone()).build()
    }
}

pub fn as_tensor<T: IntoTensor>(value: T) -> Tensor {
    value.into_tensor()
}

fn or_panic(result: Result<Tensor>) -> Tensor {
    match result {
        Ok(tensor) => tensor,
        Err(error) => panic!("{}", error),
    }
}

macro_rules! impl_binary_operator {
    ($trait:ident, $method:ident, $function:path) => {
        impl<T: IntoTensor> $trait<T> for Tensor {
            type Output = Tensor;

            fn $method(self, other: T) -> Tensor {
                or_panic($function(&self, &other.into_tensor()))
            }
        }

        impl<T: IntoTensor> $trait<T> for &Tensor {
            type Output = Tensor;

            fn $method(self, other: T) -> Tensor {
                or_panic($function(self, &other.into_tensor()))
            }
        }

        impl $trait<Tensor> for f32 {
            type Output = Tensor;

            fn $method(self, other: Tensor) -> Tensor {
                or_panic($function(&as_tensor(self), &other))
            }
        }

        impl $trait<&Tensor> for f32 {
            type Output = Tensor;

            fn $method(self, other: &Tensor) -> Tensor {
                or_panic($function(&as_tensor(self), other))
            }
        }
    };
}

impl_binary_operator!(Add, add, operations::add);
impl_binary_operator!(Sub, sub, operations::subtract);
impl_binary_operator!(Mul, mul, operations::multiply);
impl_binary_operator!(Div, div, operations::divide);

impl Neg for Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        or_panic(operations::negate(&self))
    }
}

impl Neg for &Tensor {
    type Output = Tensor;

    fn neg(self) -> Tensor {
        or_panic(operations::negate(self))
    }
}

// In-place operators rewrite the array without recording anything in the
// graph, and clear the gradient along with it.
macro_rules! impl_assign_operator {
    ($trait:ident, $method:ident, $combine:expr) => {
        impl<T: IntoTensor> $trait<T> for Tensor {
            fn $method(&mut self, other: T) {
                if let Err(error) = self.update_in_place(&other.into_tensor(), $combine) {
                    panic!("{}", error);
                }
            }
        }
    };
}

impl_assign_operator!(AddAssign, add_assign, |a, b| a + b);
impl_assign_operator!(SubAssign, sub_assign, |a, b| a - b);
impl_assign_operator!(MulAssign, mul_assign, |a, b| a * b);
impl_assign_operator!(DivAssign, div_assign, |a, b| a / b);

impl Tensor {
    fn update_in_place(&self, other: &Tensor, combine: fn(f32, f32) -> f32) -> Result<()> {
        let updated = zip_broadcast(&self.borrow_array(), &other.borrow_array(), combine)?;
        self.set_array(updated);
        Ok(())
    }

    fn compare<T: IntoTensor>(&self, other: T, test: fn(f32, f32) -> bool) -> Result<ArrayD<bool>> {
        let other = other.into_tensor();
        let other_array = other.borrow_array();
        zip_broadcast(&self.borrow_array(), &other_array, test)
    }

    /// `self ** exponent`
    pub fn pow<T: IntoTensor>(&self, exponent: T) -> Result<Tensor> {
        operations::power(self, &exponent.into_tensor())
    }

    /// `self @ other`: matrix product, with vector operands treated as a row
    /// on the left and a column on the right.
    pub fn dot<T: IntoTensor>(&self, other: T) -> Result<Tensor> {
        operations::matrix_multiply(self, &other.into_tensor())
    }

    /// `base ** self`
    pub fn rpow<T: IntoTensor>(&self, base: T) -> Result<Tensor> {
        operations::power(&base.into_tensor(), self)
    }

    /// `other @ self`
    pub fn rdot<T: IntoTensor>(&self, other: T) -> Result<Tensor> {
        operations::matrix_multiply(&other.into_tensor(), self)
    }

    /// `self **= exponent`, outside the graph.
    pub fn pow_assign<T: IntoTensor>(&self, exponent: T) -> Result<()> {
        self.update_in_place(&exponent.into_tensor(), f32::powf)
    }

    /// `self @= other`, outside the graph.
    pub fn dot_assign<T: IntoTensor>(&self, other: T) -> Result<()> {
        let other = other.into_tensor();
        let product = MatrixMultiplication {}.forward(&[
            self.borrow_array().clone(),
            other.borrow_array().clone(),
        ])?;
        self.set_array(product);
        Ok(())
    }

    pub fn sum(&self, axis: Option<usize>) -> Result<Tensor> {
        apply(Summation::new(axis), &[self.clone()])
    }

    pub fn max(&self, axis: Option<usize>) -> Result<Tensor> {
        apply(Maximum::new(axis), &[self.clone()])
    }

    pub fn min(&self, axis: Option<usize>) -> Result<Tensor> {
        apply(Minimum::new(axis), &[self.clone()])
    }

    pub fn transpose(&self, axes: Option<Vec<usize>>) -> Result<Tensor> {
        apply(Transpose::new(axes), &[self.clone()])
    }

    /// Reverses the axes.
    pub fn t(&self) -> Result<Tensor> {
        self.transpose(None)
    }

    pub fn reshape(&self, new_shape: Vec<usize>) -> Result<Tensor> {
        apply(Reshape::new(new_shape), &[self.clone()])
    }

    pub fn flatten(&self) -> Result<Tensor> {
        let length = self.borrow_array().len();
        self.reshape(vec![length])
    }

    pub fn clip(&self, minimum: Option<f32>, maximum: Option<f32>) -> Result<Tensor> {
        apply(Clip::new(minimum, maximum), &[self.clone()])
    }

    pub fn log(&self) -> Result<Tensor> {
        apply(NaturalLogarithm {}, &[self.clone()])
    }

    pub fn exp(&self) -> Result<Tensor> {
        apply(Exponentiation {}, &[self.clone()])
    }

    /// Basic indexing; axes not mentioned are taken whole.
    pub fn slice(&self, elements: &[SliceInfoElem]) -> Result<Tensor> {
        apply(Slice::new(elements.to_vec()), &[self.clone()])
    }

    /// `self[index]`, counting from the end for negative indices.
    pub fn at(&self, index: isize) -> Result<Tensor> {
        self.slice(&[SliceInfoElem::Index(index)])
    }

    // Comparisons give plain arrays and never enter the graph.

    pub fn gt<T: IntoTensor>(&self, other: T) -> Result<ArrayD<bool>> {
        self.compare(other, |a, b| a > b)
    }

    pub fn lt<T: IntoTensor>(&self, other: T) -> Result<ArrayD<bool>> {
        self.compare(other, |a, b| a < b)
    }

    pub fn ge<T: IntoTensor>(&self, other: T) -> Result<ArrayD<bool>> {
        self.compare(other, |a, b| a >= b)
    }

    pub fn le<T: IntoTensor>(&self, other: T) -> Result<ArrayD<bool>> {
        self.compare(other, |a, b| a <= b)
    }
}
