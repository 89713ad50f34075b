use std::cell::{Ref, RefCell};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::rc::Rc;
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use ndarray::prelude::*;
use num_traits::ToPrimitive;

use crate::error::{AutogradError, Result};

mod backward;
mod broadcast;
pub mod operations;
mod overloads;

pub use self::backward::{BackwardConfiguration, Traversal};
pub use self::overloads::{as_tensor, IntoTensor};

lazy_static! {
    static ref COUNTER: Mutex<u64> = Mutex::new(0);
}

fn generate_sequential_tensor_id() -> String {
    let mut num = COUNTER.lock().unwrap_or_else(PoisonError::into_inner);
    *num += 1;
    format!("Tensor{}", num)
}

/// Maps the gradient flowing into a derived tensor to the gradient owed to one
/// of its operands. Must undo any broadcasting the forward operation did.
pub type GradientFunction = Box<dyn Fn(&ArrayD<f32>) -> Result<ArrayD<f32>>>;

/// One edge of the graph: the operand a tensor was computed from, and how to
/// pass gradient back to it.
pub struct Dependency {
    tensor: Tensor,
    gradient_function: GradientFunction,
}

impl Dependency {
    pub fn new<F>(tensor: Tensor, gradient_function: F) -> Self
    where
        F: Fn(&ArrayD<f32>) -> Result<ArrayD<f32>> + 'static,
    {
        Self {
            tensor,
            gradient_function: Box::new(gradient_function),
        }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn gradient_for(&self, out_gradient: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        (self.gradient_function)(out_gradient)
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependency")
            .field("tensor", &self.tensor.identifier())
            .finish()
    }
}

struct Node {
    identifier: String,
    array: RefCell<ArrayD<f32>>,
    requires_gradient: bool,
    gradient: RefCell<Option<ArrayD<f32>>>,
    dependencies: Vec<Dependency>,
}

// Unlinks a dying chain through a work list; the derived drop would recurse
// once per link.
impl Drop for Node {
    fn drop(&mut self) {
        let mut pending = mem::take(&mut self.dependencies);
        while let Some(dependency) = pending.pop() {
            if let Ok(mut node) = Rc::try_unwrap(dependency.tensor.node) {
                pending.append(&mut node.dependencies);
            }
        }
    }
}

/// A shared handle onto a node of the computation graph.
///
/// Cloning a `Tensor` is cheap and yields another handle onto the same node:
/// the array, gradient and dependencies are shared, not copied. Derived tensors
/// hold handles onto their operands, so a node lives as long as anything
/// downstream of it does.
#[derive(Clone)]
pub struct Tensor {
    node: Rc<Node>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("identifier", &self.node.identifier)
            .field("array", &self.node.array)
            .field("requires_gradient", &self.node.requires_gradient)
            .field("gradient", &self.node.gradient)
            .field("dependencies", &self.node.dependencies)
            .finish()
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={:?}, requires_gradient={})",
            self.shape(),
            self.node.requires_gradient
        )
    }
}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.node.identifier.hash(state);
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.node.identifier == other.node.identifier
    }
}

impl Eq for Tensor {}

impl Tensor {
    pub fn identifier(&self) -> &str {
        &self.node.identifier
    }

    pub fn borrow_array(&self) -> Ref<'_, ArrayD<f32>> {
        self.node.array.borrow()
    }

    /// Replaces the forward value. Any accumulated gradient was computed
    /// against the old value, so it is cleared to `None`; call
    /// [`Tensor::zero_gradient`] before the next backward pass.
    pub fn set_array<D: Dimension>(&self, array: Array<f32, D>) {
        *self.node.array.borrow_mut() = array.into_dyn();
        self.unset_gradient();
    }

    pub fn shape(&self) -> Vec<usize> {
        self.node.array.borrow().shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.node.array.borrow().ndim()
    }

    /// Length of the first axis.
    pub fn len(&self) -> Result<usize> {
        self.node
            .array
            .borrow()
            .shape()
            .first()
            .copied()
            .ok_or_else(|| AutogradError::RankMismatch {
                expected: "at least 1".to_owned(),
                actual: 0,
            })
    }

    pub fn requires_gradient(&self) -> bool {
        self.node.requires_gradient
    }

    pub fn gradient(&self) -> Option<ArrayD<f32>> {
        self.node.gradient.borrow().clone()
    }

    pub fn borrow_gradient(&self) -> Ref<'_, Option<ArrayD<f32>>> {
        self.node.gradient.borrow()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.node.dependencies
    }

    /// (Re)allocates the gradient as zeros shaped like the current array.
    pub fn zero_gradient(&self) -> Result<()> {
        if !self.node.requires_gradient {
            return Err(AutogradError::NonDifferentiableZeroGradient);
        }
        let zeros = Array::zeros(self.node.array.borrow().raw_dim());
        *self.node.gradient.borrow_mut() = Some(zeros);
        Ok(())
    }

    fn unset_gradient(&self) {
        *self.node.gradient.borrow_mut() = None
    }

    fn accumulate_gradient(&self, gradient: &ArrayD<f32>) -> Result<()> {
        if !self.node.requires_gradient {
            return Err(AutogradError::NonDifferentiableBackward);
        }
        match self.node.gradient.borrow_mut().as_mut() {
            Some(accumulated) => broadcast::accumulate(accumulated, gradient),
            None => Err(AutogradError::ClearedGradient {
                identifier: self.node.identifier.clone(),
            }),
        }
    }
}

pub struct TensorBuilder {
    array: ArrayD<f32>,
    identifier: Option<String>,
    requires_gradient: bool,
    dependencies: Vec<Dependency>,
}

impl TensorBuilder {
    pub fn new<D: Dimension>(array: Array<f32, D>) -> TensorBuilder {
        TensorBuilder {
            array: array.into_dyn(),
            identifier: None,
            requires_gradient: false,
            dependencies: Vec::new(),
        }
    }

    /// Starts from an array of any primitive numeric element type, converting
    /// each element to `f32`.
    pub fn from_elements<T, D>(array: &Array<T, D>) -> Result<TensorBuilder>
    where
        T: ToPrimitive,
        D: Dimension,
    {
        let elements = array
            .iter()
            .enumerate()
            .map(|(position, element)| {
                element
                    .to_f32()
                    .ok_or(AutogradError::ElementConversion { position })
            })
            .collect::<Result<Vec<f32>>>()?;
        let converted =
            Array::from_shape_vec(IxDyn(array.shape()), elements).map_err(|_| {
                AutogradError::InvalidReshape {
                    from: vec![array.len()],
                    to: array.shape().to_vec(),
                }
            })?;
        Ok(TensorBuilder::new(converted))
    }

    /// Names the tensor. Identifiers are what tensors hash and compare by, so
    /// they must be unique within a graph; generated ones always are.
    pub fn identifier(mut self, identifier: String) -> TensorBuilder {
        self.identifier = Some(identifier);
        self
    }

    pub fn requires_gradient(mut self, requires: bool) -> TensorBuilder {
        self.requires_gradient = requires;
        self
    }

    pub fn dependencies(mut self, dependencies: Vec<Dependency>) -> TensorBuilder {
        self.dependencies = dependencies;
        self
    }

    pub fn build(self) -> Tensor {
        let gradient = if self.requires_gradient {
            Some(Array::zeros(self.array.raw_dim()))
        } else {
            None
        };
        Tensor {
            node: Rc::new(Node {
                identifier: match self.identifier {
                    Some(identifier) => identifier,
                    None => generate_sequential_tensor_id(),
                },
                array: RefCell::new(self.array),
                requires_gradient: self.requires_gradient,
                gradient: RefCell::new(gradient),
                dependencies: self.dependencies,
            }),
        }
    }
}
