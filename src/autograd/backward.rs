use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use ndarray::prelude::*;
use topological_sort::TopologicalSort;

use super::broadcast::zip_broadcast;
use super::Tensor;
use crate::error::{AutogradError, Result};

/// How a backward pass walks the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Traversal {
    /// Depth-first, once per path. A tensor reachable along k paths receives
    /// k separate contributions, and everything below it is walked k times.
    #[default]
    PerPath,
    /// Each tensor is visited once, in reverse topological order, after the
    /// contributions from all of its consumers have been summed.
    Topological,
}

#[derive(Debug, Clone, Default)]
pub struct BackwardConfiguration {
    pub traversal: Traversal,
    /// Longest dependency chain (counted in edges from the root) a pass may
    /// follow before giving up.
    pub maximum_depth: Option<usize>,
}

impl Tensor {
    /// Accumulates the gradient of this tensor with respect to every
    /// differentiable tensor it was computed from.
    ///
    /// `seed` is the gradient flowing into this tensor; `None` means ones
    /// shaped like the tensor. Gradients accumulate: calling this twice
    /// without [`Tensor::zero_gradient`] in between adds both passes.
    pub fn backward(&self, seed: Option<ArrayD<f32>>) -> Result<()> {
        self.backward_with(seed, &BackwardConfiguration::default())
    }

    pub fn backward_with(
        &self,
        seed: Option<ArrayD<f32>>,
        configuration: &BackwardConfiguration,
    ) -> Result<()> {
        if !self.requires_gradient() {
            return Err(AutogradError::NonDifferentiableBackward);
        }
        let seed = match seed {
            Some(seed) => seed,
            None => Array::ones(self.borrow_array().raw_dim()),
        };
        debug!(
            "backward from {} ({:?} traversal)",
            self.identifier(),
            configuration.traversal
        );
        let visits = match configuration.traversal {
            Traversal::PerPath => backprop_per_path(self, seed, configuration.maximum_depth)?,
            Traversal::Topological => {
                backprop_topologically(self, seed, configuration.maximum_depth)?
            }
        };
        debug!(
            "backward from {} accumulated into {} tensors",
            self.identifier(),
            visits
        );
        Ok(())
    }
}

fn check_depth(depth: usize, maximum_depth: Option<usize>) -> Result<()> {
    match maximum_depth {
        Some(maximum_depth) if depth > maximum_depth => {
            Err(AutogradError::DepthLimitExceeded { maximum_depth })
        }
        _ => Ok(()),
    }
}

struct Frame {
    tensor: Tensor,
    gradient: ArrayD<f32>,
    next_dependency: usize,
    depth: usize,
}

// Same visiting order as recursing into each dependency in turn, but with the
// pending work on the heap rather than the call stack.
fn backprop_per_path(
    root: &Tensor,
    seed: ArrayD<f32>,
    maximum_depth: Option<usize>,
) -> Result<usize> {
    root.accumulate_gradient(&seed)?;
    let mut visits = 1;
    let mut stack = vec![Frame {
        tensor: root.clone(),
        gradient: seed,
        next_dependency: 0,
        depth: 0,
    }];

    while let Some(frame) = stack.last_mut() {
        let step = match frame.tensor.dependencies().get(frame.next_dependency) {
            Some(dependency) => Some((
                dependency.tensor().clone(),
                dependency.gradient_for(&frame.gradient)?,
                frame.depth + 1,
            )),
            None => None,
        };
        frame.next_dependency += 1;

        match step {
            Some((tensor, gradient, depth)) => {
                check_depth(depth, maximum_depth)?;
                trace!("accumulating into {} at depth {}", tensor.identifier(), depth);
                tensor.accumulate_gradient(&gradient)?;
                visits += 1;
                stack.push(Frame {
                    tensor,
                    gradient,
                    next_dependency: 0,
                    depth,
                });
            }
            None => {
                stack.pop();
            }
        }
    }
    Ok(visits)
}

fn sorted_computation_graph(end: &Tensor) -> Vec<Tensor> {
    let mut sorter = TopologicalSort::<Tensor>::new();
    sorter.insert(end.clone());
    let mut registered = HashSet::new();
    let mut pending = vec![end.clone()];
    while let Some(child) = pending.pop() {
        if !registered.insert(child.identifier().to_owned()) {
            continue;
        }
        for dependency in child.dependencies() {
            sorter.add_dependency(dependency.tensor().clone(), child.clone());
            pending.push(dependency.tensor().clone());
        }
    }
    let mut sorted = sorter.collect::<Vec<_>>();
    // We actually want reverse-topological order
    sorted.reverse();
    sorted
}

fn backprop_topologically(
    culmination: &Tensor,
    seed: ArrayD<f32>,
    maximum_depth: Option<usize>,
) -> Result<usize> {
    let sorted = sorted_computation_graph(culmination);

    // longest path from the root; every consumer of a node precedes it
    let mut depths = HashMap::<String, usize>::new();
    depths.insert(culmination.identifier().to_owned(), 0);
    for node in &sorted {
        let depth = depths.get(node.identifier()).copied().unwrap_or(0);
        check_depth(depth, maximum_depth)?;
        for dependency in node.dependencies() {
            let entry = depths
                .entry(dependency.tensor().identifier().to_owned())
                .or_insert(0);
            *entry = (*entry).max(depth + 1);
        }
    }

    let mut gradients = HashMap::<String, ArrayD<f32>>::new();
    gradients.insert(culmination.identifier().to_owned(), seed);
    let mut visits = 0;
    for node in sorted {
        let Some(gradient) = gradients.remove(node.identifier()) else {
            continue;
        };
        trace!("accumulating into {}", node.identifier());
        node.accumulate_gradient(&gradient)?;
        visits += 1;

        for dependency in node.dependencies() {
            let contribution = dependency.gradient_for(&gradient)?;
            let identifier = dependency.tensor().identifier();
            match gradients.get_mut(identifier) {
                Some(existing) => {
                    *existing = zip_broadcast(existing, &contribution, |a, b| a + b)?;
                }
                None => {
                    gradients.insert(identifier.to_owned(), contribution);
                }
            }
        }
    }
    Ok(visits)
}
