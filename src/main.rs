use std::env;
use std::error::Error;
use std::time::Instant;

use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use log::info;

use tensorgrad::{as_tensor, BackwardConfiguration, Tensor, TensorBuilder, Traversal};

const STEP: f32 = 1e-2;

// Σ log((a / b) · w + 3), with w held fixed
fn expression(a: &Tensor, b: &Tensor, w: &Array2<f32>) -> Result<Tensor, Box<dyn Error>> {
    let scaled = (a / b) * w + 3.;
    Ok(scaled.log()?.sum(None)?)
}

fn evaluate(a: &Array2<f32>, b: &Array2<f32>, w: &Array2<f32>) -> Result<f32, Box<dyn Error>> {
    let value = expression(&as_tensor(a), &as_tensor(b), w)?;
    let total = value.borrow_array().sum();
    Ok(total)
}

fn gradient_check(seed: u64) -> Result<(), Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let a_values = Array::random_using((3, 4), Uniform::new(0.5f32, 2.), &mut rng);
    let b_values = Array::random_using((3, 4), Uniform::new(0.5f32, 2.), &mut rng);
    let w = Array::random_using((3, 4), Uniform::new(0f32, 1.), &mut rng);

    let a = TensorBuilder::new(a_values.clone())
        .identifier("a".to_owned())
        .requires_gradient(true)
        .build();
    let b = TensorBuilder::new(b_values.clone())
        .identifier("b".to_owned())
        .requires_gradient(true)
        .build();
    let loss = expression(&a, &b, &w)?;
    loss.backward(None)?;
    println!("loss: {}", loss.borrow_array());

    let mut worst: f32 = 0.;
    for (name, tensor) in [("a", &a), ("b", &b)] {
        let analytic = tensor.gradient().ok_or("differentiable tensor has a gradient")?;
        for (index, &expected) in analytic.indexed_iter() {
            let (i, j) = (index[0], index[1]);
            let perturbed = |delta: f32| -> Result<f32, Box<dyn Error>> {
                let mut shifted_a = a_values.clone();
                let mut shifted_b = b_values.clone();
                if name == "a" {
                    shifted_a[[i, j]] += delta;
                } else {
                    shifted_b[[i, j]] += delta;
                }
                evaluate(&shifted_a, &shifted_b, &w)
            };
            let numerical = (perturbed(STEP)? - perturbed(-STEP)?) / (2. * STEP);
            let discrepancy = (numerical - expected).abs();
            info!(
                "∂loss/∂{}[{}, {}]: analytic {}, numerical {}",
                name, i, j, expected, numerical
            );
            worst = worst.max(discrepancy);
        }
    }
    println!("largest discrepancy from finite differences: {}", worst);
    if worst > 1e-2 {
        return Err(format!("gradient check failed (discrepancy {})", worst).into());
    }
    println!("gradient check passed");
    Ok(())
}

fn diamond(layers: usize) -> Result<(), Box<dyn Error>> {
    let x = TensorBuilder::new(array![1.])
        .identifier("x".to_owned())
        .requires_gradient(true)
        .build();
    let mut y = x.clone();
    for _ in 0..layers {
        y = &y + &y;
    }

    for traversal in [Traversal::PerPath, Traversal::Topological] {
        x.zero_gradient()?;
        let configuration = BackwardConfiguration {
            traversal,
            ..BackwardConfiguration::default()
        };
        let start = Instant::now();
        y.backward_with(None, &configuration)?;
        println!(
            "{:?}: ∂y/∂x = {} in {:?}",
            traversal,
            x.gradient()
                .map_or_else(|| "none".to_owned(), |gradient| gradient.to_string()),
            start.elapsed()
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = env::args().collect::<Vec<_>>();

    let instructions = "pass `--gradient-check [seed]` or `--diamond [layers]`";

    if args.len() <= 1 {
        println!("{}", instructions);
        return Ok(());
    }

    match args[1].as_str() {
        "--gradient-check" => {
            let seed = match args.get(2) {
                Some(seed) => seed.parse()?,
                None => 7,
            };
            gradient_check(seed)?;
        }
        "--diamond" => {
            let layers = match args.get(2) {
                Some(layers) => layers.parse()?,
                None => 16,
            };
            diamond(layers)?;
        }
        _ => {
            println!("{}", instructions);
        }
    }
    Ok(())
}
