//! Optimizer(s)

use std::fmt::{self, Display};

use clap::ValueEnum;

use crate::tensor::Tensor;

/// Common interface for optimizers
/// Analogous to the torch.optim.Optimizer interface
/// <https://pytorch.org/docs/stable/optim.html#base-class>
pub trait Optim {
    /// Performs a single optimization step with accumulated gradients
    fn step(&mut self);
    /// Zeros gradients for all parameters
    fn zero_grad(&mut self);
}

impl<T: Optim + ?Sized> Optim for Box<T> {
    fn step(&mut self) {
        (**self).step();
    }

    fn zero_grad(&mut self) {
        (**self).zero_grad();
    }
}

/// SGD with momentum
pub struct SGD {
    params: Vec<Tensor>,
    // currently does not change the learning rate based on the iteration
    // ideally lr would decay over time
    lr: f32,
    momentum: f32,
    // velocity per parameter element
    velocity: Vec<Vec<f32>>,
}

impl SGD {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Self {
        let velocity = params.iter().map(|p| vec![0.0; p.shape().len()]).collect();
        Self {
            params,
            lr,
            momentum,
            velocity,
        }
    }

    #[cfg(test)]
    fn velocities(&self) -> &[Vec<f32>] {
        &self.velocity
    }
}

impl Optim for SGD {
    fn step(&mut self) {
        let Self {
            params,
            lr,
            momentum,
            velocity,
        } = self;
        for (param, velocity) in params.iter_mut().zip(velocity.iter_mut()) {
            param.update(|data, grad| {
                for ((d, g), v) in data.iter_mut().zip(grad).zip(velocity.iter_mut()) {
                    *v = *momentum * *v - *lr * g;
                    *d += *v;
                }
            });
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

/// Adam with bias corrected first and second moment estimates
pub struct Adam {
    params: Vec<Tensor>,
    lr: f32,
    beta1: f32,
    beta2: f32,
    // running products beta^t
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
}

impl Adam {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPSILON: f32 = 1e-8;

    pub fn new(params: Vec<Tensor>, lr: f32) -> Self {
        Self::with_betas(params, lr, Self::BETA1, Self::BETA2, Self::EPSILON)
    }

    pub fn with_betas(params: Vec<Tensor>, lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        let zeros = params
            .iter()
            .map(|p| vec![0.0; p.shape().len()])
            .collect::<Vec<_>>();
        Self {
            params,
            lr,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon,
            m: zeros.clone(),
            v: zeros,
        }
    }
}

impl Optim for Adam {
    fn step(&mut self) {
        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        for ((param, m), v) in self
            .params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            param.update(|data, grad| {
                data.iter_mut()
                    .zip(grad)
                    .zip(m.iter_mut())
                    .zip(v.iter_mut())
                    .for_each(|(((p, g), m), v)| {
                        *m = b1 * *m + (1. - b1) * g;
                        *v = b2 * *v + (1. - b2) * g.powi(2);
                        *p -= step_size * *m / (v.sqrt() + eps);
                    });
            });
        }
    }

    fn zero_grad(&mut self) {
        for param in self.params.iter_mut() {
            param.zero_grad();
        }
    }
}

/// Selects an optimizer from configuration
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

impl OptimizerKind {
    /// `momentum` is only used by SGD
    pub fn build(self, params: Vec<Tensor>, lr: f32, momentum: f32) -> Box<dyn Optim> {
        match self {
            OptimizerKind::Sgd => Box::new(SGD::new(params, lr, momentum)),
            OptimizerKind::Adam => Box::new(Adam::new(params, lr)),
        }
    }
}

impl Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{assert_eq_float, tensor::Shape};

    use super::*;

    // loss = a * b with a = 1, b = 2, so dloss/da = 2 and dloss/db = 1
    fn params_with_grads() -> (Tensor, Tensor) {
        let a = Tensor::parameter(vec![1.0], Shape::new(1, 1)).unwrap();
        let b = Tensor::parameter(vec![2.0], Shape::new(1, 1)).unwrap();
        a.mul(&b).unwrap().sum().backward();
        (a, b)
    }

    #[test]
    fn test_sgd_no_momentum() {
        let (a, b) = params_with_grads();
        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.0);
        optim.step();
        assert_eq!(a.grad(), vec![2.0]);
        assert_eq!(b.grad(), vec![1.0]);
        assert_eq_float!(a.item(), 0.8);
        assert_eq_float!(b.item(), 1.9);
    }

    #[test]
    fn test_sgd_with_momentum() {
        let (a, b) = params_with_grads();
        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.9);
        optim.step();
        assert_eq_float!(a.item(), 0.8);
        assert_eq_float!(b.item(), 1.9);
        assert_eq_float!(optim.velocities()[0][0], -0.2);
        assert_eq_float!(optim.velocities()[1][0], -0.1);
        // gradients were not zeroed, so the same gradient is applied again on top of the momentum
        optim.step();
        assert_eq_float!(a.item(), 0.42);
        assert_eq_float!(b.item(), 1.71);
        assert_eq_float!(optim.velocities()[0][0], -0.38);
        assert_eq_float!(optim.velocities()[1][0], -0.19);
    }

    #[test]
    fn test_zero_grad() {
        let (a, b) = params_with_grads();
        let mut optim = SGD::new(vec![a.clone(), b.clone()], 0.1, 0.0);
        optim.zero_grad();
        assert_eq!(a.grad(), vec![0.0]);
        assert_eq!(b.grad(), vec![0.0]);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let (a, b) = params_with_grads();
        let mut optim = Adam::new(vec![a.clone(), b.clone()], 0.01);
        optim.step();
        // bias correction makes the first update lr * sign(grad)
        assert_eq_float!(a.item(), 0.99, 1e-5);
        assert_eq_float!(b.item(), 1.99, 1e-5);

        optim.zero_grad();
        optim.step();
        // no new gradient, but the first moment keeps pushing in the same direction
        assert!(a.item() < 0.99);
    }

    #[test]
    fn test_boxed_optimizer() {
        let (a, _) = params_with_grads();
        let mut optim = OptimizerKind::Sgd.build(vec![a.clone()], 0.5, 0.0);
        optim.step();
        assert_eq_float!(a.item(), 0.0);
        assert_eq!(OptimizerKind::Adam.to_string(), "adam");
    }
}
