//! Gradient-step collaborators.
//!
//! The agent only needs "apply a step given gradients"; which rule does it
//! is up to the caller.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::params::{Gradients, Params};

pub trait Optimizer {
    fn step(&mut self, params: &mut Params, grads: &Gradients);

    fn learning_rate(&self) -> f32;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

impl OptimizerKind {
    pub fn build(self, learning_rate: f32) -> Box<dyn Optimizer> {
        match self {
            Self::Sgd => Box::new(Sgd::new(learning_rate)),
            Self::Adam => Box::new(Adam::new(learning_rate, AdamConfig::default())),
        }
    }
}

/// Plain gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut Params, grads: &Gradients) {
        let lr = self.learning_rate;
        for (p, g) in params.buffers_mut().into_iter().zip(grads.buffers()) {
            for (w, d) in p.iter_mut().zip(g.iter()) {
                *w -= lr * d;
            }
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Adam with bias correction. Moment buffers are allocated lazily on the
/// first step, one per parameter buffer.
#[derive(Debug, Clone)]
pub struct Adam {
    cfg: AdamConfig,
    learning_rate: f32,
    m: Vec<Vec<f32>>,
    v: Vec<Vec<f32>>,
    t: u32,
}

impl Adam {
    pub fn new(learning_rate: f32, cfg: AdamConfig) -> Self {
        Self {
            cfg,
            learning_rate,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    pub fn steps_taken(&self) -> u32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut Params, grads: &Gradients) {
        if self.m.is_empty() {
            self.m = grads.buffers().iter().map(|b| vec![0.0; b.len()]).collect();
            self.v = self.m.clone();
        }
        self.t += 1;

        let AdamConfig { beta1, beta2, eps } = self.cfg;
        let bc1 = 1.0 - beta1.powi(self.t as i32);
        let bc2 = 1.0 - beta2.powi(self.t as i32);
        let lr = self.learning_rate;

        for (k, (p, g)) in params
            .buffers_mut()
            .into_iter()
            .zip(grads.buffers())
            .enumerate()
        {
            let m = &mut self.m[k];
            let v = &mut self.v[k];
            for i in 0..p.len() {
                let d = g[i];
                m[i] = beta1 * m[i] + (1.0 - beta1) * d;
                v[i] = beta2 * v[i] + (1.0 - beta2) * d * d;
                let m_hat = m[i] / bc1;
                let v_hat = v[i] / bc2;
                p[i] -= lr * m_hat / (v_hat.sqrt() + eps);
            }
        }
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::prng::Prng;

    fn params() -> Params {
        let cfg = AgentConfig::default().with_dims(2, 3, 2, 2);
        Params::init(&cfg, &mut Prng::new(4))
    }

    fn filled_grads(p: &Params, value: f32) -> Gradients {
        let mut g = p.zeros_like();
        for b in g.buffers_mut() {
            b.fill(value);
        }
        g
    }

    #[test]
    fn sgd_steps_against_the_gradient() {
        let mut p = params();
        let before = p.clone();
        let g = filled_grads(&p, 2.0);
        Sgd::new(0.1).step(&mut p, &g);
        for (a, b) in p.buffers().iter().zip(before.buffers().iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - (y - 0.2)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn adam_first_step_is_learning_rate_sized() {
        let mut p = params();
        let before = p.clone();
        let g = filled_grads(&p, -3.0);
        let mut adam = Adam::new(0.01, AdamConfig::default());
        adam.step(&mut p, &g);
        assert_eq!(adam.steps_taken(), 1);
        for (a, b) in p.buffers().iter().zip(before.buffers().iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y - 0.01).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn zero_learning_rate_leaves_parameters_bit_identical() {
        for kind in [OptimizerKind::Sgd, OptimizerKind::Adam] {
            let mut p = params();
            let before = p.clone();
            let g = filled_grads(&p, 0.7);
            let mut opt = kind.build(0.0);
            opt.step(&mut p, &g);
            opt.step(&mut p, &g);
            assert_eq!(p, before);
            assert_eq!(opt.learning_rate(), 0.0);
        }
    }
}
