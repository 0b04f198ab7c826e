#[cfg(feature = "simd")]
use wide::f32x4;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::agent::AgentConfig;
use crate::cell::GATE_COUNT;
use crate::prng::Prng;

/// Inner product of two equal-length slices.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(feature = "simd")]
    {
        dot_simd(a, b)
    }

    #[cfg(not(feature = "simd"))]
    {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }
}

/// Four lanes at a time, scalar tail.
#[cfg(feature = "simd")]
fn dot_simd(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let simd_end = n - (n % 4);

    let mut acc = f32x4::splat(0.0);
    for i in (0..simd_end).step_by(4) {
        let x = f32x4::from([a[i], a[i + 1], a[i + 2], a[i + 3]]);
        let y = f32x4::from([b[i], b[i + 1], b[i + 2], b[i + 3]]);
        acc = acc + x * y;
    }

    let mut sum: f32 = acc.to_array().iter().sum();
    for i in simd_end..n {
        sum += a[i] * b[i];
    }
    sum
}

/// Dense affine map `y = W·x + b`, row-major `W` of `rows x cols`.
///
/// The same type doubles as the gradient accumulator for its own shape.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Linear {
    pub rows: usize,
    pub cols: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Linear {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            weight: vec![0.0; rows * cols],
            bias: vec![0.0; rows],
        }
    }

    /// Uniform fan-in scaled weights, zero bias.
    pub fn init(rows: usize, cols: usize, scale: f32, rng: &mut Prng) -> Self {
        let bound = scale / (cols.max(1) as f32).sqrt();
        let weight = (0..rows * cols)
            .map(|_| rng.gen_range_f32(-bound, bound))
            .collect();
        Self {
            rows,
            cols,
            weight,
            bias: vec![0.0; rows],
        }
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.weight[r * self.cols..(r + 1) * self.cols]
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        debug_assert_eq!(x.len(), self.cols);
        (0..self.rows)
            .map(|r| dot(self.row(r), x) + self.bias[r])
            .collect()
    }

    /// Accumulate `dy ⊗ x` into the weights and `dy` into the bias.
    pub fn accumulate(&mut self, x: &[f32], dy: &[f32]) {
        debug_assert_eq!(x.len(), self.cols);
        debug_assert_eq!(dy.len(), self.rows);
        for (r, &g) in dy.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            let row = &mut self.weight[r * self.cols..(r + 1) * self.cols];
            for (w, &xi) in row.iter_mut().zip(x.iter()) {
                *w += g * xi;
            }
            self.bias[r] += g;
        }
    }

    /// `Wᵀ·dy`: gradient with respect to the input.
    pub fn backward_input(&self, dy: &[f32]) -> Vec<f32> {
        debug_assert_eq!(dy.len(), self.rows);
        let mut dx = vec![0.0; self.cols];
        for (r, &g) in dy.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            for (d, &w) in dx.iter_mut().zip(self.row(r).iter()) {
                *d += g * w;
            }
        }
        dx
    }
}

/// Every trainable parameter of the agent.
///
/// - `gates`: `[x; h_prev] -> [f, i, o, r, g, u]`, `6H x (I + H)`
/// - `key`: `[h; c] -> key`, `K x 2H`, shared by queries and writes
/// - `actor`: `h -> logits`, `A x H`
/// - `critic`: `h -> value`, `1 x H`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Params {
    pub gates: Linear,
    pub key: Linear,
    pub actor: Linear,
    pub critic: Linear,
}

/// Gradients share the parameter layout.
pub type Gradients = Params;

impl Params {
    pub fn init(cfg: &AgentConfig, rng: &mut Prng) -> Self {
        let h = cfg.hidden_dim;
        Self {
            gates: Linear::init(GATE_COUNT * h, cfg.input_dim + h, cfg.init_scale, rng),
            key: Linear::init(cfg.key_dim, 2 * h, cfg.init_scale, rng),
            actor: Linear::init(cfg.action_count, h, cfg.init_scale, rng),
            critic: Linear::init(1, h, cfg.init_scale, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            gates: Linear::zeros(self.gates.rows, self.gates.cols),
            key: Linear::zeros(self.key.rows, self.key.cols),
            actor: Linear::zeros(self.actor.rows, self.actor.cols),
            critic: Linear::zeros(self.critic.rows, self.critic.cols),
        }
    }

    /// Flat views in a fixed order; optimizers key their state on it.
    pub fn buffers(&self) -> [&[f32]; 8] {
        [
            self.gates.weight.as_slice(),
            self.gates.bias.as_slice(),
            self.key.weight.as_slice(),
            self.key.bias.as_slice(),
            self.actor.weight.as_slice(),
            self.actor.bias.as_slice(),
            self.critic.weight.as_slice(),
            self.critic.bias.as_slice(),
        ]
    }

    pub fn buffers_mut(&mut self) -> [&mut [f32]; 8] {
        [
            self.gates.weight.as_mut_slice(),
            self.gates.bias.as_mut_slice(),
            self.key.weight.as_mut_slice(),
            self.key.bias.as_mut_slice(),
            self.actor.weight.as_mut_slice(),
            self.actor.bias.as_mut_slice(),
            self.critic.weight.as_mut_slice(),
            self.critic.bias.as_mut_slice(),
        ]
    }

    pub fn len(&self) -> usize {
        self.buffers().iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn l2_norm(&self) -> f32 {
        self.buffers()
            .iter()
            .flat_map(|b| b.iter())
            .map(|x| x * x)
            .sum::<f32>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.buffers()
            .iter()
            .all(|b| b.iter().all(|x| x.is_finite()))
    }
}
