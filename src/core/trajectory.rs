#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::heads::{entropy, entropy_grad_logits};

/// One step of a trial as seen by the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryStep {
    pub action: usize,
    pub reward: f32,
    pub value: f32,
    pub probs: Vec<f32>,
    pub log_probs: Vec<f32>,
}

impl TrajectoryStep {
    pub fn log_prob(&self) -> f32 {
        self.log_probs[self.action]
    }
}

/// Ordered per-step outputs of a single trial.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            steps: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, step: TrajectoryStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn rewards(&self) -> Vec<f32> {
        self.steps.iter().map(|s| s.reward).collect()
    }

    pub fn total_reward(&self) -> f32 {
        self.steps.iter().map(|s| s.reward).sum()
    }

    /// Summed policy entropy over the trial.
    pub fn entropy(&self) -> f32 {
        self.steps.iter().map(|s| entropy(&s.probs)).sum()
    }
}

/// Discounted returns, back to front: `G_t = r_t + gamma * G_{t+1}`.
///
/// With `normalize`, returns are standardized; trials shorter than two
/// steps are left as-is.
pub fn compute_returns(rewards: &[f32], gamma: f32, normalize: bool) -> Vec<f32> {
    let mut returns = vec![0.0; rewards.len()];
    let mut g = 0.0;
    for (t, r) in rewards.iter().enumerate().rev() {
        g = r + gamma * g;
        returns[t] = g;
    }

    if normalize && returns.len() >= 2 {
        let n = returns.len() as f32;
        let mean = returns.iter().sum::<f32>() / n;
        let var = returns.iter().map(|g| (g - mean) * (g - mean)).sum::<f32>() / n;
        let std = var.sqrt();
        for g in returns.iter_mut() {
            *g = (*g - mean) / (std + 1e-5);
        }
    }
    returns
}

/// Actor-critic loss terms of one trial.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct A2cLoss {
    pub policy: f32,
    pub value: f32,
    /// Summed entropy `H` (before scaling by the coefficient).
    pub entropy: f32,
    /// `value + policy - entropy_coef * entropy`
    pub total: f32,
}

impl A2cLoss {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite()
    }
}

/// The advantage `G_t - V_t` is a constant in the policy term.
pub fn a2c_loss(trajectory: &Trajectory, returns: &[f32], entropy_coef: f32) -> A2cLoss {
    debug_assert_eq!(trajectory.len(), returns.len());

    let mut policy = 0.0;
    let mut value = 0.0;
    for (step, g) in trajectory.steps().iter().zip(returns.iter()) {
        let advantage = g - step.value;
        policy -= step.log_prob() * advantage;
        value += advantage * advantage;
    }
    let entropy = trajectory.entropy();

    A2cLoss {
        policy,
        value,
        entropy,
        total: value + policy - entropy_coef * entropy,
    }
}

/// Loss gradient at the heads of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadGrad {
    pub d_logits: Vec<f32>,
    pub d_value: f32,
}

/// Per-step `dL/dlogits` and `dL/dV` for `a2c_loss`.
pub fn head_gradients(trajectory: &Trajectory, returns: &[f32], entropy_coef: f32) -> Vec<HeadGrad> {
    trajectory
        .steps()
        .iter()
        .zip(returns.iter())
        .map(|(step, g)| {
            let advantage = g - step.value;
            let d_entropy = entropy_grad_logits(&step.probs, &step.log_probs);
            let d_logits = step
                .probs
                .iter()
                .zip(d_entropy.iter())
                .enumerate()
                .map(|(j, (p, dh))| {
                    let onehot = if j == step.action { 1.0 } else { 0.0 };
                    advantage * (p - onehot) - entropy_coef * dh
                })
                .collect();
            HeadGrad {
                d_logits,
                d_value: -2.0 * advantage,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heads::{log_softmax, softmax};

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < 1e-5)
    }

    fn step_from_logits(z: &[f32], action: usize, reward: f32, value: f32) -> TrajectoryStep {
        TrajectoryStep {
            action,
            reward,
            value,
            probs: softmax(z),
            log_probs: log_softmax(z),
        }
    }

    #[test]
    fn undiscounted_and_discounted_returns() {
        assert!(close(&compute_returns(&[1.0, 1.0, 1.0], 1.0, false), &[3.0, 2.0, 1.0]));
        assert!(close(&compute_returns(&[1.0, 1.0, 1.0], 0.5, false), &[1.75, 1.5, 1.0]));
        assert!(close(&compute_returns(&[0.0, 2.0], 0.0, false), &[0.0, 2.0]));
        assert!(compute_returns(&[], 0.9, true).is_empty());
    }

    #[test]
    fn normalized_returns_are_standardized() {
        let g = compute_returns(&[1.0, 0.0, 3.0, 2.0], 0.9, true);
        let mean = g.iter().sum::<f32>() / 4.0;
        let var = g.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
        assert_eq!(compute_returns(&[5.0], 0.9, true), vec![5.0]);
    }

    #[test]
    fn loss_terms_by_hand() {
        let mut traj = Trajectory::default();
        // p = [0.5, 0.5], action 0, V = 0.25, G = 1.0 -> A = 0.75
        traj.push(step_from_logits(&[0.0, 0.0], 0, 1.0, 0.25));
        let returns = compute_returns(&traj.rewards(), 1.0, false);
        let loss = a2c_loss(&traj, &returns, 0.1);

        let ln2 = std::f32::consts::LN_2;
        assert!((loss.policy - ln2 * 0.75).abs() < 1e-6);
        assert!((loss.value - 0.5625).abs() < 1e-6);
        assert!((loss.entropy - ln2).abs() < 1e-6);
        assert!((loss.total - (0.5625 + ln2 * 0.75 - 0.1 * ln2)).abs() < 1e-6);
        assert!(loss.is_finite());
    }

    #[test]
    fn zero_entropy_coefficient_drops_the_bonus() {
        let mut traj = Trajectory::default();
        traj.push(step_from_logits(&[0.3, -0.2, 1.0], 2, 1.0, 0.0));
        traj.push(step_from_logits(&[0.1, 0.4, -0.5], 1, 0.0, 0.5));
        let returns = compute_returns(&traj.rewards(), 0.9, false);
        let loss = a2c_loss(&traj, &returns, 0.0);
        assert_eq!(loss.total, loss.value + loss.policy);
    }

    #[test]
    fn head_gradients_match_frozen_advantage_surrogate() {
        let z = [0.4f32, -0.3, 0.9];
        let (action, reward, value, eta) = (1usize, 1.0f32, 0.2f32, 0.05f32);
        let advantage = reward - value;

        // Surrogate with the advantage held fixed, as the policy gradient does.
        let surrogate = |z: &[f32], v: f32| -> f32 {
            let lp = log_softmax(z);
            (reward - v) * (reward - v) - lp[action] * advantage - eta * entropy(&softmax(z))
        };

        let mut traj = Trajectory::default();
        traj.push(step_from_logits(&z, action, reward, value));
        let grads = head_gradients(&traj, &[reward], eta);

        let eps = 1e-3;
        for j in 0..z.len() {
            let mut plus = z;
            let mut minus = z;
            plus[j] += eps;
            minus[j] -= eps;
            let numeric = (surrogate(&plus, value) - surrogate(&minus, value)) / (2.0 * eps);
            assert!((numeric - grads[0].d_logits[j]).abs() < 1e-3, "j={j}");
        }
        let numeric_v =
            (surrogate(&z, value + eps) - surrogate(&z, value - eps)) / (2.0 * eps);
        assert!((numeric_v - grads[0].d_value).abs() < 1e-3);
    }
}
