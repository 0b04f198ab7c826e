//! Policy and value read-outs of the hidden state.
//!
//! Both heads are stateless: outputs depend only on `h` and the shared
//! parameters.

use crate::params::Linear;

/// Max-shifted softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|z| (z - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let lse = max + logits.iter().map(|z| (z - max).exp()).sum::<f32>().ln();
    logits.iter().map(|z| z - lse).collect()
}

/// Shannon entropy in nats; zero-probability entries contribute nothing.
pub fn entropy(probs: &[f32]) -> f32 {
    -probs
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| p * p.ln())
        .sum::<f32>()
}

/// `∂H/∂logits` for `H = entropy(softmax(logits))`.
pub fn entropy_grad_logits(probs: &[f32], log_probs: &[f32]) -> Vec<f32> {
    let h = entropy(probs);
    probs
        .iter()
        .zip(log_probs.iter())
        .map(|(p, lp)| if *p > 0.0 { -p * (lp + h) } else { 0.0 })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyOutput {
    pub logits: Vec<f32>,
    pub probs: Vec<f32>,
    pub log_probs: Vec<f32>,
}

pub fn policy_head(actor: &Linear, h: &[f32]) -> PolicyOutput {
    let logits = actor.forward(h);
    let log_probs = log_softmax(&logits);
    let probs = log_probs.iter().map(|lp| lp.exp()).collect();
    PolicyOutput {
        logits,
        probs,
        log_probs,
    }
}

pub fn value_head(critic: &Linear, h: &[f32]) -> f32 {
    critic.forward(h)[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entropy_of_known_distributions() {
        assert!((entropy(&[0.5, 0.5]) - std::f32::consts::LN_2).abs() < 1e-6);
        assert_eq!(entropy(&[1.0, 0.0]), 0.0);
    }

    #[test]
    fn policy_is_a_distribution() {
        let actor = Linear {
            rows: 3,
            cols: 2,
            weight: vec![1.0, -2.0, 0.5, 0.5, 30.0, 0.0],
            bias: vec![0.0, 0.1, -0.1],
        };
        let out = policy_head(&actor, &[1.0, 2.0]);
        assert!(out.probs.iter().all(|p| *p >= 0.0));
        assert!((out.probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        for (p, lp) in out.probs.iter().zip(out.log_probs.iter()) {
            assert!(lp.is_finite());
            assert!((p - lp.exp()).abs() < 1e-6);
        }
        assert_eq!(softmax(&out.logits).len(), 3);
    }

    #[test]
    fn value_head_is_linear() {
        let critic = Linear {
            rows: 1,
            cols: 2,
            weight: vec![2.0, -1.0],
            bias: vec![0.5],
        };
        assert_eq!(value_head(&critic, &[1.0, 3.0]), -0.5);
    }

    #[test]
    fn entropy_gradient_matches_finite_differences() {
        let z = [0.3f32, -0.8, 1.1];
        let probs = softmax(&z);
        let grad = entropy_grad_logits(&probs, &log_softmax(&z));
        let eps = 1e-3;
        for i in 0..z.len() {
            let mut plus = z;
            let mut minus = z;
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (entropy(&softmax(&plus)) - entropy(&softmax(&minus))) / (2.0 * eps);
            assert!((numeric - grad[i]).abs() < 1e-3, "i={i}");
        }
    }
}
