//! Contextual choice task.
//!
//! Each trial shows a fixed context vector next to noisy evidence for one
//! of two choices. Early steps carry pure noise, so the answer can only be
//! known early by recalling what happened the last time this context was
//! seen. An epoch is `unique_trials` trials followed by the same trials in
//! shuffled order; only the first pass is memorized.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::agent::Trial;
use crate::error::{Error, Result};
use crate::prng::Prng;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TaskConfig {
    /// Observation width: half evidence, half context.
    pub obs_dim: usize,
    pub trial_length: usize,
    /// First step whose evidence is informative.
    pub noise_off_step: usize,
    /// Distinct trials per phase.
    pub unique_trials: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            obs_dim: 32,
            trial_length: 10,
            noise_off_step: 5,
            unique_trials: 30,
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> Result<()> {
        if self.obs_dim < 2 || self.obs_dim % 2 != 0 {
            return Err(Error::Config("obs_dim must be even and >= 2"));
        }
        if self.trial_length == 0 {
            return Err(Error::Config("trial_length must be > 0"));
        }
        if self.noise_off_step > self.trial_length {
            return Err(Error::Config("noise_off_step must be <= trial_length"));
        }
        if self.unique_trials == 0 {
            return Err(Error::Config("unique_trials must be > 0"));
        }
        Ok(())
    }

    pub fn evidence_dim(&self) -> usize {
        self.obs_dim / 2
    }
}

/// Generator for two-phase epochs of contextual choice trials.
#[derive(Debug, Clone)]
pub struct ContextualChoice {
    cfg: TaskConfig,
    rng: Prng,
}

impl ContextualChoice {
    pub fn new(cfg: TaskConfig, seed: u64) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            rng: Prng::new(seed),
        })
    }

    pub fn config(&self) -> &TaskConfig {
        &self.cfg
    }

    /// Observation width, i.e. the agent's `input_dim`.
    pub fn obs_dim(&self) -> usize {
        self.cfg.obs_dim
    }

    /// `2 * unique_trials` trials; the second half replays the first in a
    /// shuffled order with `memorize` off.
    pub fn sample_epoch(&mut self) -> Vec<Trial> {
        let n = self.cfg.unique_trials;
        let mut trials: Vec<Trial> = (0..n).map(|_| self.sample_trial()).collect();

        let mut order: Vec<usize> = (0..n).collect();
        self.rng.shuffle(&mut order);
        trials.reserve(n);
        for i in order {
            let mut replay = trials[i].clone();
            replay.memorize = false;
            trials.push(replay);
        }
        trials
    }

    /// A fresh first-phase trial.
    pub fn sample_trial(&mut self) -> Trial {
        let ed = self.cfg.evidence_dim();
        let label = self.rng.gen_range_usize(0, 2);
        let sign = if label == 1 { 1.0 } else { -1.0 };
        let context: Vec<f32> = (0..ed).map(|_| self.rng.gen_normal()).collect();

        let observations = (0..self.cfg.trial_length)
            .map(|t| {
                let mean = if t < self.cfg.noise_off_step { 0.0 } else { sign };
                let mut x: Vec<f32> = (0..ed).map(|_| mean + self.rng.gen_normal()).collect();
                x.extend_from_slice(&context);
                x
            })
            .collect();

        Trial {
            observations,
            targets: vec![label; self.cfg.trial_length],
            memorize: true,
        }
    }
}
