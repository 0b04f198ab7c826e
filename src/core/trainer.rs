//! Epoch loop: rollout, A2C loss, BPTT, optimizer step, commit.
//!
//! A trial either completes all five stages or leaves the agent untouched,
//! so the loop can be stopped between any two trials.

use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tracing::{debug, info, warn};

use crate::agent::{ActionPolicy, Agent, RewardScheme, Trial};
use crate::error::{Error, Result};
use crate::optim::{Optimizer, OptimizerKind};
use crate::trajectory::{a2c_loss, compute_returns, head_gradients, A2cLoss};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TrainConfig {
    /// Discount factor; 0 makes every step its own return.
    pub gamma: f32,
    /// Weight of the entropy bonus.
    pub entropy_coef: f32,
    pub normalize_returns: bool,
    pub learning_rate: f32,
    pub optimizer: OptimizerKind,
    pub policy: ActionPolicy,
    pub reward: RewardScheme,
    /// Return an error on NaN/Inf loss instead of skipping the trial.
    pub halt_on_non_finite: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            gamma: 0.0,
            entropy_coef: 0.0,
            normalize_returns: false,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::Adam,
            policy: ActionPolicy::Sample,
            reward: RewardScheme::default(),
            halt_on_non_finite: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.gamma.is_finite() || !(0.0..=1.0).contains(&self.gamma) {
            return Err(Error::Config("gamma must be in [0, 1]"));
        }
        if !self.entropy_coef.is_finite() || self.entropy_coef < 0.0 {
            return Err(Error::Config("entropy_coef must be finite and >= 0"));
        }
        if !self.learning_rate.is_finite() || self.learning_rate < 0.0 {
            return Err(Error::Config("learning_rate must be finite and >= 0"));
        }
        if let ActionPolicy::EpsilonGreedy { epsilon } = self.policy {
            if !(0.0..=1.0).contains(&epsilon) {
                return Err(Error::Config("epsilon must be in [0, 1]"));
            }
        }
        Ok(())
    }

    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_optimizer(mut self, optimizer: OptimizerKind) -> Self {
        self.optimizer = optimizer;
        self
    }
}

/// What happened to one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialReport {
    pub reward: f32,
    pub loss: A2cLoss,
    pub correct: usize,
    /// A memory write was committed.
    pub stored: bool,
    /// The loss was non-finite and the trial left no trace.
    pub skipped: bool,
}

/// Per-epoch summary. Means are taken over the trials of the epoch.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EpochLog {
    pub epoch: usize,
    pub trials: usize,
    pub mean_return: f32,
    pub mean_entropy: f32,
    pub value_loss: f32,
    pub policy_loss: f32,
    /// Fraction of steps where the action matched the label.
    pub accuracy: f32,
    pub store_size: usize,
    pub skipped: usize,
    pub actions: Vec<Vec<usize>>,
    pub targets: Vec<Vec<usize>>,
    /// Per-trial, per-step mean retrieval gate. Empty unless gate telemetry is on.
    pub retrieval_gates: Vec<Vec<f32>>,
}

impl EpochLog {
    /// Correct rate at each time step over the trials in `trials`.
    pub fn correct_rate_by_step(&self, trials: Range<usize>) -> Vec<f32> {
        let end = trials.end.min(self.actions.len());
        let trials = trials.start.min(end)..end;
        let steps = self.actions[trials.clone()]
            .iter()
            .map(|a| a.len())
            .max()
            .unwrap_or(0);
        let mut hits = vec![0usize; steps];
        let mut counts = vec![0usize; steps];
        for m in trials {
            for (t, (a, y)) in self.actions[m].iter().zip(self.targets[m].iter()).enumerate() {
                counts[t] += 1;
                if a == y {
                    hits[t] += 1;
                }
            }
        }
        hits.iter()
            .zip(counts.iter())
            .map(|(h, c)| if *c == 0 { 0.0 } else { *h as f32 / *c as f32 })
            .collect()
    }
}

#[derive(Debug, Default)]
struct EpochAccum {
    trials: usize,
    steps: usize,
    correct: usize,
    reward: f32,
    entropy: f32,
    value_loss: f32,
    policy_loss: f32,
    skipped: usize,
    actions: Vec<Vec<usize>>,
    targets: Vec<Vec<usize>>,
    retrieval_gates: Vec<Vec<f32>>,
}

pub struct Trainer {
    cfg: TrainConfig,
    agent: Agent,
    optimizer: Box<dyn Optimizer>,
    epoch: usize,
    acc: EpochAccum,
    gate_telemetry: bool,
}

impl Trainer {
    pub fn new(agent: Agent, cfg: TrainConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            optimizer: cfg.optimizer.build(cfg.learning_rate),
            cfg,
            agent,
            epoch: 0,
            acc: EpochAccum::default(),
            gate_telemetry: false,
        })
    }

    /// Use a custom optimizer instead of the configured one.
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Record per-step mean retrieval gates into the epoch log.
    pub fn set_gate_telemetry(&mut self, enabled: bool) {
        self.gate_telemetry = enabled;
    }

    pub fn config(&self) -> &TrainConfig {
        &self.cfg
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    pub fn into_agent(self) -> Agent {
        self.agent
    }

    /// Epochs finished so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn begin_epoch(&mut self) {
        self.agent.begin_epoch();
        self.acc = EpochAccum::default();
    }

    pub fn run_trial(&mut self, trial: &Trial) -> Result<TrialReport> {
        let index = self.acc.trials;
        let rollout = self
            .agent
            .rollout(trial, &self.cfg.policy, &self.cfg.reward)?;

        let rewards = rollout.trajectory.rewards();
        let returns = compute_returns(&rewards, self.cfg.gamma, self.cfg.normalize_returns);
        let loss = a2c_loss(&rollout.trajectory, &returns, self.cfg.entropy_coef);
        let reward = rollout.trajectory.total_reward();
        let correct = rollout.correct_count();

        let grads = if loss.is_finite() {
            let heads = head_gradients(&rollout.trajectory, &returns, self.cfg.entropy_coef);
            Some(self.agent.backward(&rollout, &heads)).filter(|g| g.is_finite())
        } else {
            None
        };

        let Some(grads) = grads else {
            warn!(epoch = self.epoch, trial = index, loss = loss.total, "non-finite loss");
            if self.cfg.halt_on_non_finite {
                return Err(Error::NonFinite {
                    trial: index,
                    loss: loss.total,
                });
            }
            self.acc.trials += 1;
            self.acc.skipped += 1;
            self.acc.actions.push(rollout.actions());
            self.acc.targets.push(rollout.targets.clone());
            return Ok(TrialReport {
                reward,
                loss,
                correct,
                stored: false,
                skipped: true,
            });
        };

        self.agent.apply(self.optimizer.as_mut(), &grads);

        let acc = &mut self.acc;
        acc.trials += 1;
        acc.steps += rollout.len();
        acc.correct += correct;
        acc.reward += reward;
        acc.entropy += loss.entropy;
        acc.value_loss += loss.value;
        acc.policy_loss += loss.policy;
        acc.actions.push(rollout.actions());
        acc.targets.push(rollout.targets.clone());
        if self.gate_telemetry {
            acc.retrieval_gates
                .push(rollout.gates.iter().map(|g| g.mean_retrieval()).collect());
        }

        let stored = self.agent.commit(rollout)?;
        debug!(
            epoch = self.epoch,
            trial = index,
            reward,
            loss = loss.total,
            stored,
            store_size = self.agent.store().len(),
            "trial"
        );

        Ok(TrialReport {
            reward,
            loss,
            correct,
            stored,
            skipped: false,
        })
    }

    pub fn finish_epoch(&mut self) -> EpochLog {
        let acc = std::mem::take(&mut self.acc);
        let n = acc.trials.max(1) as f32;
        let log = EpochLog {
            epoch: self.epoch,
            trials: acc.trials,
            mean_return: acc.reward / n,
            mean_entropy: acc.entropy / n,
            value_loss: acc.value_loss / n,
            policy_loss: acc.policy_loss / n,
            accuracy: if acc.steps == 0 {
                0.0
            } else {
                acc.correct as f32 / acc.steps as f32
            },
            store_size: self.agent.store().len(),
            skipped: acc.skipped,
            actions: acc.actions,
            targets: acc.targets,
            retrieval_gates: acc.retrieval_gates,
        };
        info!(
            epoch = log.epoch,
            ret = log.mean_return,
            ent = log.mean_entropy,
            val = log.value_loss,
            pol = log.policy_loss,
            acc = log.accuracy,
            mem = log.store_size,
            "epoch"
        );
        self.epoch += 1;
        log
    }

    /// Flush memory, run every trial in order and summarize.
    pub fn run_epoch(&mut self, trials: &[Trial]) -> Result<EpochLog> {
        self.begin_epoch();
        for trial in trials {
            self.run_trial(trial)?;
        }
        Ok(self.finish_epoch())
    }
}
