#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cell::{self, CellState, GateCache, MemoryWrite, StepCache, StepGrad};
use crate::controller::EpisodeController;
use crate::error::{check_len, Error, Result};
use crate::optim::Optimizer;
use crate::params::{Gradients, Params};
use crate::prng::Prng;
use crate::store::{EpisodicStore, Similarity, Weighting};
use crate::trajectory::{HeadGrad, Trajectory, TrajectoryStep};

/// Architecture and memory configuration of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AgentConfig {
    pub input_dim: usize,
    pub hidden_dim: usize,
    /// Width of the learned key projection used for queries and writes.
    pub key_dim: usize,
    pub action_count: usize,

    /// Stored pairs before the oldest is evicted.
    pub memory_capacity: usize,
    pub similarity: Similarity,
    pub weighting: Weighting,

    /// Constant that `h_0` and `c_0` are filled with at every trial start.
    pub initial_state: f32,
    /// Scale of the uniform fan-in weight init.
    pub init_scale: f32,

    // If set, makes init and action sampling reproducible.
    pub seed: Option<u64>,
}

impl Default for AgentConfig {
    /// 32-dim observations, 32 hidden units, two actions and room for 100
    /// memories, matching the contextual choice demo.
    fn default() -> Self {
        Self {
            input_dim: 32,
            hidden_dim: 32,
            key_dim: 32,
            action_count: 2,
            memory_capacity: 100,
            similarity: Similarity::default(),
            weighting: Weighting::default(),
            initial_state: 0.0,
            init_scale: 1.0,
            seed: None,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(Error::Config("input_dim must be > 0"));
        }
        if self.hidden_dim == 0 {
            return Err(Error::Config("hidden_dim must be > 0"));
        }
        if self.key_dim == 0 {
            return Err(Error::Config("key_dim must be > 0"));
        }
        if self.action_count < 2 {
            return Err(Error::Config("action_count must be >= 2"));
        }
        if self.memory_capacity == 0 {
            return Err(Error::Config("memory_capacity must be > 0"));
        }
        if let Weighting::Softmax { temperature } = self.weighting {
            if !temperature.is_finite() || temperature <= 0.0 {
                return Err(Error::Config("softmax temperature must be finite and > 0"));
            }
        }
        if !self.initial_state.is_finite() {
            return Err(Error::Config("initial_state must be finite"));
        }
        if !self.init_scale.is_finite() || self.init_scale < 0.0 {
            return Err(Error::Config("init_scale must be finite and >= 0"));
        }
        Ok(())
    }

    /// Set observation, hidden, key and action sizes at once.
    pub fn with_dims(mut self, input: usize, hidden: usize, key: usize, actions: usize) -> Self {
        self.input_dim = input;
        self.hidden_dim = hidden;
        self.key_dim = key;
        self.action_count = actions;
        self
    }

    /// Set the random seed for reproducibility.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_memory(mut self, capacity: usize, similarity: Similarity, weighting: Weighting) -> Self {
        self.memory_capacity = capacity;
        self.similarity = similarity;
        self.weighting = weighting;
        self
    }
}

/// One task instance: an observation and a label per step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Trial {
    pub observations: Vec<Vec<f32>>,
    pub targets: Vec<usize>,
    /// Write the last step's state into the store.
    pub memorize: bool,
}

impl Trial {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// By convention a memorized trial writes on its final step.
    pub fn write_step(&self) -> Option<usize> {
        if self.memorize {
            self.len().checked_sub(1)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RewardScheme {
    pub correct: f32,
    pub incorrect: f32,
}

impl Default for RewardScheme {
    fn default() -> Self {
        Self {
            correct: 1.0,
            incorrect: 0.0,
        }
    }
}

impl RewardScheme {
    #[inline]
    pub fn reward(&self, action: usize, target: usize) -> f32 {
        if action == target {
            self.correct
        } else {
            self.incorrect
        }
    }
}

/// How an action is picked from the policy distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ActionPolicy {
    /// Draw from the distribution (training).
    #[default]
    Sample,
    /// Most probable action; ties go to the lowest index.
    Deterministic,
    EpsilonGreedy { epsilon: f32 },
}

impl ActionPolicy {
    pub fn select(&self, probs: &[f32], rng: &mut Prng) -> usize {
        match *self {
            Self::Sample => rng.sample_categorical(probs),
            Self::Deterministic => argmax(probs),
            Self::EpsilonGreedy { epsilon } => {
                if rng.next_f32_01() < epsilon {
                    rng.gen_range_usize(0, probs.len())
                } else {
                    argmax(probs)
                }
            }
        }
    }
}

fn argmax(v: &[f32]) -> usize {
    let mut best = 0;
    for (i, x) in v.iter().enumerate() {
        if *x > v[best] {
            best = i;
        }
    }
    best
}

/// Everything one trial's forward pass produced.
///
/// A rollout is tied to the store contents it was computed against: run
/// [`Agent::backward`] before [`Agent::commit`].
#[derive(Debug, Clone)]
pub struct Rollout {
    pub trajectory: Trajectory,
    pub targets: Vec<usize>,
    pub gates: Vec<GateCache>,
    caches: Vec<StepCache>,
    write: Option<MemoryWrite>,
}

impl Rollout {
    pub fn len(&self) -> usize {
        self.trajectory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectory.is_empty()
    }

    pub fn actions(&self) -> Vec<usize> {
        self.trajectory.steps().iter().map(|s| s.action).collect()
    }

    pub fn correct_count(&self) -> usize {
        self.trajectory
            .steps()
            .iter()
            .zip(self.targets.iter())
            .filter(|(s, t)| s.action == **t)
            .count()
    }

    pub fn staged_write(&self) -> Option<&MemoryWrite> {
        self.write.as_ref()
    }
}

/// The memory-augmented actor-critic: parameters, episodic store and the
/// controller that schedules them.
#[derive(Debug, Clone)]
pub struct Agent {
    cfg: AgentConfig,
    params: Params,
    store: EpisodicStore,
    controller: EpisodeController,
    rng: Prng,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        cfg.validate()?;
        let mut rng = Prng::new(cfg.seed.unwrap_or(0));
        let mut init_rng = rng.fork();
        let params = Params::init(&cfg, &mut init_rng);
        let store = EpisodicStore::new(
            cfg.memory_capacity,
            cfg.key_dim,
            cfg.hidden_dim,
            cfg.similarity,
            cfg.weighting,
        )?;
        Ok(Self {
            cfg,
            params,
            store,
            controller: EpisodeController::new(cfg.hidden_dim, cfg.initial_state),
            rng,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn store(&self) -> &EpisodicStore {
        &self.store
    }

    pub fn controller(&self) -> &EpisodeController {
        &self.controller
    }

    /// Flush memory and re-enable retrieval.
    pub fn begin_epoch(&mut self) {
        self.controller.begin_epoch(&mut self.store);
    }

    pub fn set_retrieval(&mut self, enabled: bool) {
        self.controller.set_retrieval(enabled);
    }

    /// Run a trial forward, picking actions with `policy`.
    pub fn rollout(
        &mut self,
        trial: &Trial,
        policy: &ActionPolicy,
        reward: &RewardScheme,
    ) -> Result<Rollout> {
        let mut rng = self.rng.clone();
        let out = self.rollout_with(trial, reward, |_, probs| policy.select(probs, &mut rng));
        self.rng = rng;
        out
    }

    /// Run a trial forward with a caller-supplied chooser `(t, probs) -> action`.
    ///
    /// The store is only read; a memorized trial's write is staged in the
    /// returned [`Rollout`].
    pub fn rollout_with<F>(&self, trial: &Trial, reward: &RewardScheme, mut choose: F) -> Result<Rollout>
    where
        F: FnMut(usize, &[f32]) -> usize,
    {
        check_len("targets", trial.len(), trial.targets.len())?;
        let plan = self.controller.begin_trial(trial.len(), trial.write_step())?;

        let mut trajectory = Trajectory::with_capacity(trial.len());
        let mut gates = Vec::with_capacity(trial.len());
        let mut caches = Vec::with_capacity(trial.len());
        let mut write = None;
        let mut state: CellState = plan.initial.clone();

        for (t, (x, &target)) in trial.observations.iter().zip(trial.targets.iter()).enumerate() {
            if target >= self.cfg.action_count {
                return Err(Error::Dimension {
                    what: "target label",
                    expected: self.cfg.action_count,
                    got: target,
                });
            }
            let out = cell::step(&self.params, &self.store, x, &state, plan.modes_at(t))?;
            let action = choose(t, &out.policy.probs).min(self.cfg.action_count - 1);

            trajectory.push(TrajectoryStep {
                action,
                reward: reward.reward(action, target),
                value: out.value,
                probs: out.policy.probs,
                log_probs: out.policy.log_probs,
            });
            gates.push(out.gates);
            caches.push(out.cache);
            if out.write.is_some() {
                write = out.write;
            }
            state = out.state;
        }

        Ok(Rollout {
            trajectory,
            targets: trial.targets.clone(),
            gates,
            caches,
            write,
        })
    }

    /// BPTT over one rollout, seeded by per-step head gradients.
    ///
    /// Must run against the same store contents the rollout saw.
    pub fn backward(&self, rollout: &Rollout, head_grads: &[HeadGrad]) -> Gradients {
        debug_assert_eq!(rollout.caches.len(), head_grads.len());

        let hd = self.cfg.hidden_dim;
        let mut grads = self.params.zeros_like();
        let mut dh = vec![0.0; hd];
        let mut dc = vec![0.0; hd];
        for (cache, hg) in rollout.caches.iter().zip(head_grads.iter()).rev() {
            let upstream = StepGrad {
                d_logits: &hg.d_logits,
                d_value: hg.d_value,
                d_h_next: &dh,
                d_c_next: &dc,
            };
            let (dh_prev, dc_prev) =
                cell::backward_step(&self.params, &self.store, cache, upstream, &mut grads);
            dh = dh_prev;
            dc = dc_prev;
        }
        grads
    }

    pub fn apply(&mut self, optimizer: &mut dyn Optimizer, grads: &Gradients) {
        optimizer.step(&mut self.params, grads);
    }

    /// Commit the rollout's staged write. Returns whether anything was stored.
    pub fn commit(&mut self, rollout: Rollout) -> Result<bool> {
        self.controller.commit(&mut self.store, rollout.write)
    }
}
