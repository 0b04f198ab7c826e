//! # dnd-lstm
//!
//! A recurrent actor-critic agent with an episodic key-value memory.
//!
//! The cell is an LSTM with two extra gates that blend a retrieved memory
//! into the cell update. At the end of chosen trials the cell state is
//! written into a capacity-bounded store; later trials query the store
//! with a learned projection of their own state. Gradients are computed by
//! hand (BPTT through the cell and the retrieval), so there is no autodiff
//! dependency.
//!
//! ## Quick Start
//!
//! ```
//! use dnd_lstm::prelude::*;
//!
//! let task_cfg = TaskConfig { unique_trials: 4, ..TaskConfig::default() };
//! let mut task = ContextualChoice::new(task_cfg, 0).unwrap();
//!
//! let agent_cfg = AgentConfig::default()
//!     .with_dims(task.obs_dim(), 16, 16, 2)
//!     .with_seed(42);
//! let agent = Agent::new(agent_cfg).unwrap();
//! let mut trainer = Trainer::new(agent, TrainConfig::default()).unwrap();
//!
//! let log = trainer.run_epoch(&task.sample_epoch()).unwrap();
//! assert_eq!(log.trials, 8);
//! assert_eq!(log.store_size, 4);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): serialization of configs, logs and parameters
//! - `parallel`: rayon-parallel similarity matrices in [`observer`]
//! - `simd`: `wide` dot products in the linear layers and kernels
//!
//! ## Modules
//!
//! - [`store`]: episodic key-value memory
//! - [`cell`]: memory-augmented LSTM step and its backward pass
//! - [`heads`]: policy and value read-outs
//! - [`controller`]: epoch/trial schedule of flushes and writes
//! - [`trajectory`]: returns and the actor-critic loss
//! - [`agent`], [`trainer`]: putting it together
//! - [`task`]: the contextual choice task
//! - [`observer`]: read-only observation adapters

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/params.rs"]
pub mod params;

#[path = "core/store.rs"]
pub mod store;

#[path = "core/heads.rs"]
pub mod heads;

#[path = "core/cell.rs"]
pub mod cell;

#[path = "core/controller.rs"]
pub mod controller;

#[path = "core/trajectory.rs"]
pub mod trajectory;

#[path = "core/optim.rs"]
pub mod optim;

#[path = "core/agent.rs"]
pub mod agent;

#[path = "core/trainer.rs"]
pub mod trainer;

#[path = "experiments/contextual_choice.rs"]
pub mod task;

pub mod observer;

pub use error::{Error, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::agent::{ActionPolicy, Agent, AgentConfig, RewardScheme, Rollout, Trial};
    pub use crate::cell::{CellState, GateCache, MemoryWrite, StepModes};
    pub use crate::controller::{EpisodeController, TrialPlan};
    pub use crate::error::{Error, Result};
    pub use crate::observer::{AgentAdapter, AgentSnapshot, MemoryEntry};
    pub use crate::optim::{Adam, Optimizer, OptimizerKind, Sgd};
    pub use crate::params::{Gradients, Params};
    pub use crate::store::{EpisodicStore, Recall, Similarity, Weighting};
    pub use crate::task::{ContextualChoice, TaskConfig};
    pub use crate::trainer::{EpochLog, TrainConfig, Trainer, TrialReport};
    pub use crate::trajectory::{a2c_loss, compute_returns, A2cLoss, Trajectory};
}
