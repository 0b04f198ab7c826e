#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::store::{EpisodicStore, Similarity};

/// A read-only snapshot of the agent's memory and size.
///
/// Design intent:
/// - Observers cannot mutate or steer the agent.
/// - Snapshotting is *on-demand* and can allocate; the training loop stays unchanged.
/// - For per-step gate traces, enable telemetry with `Trainer::set_gate_telemetry(true)`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AgentSnapshot {
    pub epochs_started: u64,
    pub retrieval_enabled: bool,
    pub parameter_count: usize,
    pub parameter_norm: f32,

    pub store_len: usize,
    pub store_capacity: usize,
    pub similarity: String,
}

/// One stored pair, copied out of the store.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MemoryEntry {
    pub key: Vec<f32>,
    pub value: Vec<f32>,
}

pub struct AgentAdapter<'a> {
    agent: &'a Agent,
}

impl<'a> AgentAdapter<'a> {
    pub fn new(agent: &'a Agent) -> Self {
        Self { agent }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let store = self.agent.store();
        let params = self.agent.params();
        AgentSnapshot {
            epochs_started: self.agent.controller().epochs_started(),
            retrieval_enabled: self.agent.controller().retrieval_enabled(),
            parameter_count: params.len(),
            parameter_norm: params.l2_norm(),
            store_len: store.len(),
            store_capacity: store.capacity(),
            similarity: store.similarity().name().to_string(),
        }
    }

    /// Stored pairs, oldest first.
    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.agent
            .store()
            .entries()
            .map(|(k, v)| MemoryEntry {
                key: k.to_vec(),
                value: v.to_vec(),
            })
            .collect()
    }

    /// `[i][j]` = kernel score between stored keys `i` and `j`.
    pub fn key_similarity(&self) -> Vec<Vec<f32>> {
        let store = self.agent.store();
        similarity_matrix(store.similarity(), &collect(store, true))
    }

    /// Same as [`Self::key_similarity`] over the stored values.
    pub fn value_similarity(&self) -> Vec<Vec<f32>> {
        let store = self.agent.store();
        similarity_matrix(store.similarity(), &collect(store, false))
    }
}

fn collect(store: &EpisodicStore, keys: bool) -> Vec<&[f32]> {
    if keys {
        store.keys().collect()
    } else {
        store.values().collect()
    }
}

/// Pairwise kernel scores; rows are computed in parallel with `parallel`.
pub fn similarity_matrix(kernel: Similarity, items: &[&[f32]]) -> Vec<Vec<f32>> {
    let row = |a: &&[f32]| -> Vec<f32> { items.iter().map(|b| kernel.score(a, b)).collect() };

    #[cfg(feature = "parallel")]
    {
        items.par_iter().map(row).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        items.iter().map(row).collect()
    }
}
