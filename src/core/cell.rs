//! Memory-augmented LSTM cell.
//!
//! Per step:
//!
//! ```text
//! [f, i, o, r, g] = sigmoid(W·[x; h_prev] + b)     u = tanh(..)
//! m   = retrieve(W_k·[h_prev; c_prev] + b_k)        (0 when retrieval is off)
//! c   = f⊙c_prev + i⊙u + r⊙g⊙m
//! h   = o⊙tanh(c)
//! ```
//!
//! The forward pass keeps a `StepCache` so the trainer can run BPTT over a
//! whole trial without an autodiff tape.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{check_len, Result};
use crate::heads::{policy_head, value_head, PolicyOutput};
use crate::params::Params;
use crate::store::{EpisodicStore, Recall};

/// Row blocks of the gate transform, in order: f, i, o, r, g, u.
pub const GATE_COUNT: usize = 6;

const FORGET: usize = 0;
const INPUT: usize = 1;
const OUTPUT: usize = 2;
const RETRIEVAL: usize = 3;
const MEMORY: usize = 4;
const CANDIDATE: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    pub h: Vec<f32>,
    pub c: Vec<f32>,
}

impl CellState {
    pub fn filled(hidden_dim: usize, value: f32) -> Self {
        Self {
            h: vec![value; hidden_dim],
            c: vec![value; hidden_dim],
        }
    }
}

/// What the cell may do with the store on this step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepModes {
    /// Stage a write of the post-update state.
    pub encode: bool,
    /// Query the store with the pre-update state.
    pub retrieve: bool,
}

/// Gate activations of one step, for logging and analysis only.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GateCache {
    pub forget: Vec<f32>,
    pub input: Vec<f32>,
    pub output: Vec<f32>,
    pub retrieval: Vec<f32>,
    pub memory: Vec<f32>,
    /// The retrieved value `m` fed into the update.
    pub recalled: Vec<f32>,
}

impl GateCache {
    pub fn mean_retrieval(&self) -> f32 {
        mean(&self.retrieval)
    }
}

/// A snapshot staged for insertion into the store.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryWrite {
    pub key: Vec<f32>,
    pub value: Vec<f32>,
}

#[derive(Debug, Clone)]
struct RetrievalTrace {
    hc_prev: Vec<f32>,
    query: Vec<f32>,
    recall: Recall,
}

/// Forward intermediates needed by `backward_step`.
#[derive(Debug, Clone)]
pub struct StepCache {
    xh: Vec<f32>,
    c_prev: Vec<f32>,
    // Post-activation gates, each `hidden_dim` long.
    gates: [Vec<f32>; GATE_COUNT],
    recalled: Vec<f32>,
    tanh_c: Vec<f32>,
    h: Vec<f32>,
    retrieval: Option<RetrievalTrace>,
}

#[derive(Debug)]
pub struct StepOutput {
    pub policy: PolicyOutput,
    pub value: f32,
    pub state: CellState,
    pub gates: GateCache,
    /// Present only on encoding steps; committed by the controller.
    pub write: Option<MemoryWrite>,
    pub cache: StepCache,
}

/// Upstream gradients arriving at one step.
#[derive(Debug, Clone)]
pub struct StepGrad<'a> {
    pub d_logits: &'a [f32],
    pub d_value: f32,
    /// `dL/dh_t` and `dL/dc_t` carried back from step `t + 1`.
    pub d_h_next: &'a [f32],
    pub d_c_next: &'a [f32],
}

/// One recurrent step. The store is only read; writes are staged.
pub fn step(
    params: &Params,
    store: &EpisodicStore,
    x: &[f32],
    prev: &CellState,
    modes: StepModes,
) -> Result<StepOutput> {
    let hd = params.gates.rows / GATE_COUNT;
    check_len("hidden state", hd, prev.h.len())?;
    check_len("cell state", hd, prev.c.len())?;
    check_len("observation", params.gates.cols - hd, x.len())?;

    let mut xh = Vec::with_capacity(x.len() + hd);
    xh.extend_from_slice(x);
    xh.extend_from_slice(&prev.h);

    let no_memory = vec![0.0; hd];
    let mut retrieval = None;
    let mut recalled = no_memory.clone();
    if modes.retrieve {
        let hc_prev = concat(&prev.h, &prev.c);
        let query = params.key.forward(&hc_prev);
        let recall = store.retrieve(&query, &no_memory)?;
        if recall.found {
            recalled.copy_from_slice(&recall.value);
            retrieval = Some(RetrievalTrace {
                hc_prev,
                query,
                recall,
            });
        }
    }

    let z = params.gates.forward(&xh);
    let gates: [Vec<f32>; GATE_COUNT] = core::array::from_fn(|k| {
        let block = &z[k * hd..(k + 1) * hd];
        if k == CANDIDATE {
            block.iter().map(|v| v.tanh()).collect()
        } else {
            block.iter().map(|v| sigmoid(*v)).collect()
        }
    });

    let mut c = vec![0.0; hd];
    for j in 0..hd {
        c[j] = gates[FORGET][j] * prev.c[j]
            + gates[INPUT][j] * gates[CANDIDATE][j]
            + gates[RETRIEVAL][j] * gates[MEMORY][j] * recalled[j];
    }
    let tanh_c: Vec<f32> = c.iter().map(|v| v.tanh()).collect();
    let h: Vec<f32> = gates[OUTPUT]
        .iter()
        .zip(tanh_c.iter())
        .map(|(o, t)| o * t)
        .collect();

    let policy = policy_head(&params.actor, &h);
    let value = value_head(&params.critic, &h);

    let write = modes.encode.then(|| MemoryWrite {
        key: params.key.forward(&concat(&h, &c)),
        value: c.clone(),
    });

    let gate_cache = GateCache {
        forget: gates[FORGET].clone(),
        input: gates[INPUT].clone(),
        output: gates[OUTPUT].clone(),
        retrieval: gates[RETRIEVAL].clone(),
        memory: gates[MEMORY].clone(),
        recalled: recalled.clone(),
    };

    Ok(StepOutput {
        policy,
        value,
        state: CellState {
            h: h.clone(),
            c,
        },
        gates: gate_cache,
        write,
        cache: StepCache {
            xh,
            c_prev: prev.c.clone(),
            gates,
            recalled,
            tanh_c,
            h,
            retrieval,
        },
    })
}

/// Back-propagate one step, accumulating into `grads`.
///
/// Returns `(dL/dh_{t-1}, dL/dc_{t-1})`. `store` must hold exactly the
/// entries it held during the forward step.
pub fn backward_step(
    params: &Params,
    store: &EpisodicStore,
    cache: &StepCache,
    upstream: StepGrad<'_>,
    grads: &mut Params,
) -> (Vec<f32>, Vec<f32>) {
    let hd = cache.h.len();
    let input_dim = cache.xh.len() - hd;

    // Heads.
    grads.actor.accumulate(&cache.h, upstream.d_logits);
    grads.critic.accumulate(&cache.h, &[upstream.d_value]);
    let mut dh = params.actor.backward_input(upstream.d_logits);
    for (d, w) in dh.iter_mut().zip(params.critic.row(0).iter()) {
        *d += upstream.d_value * w;
    }
    for (d, n) in dh.iter_mut().zip(upstream.d_h_next.iter()) {
        *d += n;
    }

    let g = &cache.gates;
    let mut dz = vec![0.0; GATE_COUNT * hd];
    let mut dc_prev = vec![0.0; hd];
    let mut d_recalled = vec![0.0; hd];

    for j in 0..hd {
        let t = cache.tanh_c[j];
        let dc = upstream.d_c_next[j] + dh[j] * g[OUTPUT][j] * (1.0 - t * t);

        let d_out = dh[j] * t;
        let d_forget = dc * cache.c_prev[j];
        let d_input = dc * g[CANDIDATE][j];
        let d_cand = dc * g[INPUT][j];
        let d_retr = dc * g[MEMORY][j] * cache.recalled[j];
        let d_mem = dc * g[RETRIEVAL][j] * cache.recalled[j];

        dz[FORGET * hd + j] = d_forget * dsigmoid(g[FORGET][j]);
        dz[INPUT * hd + j] = d_input * dsigmoid(g[INPUT][j]);
        dz[OUTPUT * hd + j] = d_out * dsigmoid(g[OUTPUT][j]);
        dz[RETRIEVAL * hd + j] = d_retr * dsigmoid(g[RETRIEVAL][j]);
        dz[MEMORY * hd + j] = d_mem * dsigmoid(g[MEMORY][j]);
        dz[CANDIDATE * hd + j] = d_cand * (1.0 - g[CANDIDATE][j] * g[CANDIDATE][j]);

        dc_prev[j] = dc * g[FORGET][j];
        d_recalled[j] = dc * g[RETRIEVAL][j] * g[MEMORY][j];
    }

    grads.gates.accumulate(&cache.xh, &dz);
    let dxh = params.gates.backward_input(&dz);
    let mut dh_prev = dxh[input_dim..].to_vec();

    if let Some(trace) = &cache.retrieval {
        let d_query = store.backward(&trace.query, &trace.recall, &d_recalled);
        grads.key.accumulate(&trace.hc_prev, &d_query);
        let dhc = params.key.backward_input(&d_query);
        for j in 0..hd {
            dh_prev[j] += dhc[j];
            dc_prev[j] += dhc[hd + j];
        }
    }

    (dh_prev, dc_prev)
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative expressed through the activation `s = sigmoid(x)`.
#[inline]
fn dsigmoid(s: f32) -> f32 {
    s * (1.0 - s)
}

fn concat(a: &[f32], b: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

fn mean(v: &[f32]) -> f32 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f32>() / v.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentConfig;
    use crate::error::Error;
    use crate::prng::Prng;
    use crate::store::{Similarity, Weighting};

    fn setup() -> (Params, EpisodicStore) {
        let cfg = AgentConfig::default().with_dims(3, 4, 2, 2);
        let params = Params::init(&cfg, &mut Prng::new(9));
        let store =
            EpisodicStore::new(4, 2, 4, Similarity::NegSquaredDistance, Weighting::default())
                .unwrap();
        (params, store)
    }

    #[test]
    fn gates_are_unit_interval_and_outputs_are_consistent() {
        let (params, store) = setup();
        let prev = CellState::filled(4, 0.1);
        let out = step(
            &params,
            &store,
            &[0.5, -1.0, 2.0],
            &prev,
            StepModes::default(),
        )
        .unwrap();

        for gate in [
            &out.gates.forget,
            &out.gates.input,
            &out.gates.output,
            &out.gates.retrieval,
            &out.gates.memory,
        ] {
            assert_eq!(gate.len(), 4);
            assert!(gate.iter().all(|v| (0.0..=1.0).contains(v)));
        }
        assert_eq!(out.gates.recalled, vec![0.0; 4]);
        assert!((out.policy.probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(out.write.is_none());
        for j in 0..4 {
            assert!((out.state.h[j] - out.gates.output[j] * out.state.c[j].tanh()).abs() < 1e-6);
        }
    }

    #[test]
    fn retrieved_value_enters_cell_through_both_gates() {
        let (params, mut store) = setup();
        store
            .insert(vec![0.3, -0.2], vec![1.0, -2.0, 0.5, 3.0])
            .unwrap();

        let prev = CellState::filled(4, 0.2);
        let x = [1.0, 0.0, -1.0];
        let off = step(&params, &store, &x, &prev, StepModes::default()).unwrap();
        let on = step(
            &params,
            &store,
            &x,
            &prev,
            StepModes {
                encode: false,
                retrieve: true,
            },
        )
        .unwrap();

        // A single entry gets all the weight.
        assert_eq!(on.gates.recalled, vec![1.0, -2.0, 0.5, 3.0]);
        for j in 0..4 {
            let blend = on.gates.retrieval[j] * on.gates.memory[j] * on.gates.recalled[j];
            assert!((on.state.c[j] - off.state.c[j] - blend).abs() < 1e-6);
        }
    }

    #[test]
    fn retrieval_on_empty_store_uses_no_memory_default() {
        let (params, store) = setup();
        let prev = CellState::filled(4, 0.0);
        let modes = StepModes {
            encode: false,
            retrieve: true,
        };
        let out = step(&params, &store, &[0.1, 0.2, 0.3], &prev, modes).unwrap();
        assert_eq!(out.gates.recalled, vec![0.0; 4]);
        assert!(out.cache.retrieval.is_none());
    }

    #[test]
    fn encoding_stages_key_and_cell_snapshot() {
        let (params, store) = setup();
        let prev = CellState::filled(4, 0.0);
        let modes = StepModes {
            encode: true,
            retrieve: false,
        };
        let out = step(&params, &store, &[0.1, 0.2, 0.3], &prev, modes).unwrap();
        let write = out.write.expect("encoding step stages a write");
        assert_eq!(write.key.len(), 2);
        assert_eq!(write.value, out.state.c);
        assert!(store.is_empty());
    }

    #[test]
    fn wrong_observation_size_is_rejected() {
        let (params, store) = setup();
        let prev = CellState::filled(4, 0.0);
        let err = step(&params, &store, &[1.0], &prev, StepModes::default())
            .err()
            .unwrap();
        assert_eq!(
            err,
            Error::Dimension {
                what: "observation",
                expected: 3,
                got: 1
            }
        );
    }
}
