use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{check_len, Error, Result};
use crate::params::dot;

const NORM_EPS: f32 = 1e-8;

/// Similarity kernel between a query key and a stored key.
///
/// Larger is more similar. `NegSquaredDistance` peaks (at 0) on an exact
/// match, so it is the natural choice when a query should recover one
/// specific memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Similarity {
    #[default]
    NegSquaredDistance,
    Cosine,
    Dot,
}

impl Similarity {
    pub fn name(self) -> &'static str {
        match self {
            Self::NegSquaredDistance => "neg_squared_distance",
            Self::Cosine => "cosine",
            Self::Dot => "dot",
        }
    }

    pub fn score(self, q: &[f32], k: &[f32]) -> f32 {
        match self {
            Self::NegSquaredDistance => -q
                .iter()
                .zip(k.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>(),
            Self::Cosine => {
                let nq = dot(q, q).sqrt().max(NORM_EPS);
                let nk = dot(k, k).sqrt().max(NORM_EPS);
                dot(q, k) / (nq * nk)
            }
            Self::Dot => dot(q, k),
        }
    }

    /// Adds `scale * ∂score/∂q` into `out`.
    fn accumulate_query_grad(self, q: &[f32], k: &[f32], score: f32, scale: f32, out: &mut [f32]) {
        if scale == 0.0 {
            return;
        }
        match self {
            Self::NegSquaredDistance => {
                for ((o, &a), &b) in out.iter_mut().zip(q.iter()).zip(k.iter()) {
                    *o += scale * -2.0 * (a - b);
                }
            }
            Self::Cosine => {
                let nq_raw = dot(q, q).sqrt();
                let nq = nq_raw.max(NORM_EPS);
                let nk = dot(k, k).sqrt().max(NORM_EPS);
                // The clamped norm is constant below the floor.
                let radial = if nq_raw > NORM_EPS {
                    score / (nq * nq)
                } else {
                    0.0
                };
                for ((o, &a), &b) in out.iter_mut().zip(q.iter()).zip(k.iter()) {
                    *o += scale * (b / (nq * nk) - radial * a);
                }
            }
            Self::Dot => {
                for (o, &b) in out.iter_mut().zip(k.iter()) {
                    *o += scale * b;
                }
            }
        }
    }
}

/// Turns similarity scores into convex mixing weights.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Weighting {
    /// `softmax(score / temperature)`; smaller temperature means sharper recall.
    Softmax { temperature: f32 },
    /// All weight on the best-scoring key (earliest wins ties).
    /// Not differentiable with respect to the query.
    Nearest,
}

impl Default for Weighting {
    fn default() -> Self {
        Self::Softmax { temperature: 1.0 }
    }
}

impl Weighting {
    pub fn weights(self, scores: &[f32]) -> Vec<f32> {
        if scores.is_empty() {
            return Vec::new();
        }
        match self {
            Self::Softmax { temperature } => {
                let scaled: Vec<f32> = scores.iter().map(|s| s / temperature).collect();
                crate::heads::softmax(&scaled)
            }
            Self::Nearest => {
                let mut best = 0;
                for (i, &s) in scores.iter().enumerate() {
                    if s > scores[best] {
                        best = i;
                    }
                }
                let mut w = vec![0.0; scores.len()];
                w[best] = 1.0;
                w
            }
        }
    }
}

/// Result of one retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Recall {
    /// Weighted sum of stored values, or the caller's default.
    pub value: Vec<f32>,
    /// One weight per stored entry, in insertion order. Empty when `!found`.
    pub weights: Vec<f32>,
    pub scores: Vec<f32>,
    /// False when the store was empty ("no memory available").
    pub found: bool,
}

/// Capacity-bounded key/value memory queried by similarity.
///
/// Keys and values are parallel sequences in insertion order. Entries are
/// never modified after insertion; the only mutations are `insert` (which
/// may evict the oldest pair) and `reset`.
#[derive(Debug, Clone)]
pub struct EpisodicStore {
    capacity: usize,
    key_dim: usize,
    value_dim: usize,
    similarity: Similarity,
    weighting: Weighting,

    keys: VecDeque<Vec<f32>>,
    values: VecDeque<Vec<f32>>,
}

impl EpisodicStore {
    pub fn new(
        capacity: usize,
        key_dim: usize,
        value_dim: usize,
        similarity: Similarity,
        weighting: Weighting,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Config("memory capacity must be > 0"));
        }
        if key_dim == 0 || value_dim == 0 {
            return Err(Error::Config("memory key/value dims must be > 0"));
        }
        if let Weighting::Softmax { temperature } = weighting {
            if !(temperature > 0.0 && temperature.is_finite()) {
                return Err(Error::Config("softmax temperature must be finite and > 0"));
            }
        }
        Ok(Self {
            capacity,
            key_dim,
            value_dim,
            similarity,
            weighting,
            keys: VecDeque::with_capacity(capacity),
            values: VecDeque::with_capacity(capacity),
        })
    }

    pub fn reset(&mut self) {
        self.keys.clear();
        self.values.clear();
    }

    /// Append a pair, evicting the oldest one if the store is full.
    pub fn insert(&mut self, key: Vec<f32>, value: Vec<f32>) -> Result<()> {
        check_len("memory key", self.key_dim, key.len())?;
        check_len("memory value", self.value_dim, value.len())?;

        if self.keys.len() == self.capacity {
            self.keys.pop_front();
            self.values.pop_front();
        }
        self.keys.push_back(key);
        self.values.push_back(value);
        Ok(())
    }

    /// Similarity-weighted read. An empty store yields `default`.
    pub fn retrieve(&self, query: &[f32], default: &[f32]) -> Result<Recall> {
        check_len("query key", self.key_dim, query.len())?;
        check_len("default value", self.value_dim, default.len())?;

        if self.keys.is_empty() {
            return Ok(Recall {
                value: default.to_vec(),
                weights: Vec::new(),
                scores: Vec::new(),
                found: false,
            });
        }

        let scores: Vec<f32> = self
            .keys
            .iter()
            .map(|k| self.similarity.score(query, k))
            .collect();
        let weights = self.weighting.weights(&scores);

        let mut value = vec![0.0; self.value_dim];
        for (w, v) in weights.iter().zip(self.values.iter()) {
            if *w == 0.0 {
                continue;
            }
            for (out, x) in value.iter_mut().zip(v.iter()) {
                *out += w * x;
            }
        }

        Ok(Recall {
            value,
            weights,
            scores,
            found: true,
        })
    }

    /// Gradient of a retrieval with respect to its query.
    ///
    /// `recall` must come from `retrieve(query, ..)` on this store with no
    /// insert/reset in between. Stored keys and values are constants.
    pub fn backward(&self, query: &[f32], recall: &Recall, d_value: &[f32]) -> Vec<f32> {
        let mut d_query = vec![0.0; self.key_dim];
        if !recall.found {
            return d_query;
        }
        debug_assert_eq!(recall.weights.len(), self.keys.len());

        let temperature = match self.weighting {
            Weighting::Softmax { temperature } => temperature,
            Weighting::Nearest => return d_query,
        };

        // dL/dw_i = <v_i, dL/dm>, then back through the softmax.
        let d_weights: Vec<f32> = self.values.iter().map(|v| dot(v, d_value)).collect();
        let mean: f32 = recall
            .weights
            .iter()
            .zip(d_weights.iter())
            .map(|(w, d)| w * d)
            .sum();

        for (i, key) in self.keys.iter().enumerate() {
            let d_score = recall.weights[i] * (d_weights[i] - mean) / temperature;
            self.similarity
                .accumulate_query_grad(query, key, recall.scores[i], d_score, &mut d_query);
        }
        d_query
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn key_dim(&self) -> usize {
        self.key_dim
    }

    pub fn value_dim(&self) -> usize {
        self.value_dim
    }

    pub fn similarity(&self) -> Similarity {
        self.similarity
    }

    pub fn weighting(&self) -> Weighting {
        self.weighting
    }

    /// Stored pairs, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = (&[f32], &[f32])> + '_ {
        self.keys
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.keys.iter().map(|k| k.as_slice())
    }

    pub fn values(&self) -> impl Iterator<Item = &[f32]> + '_ {
        self.values.iter().map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize, key_dim: usize, value_dim: usize) -> EpisodicStore {
        EpisodicStore::new(
            capacity,
            key_dim,
            value_dim,
            Similarity::NegSquaredDistance,
            Weighting::default(),
        )
        .unwrap()
    }

    fn dist(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }

    #[test]
    fn retrieve_is_a_convex_combination_of_values() {
        for similarity in [Similarity::NegSquaredDistance, Similarity::Cosine, Similarity::Dot] {
            let mut s = EpisodicStore::new(8, 3, 2, similarity, Weighting::default()).unwrap();
            s.insert(vec![1.0, 0.0, 0.0], vec![1.0, 2.0]).unwrap();
            s.insert(vec![0.0, 1.0, 0.0], vec![-1.0, 0.5]).unwrap();
            s.insert(vec![0.3, 0.3, 0.9], vec![4.0, -3.0]).unwrap();

            let r = s.retrieve(&[0.2, 0.7, 0.1], &[0.0, 0.0]).unwrap();
            assert!(r.found);
            assert_eq!(r.weights.len(), 3);
            assert!(r.weights.iter().all(|w| *w >= 0.0));
            assert!((r.weights.iter().sum::<f32>() - 1.0).abs() < 1e-5);

            let mut expect = [0.0f32; 2];
            for (w, (_, v)) in r.weights.iter().zip(s.entries()) {
                expect[0] += w * v[0];
                expect[1] += w * v[1];
            }
            assert!((r.value[0] - expect[0]).abs() < 1e-5);
            assert!((r.value[1] - expect[1]).abs() < 1e-5);
        }
    }

    #[test]
    fn empty_store_returns_default() {
        let s = store(4, 2, 3);
        let r = s.retrieve(&[0.5, 0.5], &[7.0, 8.0, 9.0]).unwrap();
        assert!(!r.found);
        assert_eq!(r.value, vec![7.0, 8.0, 9.0]);
        assert!(r.weights.is_empty());
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut s = store(3, 1, 1);
        for i in 0..4 {
            s.insert(vec![i as f32], vec![i as f32 * 10.0]).unwrap();
        }
        assert_eq!(s.len(), 3);
        let keys: Vec<f32> = s.keys().map(|k| k[0]).collect();
        assert_eq!(keys, vec![1.0, 2.0, 3.0]);
        assert!(s.keys().all(|k| k[0] != 0.0));
    }

    #[test]
    fn reset_behaves_like_a_fresh_store() {
        let fresh = store(2, 2, 2);
        let mut used = store(2, 2, 2);
        used.insert(vec![1.0, 1.0], vec![2.0, 2.0]).unwrap();
        used.insert(vec![0.0, 1.0], vec![3.0, 2.0]).unwrap();
        used.reset();

        assert_eq!(used.len(), 0);
        for q in [[0.0, 0.0], [1.0, -1.0], [5.0, 2.0]] {
            assert_eq!(
                used.retrieve(&q, &[0.5, 0.5]).unwrap(),
                fresh.retrieve(&q, &[0.5, 0.5]).unwrap()
            );
        }
    }

    #[test]
    fn exact_key_recovers_its_value_after_eviction() {
        let mut s = store(2, 4, 3);
        let k1 = vec![1.0, 0.0, 0.0, 0.0];
        let k2 = vec![0.0, 1.0, 0.0, 0.0];
        let k3 = vec![0.0, 0.0, 1.0, 0.0];
        let v1 = vec![1.0, 1.0, 1.0];
        let v2 = vec![2.0, 0.0, -1.0];
        let v3 = vec![-2.0, 3.0, 0.5];

        s.insert(k1.clone(), v1).unwrap();
        s.insert(k2.clone(), v2.clone()).unwrap();
        s.insert(k3, v3.clone()).unwrap();

        assert_eq!(s.len(), 2);
        assert!(s.keys().all(|k| k != k1.as_slice()));

        let r = s.retrieve(&k2, &[0.0; 3]).unwrap();
        assert!(dist(&r.value, &v2) < dist(&r.value, &v3));

        let hard = EpisodicStore {
            weighting: Weighting::Nearest,
            ..s.clone()
        };
        let r = hard.retrieve(&k2, &[0.0; 3]).unwrap();
        assert_eq!(r.value, v2);
    }

    #[test]
    fn rejects_bad_dimensions_and_config() {
        let mut s = store(2, 2, 2);
        assert!(matches!(
            s.insert(vec![1.0], vec![1.0, 1.0]),
            Err(Error::Dimension { .. })
        ));
        assert!(s.retrieve(&[1.0, 2.0, 3.0], &[0.0, 0.0]).is_err());
        assert!(EpisodicStore::new(0, 2, 2, Similarity::Cosine, Weighting::Nearest).is_err());
        assert!(EpisodicStore::new(
            2,
            2,
            2,
            Similarity::Cosine,
            Weighting::Softmax { temperature: 0.0 }
        )
        .is_err());
    }

    #[test]
    fn query_gradient_matches_finite_differences() {
        for similarity in [Similarity::NegSquaredDistance, Similarity::Cosine, Similarity::Dot] {
            let mut s = EpisodicStore::new(
                4,
                3,
                2,
                similarity,
                Weighting::Softmax { temperature: 0.7 },
            )
            .unwrap();
            s.insert(vec![0.5, -0.2, 0.1], vec![1.0, -0.5]).unwrap();
            s.insert(vec![-0.3, 0.4, 0.8], vec![0.2, 0.9]).unwrap();
            s.insert(vec![0.1, 0.1, -0.6], vec![-1.2, 0.3]).unwrap();

            let upstream = [0.7f32, -1.3];
            let objective = |q: &[f32]| -> f32 {
                let r = s.retrieve(q, &[0.0, 0.0]).unwrap();
                r.value[0] * upstream[0] + r.value[1] * upstream[1]
            };

            let q = vec![0.2f32, 0.3, -0.1];
            let r = s.retrieve(&q, &[0.0, 0.0]).unwrap();
            let analytic = s.backward(&q, &r, &upstream);

            let eps = 1e-3;
            for i in 0..q.len() {
                let mut plus = q.clone();
                let mut minus = q.clone();
                plus[i] += eps;
                minus[i] -= eps;
                let numeric = (objective(&plus) - objective(&minus)) / (2.0 * eps);
                assert!(
                    (numeric - analytic[i]).abs() < 1e-2,
                    "{}: dq[{i}] analytic={} numeric={}",
                    similarity.name(),
                    analytic[i],
                    numeric
                );
            }
        }
    }

    #[test]
    fn nearest_weighting_has_no_query_gradient() {
        let mut s = EpisodicStore::new(2, 2, 2, Similarity::Dot, Weighting::Nearest).unwrap();
        s.insert(vec![1.0, 0.0], vec![1.0, 1.0]).unwrap();
        let q = [0.5, 0.5];
        let r = s.retrieve(&q, &[0.0, 0.0]).unwrap();
        assert_eq!(s.backward(&q, &r, &[1.0, 1.0]), vec![0.0, 0.0]);
    }
}
