//! Inference oracles.
//!
//! Learners treat inference as a black box: an oracle receives unary scores
//! and pairwise compatibility matrices and returns a labeling maximizing the
//! total score. Oracles are allowed to be approximate. A learner's margin
//! guarantees only hold for exact oracles; with an approximate one training
//! may need more iterations or stop before the true optimum. Learners report
//! detected approximations through `log::warn!`.

mod exhaustive;
mod icm;
mod max_product;

use core::fmt;
use core::str::FromStr;

use std::sync::Arc;

use bincode::{Decode, Encode};

use crate::errors::{Result, SsvmError};

pub use exhaustive::Exhaustive;
pub use icm::Icm;
pub use max_product::MaxProduct;

/// Score given to states an oracle must not choose.
pub(crate) const CLAMPED_SCORE: f64 = -1e12;

/// Numeric input of an inference problem.
#[derive(Clone, Copy, Debug)]
pub struct Potentials<'a> {
    /// Number of states per node.
    pub n_states: usize,

    /// Row-major unary scores of shape `[n_nodes, n_states]`.
    pub unary: &'a [f64],

    /// Edges as `(source, target)` node pairs.
    pub edges: &'a [(usize, usize)],

    /// Class of each edge selecting its pairwise matrix.
    pub edge_classes: &'a [usize],

    /// Pairwise matrices of shape `[n_classes, n_states, n_states]`. Rows are
    /// indexed by the source state.
    pub pairwise: &'a [f64],
}

impl Potentials<'_> {
    /// Gets the number of nodes.
    #[inline(always)]
    pub fn n_nodes(&self) -> usize {
        self.unary.len() / self.n_states
    }

    /// Gets the unary scores of a node.
    #[inline(always)]
    pub fn unary_of(&self, i: usize) -> &[f64] {
        &self.unary[i * self.n_states..(i + 1) * self.n_states]
    }

    /// Gets the pairwise score of edge `e` with the given endpoint states.
    #[inline(always)]
    pub fn pairwise_of(&self, e: usize, s: usize, t: usize) -> f64 {
        let n = self.n_states;
        self.pairwise[self.edge_classes[e] * n * n + s * n + t]
    }

    /// Computes the total score of an integral labeling.
    pub fn score(&self, labels: &[usize]) -> f64 {
        let mut score = 0.0;
        for (i, &s) in labels.iter().enumerate() {
            score += self.unary_of(i)[s];
        }
        for (e, &(i, j)) in self.edges.iter().enumerate() {
            score += self.pairwise_of(e, labels[i], labels[j]);
        }
        score
    }

    fn validate(&self) -> Result<()> {
        if self.n_states == 0 || self.unary.len() % self.n_states != 0 {
            return Err(SsvmError::inference("unary scores do not match n_states"));
        }
        if self.edges.len() != self.edge_classes.len() {
            return Err(SsvmError::inference("every edge needs a class"));
        }
        let n_classes = self.pairwise.len() / (self.n_states * self.n_states);
        let n_nodes = self.n_nodes();
        for (&(i, j), &c) in self.edges.iter().zip(self.edge_classes) {
            if i >= n_nodes || j >= n_nodes || c >= n_classes {
                return Err(SsvmError::inference("edge refers to a missing node or class"));
            }
        }
        Ok(())
    }
}

/// Per-node incident edges: `(edge index, neighbor, node is the source)`.
pub(crate) struct Adjacency {
    neighbors: Vec<Vec<(usize, usize, bool)>>,
}

impl Adjacency {
    pub fn new(n_nodes: usize, edges: &[(usize, usize)]) -> Self {
        let mut neighbors = vec![vec![]; n_nodes];
        for (e, &(i, j)) in edges.iter().enumerate() {
            neighbors[i].push((e, j, true));
            neighbors[j].push((e, i, false));
        }
        Self { neighbors }
    }

    #[inline(always)]
    pub fn of(&self, i: usize) -> &[(usize, usize, bool)] {
        &self.neighbors[i]
    }

    /// Score of node `i` taking state `s` given its neighbors' states.
    #[inline(always)]
    pub fn local_score(
        &self,
        potentials: &Potentials,
        labels: &[usize],
        i: usize,
        s: usize,
    ) -> f64 {
        let mut score = potentials.unary_of(i)[s];
        for &(e, j, is_source) in self.of(i) {
            score += if is_source {
                potentials.pairwise_of(e, s, labels[j])
            } else {
                potentials.pairwise_of(e, labels[j], s)
            };
        }
        score
    }
}

/// Index of the largest value. Ties resolve to the lowest index.
#[inline(always)]
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (s, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = s;
        }
    }
    best
}

/// Fractional solution of a relaxed inference problem.
#[derive(Clone, Debug, PartialEq)]
pub struct Marginals {
    n_states: usize,
    unary: Vec<f64>,
    pairwise: Vec<f64>,
}

impl Marginals {
    /// Creates marginals.
    ///
    /// # Arguments
    ///
    /// * `n_states` - Number of states per node.
    /// * `unary` - Row-major node marginals of shape `[n_nodes, n_states]`.
    /// * `pairwise` - Edge marginals of shape `[n_edges, n_states, n_states]`
    ///   in edge order.
    pub fn new(n_states: usize, unary: Vec<f64>, pairwise: Vec<f64>) -> Self {
        Self {
            n_states,
            unary,
            pairwise,
        }
    }

    /// Builds one-hot marginals of an integral labeling.
    pub fn from_labels(n_states: usize, labels: &[usize], edges: &[(usize, usize)]) -> Self {
        let mut unary = vec![0.0; labels.len() * n_states];
        for (i, &s) in labels.iter().enumerate() {
            unary[i * n_states + s] = 1.0;
        }
        let mut pairwise = vec![0.0; edges.len() * n_states * n_states];
        for (e, &(i, j)) in edges.iter().enumerate() {
            pairwise[e * n_states * n_states + labels[i] * n_states + labels[j]] = 1.0;
        }
        Self {
            n_states,
            unary,
            pairwise,
        }
    }

    /// Gets the number of states.
    #[inline(always)]
    pub const fn n_states(&self) -> usize {
        self.n_states
    }

    /// Gets the marginals of a node.
    #[inline(always)]
    pub fn node(&self, i: usize) -> &[f64] {
        &self.unary[i * self.n_states..(i + 1) * self.n_states]
    }

    /// Gets the row-major `n_states x n_states` marginal of an edge.
    #[inline(always)]
    pub fn edge(&self, e: usize) -> &[f64] {
        let n = self.n_states * self.n_states;
        &self.pairwise[e * n..(e + 1) * n]
    }

    /// Gets the number of nodes.
    #[inline(always)]
    pub fn n_nodes(&self) -> usize {
        self.unary.len() / self.n_states
    }

    /// Rounds to the most probable state of every node.
    pub fn round(&self) -> Vec<usize> {
        (0..self.n_nodes()).map(|i| argmax(self.node(i))).collect()
    }
}

/// Output of an oracle.
#[derive(Clone, Debug, PartialEq)]
pub enum Labeling {
    /// One state per node.
    Integral(Vec<usize>),

    /// Fractional solution of a relaxation.
    Relaxed(Marginals),
}

impl Labeling {
    /// Gets an integral labeling, rounding a relaxed one.
    pub fn to_labels(&self) -> Vec<usize> {
        match self {
            Self::Integral(labels) => labels.clone(),
            Self::Relaxed(marginals) => marginals.round(),
        }
    }

    /// Consumes the labeling and returns an integral one.
    pub fn into_labels(self) -> Vec<usize> {
        match self {
            Self::Integral(labels) => labels,
            Self::Relaxed(marginals) => marginals.round(),
        }
    }
}

/// Capability set of an inference backend.
pub trait InferenceOracle: Send + Sync {
    /// Maximizes the total score of the given potentials.
    ///
    /// Must be deterministic for identical input. When `relaxed` is `true`
    /// the oracle may return [`Labeling::Relaxed`]; an integral labeling is
    /// always an acceptable answer.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Inference`] is returned when no labeling can be produced.
    fn infer(&self, potentials: &Potentials, relaxed: bool) -> Result<Labeling>;
}

/// Identifiers of the built-in oracles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub enum InferenceMethod {
    /// Iterated conditional modes.
    Icm,

    /// Damped loopy max-product belief propagation.
    #[default]
    MaxProduct,

    /// Brute-force enumeration for tiny graphs.
    Exhaustive,
}

impl InferenceMethod {
    /// Creates the oracle this identifier refers to.
    pub fn oracle(self) -> Arc<dyn InferenceOracle> {
        match self {
            Self::Icm => Arc::new(Icm::new()),
            Self::MaxProduct => Arc::new(MaxProduct::new()),
            Self::Exhaustive => Arc::new(Exhaustive::new()),
        }
    }
}

impl FromStr for InferenceMethod {
    type Err = SsvmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "icm" => Ok(Self::Icm),
            "max-product" => Ok(Self::MaxProduct),
            "exhaustive" => Ok(Self::Exhaustive),
            _ => Err(SsvmError::invalid_argument(format!(
                "unknown inference method: {s}"
            ))),
        }
    }
}

impl fmt::Display for InferenceMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Icm => write!(f, "icm"),
            Self::MaxProduct => write!(f, "max-product"),
            Self::Exhaustive => write!(f, "exhaustive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        for name in ["icm", "max-product", "exhaustive"] {
            let method: InferenceMethod = name.parse().unwrap();
            assert_eq!(name, method.to_string());
        }
        assert!("qpbo".parse::<InferenceMethod>().is_err());
    }

    #[test]
    fn test_argmax_ties() {
        assert_eq!(1, argmax(&[0.0, 2.0, 2.0, 1.0]));
        assert_eq!(0, argmax(&[0.0, 0.0]));
    }

    // 0 - 1 - 2
    #[test]
    fn test_score() {
        let unary = [1.0, 0.0, 0.0, 2.0, 3.0, 0.0];
        let pairwise = [5.0, 0.0, 0.0, 5.0];
        let edges = [(0, 1), (1, 2)];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &edges,
            edge_classes: &[0, 0],
            pairwise: &pairwise,
        };
        assert!((potentials.score(&[0, 0, 0]) - 14.0).abs() < f64::EPSILON);
        assert!((potentials.score(&[0, 1, 0]) - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_marginals_round() {
        let m = Marginals::new(2, vec![0.2, 0.8, 0.6, 0.4], vec![0.0; 4]);
        assert_eq!(vec![1, 0], m.round());
        let m = Marginals::from_labels(2, &[1, 0], &[(0, 1)]);
        assert_eq!(&[0.0, 0.0, 1.0, 0.0], m.edge(0));
        assert_eq!(Labeling::Relaxed(m).to_labels(), vec![1, 0]);
    }
}
