use core::fmt;

use std::sync::{Arc, Mutex, PoisonError};

use hashbrown::HashMap;

use crate::errors::{Result, SsvmError};
use crate::grid::{EdgeSet, Neighborhood, Observation};
use crate::inference::{InferenceMethod, InferenceOracle, Labeling, Marginals, Potentials};
use crate::model::{self, StructuredModel};

/// Edges of one grid shape together with their pairwise classes.
#[derive(Debug)]
pub(crate) struct Topology {
    pub edges: EdgeSet,
    pub classes: Vec<usize>,
}

/// CRF over a 2D grid.
///
/// Every node carries one feature per state; the unary score of state `s` is
/// `x[node, s] * w[s]`. The pairwise block of the weight vector holds either
/// one symmetric `n_states x n_states` matrix shared by all edges (stored as
/// its upper triangle) or, for directional models, one full matrix per edge
/// direction.
pub struct GridCrf {
    n_states: usize,
    neighborhood: Neighborhood,
    directional: bool,
    inference_method: InferenceMethod,
    oracle: Arc<dyn InferenceOracle>,
    topologies: Mutex<HashMap<(usize, usize), Arc<Topology>>>,
}

impl GridCrf {
    /// Creates a new grid CRF with 4-neighborhood and symmetric pairwise
    /// potentials.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when `n_states` is 0.
    pub fn new(n_states: usize, inference_method: InferenceMethod) -> Result<Self> {
        if n_states == 0 {
            return Err(SsvmError::modeling("n_states must not be 0"));
        }
        Ok(Self {
            n_states,
            neighborhood: Neighborhood::Four,
            directional: false,
            inference_method,
            oracle: inference_method.oracle(),
            topologies: Mutex::new(HashMap::new()),
        })
    }

    /// Sets the grid connectivity.
    pub fn neighborhood(mut self, neighborhood: Neighborhood) -> Self {
        self.neighborhood = neighborhood;
        self.topologies = Mutex::new(HashMap::new());
        self
    }

    /// Uses one pairwise matrix per edge direction.
    pub fn directional(mut self, directional: bool) -> Self {
        self.directional = directional;
        self.topologies = Mutex::new(HashMap::new());
        self
    }

    /// Replaces the oracle created from the inference method.
    pub fn with_oracle(mut self, oracle: Arc<dyn InferenceOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Gets the number of states.
    #[inline(always)]
    pub const fn n_states(&self) -> usize {
        self.n_states
    }

    /// Gets the grid connectivity.
    #[inline(always)]
    pub const fn get_neighborhood(&self) -> Neighborhood {
        self.neighborhood
    }

    /// Returns `true` if pairwise potentials depend on the edge direction.
    #[inline(always)]
    pub const fn is_directional(&self) -> bool {
        self.directional
    }

    /// Gets the identifier of the inference method.
    #[inline(always)]
    pub const fn inference_method(&self) -> InferenceMethod {
        self.inference_method
    }

    fn n_pairwise_classes(&self) -> usize {
        if self.directional {
            self.neighborhood.n_directions()
        } else {
            1
        }
    }

    fn size_pairwise(&self) -> usize {
        let n = self.n_states;
        if self.directional {
            self.n_pairwise_classes() * n * n
        } else {
            n * (n + 1) / 2
        }
    }

    // index of the unordered pair (a, b), a <= b, in the upper triangle
    #[inline(always)]
    fn triangle_index(&self, a: usize, b: usize) -> usize {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        a * self.n_states - a * (a + 1) / 2 + b
    }

    #[inline(always)]
    fn pairwise_slot(&self, class: usize, s: usize, t: usize) -> usize {
        let n = self.n_states;
        n + if self.directional {
            class * n * n + s * n + t
        } else {
            self.triangle_index(s, t)
        }
    }

    pub(crate) fn topology(&self, height: usize, width: usize) -> Arc<Topology> {
        let mut topologies = self
            .topologies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let topology = topologies.entry((height, width)).or_insert_with(|| {
            let edges = EdgeSet::grid(height, width, self.neighborhood);
            let classes = if self.directional {
                edges.directions().to_vec()
            } else {
                vec![0; edges.len()]
            };
            Arc::new(Topology { edges, classes })
        });
        Arc::clone(topology)
    }

    /// Gets the unary block of a weight vector.
    #[inline(always)]
    pub fn unary_weights<'a>(&self, w: &'a [f64]) -> &'a [f64] {
        &w[..self.n_states]
    }

    /// Expands the pairwise block of a weight vector into one full
    /// `n_states x n_states` matrix per pairwise class.
    pub fn pairwise_potentials(&self, w: &[f64]) -> Vec<f64> {
        let n = self.n_states;
        let mut pairwise = vec![0.0; self.n_pairwise_classes() * n * n];
        for (c, matrix) in pairwise.chunks_exact_mut(n * n).enumerate() {
            for s in 0..n {
                for t in 0..n {
                    matrix[s * n + t] = w[self.pairwise_slot(c, s, t)];
                }
            }
        }
        pairwise
    }

    /// Computes unary scores `x[node, s] * unary_weights[s]`.
    pub fn unary_scores(&self, x: &Observation, unary_weights: &[f64]) -> Vec<f64> {
        x.data()
            .chunks_exact(self.n_states)
            .flat_map(|node| node.iter().zip(unary_weights).map(|(v, w)| v * w))
            .collect()
    }

    /// Runs the oracle on precomputed unary scores and the pairwise block of
    /// `w`.
    pub fn infer_with_unary_scores(
        &self,
        height: usize,
        width: usize,
        unary_scores: &[f64],
        w: &[f64],
        relaxed: bool,
    ) -> Result<Labeling> {
        model::check_weights(self.size_joint_feature(), w)?;
        if unary_scores.len() != height * width * self.n_states {
            return Err(SsvmError::modeling("unary scores do not match the grid"));
        }
        let topology = self.topology(height, width);
        let pairwise = self.pairwise_potentials(w);
        let potentials = Potentials {
            n_states: self.n_states,
            unary: unary_scores,
            edges: topology.edges.edges(),
            edge_classes: &topology.classes,
            pairwise: &pairwise,
        };
        self.oracle.infer(&potentials, relaxed)
    }

    fn check_observation(&self, x: &Observation) -> Result<()> {
        if x.n_features() != self.n_states {
            return Err(SsvmError::modeling(format!(
                "observation has {} features per node, the model has {} states",
                x.n_features(),
                self.n_states
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for GridCrf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GridCrf")
            .field("n_states", &self.n_states)
            .field("neighborhood", &self.neighborhood)
            .field("directional", &self.directional)
            .field("inference_method", &self.inference_method)
            .finish()
    }
}

impl StructuredModel for GridCrf {
    fn size_joint_feature(&self) -> usize {
        self.n_states + self.size_pairwise()
    }

    fn check_example(&self, x: &Observation, y: &[usize]) -> Result<()> {
        self.check_observation(x)?;
        if y.len() != x.n_nodes() {
            return Err(SsvmError::modeling(format!(
                "label map has {} entries, the observation has {} nodes",
                y.len(),
                x.n_nodes()
            )));
        }
        if let Some(&s) = y.iter().find(|&&s| s >= self.n_states) {
            return Err(SsvmError::modeling(format!(
                "state {s} is out of range for {} states",
                self.n_states
            )));
        }
        Ok(())
    }

    fn joint_feature(&self, x: &Observation, y: &[usize]) -> Result<Vec<f64>> {
        self.check_example(x, y)?;
        let mut psi = vec![0.0; self.size_joint_feature()];
        for (i, &s) in y.iter().enumerate() {
            psi[s] += x.node(i)[s];
        }
        let topology = self.topology(x.height(), x.width());
        for (&(i, j), &c) in topology.edges.edges().iter().zip(&topology.classes) {
            psi[self.pairwise_slot(c, y[i], y[j])] += 1.0;
        }
        Ok(psi)
    }

    fn relaxed_joint_feature(&self, x: &Observation, y: &Marginals) -> Result<Vec<f64>> {
        self.check_observation(x)?;
        if y.n_states() != self.n_states || y.n_nodes() != x.n_nodes() {
            return Err(SsvmError::modeling("marginals do not match the observation"));
        }
        let n = self.n_states;
        let mut psi = vec![0.0; self.size_joint_feature()];
        for i in 0..x.n_nodes() {
            for ((p, v), q) in psi.iter_mut().zip(x.node(i)).zip(y.node(i)) {
                *p += v * q;
            }
        }
        let topology = self.topology(x.height(), x.width());
        for (e, &c) in topology.classes.iter().enumerate() {
            let marginal = y.edge(e);
            for s in 0..n {
                for t in 0..n {
                    psi[self.pairwise_slot(c, s, t)] += marginal[s * n + t];
                }
            }
        }
        Ok(psi)
    }

    fn inference(&self, x: &Observation, w: &[f64]) -> Result<Vec<usize>> {
        self.check_observation(x)?;
        model::check_weights(self.size_joint_feature(), w)?;
        let scores = self.unary_scores(x, self.unary_weights(w));
        Ok(self
            .infer_with_unary_scores(x.height(), x.width(), &scores, w, false)?
            .into_labels())
    }

    fn loss_augmented_inference(
        &self,
        x: &Observation,
        y: &[usize],
        w: &[f64],
        relaxed: bool,
    ) -> Result<Labeling> {
        self.check_example(x, y)?;
        model::check_weights(self.size_joint_feature(), w)?;
        let mut scores = self.unary_scores(x, self.unary_weights(w));
        for (node, &truth) in scores.chunks_exact_mut(self.n_states).zip(y) {
            for (s, score) in node.iter_mut().enumerate() {
                if s != truth {
                    *score += 1.0;
                }
            }
        }
        self.infer_with_unary_scores(x.height(), x.width(), &scores, w, relaxed)
    }

    fn loss(&self, y: &[usize], y_hat: &[usize]) -> f64 {
        model::hamming(y, y_hat, |s| s)
    }

    fn continuous_loss(&self, y: &[usize], y_hat: &Marginals) -> f64 {
        y.iter()
            .enumerate()
            .map(|(i, &s)| 1.0 - y_hat.node(i)[s])
            .sum()
    }
}
