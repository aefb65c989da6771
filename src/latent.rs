//! CRF with hidden sub-states per visible label.
//!
//! [`LatentCrf`] wraps a [`GridCrf`] whose states are the hidden sub-states.
//! Observations carry one feature per visible label. Before delegating to
//! the inner model every feature is repeated once per sub-state of its label.
//! Losses are measured after collapsing sub-states to their labels.

use core::ops::Range;
use std::sync::Arc;

use bincode::{Decode, Encode};
use log::{debug, warn};

use crate::errors::{Result, SsvmError};
use crate::grid::{Neighborhood, Observation};
use crate::grid_crf::GridCrf;
use crate::inference::{InferenceMethod, InferenceOracle, Labeling, Marginals, CLAMPED_SCORE};
use crate::kmeans::KMeans;
use crate::model::{self, StructuredModel};

/// Replaces zero unary weights when loss terms are divided by them.
const ZERO_WEIGHT_GUARD: f64 = 1e-10;

/// Number of hidden states of each label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatesPerLabel {
    /// The same number of states for every label.
    Uniform(usize),

    /// One count per label.
    PerLabel(Vec<usize>),
}

impl From<usize> for StatesPerLabel {
    fn from(n: usize) -> Self {
        Self::Uniform(n)
    }
}

impl From<Vec<usize>> for StatesPerLabel {
    fn from(counts: Vec<usize>) -> Self {
        Self::PerLabel(counts)
    }
}

impl From<&[usize]> for StatesPerLabel {
    fn from(counts: &[usize]) -> Self {
        Self::PerLabel(counts.to_vec())
    }
}

/// Mapping between labels and their contiguous ranges of hidden states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateLayout {
    states_per_label: Vec<usize>,
    offsets: Vec<usize>,
    state_labels: Vec<usize>,
}

impl StateLayout {
    /// Creates a layout.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when `n_labels` is 0, when the
    /// number of counts differs from `n_labels`, or when a count is 0.
    pub fn new(n_labels: usize, states_per_label: StatesPerLabel) -> Result<Self> {
        if n_labels == 0 {
            return Err(SsvmError::modeling("n_labels must not be 0"));
        }
        let states_per_label = match states_per_label {
            StatesPerLabel::Uniform(n) => vec![n; n_labels],
            StatesPerLabel::PerLabel(counts) => counts,
        };
        if states_per_label.len() != n_labels {
            return Err(SsvmError::modeling(format!(
                "n_states_per_label has {} entries for {} labels",
                states_per_label.len(),
                n_labels
            )));
        }
        if states_per_label.contains(&0) {
            return Err(SsvmError::modeling("every label needs at least one state"));
        }
        let mut offsets = Vec::with_capacity(n_labels);
        let mut state_labels = vec![];
        for (label, &n) in states_per_label.iter().enumerate() {
            offsets.push(state_labels.len());
            state_labels.extend(core::iter::repeat_n(label, n));
        }
        Ok(Self {
            states_per_label,
            offsets,
            state_labels,
        })
    }

    /// Gets the number of visible labels.
    #[inline(always)]
    pub fn n_labels(&self) -> usize {
        self.states_per_label.len()
    }

    /// Gets the total number of hidden states.
    #[inline(always)]
    pub fn n_states(&self) -> usize {
        self.state_labels.len()
    }

    /// Gets the number of hidden states of each label.
    #[inline(always)]
    pub fn states_per_label(&self) -> &[usize] {
        &self.states_per_label
    }

    /// Gets the hidden states of a label.
    #[inline(always)]
    pub fn states_of(&self, label: usize) -> Range<usize> {
        self.offsets[label]..self.offsets[label] + self.states_per_label[label]
    }

    /// Gets the label owning a hidden state.
    #[inline(always)]
    pub fn label_of(&self, state: usize) -> usize {
        self.state_labels[state]
    }

    /// Gets the first hidden state of a label.
    #[inline(always)]
    pub fn first_state(&self, label: usize) -> usize {
        self.offsets[label]
    }
}

/// Hyper-parameters of a [`LatentCrf`].
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct LatentCrfConfig {
    /// Number of hidden states of each label.
    pub states_per_label: Vec<usize>,

    /// Grid connectivity.
    pub neighborhood: Neighborhood,

    /// Whether pairwise potentials depend on the edge direction.
    pub directional: bool,

    /// Oracle identifier.
    pub inference_method: InferenceMethod,

    /// Seed of the k-means initialization.
    pub seed: u64,
}

/// Result of completing hidden states for a ground truth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatentAssignment {
    /// Hidden states consistent with the ground truth.
    pub states: Vec<usize>,

    /// `true` if the oracle returned inconsistent states and the trivial
    /// assignment was used instead.
    pub fallback: bool,
}

/// Grid CRF with hidden sub-states per visible label.
#[derive(Debug)]
pub struct LatentCrf {
    inner: GridCrf,
    layout: StateLayout,
    seed: u64,
}

impl LatentCrf {
    /// Creates a latent CRF on a grid with 4-neighborhood and symmetric
    /// pairwise potentials.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the state counts do not fit
    /// `n_labels`.
    pub fn grid<S>(
        n_labels: usize,
        states_per_label: S,
        inference_method: InferenceMethod,
    ) -> Result<Self>
    where
        S: Into<StatesPerLabel>,
    {
        let layout = StateLayout::new(n_labels, states_per_label.into())?;
        let inner = GridCrf::new(layout.n_states(), inference_method)?;
        Ok(Self {
            inner,
            layout,
            seed: 0,
        })
    }

    /// Creates a latent CRF with one pairwise matrix per edge direction.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the state counts do not fit
    /// `n_labels`.
    pub fn directional_grid<S>(
        n_labels: usize,
        states_per_label: S,
        inference_method: InferenceMethod,
    ) -> Result<Self>
    where
        S: Into<StatesPerLabel>,
    {
        let mut crf = Self::grid(n_labels, states_per_label, inference_method)?;
        crf.inner = crf.inner.directional(true);
        Ok(crf)
    }

    /// Creates a latent CRF from its hyper-parameters.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the state counts are invalid.
    pub fn from_config(config: &LatentCrfConfig) -> Result<Self> {
        let n_labels = config.states_per_label.len();
        let crf = Self::grid(
            n_labels,
            config.states_per_label.clone(),
            config.inference_method,
        )?;
        Ok(crf
            .neighborhood(config.neighborhood)
            .directional(config.directional)
            .seed(config.seed))
    }

    /// Gets the hyper-parameters.
    pub fn config(&self) -> LatentCrfConfig {
        LatentCrfConfig {
            states_per_label: self.layout.states_per_label().to_vec(),
            neighborhood: self.inner.get_neighborhood(),
            directional: self.inner.is_directional(),
            inference_method: self.inner.inference_method(),
            seed: self.seed,
        }
    }

    /// Sets the grid connectivity.
    pub fn neighborhood(mut self, neighborhood: Neighborhood) -> Self {
        self.inner = self.inner.neighborhood(neighborhood);
        self
    }

    /// Uses one pairwise matrix per edge direction.
    pub fn directional(mut self, directional: bool) -> Self {
        self.inner = self.inner.directional(directional);
        self
    }

    /// Replaces the oracle of the inner model.
    pub fn with_oracle(mut self, oracle: Arc<dyn InferenceOracle>) -> Self {
        self.inner = self.inner.with_oracle(oracle);
        self
    }

    /// Sets the seed of the k-means initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Gets the number of visible labels.
    #[inline(always)]
    pub fn n_labels(&self) -> usize {
        self.layout.n_labels()
    }

    /// Gets the number of hidden states.
    #[inline(always)]
    pub fn n_states(&self) -> usize {
        self.layout.n_states()
    }

    /// Gets the state layout.
    #[inline(always)]
    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Gets the inner model over hidden states.
    #[inline(always)]
    pub fn inner(&self) -> &GridCrf {
        &self.inner
    }

    /// Maps hidden states to their labels.
    pub fn collapse(&self, h: &[usize]) -> Vec<usize> {
        h.iter().map(|&s| self.layout.label_of(s)).collect()
    }

    /// Returns `true` if every hidden state belongs to the label of its node.
    pub fn is_consistent(&self, h: &[usize], y: &[usize]) -> bool {
        h.len() == y.len()
            && h
                .iter()
                .zip(y)
                .all(|(&s, &label)| s < self.n_states() && self.layout.label_of(s) == label)
    }

    fn check_observation(&self, x: &Observation) -> Result<()> {
        if x.n_features() != self.n_labels() {
            return Err(SsvmError::modeling(format!(
                "observation has {} features per node, the model has {} labels",
                x.n_features(),
                self.n_labels()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_labels(&self, x: &Observation, y: &[usize]) -> Result<()> {
        self.check_observation(x)?;
        if y.len() != x.n_nodes() {
            return Err(SsvmError::modeling(format!(
                "label map has {} entries, the observation has {} nodes",
                y.len(),
                x.n_nodes()
            )));
        }
        if let Some(&label) = y.iter().find(|&&label| label >= self.n_labels()) {
            return Err(SsvmError::modeling(format!(
                "label {label} is out of range for {} labels",
                self.n_labels()
            )));
        }
        Ok(())
    }

    #[inline(always)]
    fn widen(&self, x: &Observation) -> Observation {
        x.widen(self.layout.states_per_label())
    }

    fn guarded_unary_weights(&self, w: &[f64]) -> Vec<f64> {
        self.inner
            .unary_weights(w)
            .iter()
            .map(|&v| if v == 0.0 { ZERO_WEIGHT_GUARD } else { v })
            .collect()
    }

    /// Computes neighbor-label statistics of every node and clusters the
    /// nodes of each label into its hidden states.
    ///
    /// Symmetric models count neighbor labels over all edges. Directional
    /// models count them separately per direction and per edge end.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the examples do not fit the
    /// model.
    pub fn init_latent(&self, xs: &[Observation], ys: &[Vec<usize>]) -> Result<Vec<Vec<usize>>> {
        if xs.len() != ys.len() {
            return Err(SsvmError::modeling("X and Y have different lengths"));
        }
        let n_labels = self.n_labels();
        let n_blocks = if self.inner.is_directional() {
            2 * self.inner.get_neighborhood().n_directions()
        } else {
            1
        };

        // (example, node) of every node, grouped by label
        let mut members = vec![vec![]; n_labels];
        let mut features = vec![vec![]; n_labels];
        for (k, (x, y)) in xs.iter().zip(ys).enumerate() {
            self.check_labels(x, y)?;
            let topology = self.inner.topology(x.height(), x.width());
            let mut counts = vec![vec![0.0; n_blocks * n_labels]; x.n_nodes()];
            for (&(i, j), &d) in topology
                .edges
                .edges()
                .iter()
                .zip(topology.edges.directions())
            {
                let (out_block, in_block) = if self.inner.is_directional() {
                    (2 * d, 2 * d + 1)
                } else {
                    (0, 0)
                };
                counts[i][out_block * n_labels + y[j]] += 1.0;
                counts[j][in_block * n_labels + y[i]] += 1.0;
            }
            for (i, mut f) in counts.into_iter().enumerate() {
                let total: f64 = f.iter().sum();
                if total > 0.0 {
                    for v in &mut f {
                        *v /= total;
                    }
                }
                members[y[i]].push((k, i));
                features[y[i]].push(f);
            }
        }

        let mut hs: Vec<Vec<usize>> = ys
            .iter()
            .map(|y| y.iter().map(|&l| self.layout.first_state(l)).collect())
            .collect();
        for label in 0..n_labels {
            let n_states = self.layout.states_per_label()[label];
            if n_states == 1 {
                continue;
            }
            let clusters = KMeans::new(n_states, self.seed).fit_predict(&features[label]);
            for (&(k, i), c) in members[label].iter().zip(clusters) {
                hs[k][i] = self.layout.first_state(label) + c;
            }
        }
        Ok(hs)
    }

    /// Completes the hidden states of a ground truth: the best-scoring
    /// hidden labeling whose states all belong to the given labels.
    ///
    /// States of other labels are clamped to a huge negative score. If the
    /// oracle still returns an inconsistent labeling, the first state of each
    /// label is used and [`LatentAssignment::fallback`] is set.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned on shape mismatches and
    /// [`SsvmError::Inference`] when the oracle fails.
    pub fn latent(&self, x: &Observation, y: &[usize], w: &[f64]) -> Result<LatentAssignment> {
        self.check_labels(x, y)?;
        model::check_weights(self.size_joint_feature(), w)?;
        let n_states = self.n_states();
        let x_wide = self.widen(x);
        let mut scores = self.inner.unary_scores(&x_wide, self.inner.unary_weights(w));
        for (node, &label) in scores.chunks_exact_mut(n_states).zip(y) {
            for (s, score) in node.iter_mut().enumerate() {
                if self.layout.label_of(s) != label {
                    *score = CLAMPED_SCORE;
                }
            }
        }
        let h = self
            .inner
            .infer_with_unary_scores(x.height(), x.width(), &scores, w, false)?
            .into_labels();
        if self.is_consistent(&h, y) {
            return Ok(LatentAssignment {
                states: h,
                fallback: false,
            });
        }
        let n_bad = h
            .iter()
            .zip(y)
            .filter(|(&s, &label)| self.layout.label_of(s) != label)
            .count();
        if w.iter().any(|&v| v != 0.0) {
            warn!(
                "oracle returned {n_bad} hidden states inconsistent with the labels; \
                 falling back to the first state of each label"
            );
        } else {
            debug!("{n_bad} inconsistent hidden states with zero weights; using the first states");
        }
        Ok(LatentAssignment {
            states: y.iter().map(|&l| self.layout.first_state(l)).collect(),
            fallback: true,
        })
    }

    /// Widens the observation and adds `1 / w[s]` to every state `s` whose
    /// label differs from the label of `h` at that node. Zero unary weights
    /// are replaced by a tiny constant.
    ///
    /// Scoring the result with the same guarded unary weights adds exactly
    /// one to the score of every disagreeing state.
    pub fn loss_augment(&self, x: &Observation, h: &[usize], w: &[f64]) -> Result<Observation> {
        self.check_example(x, h)?;
        model::check_weights(self.size_joint_feature(), w)?;
        let n_states = self.n_states();
        let guarded = self.guarded_unary_weights(w);
        let mut x_wide = self.widen(x);
        for (node, &state) in x_wide.data_mut().chunks_exact_mut(n_states).zip(h) {
            let label = self.layout.label_of(state);
            for (s, (v, g)) in node.iter_mut().zip(&guarded).enumerate() {
                if self.layout.label_of(s) != label {
                    *v += 1.0 / g;
                }
            }
        }
        Ok(x_wide)
    }

    /// Sums the marginals of the hidden states of each label.
    fn collapse_marginals(&self, node: &[f64]) -> Vec<f64> {
        (0..self.n_labels())
            .map(|label| node[self.layout.states_of(label)].iter().sum())
            .collect()
    }
}

impl StructuredModel for LatentCrf {
    fn size_joint_feature(&self) -> usize {
        self.inner.size_joint_feature()
    }

    fn check_example(&self, x: &Observation, h: &[usize]) -> Result<()> {
        self.check_observation(x)?;
        if h.len() != x.n_nodes() {
            return Err(SsvmError::modeling(format!(
                "state map has {} entries, the observation has {} nodes",
                h.len(),
                x.n_nodes()
            )));
        }
        if let Some(&s) = h.iter().find(|&&s| s >= self.n_states()) {
            return Err(SsvmError::modeling(format!(
                "state {s} is out of range for {} states",
                self.n_states()
            )));
        }
        Ok(())
    }

    fn joint_feature(&self, x: &Observation, h: &[usize]) -> Result<Vec<f64>> {
        self.check_example(x, h)?;
        self.inner.joint_feature(&self.widen(x), h)
    }

    fn relaxed_joint_feature(&self, x: &Observation, h: &Marginals) -> Result<Vec<f64>> {
        self.check_observation(x)?;
        self.inner.relaxed_joint_feature(&self.widen(x), h)
    }

    fn inference(&self, x: &Observation, w: &[f64]) -> Result<Vec<usize>> {
        self.check_observation(x)?;
        self.inner.inference(&self.widen(x), w)
    }

    fn loss_augmented_inference(
        &self,
        x: &Observation,
        h: &[usize],
        w: &[f64],
        relaxed: bool,
    ) -> Result<Labeling> {
        let x_augmented = self.loss_augment(x, h, w)?;
        let scores = self
            .inner
            .unary_scores(&x_augmented, &self.guarded_unary_weights(w));
        self.inner
            .infer_with_unary_scores(x.height(), x.width(), &scores, w, relaxed)
    }

    fn loss(&self, h: &[usize], h_hat: &[usize]) -> f64 {
        model::hamming(h, h_hat, |s| self.layout.label_of(s))
    }

    fn continuous_loss(&self, h: &[usize], h_hat: &Marginals) -> f64 {
        h.iter()
            .enumerate()
            .map(|(i, &s)| 1.0 - self.collapse_marginals(h_hat.node(i))[self.layout.label_of(s)])
            .sum()
    }
}
