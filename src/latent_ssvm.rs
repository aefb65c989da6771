use log::{info, warn};

use crate::errors::{Result, SsvmError};
use crate::grid::Observation;
use crate::latent::{LatentAssignment, LatentCrf};
use crate::learners::{BaseSvm, SsvmConfig};
use crate::model::StructuredModel;
use crate::parallel;
use crate::snapshot::Snapshot;

/// State of a [`LatentSsvm`] after fitting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatentStatus {
    /// `fit` has not been called.
    NotFitted,

    /// Hidden states or the objective stopped changing.
    Converged,

    /// `latent_iter` outer iterations ran without convergence.
    MaxIterReached,

    /// Hidden state completion fell back to the trivial assignment and
    /// [`SsvmConfig::break_on_bad`] stopped the loop.
    Diverged,
}

/// Latent SSVM.
///
/// Alternates between fitting a base learner on the current hidden states
/// and completing the hidden states of every example with the new weights.
/// The [`SsvmConfig`] is passed to the base learner. Its `break_on_bad` also
/// stops the outer loop when hidden state completion falls back to the
/// trivial assignment.
pub struct LatentSsvm {
    model: LatentCrf,
    base_svm: BaseSvm,
    config: SsvmConfig,
    latent_iter: usize,
    w: Vec<f64>,
    latent_states: Vec<Vec<usize>>,
    objective_curve: Vec<f64>,
    status: LatentStatus,
}

impl LatentSsvm {
    /// Creates a new learner.
    pub fn new(model: LatentCrf, base_svm: BaseSvm, config: SsvmConfig) -> Self {
        let w = vec![0.0; model.size_joint_feature()];
        Self {
            model,
            base_svm,
            config,
            latent_iter: 10,
            w,
            latent_states: vec![],
            objective_curve: vec![],
            status: LatentStatus::NotFitted,
        }
    }

    /// Sets the maximum number of outer iterations.
    ///
    /// # Errors
    ///
    /// `latent_iter` must not be 0.
    pub fn latent_iter(mut self, latent_iter: usize) -> Result<Self> {
        if latent_iter == 0 {
            return Err(SsvmError::invalid_argument("latent_iter must not be 0"));
        }
        self.latent_iter = latent_iter;
        Ok(self)
    }

    fn check_initial_states(
        &self,
        xs: &[Observation],
        ys: &[Vec<usize>],
        hs: &[Vec<usize>],
    ) -> Result<()> {
        if hs.len() != xs.len() {
            return Err(SsvmError::modeling(format!(
                "{} initial state maps for {} examples",
                hs.len(),
                xs.len()
            )));
        }
        for (i, ((x, y), h)) in xs.iter().zip(ys).zip(hs).enumerate() {
            self.model.check_labels(x, y)?;
            if !self.model.is_consistent(h, y) {
                return Err(SsvmError::modeling(format!(
                    "initial states of example {i} are inconsistent with its labels"
                )));
            }
        }
        Ok(())
    }

    /// Learns weights and hidden states.
    ///
    /// Without `h_init` the hidden states are initialized by clustering
    /// neighbor labels.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the examples or `h_init` do
    /// not fit the model, and errors of the base learner are propagated.
    pub fn fit(
        &mut self,
        xs: &[Observation],
        ys: &[Vec<usize>],
        h_init: Option<Vec<Vec<usize>>>,
    ) -> Result<()> {
        if xs.len() != ys.len() {
            return Err(SsvmError::invalid_argument(format!(
                "{} observations but {} label maps",
                xs.len(),
                ys.len()
            )));
        }
        let mut hs = match h_init {
            Some(hs) => {
                self.check_initial_states(xs, ys, &hs)?;
                hs
            }
            None => self.model.init_latent(xs, ys)?,
        };
        self.objective_curve.clear();
        self.status = LatentStatus::MaxIterReached;

        for iteration in 0..self.latent_iter {
            let mut learner = self.base_svm.build(&self.model, self.config.clone());
            learner.fit(xs, &hs)?;
            let objective = learner.objective_curve().last().copied().unwrap_or(0.0);
            self.w = learner.weights().to_vec();

            let model = &self.model;
            let w = &self.w;
            let assignments: Vec<LatentAssignment> =
                parallel::map(xs, self.config.n_jobs, |i, x| model.latent(x, &ys[i], w))
                    .into_iter()
                    .collect::<Result<_>>()?;
            let mut n_fallbacks = 0;
            for (i, assignment) in assignments.iter().enumerate() {
                if assignment.fallback {
                    n_fallbacks += 1;
                    warn!("iteration {iteration}: example {i} fell back to trivial hidden states");
                }
            }
            let n_changed = assignments
                .iter()
                .zip(&hs)
                .filter(|(a, h)| &a.states != *h)
                .count();
            if self.config.verbose >= 1 {
                info!(
                    "latent iteration {iteration}: objective {objective:.6}, \
                     {n_changed} examples changed hidden states"
                );
            }
            let prev_objective = self.objective_curve.last().copied();
            self.objective_curve.push(objective);

            if n_fallbacks != 0 && self.config.break_on_bad {
                self.status = LatentStatus::Diverged;
                break;
            }
            hs = assignments.into_iter().map(|a| a.states).collect();
            if n_changed == 0 {
                self.status = LatentStatus::Converged;
                break;
            }
            if prev_objective.is_some_and(|prev| (objective - prev).abs() < self.config.tol) {
                self.status = LatentStatus::Converged;
                break;
            }
        }
        self.latent_states = hs;
        Ok(())
    }

    /// Predicts hidden states of every observation.
    pub fn predict_latent(&self, xs: &[Observation]) -> Result<Vec<Vec<usize>>> {
        parallel::map(xs, self.config.n_jobs, |_, x| self.model.inference(x, &self.w))
            .into_iter()
            .collect()
    }

    /// Predicts visible labels of every observation.
    pub fn predict(&self, xs: &[Observation]) -> Result<Vec<Vec<usize>>> {
        Ok(self
            .predict_latent(xs)?
            .iter()
            .map(|h| self.model.collapse(h))
            .collect())
    }

    /// Gets the learned weights.
    pub fn weights(&self) -> &[f64] {
        &self.w
    }

    /// Gets the hidden states of the training examples.
    pub fn latent_states(&self) -> &[Vec<usize>] {
        &self.latent_states
    }

    /// Gets the final objective of the base learner in each outer iteration.
    pub fn objective_curve(&self) -> &[f64] {
        &self.objective_curve
    }

    /// Gets the status of the last fit.
    pub fn status(&self) -> LatentStatus {
        self.status
    }

    /// Gets the model.
    pub fn model(&self) -> &LatentCrf {
        &self.model
    }

    /// Captures the model configuration and the learned weights.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            model: self.model.config(),
            weights: self.w.clone(),
        }
    }
}
