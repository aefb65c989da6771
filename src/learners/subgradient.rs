use argmin_math::{ArgminDot, ArgminL2Norm, ArgminMul, ArgminScaledAdd, ArgminSub};
use log::{debug, info};

use crate::errors::Result;
use crate::grid::Observation;
use crate::learners::{self, Learner, SsvmConfig};
use crate::model::StructuredModel;

/// SSVM trained by online subgradient descent on the primal objective
/// `1/2 |w|^2 + C sum_i slack_i`.
///
/// Examples are visited in order. The learning rate decays with the
/// fractional epoch. Learning stops after an epoch without margin violations.
pub struct SubgradientSsvm<'a, M: ?Sized> {
    model: &'a M,
    config: SsvmConfig,
    w: Vec<f64>,
    objective_curve: Vec<f64>,
}

impl<'a, M> SubgradientSsvm<'a, M>
where
    M: StructuredModel + ?Sized,
{
    /// Creates a new learner.
    pub fn new(model: &'a M, config: SsvmConfig) -> Self {
        Self {
            model,
            config,
            w: vec![0.0; model.size_joint_feature()],
            objective_curve: vec![],
        }
    }
}

impl<M> Learner for SubgradientSsvm<'_, M>
where
    M: StructuredModel + ?Sized,
{
    fn fit(&mut self, xs: &[Observation], ys: &[Vec<usize>]) -> Result<()> {
        learners::check_examples(self.model, xs, ys)?;
        let n = xs.len() as f64;
        self.w = vec![0.0; self.model.size_joint_feature()];
        self.objective_curve.clear();

        let psi_true = learners::joint_features(self.model, xs, ys, self.config.n_jobs)?;
        for epoch in 0..self.config.max_iter {
            let mut n_violations = 0;
            let mut slack_total = 0.0;
            for (i, x) in xs.iter().enumerate() {
                let relaxed = self.config.relaxed;
                let Some(v) = learners::find_violation(self.model, i, x, &ys[i], &self.w, relaxed)?
                else {
                    continue;
                };
                let dpsi = psi_true[i].sub(&v.psi);
                let slack = v.loss - ArgminDot::<Vec<f64>, f64>::dot(&self.w, &dpsi);
                let eta = self.config.learning_rate
                    * self.config.decay.factor(epoch as f64 + i as f64 / n);

                let mut step = self.w.mul(&(-1.0 / n));
                if slack > self.config.tol {
                    n_violations += 1;
                    slack_total += slack;
                    step = step.scaled_add(&self.config.c, &dpsi);
                }
                self.w = self.w.scaled_add(&eta, &step);
                if self.config.verbose >= 2 {
                    debug!("example {i}: slack {slack:.6}, learning rate {eta:.6}");
                }
            }
            let norm = self.w.l2_norm();
            let objective = 0.5 * norm * norm + self.config.c * slack_total;
            if self.config.verbose >= 1 {
                info!("epoch {epoch}: objective {objective:.6}, {n_violations} margin violations");
            }
            self.objective_curve.push(objective);
            if n_violations == 0 {
                break;
            }
        }
        Ok(())
    }

    fn weights(&self) -> &[f64] {
        &self.w
    }

    fn predict(&self, xs: &[Observation]) -> Result<Vec<Vec<usize>>> {
        learners::predict(self.model, xs, &self.w, self.config.n_jobs)
    }

    fn objective_curve(&self) -> &[f64] {
        &self.objective_curve
    }
}
