use argmin_math::{ArgminDot, ArgminSub};
use log::{debug, info, warn};

use crate::errors::Result;
use crate::grid::Observation;
use crate::learners::qp::{Constraint, ConstraintPool};
use crate::learners::{self, Learner, SsvmConfig};
use crate::model::StructuredModel;

/// Cutting-plane SSVM with one slack variable per example.
///
/// Every round adds, for each example, the constraint of its most violating
/// labeling if it is violated by more than `tol`, and re-solves the dual QP
/// over all constraints. Learning stops after a round without new
/// constraints.
pub struct NSlackSsvm<'a, M: ?Sized> {
    model: &'a M,
    config: SsvmConfig,
    w: Vec<f64>,
    objective_curve: Vec<f64>,
    n_bad_constraints: usize,
}

impl<'a, M> NSlackSsvm<'a, M>
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
            n_bad_constraints: 0,
        }
    }

    /// Gets the number of constraints of the last fit that showed
    /// loss-augmented inference to be approximate.
    pub fn n_bad_constraints(&self) -> usize {
        self.n_bad_constraints
    }
}

impl<M> Learner for NSlackSsvm<'_, M>
where
    M: StructuredModel + ?Sized,
{
    fn fit(&mut self, xs: &[Observation], ys: &[Vec<usize>]) -> Result<()> {
        learners::check_examples(self.model, xs, ys)?;
        let size = self.model.size_joint_feature();
        self.w = vec![0.0; size];
        self.objective_curve.clear();
        self.n_bad_constraints = 0;

        let psi_true = learners::joint_features(self.model, xs, ys, self.config.n_jobs)?;
        let mut pool = ConstraintPool::new(xs.len(), self.config.c, self.config.qp_max_sweeps);
        'rounds: for iteration in 0..self.config.max_iter {
            let violations = learners::find_violations(self.model, xs, ys, &self.w, &self.config)?;

            let mut n_added = 0;
            let mut n_bad = 0;
            for (i, violation) in violations.into_iter().enumerate() {
                let Some(v) = violation else {
                    continue;
                };
                let dpsi = psi_true[i].sub(&v.psi);
                let violation = v.loss - ArgminDot::<Vec<f64>, f64>::dot(&self.w, &dpsi) - pool.slack(i);
                if self.config.verbose >= 2 {
                    debug!("example {i}: loss {}, violation {violation:.6}", v.loss);
                }
                if self.config.check_constraints
                    && (violation < -learners::BAD_CONSTRAINT_TOL
                        || (violation > self.config.tol && pool.contains(i, &dpsi, v.loss)))
                {
                    n_bad += 1;
                    continue;
                }
                if violation <= self.config.tol {
                    continue;
                }
                pool.push(Constraint {
                    dpsi,
                    loss: v.loss,
                    block: i,
                })?;
                n_added += 1;
            }
            if n_bad != 0 {
                self.n_bad_constraints += n_bad;
                warn!(
                    "iteration {iteration}: {n_bad} examples returned constraints weaker than \
                     the pool; inference may be approximate"
                );
                if self.config.break_on_bad {
                    break 'rounds;
                }
            }
            if self.config.verbose >= 1 {
                info!(
                    "iteration {iteration}: {n_added} new constraints, {} in total",
                    pool.len()
                );
            }
            if n_added == 0 {
                break;
            }
            let objective = pool.solve()?;
            self.w = pool.weights(size);
            if self.config.verbose >= 2 {
                debug!(
                    "dual objective {objective:.6}, primal objective {:.6}",
                    pool.primal_objective(&self.w)
                );
            }
            self.objective_curve.push(objective);
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

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::grid_crf::GridCrf;
    use crate::inference::InferenceMethod;
    use crate::test_utils::{self, ScriptedOracle};

    #[test]
    fn test_objective_is_monotone() {
        let (xs, ys) = test_utils::generate_crosses(4, 6, 0.6, 8);
        let crf = GridCrf::new(2, InferenceMethod::MaxProduct)
            .unwrap()
            .directional(true);
        let config = SsvmConfig::new().c(10.0).unwrap().max_iter(20).unwrap();
        let mut learner = NSlackSsvm::new(&crf, config);
        learner.fit(&xs, &ys).unwrap();
        let curve = learner.objective_curve();
        assert!(!curve.is_empty());
        for pair in curve.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-9, "{curve:?}");
        }
    }

    #[test_log::test]
    fn test_oracle_failures_are_skipped() {
        // 2^25 labelings are too many to enumerate
        let (xs, ys) = test_utils::generate_crosses(2, 5, 0.1, 9);
        let crf = GridCrf::new(2, InferenceMethod::Exhaustive).unwrap();
        let mut learner = NSlackSsvm::new(&crf, SsvmConfig::new());
        learner.fit(&xs, &ys).unwrap();
        assert!(learner.weights().iter().all(|&v| v == 0.0));
        assert!(learner.objective_curve().is_empty());
    }

    #[test_log::test]
    fn test_approximate_inference() {
        let (x, y) = test_utils::generate_crosses(1, 5, 0.0, 0);
        let xs = vec![x[0].clone(), x[0].clone()];
        let ys = vec![y[0].clone(), y[0].clone()];
        let flipped: Vec<usize> = y[0].iter().map(|&l| 1 - l).collect();
        // the third answer is weaker than the constraint of the first one
        let answers = vec![vec![0; 25], vec![0; 25], y[0].clone(), flipped];
        let config = SsvmConfig::new().c(1e-3).unwrap();

        let crf = GridCrf::new(2, InferenceMethod::Icm)
            .unwrap()
            .with_oracle(Arc::new(ScriptedOracle::new(answers.clone())));
        let mut learner = NSlackSsvm::new(&crf, config.clone().break_on_bad(true));
        learner.fit(&xs, &ys).unwrap();
        assert_eq!(1, learner.n_bad_constraints());
        assert_eq!(1, learner.objective_curve().len());

        let crf = GridCrf::new(2, InferenceMethod::Icm)
            .unwrap()
            .with_oracle(Arc::new(ScriptedOracle::new(answers)));
        let mut learner = NSlackSsvm::new(&crf, config);
        learner.fit(&xs, &ys).unwrap();
        assert!(learner.n_bad_constraints() >= 1);
        assert!(learner.objective_curve().len() >= 2);
    }
}
