use argmin_math::{ArgminAdd, ArgminDot, ArgminMul, ArgminSub};
use log::{debug, info, warn};

use crate::errors::Result;
use crate::grid::Observation;
use crate::learners::qp::{Constraint, ConstraintPool};
use crate::learners::{self, Learner, SsvmConfig};
use crate::model::StructuredModel;

/// Cutting-plane SSVM with a single slack variable shared by all examples.
///
/// Every round adds one constraint built from the means of the joint
/// feature differences and of the losses of the most violating labelings.
/// Learning stops when the new constraint is violated by at most `tol`, or
/// when `check_constraints` finds it weaker than the pool or already in it.
pub struct OneSlackSsvm<'a, M: ?Sized> {
    model: &'a M,
    config: SsvmConfig,
    w: Vec<f64>,
    objective_curve: Vec<f64>,
    n_bad_constraints: usize,
}

impl<'a, M> OneSlackSsvm<'a, M>
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

    /// Gets the number of rounds of the last fit in which loss-augmented
    /// inference was detected to be approximate.
    pub fn n_bad_constraints(&self) -> usize {
        self.n_bad_constraints
    }
}

impl<M> Learner for OneSlackSsvm<'_, M>
where
    M: StructuredModel + ?Sized,
{
    fn fit(&mut self, xs: &[Observation], ys: &[Vec<usize>]) -> Result<()> {
        learners::check_examples(self.model, xs, ys)?;
        let size = self.model.size_joint_feature();
        let n = xs.len() as f64;
        self.w = vec![0.0; size];
        self.objective_curve.clear();
        self.n_bad_constraints = 0;

        let psi_true = learners::joint_features(self.model, xs, ys, self.config.n_jobs)?;
        let mut pool = ConstraintPool::new(1, self.config.c, self.config.qp_max_sweeps);
        for iteration in 0..self.config.max_iter {
            let violations = learners::find_violations(self.model, xs, ys, &self.w, &self.config)?;

            // skipped examples count as correctly labeled
            let mut dpsi = vec![0.0; size];
            let mut loss = 0.0;
            for (i, violation) in violations.into_iter().enumerate() {
                if let Some(v) = violation {
                    if self.config.verbose >= 2 {
                        debug!("example {i}: loss {}", v.loss);
                    }
                    dpsi = dpsi.add(&psi_true[i].sub(&v.psi));
                    loss += v.loss;
                }
            }
            let dpsi = dpsi.mul(&(1.0 / n));
            let loss = loss / n;

            let slack = pool.slack(0);
            let violation = loss - ArgminDot::<Vec<f64>, f64>::dot(&self.w, &dpsi) - slack;
            if self.config.verbose >= 1 {
                info!(
                    "iteration {iteration}: mean loss {loss:.6}, violation {violation:.6}, \
                     {} constraints",
                    pool.len()
                );
            }
            if self.config.check_constraints
                && (violation < -learners::BAD_CONSTRAINT_TOL
                    || (violation > self.config.tol && pool.contains(0, &dpsi, loss)))
            {
                // no new constraint can be found by this oracle
                self.n_bad_constraints += 1;
                warn!(
                    "iteration {iteration}: the most violated constraint is weaker than the \
                     pool (violation {violation:.6}); inference may be approximate"
                );
                break;
            }
            if violation <= self.config.tol {
                if self.config.verbose >= 1 {
                    info!("no constraint violated by more than {}", self.config.tol);
                }
                break;
            }
            pool.push(Constraint {
                dpsi,
                loss,
                block: 0,
            })?;
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
        let (xs, ys) = test_utils::generate_crosses(4, 6, 0.6, 5);
        let crf = GridCrf::new(2, InferenceMethod::MaxProduct).unwrap();
        let config = SsvmConfig::new().c(10.0).unwrap().max_iter(30).unwrap();
        let mut learner = OneSlackSsvm::new(&crf, config);
        learner.fit(&xs, &ys).unwrap();
        let curve = learner.objective_curve();
        assert!(!curve.is_empty());
        for pair in curve.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-9, "{curve:?}");
        }
    }

    #[test]
    fn test_refit_starts_from_zero() {
        let (xs, ys) = test_utils::generate_crosses(3, 5, 0.2, 2);
        let crf = GridCrf::new(2, InferenceMethod::Icm).unwrap();
        let mut learner = OneSlackSsvm::new(&crf, SsvmConfig::new().max_iter(20).unwrap());
        learner.fit(&xs, &ys).unwrap();
        let w = learner.weights().to_vec();
        let curve = learner.objective_curve().to_vec();
        learner.fit(&xs, &ys).unwrap();
        assert_eq!(w, learner.weights());
        assert_eq!(curve, learner.objective_curve());
    }

    #[test]
    fn test_relaxed() {
        let (xs, ys) = test_utils::generate_crosses(3, 5, 0.1, 4);
        let crf = GridCrf::new(2, InferenceMethod::MaxProduct).unwrap();
        let config = SsvmConfig::new()
            .c(100.0)
            .unwrap()
            .max_iter(50)
            .unwrap()
            .relaxed(true);
        let mut learner = OneSlackSsvm::new(&crf, config);
        learner.fit(&xs, &ys).unwrap();
        assert_eq!(ys, learner.predict(&xs).unwrap());
    }

    #[test_log::test]
    fn test_approximate_inference_stops_learning() {
        let (xs, ys) = test_utils::generate_crosses(1, 5, 0.0, 0);
        // the second answer is weaker than the constraint of the first one
        let oracle = Arc::new(ScriptedOracle::new(vec![vec![0; 25], ys[0].clone()]));
        let crf = GridCrf::new(2, InferenceMethod::Icm)
            .unwrap()
            .with_oracle(oracle.clone());
        let config = SsvmConfig::new().c(1e-3).unwrap();
        let mut learner = OneSlackSsvm::new(&crf, config.clone());
        learner.fit(&xs, &ys).unwrap();
        assert_eq!(1, learner.n_bad_constraints());
        assert_eq!(1, learner.objective_curve().len());
        assert_eq!(2, oracle.calls());

        let oracle = Arc::new(ScriptedOracle::new(vec![vec![0; 25], ys[0].clone()]));
        let crf = GridCrf::new(2, InferenceMethod::Icm)
            .unwrap()
            .with_oracle(oracle);
        let mut learner = OneSlackSsvm::new(&crf, config.check_constraints(false));
        learner.fit(&xs, &ys).unwrap();
        assert_eq!(0, learner.n_bad_constraints());
    }
}
