//! Structural SVM learners.
//!
//! Three strategies share [`SsvmConfig`] and the [`Learner`] interface:
//! [`OneSlackSsvm`] and [`NSlackSsvm`] are cutting-plane methods solving the
//! dual QP over a growing constraint pool, [`SubgradientSsvm`] takes
//! subgradient steps on the primal.
//!
//! The cutting-plane guarantees hold when loss-augmented inference is exact.
//! With approximate oracles the learners may need more iterations or stop
//! early; with `check_constraints` enabled this is reported as a warning.

mod n_slack;
mod one_slack;
mod qp;
mod subgradient;

use core::fmt;
use core::str::FromStr;

use log::warn;

use crate::errors::{Result, SsvmError};
use crate::grid::Observation;
use crate::model::StructuredModel;
use crate::parallel;

pub use n_slack::NSlackSsvm;
pub use one_slack::OneSlackSsvm;
pub use subgradient::SubgradientSsvm;

/// Violations below this value prove that the oracle missed a known
/// constraint.
pub(crate) const BAD_CONSTRAINT_TOL: f64 = 1e-5;

/// Learning rate decay settings of [`SubgradientSsvm`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LearningRateDecay {
    /// The learning rate at fractional epoch `t` is `eta / (t + 1)`.
    Inverse,

    /// The learning rate at fractional epoch `t` is `eta * alpha^t`.
    Exponential(f64),
}

impl LearningRateDecay {
    #[inline(always)]
    pub(crate) fn factor(self, t: f64) -> f64 {
        match self {
            Self::Inverse => 1.0 / (t + 1.0),
            Self::Exponential(alpha) => alpha.powf(t),
        }
    }
}

/// Hyper-parameters shared by all learners.
#[derive(Clone, Debug, PartialEq)]
pub struct SsvmConfig {
    pub(crate) c: f64,
    pub(crate) tol: f64,
    pub(crate) max_iter: usize,
    pub(crate) verbose: u8,
    pub(crate) check_constraints: bool,
    pub(crate) break_on_bad: bool,
    pub(crate) n_jobs: usize,
    pub(crate) relaxed: bool,
    pub(crate) learning_rate: f64,
    pub(crate) decay: LearningRateDecay,
    pub(crate) qp_max_sweeps: usize,
}

impl SsvmConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            c: 1.0,
            tol: 1e-3,
            max_iter: 100,
            verbose: 0,
            check_constraints: true,
            break_on_bad: false,
            n_jobs: 1,
            relaxed: false,
            learning_rate: 0.01,
            decay: LearningRateDecay::Inverse,
            qp_max_sweeps: 1000,
        }
    }

    /// Sets the regularization trade-off `C`.
    ///
    /// # Errors
    ///
    /// `c` must be positive and finite.
    pub fn c(mut self, c: f64) -> Result<Self> {
        if !(c.is_finite() && c > 0.0) {
            return Err(SsvmError::invalid_argument("c must be positive and finite"));
        }
        self.c = c;
        Ok(self)
    }

    /// Sets the stopping tolerance.
    ///
    /// # Errors
    ///
    /// `tol` must be non-negative and finite.
    pub fn tol(mut self, tol: f64) -> Result<Self> {
        if !(tol.is_finite() && tol >= 0.0) {
            return Err(SsvmError::invalid_argument(
                "tol must be greater than or equal to 0.0",
            ));
        }
        self.tol = tol;
        Ok(self)
    }

    /// Sets the maximum number of iterations.
    ///
    /// # Errors
    ///
    /// `max_iter` must not be 0.
    pub fn max_iter(mut self, max_iter: usize) -> Result<Self> {
        if max_iter == 0 {
            return Err(SsvmError::invalid_argument("max_iter must not be 0"));
        }
        self.max_iter = max_iter;
        Ok(self)
    }

    /// Sets the verbosity. 1 logs progress per iteration, 2 also logs
    /// per-example details.
    pub fn verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Enables detection of approximate loss-augmented inference: a returned
    /// constraint that is weaker than the pool or already in it.
    pub fn check_constraints(mut self, check_constraints: bool) -> Self {
        self.check_constraints = check_constraints;
        self
    }

    /// Stops learning when inference turns out to be approximate.
    ///
    /// [`NSlackSsvm`] stops after a round with a bad constraint. [`OneSlackSsvm`]
    /// always stops on a bad constraint. [`LatentSsvm`](crate::LatentSsvm)
    /// stops the outer loop with [`LatentStatus::Diverged`](crate::LatentStatus)
    /// when hidden state completion falls back to the trivial assignment.
    pub fn break_on_bad(mut self, break_on_bad: bool) -> Self {
        self.break_on_bad = break_on_bad;
        self
    }

    /// Sets the number of worker threads for inference.
    ///
    /// # Errors
    ///
    /// `n_jobs` must not be 0.
    pub fn n_jobs(mut self, n_jobs: usize) -> Result<Self> {
        if n_jobs == 0 {
            return Err(SsvmError::invalid_argument("n_jobs must not be 0"));
        }
        self.n_jobs = n_jobs;
        Ok(self)
    }

    /// Uses relaxed loss-augmented inference.
    pub fn relaxed(mut self, relaxed: bool) -> Self {
        self.relaxed = relaxed;
        self
    }

    /// Sets the learning rate of [`SubgradientSsvm`] and its decay.
    ///
    /// # Errors
    ///
    /// `eta` must be positive and finite, and the exponential decay factor
    /// must be in `(0, 1]`.
    pub fn learning_rate(mut self, eta: f64, decay: LearningRateDecay) -> Result<Self> {
        if !(eta.is_finite() && eta > 0.0) {
            return Err(SsvmError::invalid_argument(
                "learning rate must be positive and finite",
            ));
        }
        if let LearningRateDecay::Exponential(alpha) = decay {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(SsvmError::invalid_argument(
                    "decay factor must be in (0.0, 1.0]",
                ));
            }
        }
        self.learning_rate = eta;
        self.decay = decay;
        Ok(self)
    }

    /// Sets the maximum number of sweeps of the dual QP solver per round.
    ///
    /// # Errors
    ///
    /// `qp_max_sweeps` must not be 0.
    pub fn qp_max_sweeps(mut self, qp_max_sweeps: usize) -> Result<Self> {
        if qp_max_sweeps == 0 {
            return Err(SsvmError::invalid_argument("qp_max_sweeps must not be 0"));
        }
        self.qp_max_sweeps = qp_max_sweeps;
        Ok(self)
    }
}

impl Default for SsvmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Interface of the SSVM learners.
pub trait Learner {
    /// Learns weights from examples, starting from zero weights.
    ///
    /// # Errors
    ///
    /// Shape mismatches are returned as [`SsvmError::Modeling`], mismatching
    /// or empty inputs as [`SsvmError::InvalidArgument`] and a broken dual QP
    /// as [`SsvmError::OptimizationInfeasible`]. Oracle failures are logged
    /// and skipped.
    fn fit(&mut self, xs: &[Observation], ys: &[Vec<usize>]) -> Result<()>;

    /// Gets the learned weights.
    fn weights(&self) -> &[f64];

    /// Predicts a labeling of every observation.
    fn predict(&self, xs: &[Observation]) -> Result<Vec<Vec<usize>>>;

    /// Gets the objective value recorded after each iteration.
    fn objective_curve(&self) -> &[f64];
}

/// Learning strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BaseSvm {
    /// [`OneSlackSsvm`].
    #[default]
    OneSlack,

    /// [`NSlackSsvm`].
    NSlack,

    /// [`SubgradientSsvm`].
    Subgradient,
}

impl BaseSvm {
    /// Creates a learner of this strategy.
    pub fn build<'a, M>(self, model: &'a M, config: SsvmConfig) -> Box<dyn Learner + 'a>
    where
        M: StructuredModel,
    {
        match self {
            Self::OneSlack => Box::new(OneSlackSsvm::new(model, config)),
            Self::NSlack => Box::new(NSlackSsvm::new(model, config)),
            Self::Subgradient => Box::new(SubgradientSsvm::new(model, config)),
        }
    }
}

impl FromStr for BaseSvm {
    type Err = SsvmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1-slack" => Ok(Self::OneSlack),
            "n-slack" => Ok(Self::NSlack),
            "subgradient" => Ok(Self::Subgradient),
            _ => Err(SsvmError::invalid_argument(format!(
                "unknown base SSVM: {s}"
            ))),
        }
    }
}

impl fmt::Display for BaseSvm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::OneSlack => "1-slack",
            Self::NSlack => "n-slack",
            Self::Subgradient => "subgradient",
        })
    }
}

/// Joint feature and loss of a loss-augmented labeling.
pub(crate) struct Violation {
    pub psi: Vec<f64>,
    pub loss: f64,
}

pub(crate) fn check_examples<M>(
    model: &M,
    xs: &[Observation],
    ys: &[Vec<usize>],
) -> Result<()>
where
    M: StructuredModel + ?Sized,
{
    if xs.len() != ys.len() {
        return Err(SsvmError::invalid_argument(format!(
            "{} observations but {} label maps",
            xs.len(),
            ys.len()
        )));
    }
    if xs.is_empty() {
        return Err(SsvmError::invalid_argument("no training examples"));
    }
    for (x, y) in xs.iter().zip(ys) {
        model.check_example(x, y)?;
    }
    Ok(())
}

pub(crate) fn joint_features<M>(
    model: &M,
    xs: &[Observation],
    ys: &[Vec<usize>],
    n_jobs: usize,
) -> Result<Vec<Vec<f64>>>
where
    M: StructuredModel + ?Sized,
{
    parallel::map(xs, n_jobs, |i, x| model.joint_feature(x, &ys[i]))
        .into_iter()
        .collect()
}

fn violation<M>(
    model: &M,
    x: &Observation,
    y: &[usize],
    w: &[f64],
    relaxed: bool,
) -> Result<Violation>
where
    M: StructuredModel + ?Sized,
{
    let y_hat = model.loss_augmented_inference(x, y, w, relaxed)?;
    Ok(Violation {
        psi: model.labeling_joint_feature(x, &y_hat)?,
        loss: model.labeling_loss(y, &y_hat),
    })
}

/// Runs loss-augmented inference on one example. Oracle failures are logged
/// and yield `None`.
pub(crate) fn find_violation<M>(
    model: &M,
    i: usize,
    x: &Observation,
    y: &[usize],
    w: &[f64],
    relaxed: bool,
) -> Result<Option<Violation>>
where
    M: StructuredModel + ?Sized,
{
    match violation(model, x, y, w, relaxed) {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_recoverable() => {
            warn!("example {i}: {e}; no constraint this round");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Runs loss-augmented inference on every example in parallel.
pub(crate) fn find_violations<M>(
    model: &M,
    xs: &[Observation],
    ys: &[Vec<usize>],
    w: &[f64],
    config: &SsvmConfig,
) -> Result<Vec<Option<Violation>>>
where
    M: StructuredModel + ?Sized,
{
    parallel::map(xs, config.n_jobs, |i, x| {
        find_violation(model, i, x, &ys[i], w, config.relaxed)
    })
    .into_iter()
    .collect()
}

pub(crate) fn predict<M>(
    model: &M,
    xs: &[Observation],
    w: &[f64],
    n_jobs: usize,
) -> Result<Vec<Vec<usize>>>
where
    M: StructuredModel + ?Sized,
{
    parallel::map(xs, n_jobs, |_, x| model.inference(x, w))
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grid_crf::GridCrf;
    use crate::inference::InferenceMethod;
    use crate::test_utils::{self, assert_close};

    fn training_loss<M>(model: &M, ys: &[Vec<usize>], predictions: &[Vec<usize>]) -> f64
    where
        M: StructuredModel,
    {
        ys.iter()
            .zip(predictions)
            .map(|(y, y_hat)| model.loss(y, y_hat))
            .sum()
    }

    #[test]
    fn test_config_validation() {
        assert!(matches!(
            SsvmConfig::new().c(0.0),
            Err(SsvmError::InvalidArgument(_))
        ));
        assert!(SsvmConfig::new().c(f64::NAN).is_err());
        assert!(SsvmConfig::new().tol(-1.0).is_err());
        assert!(SsvmConfig::new().max_iter(0).is_err());
        assert!(SsvmConfig::new().n_jobs(0).is_err());
        assert!(SsvmConfig::new().qp_max_sweeps(0).is_err());
        assert!(SsvmConfig::new()
            .learning_rate(0.0, LearningRateDecay::Inverse)
            .is_err());
        assert!(SsvmConfig::new()
            .learning_rate(0.1, LearningRateDecay::Exponential(1.5))
            .is_err());
        let config = SsvmConfig::new()
            .c(10.0)
            .unwrap()
            .learning_rate(0.1, LearningRateDecay::Exponential(0.9))
            .unwrap();
        assert_eq!(10.0, config.c);
        assert_eq!(LearningRateDecay::Exponential(0.9), config.decay);
    }

    #[test]
    fn test_decay() {
        assert_close!(0.5, LearningRateDecay::Inverse.factor(1.0));
        assert_close!(0.25, LearningRateDecay::Exponential(0.5).factor(2.0));
    }

    #[test]
    fn test_base_svm_from_str() {
        assert_eq!(BaseSvm::OneSlack, "1-slack".parse().unwrap());
        assert_eq!(BaseSvm::NSlack, "n-slack".parse().unwrap());
        assert_eq!(BaseSvm::Subgradient, "subgradient".parse().unwrap());
        assert!(matches!(
            "2-slack".parse::<BaseSvm>(),
            Err(SsvmError::InvalidArgument(_))
        ));
        for base in [BaseSvm::OneSlack, BaseSvm::NSlack, BaseSvm::Subgradient] {
            assert_eq!(base, base.to_string().parse().unwrap());
        }
    }

    #[test]
    fn test_check_examples() {
        let (xs, ys) = test_utils::generate_crosses(2, 5, 0.1, 0);
        let crf = GridCrf::new(2, InferenceMethod::Icm).unwrap();
        assert!(check_examples(&crf, &xs, &ys).is_ok());
        assert!(matches!(
            check_examples(&crf, &xs, &ys[..1]),
            Err(SsvmError::InvalidArgument(_))
        ));
        assert!(check_examples(&crf, &[], &[]).is_err());
        let crf = GridCrf::new(3, InferenceMethod::Icm).unwrap();
        assert!(matches!(
            check_examples(&crf, &xs, &ys),
            Err(SsvmError::Modeling(_))
        ));
    }

    #[test_log::test]
    fn test_strategies_reach_zero_loss() {
        let (xs, ys) = test_utils::generate_crosses(4, 6, 0.2, 7);
        let crf = GridCrf::new(2, InferenceMethod::MaxProduct).unwrap();
        let config = SsvmConfig::new()
            .c(100.0)
            .unwrap()
            .max_iter(100)
            .unwrap();
        let zero = vec![0.0; crf.size_joint_feature()];
        let baseline = predict(&crf, &xs, &zero, 1).unwrap();
        assert!(training_loss(&crf, &ys, &baseline) > 0.0);
        for base in [BaseSvm::OneSlack, BaseSvm::NSlack, BaseSvm::Subgradient] {
            let mut learner = base.build(&crf, config.clone());
            learner.fit(&xs, &ys).unwrap();
            let predictions = learner.predict(&xs).unwrap();
            assert_eq!(0.0, training_loss(&crf, &ys, &predictions), "{base}");
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let (xs, ys) = test_utils::generate_crosses(5, 6, 0.4, 3);
        let crf = GridCrf::new(2, InferenceMethod::MaxProduct).unwrap();
        for base in [BaseSvm::OneSlack, BaseSvm::NSlack, BaseSvm::Subgradient] {
            let config = SsvmConfig::new().max_iter(10).unwrap();
            let mut sequential = base.build(&crf, config.clone());
            sequential.fit(&xs, &ys).unwrap();
            let mut parallel = base.build(&crf, config.n_jobs(3).unwrap());
            parallel.fit(&xs, &ys).unwrap();
            assert_eq!(sequential.weights(), parallel.weights(), "{base}");
            assert_eq!(sequential.objective_curve(), parallel.objective_curve());
        }
    }
}
