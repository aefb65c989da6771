use argmin_math::ArgminDot;

use crate::errors::{Result, SsvmError};
use crate::grid::Observation;
use crate::inference::{Labeling, Marginals};

/// Interface of a structured model learned by the SSVM learners.
///
/// A model defines the joint feature map `psi(x, y)`, the loss between two
/// labelings and (loss-augmented) inference. The score of a labeling is the
/// dot product of a weight vector with its joint feature. Implementations
/// never mutate `x` or `w`.
pub trait StructuredModel: Sync {
    /// Gets the length of the joint feature vector and of weight vectors.
    fn size_joint_feature(&self) -> usize;

    /// Validates the shape of an example.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when the example does not fit the
    /// model.
    fn check_example(&self, x: &Observation, y: &[usize]) -> Result<()>;

    /// Computes the joint feature of an integral labeling.
    fn joint_feature(&self, x: &Observation, y: &[usize]) -> Result<Vec<f64>>;

    /// Computes the joint feature of a fractional labeling.
    fn relaxed_joint_feature(&self, x: &Observation, y: &Marginals) -> Result<Vec<f64>>;

    /// Finds the labeling with the highest score.
    fn inference(&self, x: &Observation, w: &[f64]) -> Result<Vec<usize>>;

    /// Finds the labeling maximizing the score plus its loss against `y`.
    fn loss_augmented_inference(
        &self,
        x: &Observation,
        y: &[usize],
        w: &[f64],
        relaxed: bool,
    ) -> Result<Labeling>;

    /// Computes the loss between two integral labelings.
    fn loss(&self, y: &[usize], y_hat: &[usize]) -> f64;

    /// Computes the expected loss of a fractional labeling.
    fn continuous_loss(&self, y: &[usize], y_hat: &Marginals) -> f64;

    /// Computes the joint feature of any labeling.
    fn labeling_joint_feature(&self, x: &Observation, y: &Labeling) -> Result<Vec<f64>> {
        match y {
            Labeling::Integral(labels) => self.joint_feature(x, labels),
            Labeling::Relaxed(marginals) => self.relaxed_joint_feature(x, marginals),
        }
    }

    /// Computes the loss of any labeling.
    fn labeling_loss(&self, y: &[usize], y_hat: &Labeling) -> f64 {
        match y_hat {
            Labeling::Integral(labels) => self.loss(y, labels),
            Labeling::Relaxed(marginals) => self.continuous_loss(y, marginals),
        }
    }

    /// Computes the score `w · psi(x, y)`.
    fn potential(&self, x: &Observation, y: &Labeling, w: &[f64]) -> Result<f64> {
        check_weights(self.size_joint_feature(), w)?;
        Ok(self.labeling_joint_feature(x, y)?.dot(&w.to_vec()))
    }
}

/// Ensures a weight vector fits a model.
pub(crate) fn check_weights(size_joint_feature: usize, w: &[f64]) -> Result<()> {
    if w.len() != size_joint_feature {
        return Err(SsvmError::modeling(format!(
            "weight vector has {} entries, the joint feature has {}",
            w.len(),
            size_joint_feature
        )));
    }
    Ok(())
}

/// Hamming distance of two label maps.
#[inline(always)]
pub(crate) fn hamming<F>(y: &[usize], y_hat: &[usize], f: F) -> f64
where
    F: Fn(usize) -> usize,
{
    debug_assert_eq!(y.len(), y_hat.len());
    y.iter()
        .zip(y_hat)
        .filter(|(&a, &b)| f(a) != f(b))
        .count() as f64
}
