//! Definition of errors.

use core::fmt;

use std::error::Error;

/// Error used when an argument or a configuration value is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    msg: String,
}

/// Error used when the model configuration or the data shapes are malformed.
#[derive(Debug)]
pub struct ModelingError {
    msg: String,
}

/// Error returned by an inference oracle that could not produce a labeling.
#[derive(Debug)]
pub struct InferenceError {
    msg: String,
}

/// Error used when the quadratic sub-problem of a cutting-plane learner
/// cannot be solved.
#[derive(Debug)]
pub struct OptimizationInfeasibleError {
    msg: String,
}

/// Error used when a snapshot cannot be written or read.
#[derive(Debug)]
pub struct PersistenceError {
    msg: String,
}

/// The error type for structsvm.
#[derive(Debug)]
pub enum SsvmError {
    /// Invalid argument or configuration value.
    InvalidArgument(InvalidArgumentError),

    /// Malformed model configuration or data. Fatal.
    Modeling(ModelingError),

    /// Oracle failure. Learners recover from it.
    Inference(InferenceError),

    /// Broken constraint data in the QP. Fatal.
    OptimizationInfeasible(OptimizationInfeasibleError),

    /// Encoding or decoding of a snapshot failed.
    Persistence(PersistenceError),
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}", self.msg)
    }
}

impl Error for InvalidArgumentError {}

impl fmt::Display for ModelingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ModelingError: {}", self.msg)
    }
}

impl Error for ModelingError {}

impl fmt::Display for InferenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InferenceError: {}", self.msg)
    }
}

impl Error for InferenceError {}

impl fmt::Display for OptimizationInfeasibleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OptimizationInfeasibleError: {}", self.msg)
    }
}

impl Error for OptimizationInfeasibleError {}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PersistenceError: {}", self.msg)
    }
}

impl Error for PersistenceError {}

impl SsvmError {
    /// Creates a new [`InvalidArgumentError`].
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(InvalidArgumentError { msg: msg.into() })
    }

    /// Creates a new [`ModelingError`].
    pub fn modeling<S: Into<String>>(msg: S) -> Self {
        Self::Modeling(ModelingError { msg: msg.into() })
    }

    /// Creates a new [`InferenceError`].
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(InferenceError { msg: msg.into() })
    }

    /// Creates a new [`OptimizationInfeasibleError`].
    pub fn optimization_infeasible<S: Into<String>>(msg: S) -> Self {
        Self::OptimizationInfeasible(OptimizationInfeasibleError { msg: msg.into() })
    }

    /// Creates a new [`PersistenceError`].
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(PersistenceError { msg: msg.into() })
    }

    /// Returns `true` if the learner can continue after this error.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Inference(_))
    }
}

impl fmt::Display for SsvmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => e.fmt(f),
            Self::Modeling(e) => e.fmt(f),
            Self::Inference(e) => e.fmt(f),
            Self::OptimizationInfeasible(e) => e.fmt(f),
            Self::Persistence(e) => e.fmt(f),
        }
    }
}

impl Error for SsvmError {}

impl From<bincode::error::EncodeError> for SsvmError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::persistence(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for SsvmError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::persistence(e.to_string())
    }
}

/// A specialized Result type.
pub type Result<T, E = SsvmError> = core::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = SsvmError::modeling("n_states must not be 0");
        assert_eq!("ModelingError: n_states must not be 0", e.to_string());
        let e = SsvmError::invalid_argument("c must be positive");
        assert_eq!("InvalidArgumentError: c must be positive", e.to_string());
    }

    #[test]
    fn test_recoverable() {
        assert!(SsvmError::inference("too many nodes").is_recoverable());
        assert!(!SsvmError::optimization_infeasible("nan").is_recoverable());
        assert!(!SsvmError::modeling("shape").is_recoverable());
    }
}
