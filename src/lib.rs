//! # structsvm
//!
//! Structural SVMs over grid CRFs with latent sub-states, implemented in pure
//! Rust.
//!
//! A [`GridCrf`] scores label maps of 2D grids with unary and pairwise
//! potentials. A [`LatentCrf`] splits every visible label into hidden
//! sub-states, and [`LatentSsvm`] learns its weights by alternating between a
//! base SSVM learner and hidden state completion.
//!
//! ## Examples
//!
//! ```rust
//! use structsvm::{BaseSvm, InferenceMethod, LatentCrf, LatentSsvm, Observation, SsvmConfig};
//!
//! // 3x3 image with a vertical bar of label 1
//! let y = vec![0, 1, 0, 0, 1, 0, 0, 1, 0];
//! let data: Vec<f64> = y
//!     .iter()
//!     .flat_map(|&l| if l == 1 { [0.2, 0.8] } else { [0.9, 0.1] })
//!     .collect();
//! let x = Observation::new(3, 3, 2, data)?;
//!
//! let crf = LatentCrf::grid(2, 2, InferenceMethod::MaxProduct)?;
//! let config = SsvmConfig::new().c(100.0)?.max_iter(50)?;
//! let mut ssvm = LatentSsvm::new(crf, BaseSvm::OneSlack, config);
//! ssvm.fit(&[x.clone()], &[y.clone()], None)?;
//!
//! assert_eq!(vec![y], ssvm.predict(&[x])?);
//! # Ok::<(), structsvm::SsvmError>(())
//! ```
#![deny(missing_docs)]

pub mod errors;
pub mod inference;
pub mod learners;

mod grid;
mod grid_crf;
mod kmeans;
mod latent;
mod latent_ssvm;
mod math;
mod model;
mod parallel;
mod snapshot;

#[cfg(test)]
mod test_utils;

pub use errors::{Result, SsvmError};
pub use grid::{EdgeSet, Neighborhood, Observation};
pub use grid_crf::GridCrf;
pub use inference::{InferenceMethod, InferenceOracle, Labeling, Marginals, Potentials};
pub use latent::{LatentAssignment, LatentCrf, LatentCrfConfig, StateLayout, StatesPerLabel};
pub use latent_ssvm::{LatentSsvm, LatentStatus};
pub use learners::{BaseSvm, Learner, LearningRateDecay, SsvmConfig};
pub use model::StructuredModel;
pub use snapshot::Snapshot;
