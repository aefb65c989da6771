use crate::errors::{Result, SsvmError};
use crate::inference::{InferenceOracle, Labeling, Potentials};

const MAX_CONFIGURATIONS: f64 = (1u64 << 20) as f64;

/// Brute-force enumeration of every labeling.
///
/// Exact, and only usable on tiny graphs.
#[derive(Clone, Debug, Default)]
pub struct Exhaustive;

impl Exhaustive {
    /// Creates a new oracle.
    pub const fn new() -> Self {
        Self
    }
}

impl InferenceOracle for Exhaustive {
    fn infer(&self, potentials: &Potentials, _relaxed: bool) -> Result<Labeling> {
        potentials.validate()?;
        let n_nodes = potentials.n_nodes();
        let n_states = potentials.n_states;
        if (n_states as f64).powi(i32::try_from(n_nodes).unwrap_or(i32::MAX)) > MAX_CONFIGURATIONS {
            return Err(SsvmError::inference(format!(
                "{n_states}^{n_nodes} labelings are too many to enumerate"
            )));
        }
        let mut labels = vec![0; n_nodes];
        let mut best = labels.clone();
        let mut best_score = potentials.score(&labels);
        'outer: loop {
            // odometer increment, node 0 is the fastest digit
            for digit in labels.iter_mut() {
                *digit += 1;
                if *digit < n_states {
                    let score = potentials.score(&labels);
                    if score > best_score {
                        best_score = score;
                        best.copy_from_slice(&labels);
                    }
                    continue 'outer;
                }
                *digit = 0;
            }
            break;
        }
        Ok(Labeling::Integral(best))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 0 - 1 - 2
    #[test]
    fn test_best_labeling() {
        let unary = [1.0, 0.0, 0.0, 0.5, 0.0, 1.0];
        let pairwise = [0.0, -2.0, -2.0, 0.0];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[(0, 1), (1, 2)],
            edge_classes: &[0, 0],
            pairwise: &pairwise,
        };
        // [1, 1, 1] scores 1.5, [0, 0, 0] scores 1.0, mixed labelings pay 2.0
        let labeling = Exhaustive::new().infer(&potentials, false).unwrap();
        assert_eq!(Labeling::Integral(vec![1, 1, 1]), labeling);
    }

    #[test]
    fn test_too_large() {
        let unary = vec![0.0; 2 * 30];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[],
            edge_classes: &[],
            pairwise: &[0.0; 4],
        };
        let result = Exhaustive::new().infer(&potentials, false);
        assert!(matches!(result, Err(SsvmError::Inference(_))));
    }
}
