use crate::errors::Result;
use crate::inference::{argmax, Adjacency, InferenceOracle, Labeling, Potentials};

const MAX_SWEEPS: usize = 100;

/// Iterated conditional modes.
///
/// Starts from the per-node unary argmax and greedily moves single nodes to
/// their best state until no move improves the score. Converges to a local
/// optimum only.
#[derive(Clone, Debug)]
pub struct Icm {
    max_sweeps: usize,
}

impl Icm {
    /// Creates a new oracle.
    pub fn new() -> Self {
        Self {
            max_sweeps: MAX_SWEEPS,
        }
    }
}

impl Default for Icm {
    fn default() -> Self {
        Self::new()
    }
}

/// Improves `labels` in place by single-node moves. A node only changes its
/// state when the new one is strictly better, so the score never decreases.
pub(crate) fn polish(
    potentials: &Potentials,
    adjacency: &Adjacency,
    labels: &mut [usize],
    max_sweeps: usize,
) {
    let mut scores = vec![0.0; potentials.n_states];
    for _ in 0..max_sweeps {
        let mut changed = false;
        for i in 0..labels.len() {
            for (s, score) in scores.iter_mut().enumerate() {
                *score = adjacency.local_score(potentials, labels, i, s);
            }
            let best = argmax(&scores);
            if scores[best] > scores[labels[i]] {
                labels[i] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

impl InferenceOracle for Icm {
    fn infer(&self, potentials: &Potentials, _relaxed: bool) -> Result<Labeling> {
        potentials.validate()?;
        let adjacency = Adjacency::new(potentials.n_nodes(), potentials.edges);
        let mut labels: Vec<usize> = (0..potentials.n_nodes())
            .map(|i| argmax(potentials.unary_of(i)))
            .collect();
        polish(potentials, &adjacency, &mut labels, self.max_sweeps);
        Ok(Labeling::Integral(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unary_only() {
        let unary = [0.0, 1.0, 2.0, 0.0, 1.0, 1.0];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[],
            edge_classes: &[],
            pairwise: &[0.0; 4],
        };
        let labeling = Icm::new().infer(&potentials, false).unwrap();
        assert_eq!(Labeling::Integral(vec![1, 0, 0]), labeling);
    }

    // 0 - 1
    //
    // node 1 is weakly in favor of state 1 but strongly attracted to the
    // state of node 0.
    #[test]
    fn test_smoothing() {
        let unary = [3.0, 0.0, 0.0, 1.0];
        let pairwise = [2.0, 0.0, 0.0, 2.0];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[(0, 1)],
            edge_classes: &[0],
            pairwise: &pairwise,
        };
        let labeling = Icm::new().infer(&potentials, false).unwrap();
        assert_eq!(Labeling::Integral(vec![0, 0]), labeling);
    }

    #[test]
    fn test_invalid_edges() {
        let unary = [0.0; 4];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[(0, 2)],
            edge_classes: &[0],
            pairwise: &[0.0; 4],
        };
        assert!(Icm::new().infer(&potentials, false).is_err());
    }
}
