use crate::errors::Result;
use crate::inference::icm;
use crate::inference::{argmax, Adjacency, InferenceOracle, Labeling, Marginals, Potentials};
use crate::math;

const MAX_ITER: usize = 100;
const DAMPING: f64 = 0.5;
const CONVERGENCE_TOL: f64 = 1e-9;

/// Damped loopy max-product belief propagation.
///
/// Exact on trees. On loopy graphs the decoded labeling is refined by
/// iterated conditional modes, which makes the result a local optimum at
/// least.
#[derive(Clone, Debug)]
pub struct MaxProduct {
    max_iter: usize,
    damping: f64,
}

impl MaxProduct {
    /// Creates a new oracle.
    pub fn new() -> Self {
        Self {
            max_iter: MAX_ITER,
            damping: DAMPING,
        }
    }

    // messages[(2 * e) * n ..] flows source -> target and is indexed by the
    // target state, messages[(2 * e + 1) * n ..] flows back.
    fn beliefs(potentials: &Potentials, messages: &[f64], beliefs: &mut [f64]) {
        let n = potentials.n_states;
        beliefs.copy_from_slice(potentials.unary);
        for (e, &(i, j)) in potentials.edges.iter().enumerate() {
            let forward = &messages[2 * e * n..(2 * e + 1) * n];
            let backward = &messages[(2 * e + 1) * n..(2 * e + 2) * n];
            for (b, m) in beliefs[j * n..(j + 1) * n].iter_mut().zip(forward) {
                *b += m;
            }
            for (b, m) in beliefs[i * n..(i + 1) * n].iter_mut().zip(backward) {
                *b += m;
            }
        }
    }

    fn run(&self, potentials: &Potentials) -> Vec<f64> {
        let n = potentials.n_states;
        let n_edges = potentials.edges.len();
        let mut messages = vec![0.0; 2 * n_edges * n];
        let mut new_messages = vec![0.0; 2 * n_edges * n];
        let mut beliefs = vec![0.0; potentials.unary.len()];
        for _ in 0..self.max_iter {
            Self::beliefs(potentials, &messages, &mut beliefs);
            for (e, &(i, j)) in potentials.edges.iter().enumerate() {
                let forward = 2 * e * n;
                let backward = (2 * e + 1) * n;
                for t in 0..n {
                    let mut best = f64::NEG_INFINITY;
                    for s in 0..n {
                        let v = beliefs[i * n + s] - messages[backward + s]
                            + potentials.pairwise_of(e, s, t);
                        best = best.max(v);
                    }
                    new_messages[forward + t] = best;
                }
                for s in 0..n {
                    let mut best = f64::NEG_INFINITY;
                    for t in 0..n {
                        let v = beliefs[j * n + t] - messages[forward + t]
                            + potentials.pairwise_of(e, s, t);
                        best = best.max(v);
                    }
                    new_messages[backward + s] = best;
                }
            }
            let mut delta: f64 = 0.0;
            for (old, new) in messages
                .chunks_exact_mut(n)
                .zip(new_messages.chunks_exact(n))
            {
                let offset = new.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                for (o, &v) in old.iter_mut().zip(new) {
                    let v = self.damping * *o + (1.0 - self.damping) * (v - offset);
                    delta = delta.max((v - *o).abs());
                    *o = v;
                }
            }
            if delta < CONVERGENCE_TOL {
                break;
            }
        }
        Self::beliefs(potentials, &messages, &mut beliefs);
        beliefs
    }
}

impl Default for MaxProduct {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceOracle for MaxProduct {
    fn infer(&self, potentials: &Potentials, relaxed: bool) -> Result<Labeling> {
        potentials.validate()?;
        let n = potentials.n_states;
        let beliefs = self.run(potentials);
        if relaxed {
            let mut unary = Vec::with_capacity(beliefs.len());
            for b in beliefs.chunks_exact(n) {
                unary.extend(math::softmax(b));
            }
            let mut pairwise = Vec::with_capacity(potentials.edges.len() * n * n);
            for &(i, j) in potentials.edges {
                for s in 0..n {
                    for t in 0..n {
                        pairwise.push(unary[i * n + s] * unary[j * n + t]);
                    }
                }
            }
            return Ok(Labeling::Relaxed(Marginals::new(n, unary, pairwise)));
        }
        let mut labels: Vec<usize> = beliefs.chunks_exact(n).map(argmax).collect();
        let adjacency = Adjacency::new(potentials.n_nodes(), potentials.edges);
        icm::polish(potentials, &adjacency, &mut labels, self.max_iter);
        Ok(Labeling::Integral(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::inference::Exhaustive;

    type Chain = (Vec<f64>, Vec<(usize, usize)>, Vec<f64>);

    fn random_chain(rng: &mut StdRng, n_nodes: usize, n_states: usize) -> Chain {
        let unary = (0..n_nodes * n_states)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        let edges = (0..n_nodes - 1).map(|i| (i, i + 1)).collect();
        let pairwise = (0..n_states * n_states)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();
        (unary, edges, pairwise)
    }

    #[test]
    fn test_exact_on_chains() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let (unary, edges, pairwise) = random_chain(&mut rng, 6, 3);
            let classes = vec![0; edges.len()];
            let potentials = Potentials {
                n_states: 3,
                unary: &unary,
                edges: &edges,
                edge_classes: &classes,
                pairwise: &pairwise,
            };
            let expected = Exhaustive::new().infer(&potentials, false).unwrap();
            let result = MaxProduct::new().infer(&potentials, false).unwrap();
            let expected_score = potentials.score(&expected.to_labels());
            let result_score = potentials.score(&result.to_labels());
            assert!((expected_score - result_score).abs() < 1e-9);
        }
    }

    #[test]
    fn test_clamped_states_are_avoided() {
        let unary = [super::super::CLAMPED_SCORE, 0.0, 0.0, 5.0];
        let pairwise = [10.0, 0.0, 0.0, 0.0];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[(0, 1)],
            edge_classes: &[0],
            pairwise: &pairwise,
        };
        let labeling = MaxProduct::new().infer(&potentials, false).unwrap();
        assert_eq!(Labeling::Integral(vec![1, 1]), labeling);
    }

    #[test]
    fn test_relaxed_marginals() {
        let unary = [4.0, 0.0, 0.0, 4.0];
        let pairwise = [0.0; 4];
        let potentials = Potentials {
            n_states: 2,
            unary: &unary,
            edges: &[(0, 1)],
            edge_classes: &[0],
            pairwise: &pairwise,
        };
        let Labeling::Relaxed(marginals) = MaxProduct::new().infer(&potentials, true).unwrap()
        else {
            panic!("expected a relaxed labeling");
        };
        for i in 0..2 {
            assert!((marginals.node(i).iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
        assert!((marginals.edge(0).iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert_eq!(vec![0, 1], marginals.round());
    }
}
