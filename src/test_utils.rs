use std::sync::atomic::{AtomicUsize, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::Result;
use crate::grid::Observation;
use crate::inference::{InferenceOracle, Labeling, Potentials};

macro_rules! assert_close {
    ( $a:expr, $b:expr ) => {
        assert_close!($a, $b, 1e-9)
    };
    ( $a:expr, $b:expr, $eps:expr ) => {{
        let (a, b): (f64, f64) = ($a, $b);
        assert!((a - b).abs() <= $eps, "{a} and {b} differ by more than {}", $eps);
    }};
}

// one feature per label: the one-hot label plus uniform noise
fn noisy_observation(
    size: usize,
    y: &[usize],
    n_labels: usize,
    noise: f64,
    rng: &mut StdRng,
) -> Observation {
    let mut data = Vec::with_capacity(y.len() * n_labels);
    for &label in y {
        for l in 0..n_labels {
            let v = if l == label { 1.0 } else { 0.0 };
            let n = if noise > 0.0 {
                rng.random_range(-noise..noise)
            } else {
                0.0
            };
            data.push(v + n);
        }
    }
    Observation::new(size, size, n_labels, data).unwrap()
}

/// Generates `size x size` images with one cross of label 1 on a background
/// of label 0.
pub fn generate_crosses(
    n_samples: usize,
    size: usize,
    noise: f64,
    seed: u64,
) -> (Vec<Observation>, Vec<Vec<usize>>) {
    assert!(size >= 5);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut xs = vec![];
    let mut ys = vec![];
    for _ in 0..n_samples {
        let row = rng.random_range(2..size - 2);
        let col = rng.random_range(2..size - 2);
        let mut y = vec![0; size * size];
        for d in 0..5 {
            y[(row + d - 2) * size + col] = 1;
            y[row * size + col + d - 2] = 1;
        }
        xs.push(noisy_observation(size, &y, 2, noise, &mut rng));
        ys.push(y);
    }
    (xs, ys)
}

/// Generates `size x size` images with two horizontal or vertical bars of
/// label 1 on a background of label 0.
pub fn generate_bars(
    n_samples: usize,
    size: usize,
    noise: f64,
    seed: u64,
) -> (Vec<Observation>, Vec<Vec<usize>>) {
    assert!(size >= 4);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut xs = vec![];
    let mut ys = vec![];
    for _ in 0..n_samples {
        let mut y = vec![0; size * size];
        for _ in 0..2 {
            let len = rng.random_range(2..size);
            let start = rng.random_range(0..=size - len);
            let line = rng.random_range(0..size);
            let vertical = rng.random::<bool>();
            for k in start..start + len {
                let (r, c) = if vertical { (k, line) } else { (line, k) };
                y[r * size + c] = 1;
            }
        }
        xs.push(noisy_observation(size, &y, 2, noise, &mut rng));
        ys.push(y);
    }
    (xs, ys)
}

/// Oracle answering state 0 for every node, whatever the scores.
pub struct FirstStateOracle;

impl InferenceOracle for FirstStateOracle {
    fn infer(&self, potentials: &Potentials, _relaxed: bool) -> Result<Labeling> {
        Ok(Labeling::Integral(vec![0; potentials.n_nodes()]))
    }
}

/// Oracle returning fixed labelings in call order. The last one is repeated.
pub struct ScriptedOracle {
    answers: Vec<Vec<usize>>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn new(answers: Vec<Vec<usize>>) -> Self {
        assert!(!answers.is_empty());
        Self {
            answers,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceOracle for ScriptedOracle {
    fn infer(&self, _potentials: &Potentials, _relaxed: bool) -> Result<Labeling> {
        let k = self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = &self.answers[k.min(self.answers.len() - 1)];
        Ok(Labeling::Integral(answer.clone()))
    }
}

pub(crate) use assert_close;
