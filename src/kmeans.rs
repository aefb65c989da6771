//! Seeded k-means clustering used to initialize latent states.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ITER: usize = 300;
const N_INIT: u64 = 10;

#[inline(always)]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of the closest center. Ties resolve to the lowest index.
fn nearest(point: &[f64], centers: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, center) in centers.iter().enumerate() {
        let d = squared_distance(point, center);
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

/// Lloyd's algorithm with k-means++ seeding and several restarts.
///
/// Deterministic for a fixed seed.
pub struct KMeans {
    n_clusters: usize,
    seed: u64,
}

impl KMeans {
    pub fn new(n_clusters: usize, seed: u64) -> Self {
        Self {
            n_clusters: n_clusters.max(1),
            seed,
        }
    }

    fn init_centers(&self, points: &[Vec<f64>], rng: &mut StdRng) -> Vec<Vec<f64>> {
        let mut centers = vec![points[rng.random_range(0..points.len())].clone()];
        let mut distances: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &centers[0]))
            .collect();
        while centers.len() < self.n_clusters {
            let total: f64 = distances.iter().sum();
            let idx = if total > 0.0 {
                let mut r = rng.random::<f64>() * total;
                let mut idx = points.len() - 1;
                for (i, &d) in distances.iter().enumerate() {
                    if r < d {
                        idx = i;
                        break;
                    }
                    r -= d;
                }
                idx
            } else {
                rng.random_range(0..points.len())
            };
            centers.push(points[idx].clone());
            for (d, p) in distances.iter_mut().zip(points) {
                *d = d.min(squared_distance(p, &points[idx]));
            }
        }
        centers
    }

    fn lloyd(&self, points: &[Vec<f64>], mut centers: Vec<Vec<f64>>) -> (Vec<usize>, f64) {
        let dim = points[0].len();
        let mut assignments = vec![usize::MAX; points.len()];
        for _ in 0..MAX_ITER {
            let mut changed = false;
            for (a, p) in assignments.iter_mut().zip(points) {
                let (c, _) = nearest(p, &centers);
                if *a != c {
                    *a = c;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
            let mut sums = vec![vec![0.0; dim]; self.n_clusters];
            let mut counts = vec![0usize; self.n_clusters];
            for (&a, p) in assignments.iter().zip(points) {
                counts[a] += 1;
                for (s, v) in sums[a].iter_mut().zip(p) {
                    *s += v;
                }
            }
            for ((center, sum), &count) in centers.iter_mut().zip(sums).zip(&counts) {
                // empty clusters keep their previous center
                if count != 0 {
                    *center = sum.into_iter().map(|s| s / count as f64).collect();
                }
            }
        }
        let inertia = points.iter().map(|p| nearest(p, &centers).1).sum();
        (assignments, inertia)
    }

    /// Clusters the points and returns the cluster index of each point.
    pub fn fit_predict(&self, points: &[Vec<f64>]) -> Vec<usize> {
        if points.len() <= self.n_clusters {
            return (0..points.len()).collect();
        }
        let mut best: Option<(Vec<usize>, f64)> = None;
        for run in 0..N_INIT {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(run));
            let centers = self.init_centers(points, &mut rng);
            let (assignments, inertia) = self.lloyd(points, centers);
            if best.as_ref().is_none_or(|(_, b)| inertia < *b) {
                best = Some((assignments, inertia));
            }
        }
        best.map(|(assignments, _)| assignments).unwrap_or_default()
    }
}
