//! Dual QP over a pool of cutting-plane constraints.
//!
//! Maximizes `sum_j a_j l_j - 1/2 |sum_j a_j d_j|^2` subject to `a >= 0` and
//! `sum_{j in block} a_j <= C` for every block. The primal weights are
//! `w = sum_j a_j d_j`.

use argmin_math::{ArgminDot, ArgminScaledAdd};
use hashbrown::HashSet;

use crate::errors::{Result, SsvmError};

const EPSILON: f64 = 1e-12;
const KKT_TOL: f64 = 1e-9;

/// Cutting-plane constraint `w · dpsi >= loss - slack[block]`.
pub(crate) struct Constraint {
    pub dpsi: Vec<f64>,
    pub loss: f64,
    pub block: usize,
}

pub(crate) struct ConstraintPool {
    c: f64,
    max_sweeps: usize,
    constraints: Vec<Constraint>,
    known: HashSet<(usize, Vec<u64>)>,
    blocks: Vec<Vec<usize>>,
    block_sums: Vec<f64>,
    gram: Vec<Vec<f64>>,
    alpha: Vec<f64>,
    // K alpha - loss
    grad: Vec<f64>,
}

#[inline(always)]
fn constraint_key(block: usize, dpsi: &[f64], loss: f64) -> (usize, Vec<u64>) {
    let mut bits: Vec<u64> = dpsi.iter().map(|v| v.to_bits()).collect();
    bits.push(loss.to_bits());
    (block, bits)
}

impl ConstraintPool {
    pub fn new(n_blocks: usize, c: f64, max_sweeps: usize) -> Self {
        Self {
            c,
            max_sweeps,
            constraints: vec![],
            known: HashSet::new(),
            blocks: vec![vec![]; n_blocks],
            block_sums: vec![0.0; n_blocks],
            gram: vec![],
            alpha: vec![],
            grad: vec![],
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    /// Returns `true` if the same constraint was already added.
    pub fn contains(&self, block: usize, dpsi: &[f64], loss: f64) -> bool {
        self.known.contains(&constraint_key(block, dpsi, loss))
    }

    /// Adds a constraint with a zero dual variable.
    pub fn push(&mut self, constraint: Constraint) -> Result<()> {
        if !constraint.loss.is_finite() || constraint.dpsi.iter().any(|v| !v.is_finite()) {
            return Err(SsvmError::optimization_infeasible(
                "constraint contains non-finite values",
            ));
        }
        let mut row: Vec<f64> = self
            .constraints
            .iter()
            .map(|other| constraint.dpsi.dot(&other.dpsi))
            .collect();
        row.push(constraint.dpsi.dot(&constraint.dpsi));
        if row.iter().any(|v| !v.is_finite()) {
            return Err(SsvmError::optimization_infeasible(
                "constraint norms overflow",
            ));
        }
        for (k, &v) in row[..self.len()].iter().enumerate() {
            self.gram[k].push(v);
        }
        self.gram.push(row);
        self.known.insert(constraint_key(
            constraint.block,
            &constraint.dpsi,
            constraint.loss,
        ));
        let j = self.len();
        self.blocks[constraint.block].push(j);
        self.alpha.push(0.0);
        self.grad.push(-constraint.loss);
        self.constraints.push(constraint);
        Ok(())
    }

    #[inline(always)]
    fn is_saturated(&self, block: usize) -> bool {
        self.block_sums[block] >= self.c * (1.0 - 1e-9)
    }

    fn move_alpha(&mut self, j: usize, delta: f64) {
        if delta == 0.0 {
            return;
        }
        self.alpha[j] += delta;
        self.block_sums[self.constraints[j].block] += delta;
        for (g, row) in self.grad.iter_mut().zip(&self.gram) {
            *g += delta * row[j];
        }
    }

    fn coordinate_step(&mut self, j: usize) {
        let block = self.constraints[j].block;
        let a = self.alpha[j];
        let upper = a + (self.c - self.block_sums[block]).max(0.0);
        let k = self.gram[j][j];
        let g = self.grad[j];
        let target = if k > EPSILON {
            a - g / k
        } else if g < 0.0 {
            upper
        } else if g > 0.0 {
            0.0
        } else {
            a
        };
        self.move_alpha(j, target.clamp(0.0, upper) - a);
    }

    // moves dual mass between two constraints of a saturated block
    fn transfer_step(&mut self, block: usize) -> bool {
        let members = &self.blocks[block];
        let mut to = None;
        let mut from = None;
        for &j in members {
            if to.is_none_or(|i: usize| self.grad[j] < self.grad[i]) {
                to = Some(j);
            }
            if self.alpha[j] > 0.0 && from.is_none_or(|k: usize| self.grad[j] > self.grad[k]) {
                from = Some(j);
            }
        }
        let (Some(i), Some(k)) = (to, from) else {
            return false;
        };
        let gap = self.grad[k] - self.grad[i];
        if i == k || gap <= EPSILON {
            return false;
        }
        let eta = self.gram[i][i] + self.gram[k][k] - 2.0 * self.gram[i][k];
        let t = if eta > EPSILON { gap / eta } else { self.alpha[k] };
        let t = t.min(self.alpha[k]);
        self.move_alpha(i, t);
        self.move_alpha(k, -t);
        true
    }

    fn kkt_violation(&self) -> f64 {
        let mut worst = 0.0f64;
        for (block, members) in self.blocks.iter().enumerate() {
            let mut max_up = f64::NEG_INFINITY;
            let mut min_up_active = f64::INFINITY;
            for &j in members {
                let up = -self.grad[j];
                max_up = max_up.max(up);
                if self.alpha[j] > 0.0 {
                    min_up_active = min_up_active.min(up);
                }
            }
            if members.is_empty() {
                continue;
            }
            if self.is_saturated(block) {
                worst = worst.max(max_up - min_up_active).max(-min_up_active);
            } else {
                worst = worst.max(max_up);
                if min_up_active.is_finite() {
                    worst = worst.max(-min_up_active);
                }
            }
        }
        worst
    }

    /// Solves the dual QP starting from the current dual variables and
    /// returns the dual objective.
    ///
    /// # Errors
    ///
    /// [`SsvmError::OptimizationInfeasible`] is returned when the solution is
    /// not finite.
    pub fn solve(&mut self) -> Result<f64> {
        for (j, g) in self.grad.iter_mut().enumerate() {
            *g = self.gram[j].iter().zip(&self.alpha).map(|(k, a)| k * a).sum::<f64>()
                - self.constraints[j].loss;
        }
        let scale = self
            .constraints
            .iter()
            .fold(1.0f64, |acc, c| acc.max(c.loss.abs()));
        for _ in 0..self.max_sweeps {
            for j in 0..self.len() {
                self.coordinate_step(j);
            }
            for block in 0..self.blocks.len() {
                if !self.is_saturated(block) {
                    continue;
                }
                for _ in 0..self.blocks[block].len() {
                    if !self.transfer_step(block) {
                        break;
                    }
                }
            }
            if self.kkt_violation() <= KKT_TOL * scale {
                break;
            }
        }
        if self.alpha.iter().chain(&self.grad).any(|v| !v.is_finite()) {
            return Err(SsvmError::optimization_infeasible(
                "dual QP diverged to non-finite values",
            ));
        }
        Ok(self.dual_objective())
    }

    /// `sum_j a_j l_j - 1/2 a^T K a`
    pub fn dual_objective(&self) -> f64 {
        0.5 * self
            .alpha
            .iter()
            .zip(&self.constraints)
            .zip(&self.grad)
            .map(|((a, c), g)| a * (c.loss - g))
            .sum::<f64>()
    }

    /// Slack of a block under the current weights.
    pub fn slack(&self, block: usize) -> f64 {
        self.blocks[block]
            .iter()
            .fold(0.0f64, |acc, &j| acc.max(-self.grad[j]))
    }

    pub fn weights(&self, size: usize) -> Vec<f64> {
        let mut w = vec![0.0; size];
        for (c, a) in self.constraints.iter().zip(&self.alpha) {
            if *a != 0.0 {
                w = w.scaled_add(a, &c.dpsi);
            }
        }
        w
    }

    /// `1/2 |w|^2 + C sum_b slack_b`
    pub fn primal_objective(&self, w: &[f64]) -> f64 {
        let slack: f64 = (0..self.blocks.len()).map(|b| self.slack(b)).sum();
        0.5 * w.iter().map(|v| v * v).sum::<f64>() + self.c * slack
    }
}
