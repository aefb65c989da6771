use core::str::FromStr;

use bincode::{Decode, Encode};

use crate::errors::{Result, SsvmError};

/// Represents a grid-shaped observation: one vector of unary feature scores
/// per node.
///
/// Nodes are stored row-major, i.e., the node at `(row, col)` has the index
/// `row * width + col`.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    height: usize,
    width: usize,
    n_features: usize,
    data: Vec<f64>,
}

impl Observation {
    /// Creates a new observation.
    ///
    /// # Arguments
    ///
    /// * `height` - Number of rows.
    /// * `width` - Number of columns.
    /// * `n_features` - Number of feature scores per node.
    /// * `data` - Row-major scores of length `height * width * n_features`.
    ///
    /// # Errors
    ///
    /// [`SsvmError::Modeling`] is returned when a dimension is zero or the
    /// data length does not match.
    pub fn new(height: usize, width: usize, n_features: usize, data: Vec<f64>) -> Result<Self> {
        if height == 0 || width == 0 || n_features == 0 {
            return Err(SsvmError::modeling("observation dimensions must not be 0"));
        }
        if data.len() != height * width * n_features {
            return Err(SsvmError::modeling(format!(
                "observation data has {} values, expected {}x{}x{}",
                data.len(),
                height,
                width,
                n_features
            )));
        }
        Ok(Self {
            height,
            width,
            n_features,
            data,
        })
    }

    /// Gets the number of rows.
    #[inline(always)]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Gets the number of columns.
    #[inline(always)]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Gets the number of feature scores per node.
    #[inline(always)]
    pub const fn n_features(&self) -> usize {
        self.n_features
    }

    /// Gets the number of nodes.
    #[inline(always)]
    pub const fn n_nodes(&self) -> usize {
        self.height * self.width
    }

    /// Gets the feature scores of a node.
    #[inline(always)]
    pub fn node(&self, i: usize) -> &[f64] {
        &self.data[i * self.n_features..(i + 1) * self.n_features]
    }

    /// Gets the raw row-major data.
    #[inline(always)]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline(always)]
    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Repeats feature `f` of every node `reps[f]` times.
    pub(crate) fn widen(&self, reps: &[usize]) -> Self {
        debug_assert_eq!(reps.len(), self.n_features);
        let n_wide: usize = reps.iter().sum();
        let mut data = Vec::with_capacity(self.n_nodes() * n_wide);
        for i in 0..self.n_nodes() {
            for (&v, &r) in self.node(i).iter().zip(reps) {
                data.extend(core::iter::repeat_n(v, r));
            }
        }
        Self {
            height: self.height,
            width: self.width,
            n_features: n_wide,
            data,
        }
    }
}

/// Grid connectivity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub enum Neighborhood {
    /// Horizontal and vertical neighbors.
    #[default]
    Four,

    /// Horizontal, vertical and diagonal neighbors.
    Eight,
}

impl Neighborhood {
    /// Gets the number of edge directions.
    #[inline(always)]
    pub const fn n_directions(self) -> usize {
        match self {
            Self::Four => 2,
            Self::Eight => 4,
        }
    }
}

impl FromStr for Neighborhood {
    type Err = SsvmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "4" => Ok(Self::Four),
            "8" => Ok(Self::Eight),
            _ => Err(SsvmError::invalid_argument(format!(
                "unknown neighborhood: {s}"
            ))),
        }
    }
}

/// Edges of a grid graph grouped by direction.
///
/// Directions: `0` right, `1` down, `2` down-right, `3` down-left.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeSet {
    edges: Vec<(usize, usize)>,
    directions: Vec<usize>,
    n_directions: usize,
    n_nodes: usize,
}

impl EdgeSet {
    /// Builds the edge set of a `height x width` grid.
    pub fn grid(height: usize, width: usize, neighborhood: Neighborhood) -> Self {
        let mut edges = vec![];
        let mut directions = vec![];
        let idx = |r: usize, c: usize| r * width + c;
        for r in 0..height {
            for c in 0..width.saturating_sub(1) {
                edges.push((idx(r, c), idx(r, c + 1)));
                directions.push(0);
            }
        }
        for r in 0..height.saturating_sub(1) {
            for c in 0..width {
                edges.push((idx(r, c), idx(r + 1, c)));
                directions.push(1);
            }
        }
        if neighborhood == Neighborhood::Eight {
            for r in 0..height.saturating_sub(1) {
                for c in 0..width.saturating_sub(1) {
                    edges.push((idx(r, c), idx(r + 1, c + 1)));
                    directions.push(2);
                }
            }
            for r in 0..height.saturating_sub(1) {
                for c in 1..width {
                    edges.push((idx(r, c), idx(r + 1, c - 1)));
                    directions.push(3);
                }
            }
        }
        Self {
            edges,
            directions,
            n_directions: neighborhood.n_directions(),
            n_nodes: height * width,
        }
    }

    /// Gets the edges as `(source, target)` node pairs.
    #[inline(always)]
    pub fn edges(&self) -> &[(usize, usize)] {
        &self.edges
    }

    /// Gets the direction of each edge.
    #[inline(always)]
    pub fn directions(&self) -> &[usize] {
        &self.directions
    }

    /// Gets the number of directions.
    #[inline(always)]
    pub const fn n_directions(&self) -> usize {
        self.n_directions
    }

    /// Gets the number of nodes of the grid.
    #[inline(always)]
    pub const fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    /// Gets the number of edges.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Returns `true` if the grid has a single node.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_shape() {
        assert!(Observation::new(2, 2, 2, vec![0.0; 8]).is_ok());
        assert!(Observation::new(2, 2, 2, vec![0.0; 7]).is_err());
        assert!(Observation::new(0, 2, 2, vec![]).is_err());
    }

    #[test]
    fn test_widen() {
        let x = Observation::new(1, 2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let wide = x.widen(&[1, 2]);
        assert_eq!(3, wide.n_features());
        assert_eq!(&[1.0, 2.0, 2.0, 3.0, 4.0, 4.0], wide.data());
    }

    // 0 1 2
    // 3 4 5
    #[test]
    fn test_grid_edges_four() {
        let edges = EdgeSet::grid(2, 3, Neighborhood::Four);
        assert_eq!(
            &[(0, 1), (1, 2), (3, 4), (4, 5), (0, 3), (1, 4), (2, 5)],
            edges.edges()
        );
        assert_eq!(&[0, 0, 0, 0, 1, 1, 1], edges.directions());
        assert_eq!(2, edges.n_directions());
    }

    #[test]
    fn test_grid_edges_eight() {
        let edges = EdgeSet::grid(2, 3, Neighborhood::Eight);
        assert_eq!(11, edges.len());
        assert_eq!(&[(0, 4), (1, 5), (1, 3), (2, 4)], &edges.edges()[7..]);
        assert_eq!(&[2, 2, 3, 3], &edges.directions()[7..]);
    }

    #[test]
    fn test_neighborhood_from_str() {
        assert_eq!(Neighborhood::Four, "4".parse().unwrap());
        assert_eq!(Neighborhood::Eight, "8".parse().unwrap());
        assert!("6".parse::<Neighborhood>().is_err());
    }
}
