//! Ground cost `c(x, y) = ‖x − y‖^p`.
//!
//! Only powers of the Euclidean distance are supported. `p = 1` is the plain
//! distance (Wasserstein-1 / earth mover's), `p = 2` the squared distance
//! (no root is taken on the final divergence).

use crate::cloud::WeightedPointCloud;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView1};

/// Power-of-Euclidean ground cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    p: f64,
}

impl CostModel {
    /// Create a cost model for exponent `p > 0`.
    pub fn new(p: f64) -> Result<Self> {
        if !(p > 0.0) || !p.is_finite() {
            return Err(Error::InvalidParameter { name: "p", value: p });
        }
        Ok(Self { p })
    }

    /// The exponent `p`.
    pub fn exponent(&self) -> f64 {
        self.p
    }

    /// `‖x − y‖^p`.
    ///
    /// Panics (debug only) if the points have different dimensions.
    #[inline]
    pub fn cost(&self, x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
        self.cost_from_distance(euclidean_distance(x, y))
    }

    /// Apply the exponent to an already computed distance.
    #[inline]
    pub fn cost_from_distance(&self, d: f64) -> f64 {
        if self.p == 1.0 {
            d
        } else if self.p == 2.0 {
            d * d
        } else {
            d.powf(self.p)
        }
    }

    /// Dense cost matrix between two clouds: `C[i, j] = c(a_i, b_j)`.
    ///
    /// Only meant for small clouds; the solver evaluates costs on the fly.
    pub fn cost_matrix(&self, a: &WeightedPointCloud, b: &WeightedPointCloud) -> Array2<f64> {
        let m = a.len();
        let n = b.len();
        let mut cost = Array2::zeros((m, n));
        for i in 0..m {
            for j in 0..n {
                cost[[i, j]] = self.cost(a.point(i), b.point(j));
            }
        }
        cost
    }
}

/// Euclidean distance with max-abs scaling.
///
/// Dividing by the largest component keeps the sum of squares in `[1, D]`,
/// so very large (or very small) coordinate differences neither overflow nor
/// underflow.
#[inline]
pub fn euclidean_distance(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> f64 {
    debug_assert_eq!(x.len(), y.len());
    if x.len() == 2 {
        return (x[0] - y[0]).hypot(x[1] - y[1]);
    }
    let scale = x
        .iter()
        .zip(y.iter())
        .fold(0.0f64, |acc, (&a, &b)| acc.max((a - b).abs()));
    if scale == 0.0 || !scale.is_finite() {
        return scale;
    }
    let sum_sq: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(&a, &b)| {
            let d = (a - b) / scale;
            d * d
        })
        .sum();
    scale * sum_sq.sqrt()
}
