//! Weighted point clouds and the grid sampler.
//!
//! A grid `G` of shape `R × C` becomes one point per cell: point `(i, j)`
//! carries weight `G[i, j]`. Points are emitted in row-major order, so the
//! cloud index of cell `(i, j)` is `i * C + j`.

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// An ordered set of points with non-negative weights.
///
/// Coordinates are stored as an `N × D` matrix, weights as a length-`N` vector.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedPointCloud {
    points: Array2<f64>,
    weights: Array1<f64>,
}

impl WeightedPointCloud {
    /// Build a cloud from explicit coordinates and weights.
    ///
    /// Fails if the shapes disagree, a coordinate is non-finite, or a weight is
    /// negative or non-finite.
    pub fn new(points: Array2<f64>, weights: Array1<f64>) -> Result<Self> {
        if points.nrows() != weights.len() {
            return Err(Error::ShapeMismatch(points.nrows(), weights.len()));
        }
        if points.ncols() == 0 {
            return Err(Error::EmptyInput("points must have positive dimension"));
        }
        if let Some((index, _)) = points
            .outer_iter()
            .enumerate()
            .find(|(_, row)| row.iter().any(|v| !v.is_finite()))
        {
            return Err(Error::InvalidCoordinate { index });
        }
        validate_weights(weights.iter().copied())?;
        Ok(Self { points, weights })
    }

    /// Internal constructor for clouds whose invariants already hold.
    pub(crate) fn from_parts(points: Array2<f64>, weights: Array1<f64>) -> Self {
        debug_assert_eq!(points.nrows(), weights.len());
        Self { points, weights }
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True if the cloud has no points.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Dimension of the ambient space.
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    /// Coordinates of point `i`.
    #[inline]
    pub fn point(&self, i: usize) -> ArrayView1<'_, f64> {
        self.points.row(i)
    }

    /// Weight of point `i`.
    #[inline]
    pub fn weight(&self, i: usize) -> f64 {
        self.weights[i]
    }

    pub fn points(&self) -> &Array2<f64> {
        &self.points
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Sum of all weights.
    pub fn total_mass(&self) -> f64 {
        self.weights.sum()
    }

    /// Copy of the cloud without its zero-weight points.
    ///
    /// Zero-mass points never carry transport, so dropping them leaves every
    /// result unchanged.
    pub fn pruned(&self) -> Result<Self> {
        let keep: Vec<usize> = (0..self.len()).filter(|&i| self.weights[i] > 0.0).collect();
        if keep.len() == self.len() {
            return Ok(self.clone());
        }
        let d = self.dim();
        let mut coords = Vec::with_capacity(keep.len() * d);
        for &i in &keep {
            coords.extend(self.points.row(i).iter().copied());
        }
        let weights: Array1<f64> = keep.iter().map(|&i| self.weights[i]).collect();
        let points = Array2::from_shape_vec((keep.len(), d), coords)
            .map_err(|_| Error::ShapeMismatch(keep.len(), weights.len()))?;
        Ok(Self { points, weights })
    }

    /// Copy of the cloud with every weight multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            points: self.points.clone(),
            weights: self.weights.mapv(|w| w * factor),
        }
    }

    /// Axis-aligned bounding box `(min, max)`; `None` for an empty cloud.
    pub fn bounding_box(&self) -> Option<(Array1<f64>, Array1<f64>)> {
        if self.is_empty() {
            return None;
        }
        let mut lo = self.points.row(0).to_owned();
        let mut hi = lo.clone();
        for row in self.points.outer_iter() {
            for (k, &v) in row.iter().enumerate() {
                lo[k] = lo[k].min(v);
                hi[k] = hi[k].max(v);
            }
        }
        Some((lo, hi))
    }

    /// Diagonal of the bounding box that encloses both clouds.
    pub fn diameter_with(&self, other: &Self) -> f64 {
        match joint_bounding_box(self, other) {
            Some((lo, hi)) => crate::cost::euclidean_distance(lo.view(), hi.view()),
            None => 0.0,
        }
    }
}

/// Bounding box of the union of two clouds of the same dimension.
pub(crate) fn joint_bounding_box(
    a: &WeightedPointCloud,
    b: &WeightedPointCloud,
) -> Option<(Array1<f64>, Array1<f64>)> {
    match (a.bounding_box(), b.bounding_box()) {
        (Some((lo_a, hi_a)), Some((lo_b, hi_b))) => {
            let lo = ndarray::Zip::from(&lo_a).and(&lo_b).map_collect(|&x, &y| x.min(y));
            let hi = ndarray::Zip::from(&hi_a).and(&hi_b).map_collect(|&x, &y| x.max(y));
            Some((lo, hi))
        }
        (Some(bb), None) | (None, Some(bb)) => Some(bb),
        (None, None) => None,
    }
}

fn validate_weights(weights: impl Iterator<Item = f64>) -> Result<()> {
    for (index, value) in weights.enumerate() {
        if value < 0.0 || !value.is_finite() {
            return Err(Error::InvalidWeight { index, value });
        }
    }
    Ok(())
}

/// Convert an `R × C` grid of non-negative masses into a weighted point cloud.
///
/// Cell `(i, j)` becomes the point `(i, j)` with weight `grid[[i, j]]`.
///
/// # Example
///
/// ```rust
/// use gridwass::sample_grid;
/// use ndarray::array;
///
/// let grid = array![[1.0, 0.0, 0.0], [0.0, 0.0, 2.0]];
/// let cloud = sample_grid(&grid.view()).unwrap();
/// assert_eq!(cloud.len(), 6);
/// assert_eq!(cloud.point(5).to_vec(), vec![1.0, 2.0]);
/// assert_eq!(cloud.weight(5), 2.0);
/// ```
pub fn sample_grid(grid: &ArrayView2<'_, f64>) -> Result<WeightedPointCloud> {
    let (rows, cols) = grid.dim();
    if rows == 0 || cols == 0 {
        return Err(Error::EmptyInput("grid must have at least one row and one column"));
    }

    let mut coords = Vec::with_capacity(rows * cols * 2);
    let mut weights = Vec::with_capacity(rows * cols);
    for ((i, j), &w) in grid.indexed_iter() {
        if w < 0.0 || !w.is_finite() {
            return Err(Error::InvalidWeight { index: i * cols + j, value: w });
        }
        coords.push(i as f64);
        coords.push(j as f64);
        weights.push(w);
    }

    let points = Array2::from_shape_vec((rows * cols, 2), coords)
        .map_err(|_| Error::ShapeMismatch(rows * cols, weights.len()))?;
    Ok(WeightedPointCloud::from_parts(points, Array1::from_vec(weights)))
}
