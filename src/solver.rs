//! Log-domain Sinkhorn solver on weighted point clouds.
//!
//! The dual potentials are updated by alternating soft-min passes:
//!
//! ```text
//! f(x) = -ε log Σ_y β(y) exp((g(y) − c(x,y)) / ε)
//! g(y) = -ε log Σ_x α(x) exp((f(x) − c(x,y)) / ε)
//! ```
//!
//! Each reduction goes through [`logsumexp_by`], so no exponent is ever taken
//! of a large positive number, however small `ε` gets. Costs are evaluated on
//! the fly; the `N × M` matrix is never materialized.
//!
//! A [`Support`] restricts which pairs a pass visits. The direct solver uses
//! [`Support::Dense`]; the multiscale driver hands in block-sparse supports
//! obtained by kernel truncation.
//!
//! Weights are used as given (no normalization): with equal total masses the
//! dual value `⟨α, f⟩ + ⟨β, g⟩` is the transport cost of the masses themselves.

use crate::cloud::WeightedPointCloud;
use crate::config::DivergenceConfig;
use crate::cost::CostModel;
use crate::schedule::AnnealingSchedule;
use crate::{logsumexp_by, Error, Result};
use ndarray::Array1;
use rayon::prelude::*;

/// Dual potentials `f` (on A) and `g` (on B).
#[derive(Debug, Clone, PartialEq)]
pub struct DualPotentials {
    pub f: Array1<f64>,
    pub g: Array1<f64>,
}

impl DualPotentials {
    /// Zero potentials for clouds of sizes `m` and `n`.
    pub fn zeros(m: usize, n: usize) -> Self {
        Self {
            f: Array1::zeros(m),
            g: Array1::zeros(n),
        }
    }
}

/// Result of a solve.
#[derive(Debug, Clone)]
pub struct SinkhornOutput {
    pub potentials: DualPotentials,
    /// Dual value `⟨α, f⟩ + ⟨β, g⟩` at the final epsilon.
    pub value: f64,
    /// Total number of f-then-g passes, over all epsilons and levels.
    pub iterations: usize,
    /// Largest potential change during the last pass.
    pub residual: f64,
    /// Hierarchy levels walked (1 for a single-scale solve).
    pub levels: usize,
}

/// Iteration budget of a solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    /// Passes at every intermediate epsilon.
    pub inner_iterations: usize,
    /// Pass cap at the final epsilon.
    pub max_iterations: usize,
    /// Convergence threshold on the largest potential change.
    pub tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions::from(&DivergenceConfig::default())
    }
}

impl From<&DivergenceConfig> for SolverOptions {
    fn from(config: &DivergenceConfig) -> Self {
        Self {
            inner_iterations: config.inner_iterations,
            max_iterations: config.max_iterations,
            tolerance: config.tolerance,
        }
    }
}

/// Block-sparse set of candidate pairs.
///
/// Rows and columns are grouped by their parent clusters one level up. A kept
/// block `(I, J)` means every fine pair `(x, y)` with `x ∈ I`, `y ∈ J` is
/// visited.
#[derive(Debug, Clone)]
pub struct BlockSupport<'h> {
    row_parent: &'h [u32],
    col_parent: &'h [u32],
    row_children: &'h [Vec<u32>],
    col_children: &'h [Vec<u32>],
    rows: Vec<Vec<u32>>,
    cols: Vec<Vec<u32>>,
}

impl<'h> BlockSupport<'h> {
    /// Build from the kept column clusters of every row cluster.
    ///
    /// `rows[I]` must be sorted and free of duplicates.
    pub fn new(
        row_parent: &'h [u32],
        col_parent: &'h [u32],
        row_children: &'h [Vec<u32>],
        col_children: &'h [Vec<u32>],
        rows: Vec<Vec<u32>>,
    ) -> Self {
        debug_assert_eq!(rows.len(), row_children.len());
        let mut cols: Vec<Vec<u32>> = vec![Vec::new(); col_children.len()];
        for (i, js) in rows.iter().enumerate() {
            for &j in js {
                cols[j as usize].push(i as u32);
            }
        }
        Self {
            row_parent,
            col_parent,
            row_children,
            col_children,
            rows,
            cols,
        }
    }

    /// Number of kept blocks.
    pub fn block_count(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// Number of fine pairs covered by the kept blocks.
    pub fn pair_count(&self) -> usize {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, js)| {
                let rows = self.row_children[i].len();
                js.iter()
                    .map(|&j| rows * self.col_children[j as usize].len())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Kept column clusters of every row cluster.
    pub(crate) fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }
}

/// Which pairs a soft-min pass visits.
#[derive(Debug, Clone)]
pub enum Support<'h> {
    Dense,
    Blocks(BlockSupport<'h>),
}

impl Support<'_> {
    /// Visit every candidate column of row `x`.
    #[inline]
    pub(crate) fn visit_cols(&self, x: usize, n_cols: usize, visit: &mut dyn FnMut(usize)) {
        match self {
            Support::Dense => (0..n_cols).for_each(visit),
            Support::Blocks(bs) => {
                let parent = bs.row_parent[x] as usize;
                for &j in &bs.rows[parent] {
                    for &y in &bs.col_children[j as usize] {
                        visit(y as usize);
                    }
                }
            }
        }
    }

    /// Visit every candidate row of column `y`.
    #[inline]
    pub(crate) fn visit_rows(&self, y: usize, n_rows: usize, visit: &mut dyn FnMut(usize)) {
        match self {
            Support::Dense => (0..n_rows).for_each(visit),
            Support::Blocks(bs) => {
                let parent = bs.col_parent[y] as usize;
                for &i in &bs.cols[parent] {
                    for &x in &bs.row_children[i as usize] {
                        visit(x as usize);
                    }
                }
            }
        }
    }
}

/// `log w`, with exact zeros mapped to `-∞` (hard support exclusion).
pub(crate) fn log_weights(w: &Array1<f64>) -> Array1<f64> {
    w.mapv(|x| if x <= 0.0 { f64::NEG_INFINITY } else { x.ln() })
}

/// Entropic OT solver between two fixed clouds.
#[derive(Debug)]
pub struct SinkhornSolver<'a> {
    a: &'a WeightedPointCloud,
    b: &'a WeightedPointCloud,
    cost: CostModel,
    log_a: Array1<f64>,
    log_b: Array1<f64>,
    options: SolverOptions,
}

impl<'a> SinkhornSolver<'a> {
    pub fn new(
        a: &'a WeightedPointCloud,
        b: &'a WeightedPointCloud,
        cost: CostModel,
        options: SolverOptions,
    ) -> Result<Self> {
        if a.is_empty() || b.is_empty() {
            return Err(Error::EmptyInput("sinkhorn requires non-empty point clouds"));
        }
        if a.dim() != b.dim() {
            return Err(Error::DimensionMismatch(a.dim(), b.dim()));
        }
        Ok(Self {
            a,
            b,
            cost,
            log_a: log_weights(a.weights()),
            log_b: log_weights(b.weights()),
            options,
        })
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// `⟨α, f⟩ + ⟨β, g⟩`.
    pub fn dual_value(&self, potentials: &DualPotentials) -> f64 {
        self.a.weights().dot(&potentials.f) + self.b.weights().dot(&potentials.g)
    }

    /// Soft-min over the candidate columns of every row:
    /// `out[x] = -ε log Σ_y exp(log β_y + (h_y − c(x, y)) / ε)`.
    fn softmin_rows(&self, eps: f64, h: &Array1<f64>, support: &Support<'_>) -> Result<Array1<f64>> {
        let n = self.b.len();
        let out: Vec<f64> = (0..self.a.len())
            .into_par_iter()
            .map_init(Vec::new, |terms: &mut Vec<f64>, x| {
                terms.clear();
                let px = self.a.point(x);
                support.visit_cols(x, n, &mut |y| {
                    terms.push(self.log_b[y] + (h[y] - self.cost.cost(px, self.b.point(y))) / eps);
                });
                -eps * logsumexp_by(terms.len(), |k| terms[k])
            })
            .collect();
        finite_or_unstable(out, eps, "f update")
    }

    /// Soft-min over the candidate rows of every column.
    fn softmin_cols(&self, eps: f64, h: &Array1<f64>, support: &Support<'_>) -> Result<Array1<f64>> {
        let m = self.a.len();
        let out: Vec<f64> = (0..self.b.len())
            .into_par_iter()
            .map_init(Vec::new, |terms: &mut Vec<f64>, y| {
                terms.clear();
                let py = self.b.point(y);
                support.visit_rows(y, m, &mut |x| {
                    terms.push(self.log_a[x] + (h[x] - self.cost.cost(self.a.point(x), py)) / eps);
                });
                -eps * logsumexp_by(terms.len(), |k| terms[k])
            })
            .collect();
        finite_or_unstable(out, eps, "g update")
    }

    /// Run `passes` f-then-g updates in place.
    ///
    /// Returns the largest absolute potential change of the last pass
    /// (`+∞` if no pass was run).
    pub fn iterate(
        &self,
        potentials: &mut DualPotentials,
        eps: f64,
        support: &Support<'_>,
        passes: usize,
    ) -> Result<f64> {
        self.check_shapes(potentials)?;
        let mut residual = f64::INFINITY;
        for _ in 0..passes {
            let f = self.softmin_rows(eps, &potentials.g, support)?;
            let g = self.softmin_cols(eps, &f, support)?;
            residual = max_abs_diff(&f, &potentials.f).max(max_abs_diff(&g, &potentials.g));
            potentials.f = f;
            potentials.g = g;
        }
        Ok(residual)
    }

    /// Iterate at `eps` until the potentials move less than the tolerance.
    ///
    /// Returns `(passes, residual)`, or [`Error::NonConvergence`] once the pass
    /// cap is hit.
    pub fn converge(
        &self,
        potentials: &mut DualPotentials,
        eps: f64,
        support: &Support<'_>,
    ) -> Result<(usize, f64)> {
        let tol = self.options.tolerance;
        let mut residual = f64::INFINITY;
        for iter in 0..self.options.max_iterations {
            residual = self.iterate(potentials, eps, support, 1)?;
            log::trace!("eps={:.3e} pass={} residual={:.3e}", eps, iter + 1, residual);
            if residual < tol {
                return Ok((iter + 1, residual));
            }
        }
        Err(Error::NonConvergence {
            iterations: self.options.max_iterations,
            epsilon: eps,
            residual,
        })
    }

    /// Solve at a single `eps` on the dense support.
    pub fn solve(&self, eps: f64, warm_start: Option<DualPotentials>) -> Result<SinkhornOutput> {
        let schedule = AnnealingSchedule::constant(eps)?;
        self.solve_annealed(&schedule, warm_start)
    }

    /// Walk the schedule on the dense support.
    ///
    /// Intermediate epsilons run a fixed number of passes (failing to settle
    /// there is fine); the final epsilon must converge.
    pub fn solve_annealed(
        &self,
        schedule: &AnnealingSchedule,
        warm_start: Option<DualPotentials>,
    ) -> Result<SinkhornOutput> {
        let mut potentials =
            warm_start.unwrap_or_else(|| DualPotentials::zeros(self.a.len(), self.b.len()));
        self.check_shapes(&potentials)?;

        let support = Support::Dense;
        let mut iterations = 0;
        let mut residual = f64::INFINITY;
        for (is_final, eps) in schedule.iter() {
            if is_final {
                let (passes, r) = self.converge(&mut potentials, eps, &support)?;
                iterations += passes;
                residual = r;
            } else {
                residual = self.iterate(&mut potentials, eps, &support, self.options.inner_iterations)?;
                iterations += self.options.inner_iterations;
                log::trace!("eps={:.3e} residual={:.3e}", eps, residual);
            }
        }

        let value = self.dual_value(&potentials);
        log::debug!(
            "direct sinkhorn: {}x{} points, {} epsilons, {} passes, value={:.6}",
            self.a.len(),
            self.b.len(),
            schedule.len(),
            iterations,
            value
        );
        Ok(SinkhornOutput {
            potentials,
            value,
            iterations,
            residual,
            levels: 1,
        })
    }

    fn check_shapes(&self, potentials: &DualPotentials) -> Result<()> {
        if potentials.f.len() != self.a.len() {
            return Err(Error::ShapeMismatch(self.a.len(), potentials.f.len()));
        }
        if potentials.g.len() != self.b.len() {
            return Err(Error::ShapeMismatch(self.b.len(), potentials.g.len()));
        }
        Ok(())
    }
}

fn finite_or_unstable(values: Vec<f64>, eps: f64, context: &'static str) -> Result<Array1<f64>> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(Array1::from_vec(values))
    } else {
        Err(Error::NumericalInstability { epsilon: eps, context })
    }
}

fn max_abs_diff(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .fold(0.0f64, |acc, (&x, &y)| acc.max((x - y).abs()))
}
