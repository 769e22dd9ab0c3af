//! Coarse-to-fine Sinkhorn over a cluster hierarchy.
//!
//! A dense pass costs `O(N·M)`. On a 128×128 grid that is 2.7e8 kernel
//! evaluations per pass, repeated at every epsilon of the schedule. The
//! multiscale driver avoids most of that work:
//!
//! 1. Both clouds are bucketed into a hierarchy of axis-aligned cells whose
//!    width doubles at every level. Each cell is replaced by its weighted
//!    centroid carrying the summed mass.
//! 2. Large epsilons are solved on coarse levels, where the blur hides the
//!    clustering error anyway.
//! 3. When the schedule reaches the scale of a level's clusters, the driver
//!    descends: it broadcasts the coarse potentials to the children and keeps
//!    only the blocks of coarse pairs that can carry a visible share of the
//!    plan (*kernel truncation*), then continues on the finer clouds with a
//!    block-sparse support.
//! 4. On a fine level, every new epsilon re-scores all blocks. A
//!    north-west-corner skeleton is always kept, so the sparse problem admits
//!    a plan with the right marginals.
//! 5. At the final epsilon, blocks are re-admitted from the current
//!    potentials until none is missing; a stalled sparse solve finishes on
//!    the dense support.
//!
//! # References
//!
//! - Schmitzer (2019). "Stabilized Sparse Scaling Algorithms for Entropy
//!   Regularized Transport Problems"
//! - Feydy (2020). "Geometric data analysis, beyond convolutions", ch. 3

use crate::cloud::{joint_bounding_box, WeightedPointCloud};
use crate::config::DivergenceConfig;
use crate::cost::{euclidean_distance, CostModel};
use crate::schedule::AnnealingSchedule;
use crate::solver::{log_weights, BlockSupport, DualPotentials, SinkhornOutput, SinkhornSolver, SolverOptions, Support};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Upper bound on hierarchy depth.
const MAX_DEPTH: usize = 16;

/// One level of a [`ClusterHierarchy`].
#[derive(Debug, Clone)]
pub struct ClusterLevel {
    cloud: WeightedPointCloud,
    /// Upper bound on the distance from each representative to any original
    /// point below it.
    radius: Vec<f64>,
    /// Index of each point's cluster on the next coarser level.
    parent: Vec<u32>,
    /// Points of the next finer level grouped under each representative.
    children: Vec<Vec<u32>>,
    width: f64,
}

impl ClusterLevel {
    /// Representative points and their aggregated masses.
    pub fn cloud(&self) -> &WeightedPointCloud {
        &self.cloud
    }

    pub fn radius(&self) -> &[f64] {
        &self.radius
    }

    /// Empty on the coarsest level.
    pub fn parent(&self) -> &[u32] {
        &self.parent
    }

    /// Empty on level 0.
    pub fn children(&self) -> &[Vec<u32>] {
        &self.children
    }

    /// Bucket width used to build this level (`0` for the original points).
    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn max_radius(&self) -> f64 {
        self.radius.iter().copied().fold(0.0, f64::max)
    }
}

/// Coarse-to-fine clustering of one point cloud.
///
/// Level 0 holds the original points; level `k` buckets level `k - 1` into
/// cells of width `base_width · 2^k` anchored at `origin`. Mass is conserved
/// exactly: every parent weighs the sum of its children.
#[derive(Debug, Clone)]
pub struct ClusterHierarchy {
    levels: Vec<ClusterLevel>,
}

impl ClusterHierarchy {
    /// Build a hierarchy with exactly `levels` levels.
    ///
    /// Levels are built even once everything has merged into a single
    /// cluster, so two hierarchies built with the same arguments always line
    /// up level for level.
    pub fn build(
        cloud: &WeightedPointCloud,
        levels: usize,
        base_width: f64,
        origin: ArrayView1<'_, f64>,
    ) -> Result<Self> {
        if levels == 0 {
            return Err(Error::InvalidParameter { name: "levels", value: 0.0 });
        }
        if !(base_width > 0.0) || !base_width.is_finite() {
            return Err(Error::InvalidParameter { name: "base_width", value: base_width });
        }
        if origin.len() != cloud.dim() {
            return Err(Error::DimensionMismatch(cloud.dim(), origin.len()));
        }

        let mut out = Vec::with_capacity(levels);
        out.push(ClusterLevel {
            cloud: cloud.clone(),
            radius: vec![0.0; cloud.len()],
            parent: Vec::new(),
            children: Vec::new(),
            width: 0.0,
        });
        for k in 1..levels {
            let width = base_width * 2f64.powi(k as i32);
            let (parent, coarse) = coarsen(&out[k - 1], width, origin)?;
            out[k - 1].parent = parent;
            out.push(coarse);
        }
        Ok(Self { levels: out })
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Level `k` (`0` = original points).
    pub fn level(&self, k: usize) -> &ClusterLevel {
        &self.levels[k]
    }

    /// Copy per-cluster values of level `k + 1` down to the points of level `k`.
    pub fn broadcast(&self, k: usize, coarse: &Array1<f64>) -> Array1<f64> {
        self.levels[k]
            .parent
            .iter()
            .map(|&p| coarse[p as usize])
            .collect()
    }
}

/// Bucket `fine` into cells of side `width`; returns the parent map and the
/// coarse level.
fn coarsen(fine: &ClusterLevel, width: f64, origin: ArrayView1<'_, f64>) -> Result<(Vec<u32>, ClusterLevel)> {
    let n = fine.cloud.len();
    let d = fine.cloud.dim();

    let mut index: HashMap<Vec<i64>, u32> = HashMap::new();
    let mut parent = Vec::with_capacity(n);
    let mut children: Vec<Vec<u32>> = Vec::new();
    let mut key = Vec::with_capacity(d);
    for i in 0..n {
        key.clear();
        key.extend(
            fine.cloud
                .point(i)
                .iter()
                .zip(origin.iter())
                .map(|(&x, &o)| ((x - o) / width).floor() as i64),
        );
        let id = match index.get(&key) {
            Some(&id) => id,
            None => {
                let id = children.len() as u32;
                index.insert(key.clone(), id);
                children.push(Vec::new());
                id
            }
        };
        parent.push(id);
        children[id as usize].push(i as u32);
    }

    let clusters: Vec<(Vec<f64>, f64, f64)> = children
        .par_iter()
        .map(|members| aggregate(fine, members))
        .collect();

    let mut coords = Vec::with_capacity(clusters.len() * d);
    let mut weights = Vec::with_capacity(clusters.len());
    let mut radius = Vec::with_capacity(clusters.len());
    for (centroid, mass, r) in clusters {
        coords.extend(centroid);
        weights.push(mass);
        radius.push(r);
    }
    let (m, len) = (weights.len(), coords.len());
    let points = Array2::from_shape_vec((m, d), coords).map_err(|_| Error::ShapeMismatch(m * d, len))?;

    let coarse = ClusterLevel {
        cloud: WeightedPointCloud::from_parts(points, Array1::from_vec(weights)),
        radius,
        parent: Vec::new(),
        children,
        width,
    };
    Ok((parent, coarse))
}

/// Weighted centroid, summed mass, and covering radius of one cluster.
fn aggregate(fine: &ClusterLevel, members: &[u32]) -> (Vec<f64>, f64, f64) {
    let d = fine.cloud.dim();
    let mass: f64 = members.iter().map(|&i| fine.cloud.weight(i as usize)).sum();

    let mut centroid = vec![0.0; d];
    if mass > 0.0 {
        for &i in members {
            let w = fine.cloud.weight(i as usize);
            for (c, &x) in centroid.iter_mut().zip(fine.cloud.point(i as usize).iter()) {
                *c += w * x;
            }
        }
        centroid.iter_mut().for_each(|c| *c /= mass);
    } else {
        // Massless cluster: fall back to the plain mean.
        for &i in members {
            for (c, &x) in centroid.iter_mut().zip(fine.cloud.point(i as usize).iter()) {
                *c += x;
            }
        }
        let count = members.len() as f64;
        centroid.iter_mut().for_each(|c| *c /= count);
    }

    let center = ArrayView1::from(&centroid[..]);
    let radius = members
        .iter()
        .map(|&i| euclidean_distance(center, fine.cloud.point(i as usize)) + fine.radius[i as usize])
        .fold(0.0, f64::max);

    (centroid, mass, radius)
}

/// Number of levels needed for the coarsest one to hold about `coarse_points`.
fn hierarchy_depth(n: usize, dim: usize, coarse_points: usize) -> usize {
    let branching = 2f64.powi(dim as i32);
    let mut depth = 1;
    let mut size = n as f64;
    while size > coarse_points as f64 && depth < MAX_DEPTH {
        size /= branching;
        depth += 1;
    }
    depth
}

/// Passes between support rechecks at the final epsilon.
const RECHECK_EVERY: usize = 25;

/// A recheck window that shrinks the residual by less than this factor counts
/// as a stall.
const STALL_RATIO: f64 = 0.9;

/// Cluster indices of `cloud` in lexicographic order of their coordinates.
fn lexicographic(cloud: &WeightedPointCloud) -> Vec<usize> {
    let mut order: Vec<usize> = (0..cloud.len()).collect();
    order.sort_by(|&i, &j| {
        cloud
            .point(i)
            .iter()
            .zip(cloud.point(j).iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    });
    order
}

/// Blocks of a north-west-corner plan between the clusters of `la` and `lb`.
///
/// Both levels carry the same total mass, so the corner plan has exactly the
/// cluster masses as marginals. Spreading each entry over its block in
/// proportion to the fine masses gives a fine plan with the right marginals,
/// hence any block support containing these pairs is feasible. At most
/// `m + n - 1` pairs.
fn feasible_skeleton(la: &ClusterLevel, lb: &ClusterLevel) -> Vec<(u32, u32)> {
    let (ra, rb) = (lexicographic(&la.cloud), lexicographic(&lb.cloud));
    if ra.is_empty() || rb.is_empty() {
        return Vec::new();
    }

    let mut pairs = Vec::with_capacity(ra.len() + rb.len());
    let (mut i, mut j) = (0, 0);
    let mut left_a = la.cloud.weight(ra[0]);
    let mut left_b = lb.cloud.weight(rb[0]);
    loop {
        pairs.push((ra[i] as u32, rb[j] as u32));
        let (last_a, last_b) = (i + 1 == ra.len(), j + 1 == rb.len());
        if last_a && last_b {
            break;
        }
        if last_b || (!last_a && left_a <= left_b) {
            left_b -= left_a;
            i += 1;
            left_a = la.cloud.weight(ra[i]);
        } else {
            left_a -= left_b;
            j += 1;
            left_b = lb.cloud.weight(rb[j]);
        }
    }
    pairs
}

/// Per cluster: `max f/ε` and `max (log w + f/ε)` over its children.
fn cluster_peaks(children: &[Vec<u32>], log_w: &Array1<f64>, pot: &Array1<f64>, eps: f64) -> Vec<(f64, f64)> {
    children
        .iter()
        .map(|members| {
            members.iter().fold((f64::NEG_INFINITY, f64::NEG_INFINITY), |(p, wp), &x| {
                let x = x as usize;
                let s = pot[x] / eps;
                (p.max(s), wp.max(log_w[x] + s))
            })
        })
        .collect()
}

/// Add `pairs` to per-row block lists, keeping each list sorted and unique.
fn union_blocks<I>(mut rows: Vec<Vec<u32>>, pairs: I) -> Vec<Vec<u32>>
where
    I: IntoIterator<Item = (u32, u32)>,
{
    for (i, j) in pairs {
        rows[i as usize].push(j);
    }
    for js in rows.iter_mut() {
        js.sort_unstable();
        js.dedup();
    }
    rows
}

/// Every kept `(row cluster, column cluster)` pair of a block support.
fn block_pairs<'s>(blocks: &'s BlockSupport<'_>) -> impl Iterator<Item = (u32, u32)> + 's {
    blocks
        .rows()
        .iter()
        .enumerate()
        .flat_map(|(i, js)| js.iter().map(move |&j| (i as u32, j)))
}

/// The two hierarchies walked in lock-step.
struct Pyramid<'h> {
    a: &'h ClusterHierarchy,
    b: &'h ClusterHierarchy,
    cost: CostModel,
    truncate: f64,
}

impl<'h> Pyramid<'h> {
    /// Block support on `level`, grouped by the clusters of `level + 1`.
    fn blocks(&self, level: usize, rows: Vec<Vec<u32>>) -> BlockSupport<'h> {
        BlockSupport::new(
            self.a.level(level).parent(),
            self.b.level(level).parent(),
            self.a.level(level + 1).children(),
            self.b.level(level + 1).children(),
            rows,
        )
    }

    /// Kernel truncation on `level`.
    ///
    /// Keeps every block `(I, J)` of `level + 1` clusters holding a pair
    /// `(x, y)` that carries at least an `e^-truncate` share of the mass of
    /// row `x` or of column `y` under the current potentials. The row share
    /// is `β_y exp((f_x + g_y − c(x, y)) / ε)`; per-cluster maxima of the
    /// potentials and the radius lower bound `c(max(0, d − r_I − r_J))` bound
    /// it over a whole block, so no qualifying pair is ever dropped. All
    /// cluster pairs are scored, whatever the previous support was, and the
    /// result always contains `skeleton`.
    fn admit(
        &self,
        level: usize,
        potentials: &DualPotentials,
        eps: f64,
        skeleton: &[(u32, u32)],
    ) -> Vec<Vec<u32>> {
        let (fine_a, fine_b) = (self.a.level(level), self.b.level(level));
        let (ca, cb) = (self.a.level(level + 1), self.b.level(level + 1));
        let log_a = log_weights(fine_a.cloud.weights());
        let log_b = log_weights(fine_b.cloud.weights());
        let peaks_a = cluster_peaks(&ca.children, &log_a, &potentials.f, eps);
        let peaks_b = cluster_peaks(&cb.children, &log_b, &potentials.g, eps);

        let (cost, truncate) = (self.cost, self.truncate);
        let rows: Vec<Vec<u32>> = (0..ca.cloud.len())
            .into_par_iter()
            .map(|i| {
                let pi = ca.cloud.point(i);
                let ri = ca.radius[i];
                let (f_i, af_i) = peaks_a[i];
                (0..cb.cloud.len())
                    .filter(|&j| {
                        let (g_j, bg_j) = peaks_b[j];
                        let share = (f_i + bg_j).max(af_i + g_j);
                        if share < -truncate {
                            return false;
                        }
                        let d = euclidean_distance(pi, cb.cloud.point(j));
                        share - cost.cost_from_distance((d - ri - cb.radius[j]).max(0.0)) / eps >= -truncate
                    })
                    .map(|j| j as u32)
                    .collect()
            })
            .collect();
        union_blocks(rows, skeleton.iter().copied())
    }

    /// Converge at the final epsilon on the original points.
    ///
    /// Every `RECHECK_EVERY` passes, and again once the residual is below the
    /// tolerance, blocks are re-admitted from the current potentials; a solve
    /// only counts as converged when no block is missing. A window that
    /// neither admits a block nor shrinks the residual switches to the dense
    /// support.
    fn converge(
        &self,
        solver: &SinkhornSolver<'_>,
        potentials: &mut DualPotentials,
        support: &mut Support<'h>,
        skeleton: &[(u32, u32)],
        eps: f64,
    ) -> Result<(usize, f64)> {
        let options = *solver.options();
        let mut passes = 0;
        let mut residual = f64::INFINITY;
        let mut window_start = f64::INFINITY;

        while passes < options.max_iterations {
            let window = RECHECK_EVERY.min(options.max_iterations - passes);
            let mut settled = false;
            for _ in 0..window {
                residual = solver.iterate(potentials, eps, support, 1)?;
                passes += 1;
                if residual < options.tolerance {
                    settled = true;
                    break;
                }
            }

            let grown = match &*support {
                Support::Dense => None,
                Support::Blocks(blocks) => {
                    let rows = union_blocks(self.admit(0, potentials, eps, skeleton), block_pairs(blocks));
                    let count: usize = rows.iter().map(Vec::len).sum();
                    (count > blocks.block_count()).then_some(rows)
                }
            };
            match grown {
                Some(rows) => {
                    let blocks = self.blocks(0, rows);
                    log::debug!(
                        "multiscale: pass {} residual={:.3e}, support grew to {} blocks",
                        passes,
                        residual,
                        blocks.block_count()
                    );
                    *support = Support::Blocks(blocks);
                }
                None if settled => return Ok((passes, residual)),
                None => {
                    if matches!(support, Support::Blocks(_)) && residual >= STALL_RATIO * window_start {
                        log::debug!(
                            "multiscale: pass {} residual={:.3e} stalled, switching to the dense support",
                            passes,
                            residual
                        );
                        *support = Support::Dense;
                    }
                }
            }
            window_start = residual;
        }

        Err(Error::NonConvergence {
            iterations: options.max_iterations,
            epsilon: eps,
            residual,
        })
    }
}

/// Solve entropic OT between `a` and `b` coarse-to-fine.
///
/// Walks `schedule` in lock-step with the cluster hierarchies: epsilons larger
/// than a level's cluster scale are solved on that level, potentials are
/// broadcast to the children on the way down, and the final epsilon is always
/// solved (to convergence) on the original points.
///
/// Falls back to the dense single-scale solver when either cloud has fewer
/// than `config.min_multiscale_points` points or no coarsening is possible.
pub fn solve_multiscale(
    a: &WeightedPointCloud,
    b: &WeightedPointCloud,
    schedule: &AnnealingSchedule,
    config: &DivergenceConfig,
) -> Result<SinkhornOutput> {
    let cost = CostModel::new(config.p)?;
    let options = SolverOptions::from(config);
    if a.dim() != b.dim() {
        return Err(Error::DimensionMismatch(a.dim(), b.dim()));
    }

    let direct = || -> Result<SinkhornOutput> {
        SinkhornSolver::new(a, b, cost, options)?.solve_annealed(schedule, None)
    };

    if a.len().min(b.len()) < config.min_multiscale_points {
        log::debug!(
            "multiscale: {}x{} points below {}, solving directly",
            a.len(),
            b.len(),
            config.min_multiscale_points
        );
        return direct();
    }

    let dim = a.dim();
    let n_max = a.len().max(b.len());
    let depth = hierarchy_depth(n_max, dim, config.coarse_points);
    let (lo, hi) = match joint_bounding_box(a, b) {
        Some(bb) => bb,
        None => return direct(),
    };
    let diameter = euclidean_distance(lo.view(), hi.view());
    if depth < 2 || !(diameter > 0.0) {
        return direct();
    }

    let base_width = diameter / ((dim as f64).sqrt() * (n_max as f64).powf(1.0 / dim as f64));
    let ha = ClusterHierarchy::build(a, depth, base_width, lo.view())?;
    let hb = ClusterHierarchy::build(b, depth, base_width, lo.view())?;
    let pyramid = Pyramid {
        a: &ha,
        b: &hb,
        cost,
        truncate: config.truncate,
    };

    // Cost scale of the clustering error on each level.
    let level_scale: Vec<f64> = (0..depth)
        .map(|k| cost.cost_from_distance(2.0 * ha.level(k).max_radius().max(hb.level(k).max_radius())))
        .collect();
    log::debug!(
        "multiscale: {}x{} points, {} levels, sizes {:?}x{:?}, base width {:.3}",
        a.len(),
        b.len(),
        depth,
        (0..depth).map(|k| ha.level(k).cloud().len()).collect::<Vec<_>>(),
        (0..depth).map(|k| hb.level(k).cloud().len()).collect::<Vec<_>>(),
        base_width
    );

    let mut level = depth - 1;
    let mut support = Support::Dense;
    let mut skeleton = Vec::new();
    let mut potentials =
        DualPotentials::zeros(ha.level(level).cloud().len(), hb.level(level).cloud().len());
    let mut iterations = 0;
    let mut residual = f64::INFINITY;

    for (is_final, eps) in schedule.iter() {
        let target = if is_final {
            0
        } else {
            (1..=level).rev().find(|&k| level_scale[k] <= eps).unwrap_or(0)
        };

        if level > target {
            while level > target {
                potentials = DualPotentials {
                    f: ha.broadcast(level - 1, &potentials.f),
                    g: hb.broadcast(level - 1, &potentials.g),
                };
                skeleton = feasible_skeleton(ha.level(level), hb.level(level));
                level -= 1;
                let blocks = pyramid.blocks(level, pyramid.admit(level, &potentials, eps, &skeleton));
                log::debug!(
                    "multiscale: eps={:.3e} -> level {} ({}x{} points), {} blocks, {} pairs",
                    eps,
                    level,
                    ha.level(level).cloud().len(),
                    hb.level(level).cloud().len(),
                    blocks.block_count(),
                    blocks.pair_count()
                );
                support = Support::Blocks(blocks);
            }
        } else if matches!(support, Support::Blocks(_)) {
            let blocks = pyramid.blocks(level, pyramid.admit(level, &potentials, eps, &skeleton));
            log::trace!("multiscale: eps={:.3e} kept {} blocks", eps, blocks.block_count());
            support = Support::Blocks(blocks);
        }

        let solver = SinkhornSolver::new(ha.level(level).cloud(), hb.level(level).cloud(), cost, options)?;
        if is_final {
            let (passes, r) = pyramid.converge(&solver, &mut potentials, &mut support, &skeleton, eps)?;
            iterations += passes;
            residual = r;
        } else {
            residual = solver.iterate(&mut potentials, eps, &support, options.inner_iterations)?;
            iterations += options.inner_iterations;
            log::trace!("multiscale: level {} eps={:.3e} residual={:.3e}", level, eps, residual);
        }
    }

    let solver = SinkhornSolver::new(ha.level(0).cloud(), hb.level(0).cloud(), cost, options)?;
    let value = solver.dual_value(&potentials);
    log::debug!(
        "multiscale: {} epsilons, {} passes, value={:.6}",
        schedule.len(),
        iterations,
        value
    );
    Ok(SinkhornOutput {
        potentials,
        value,
        iterations,
        residual,
        levels: depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::sample_grid;
    use ndarray::{array, Array2};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn grid_cloud(n: usize) -> WeightedPointCloud {
        let grid = Array2::from_shape_fn((n, n), |(i, j)| 1.0 + ((i * 7 + j * 3) % 5) as f64);
        sample_grid(&grid.view()).unwrap()
    }

    fn random_grid(n: usize, seed: u64, mass: f64) -> Array2<f64> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut g = Array2::from_shape_fn((n, n), |_| rng.gen::<f64>());
        let s = g.sum();
        g.mapv_inplace(|x| x * mass / s);
        g
    }

    #[test]
    fn levels_bucket_by_doubling_width() {
        let cloud = grid_cloud(8);
        let h = ClusterHierarchy::build(&cloud, 4, 1.0, array![0.0, 0.0].view()).unwrap();
        let sizes: Vec<usize> = (0..4).map(|k| h.level(k).cloud().len()).collect();
        assert_eq!(sizes, vec![64, 16, 4, 1]);
        assert_eq!(h.level(1).width(), 2.0);
        assert_eq!(h.level(3).width(), 8.0);
    }

    #[test]
    fn mass_is_conserved_at_every_level() {
        let cloud = grid_cloud(13);
        let total = cloud.total_mass();
        let h = ClusterHierarchy::build(&cloud, 5, 1.3, array![0.0, 0.0].view()).unwrap();
        for k in 0..h.depth() {
            let lvl = h.level(k);
            assert!(
                (lvl.cloud().total_mass() - total).abs() < 1e-9 * total,
                "level {} mass {} != {}",
                k,
                lvl.cloud().total_mass(),
                total
            );
            if k > 0 {
                let below = h.level(k - 1).cloud();
                for (id, members) in lvl.children().iter().enumerate() {
                    let sum: f64 = members.iter().map(|&i| below.weight(i as usize)).sum();
                    assert_eq!(lvl.cloud().weight(id), sum);
                }
            }
        }
    }

    #[test]
    fn parents_and_children_agree() {
        let cloud = grid_cloud(9);
        let h = ClusterHierarchy::build(&cloud, 3, 1.0, array![0.0, 0.0].view()).unwrap();
        for k in 0..h.depth() - 1 {
            let parent = h.level(k).parent();
            assert_eq!(parent.len(), h.level(k).cloud().len());
            for (i, &p) in parent.iter().enumerate() {
                assert!(h.level(k + 1).children()[p as usize].contains(&(i as u32)));
            }
        }
        assert!(h.level(h.depth() - 1).parent().is_empty());
        assert!(h.level(0).children().is_empty());
    }

    #[test]
    fn radius_covers_every_original_point() {
        let cloud = grid_cloud(11);
        let h = ClusterHierarchy::build(&cloud, 4, 1.0, array![0.0, 0.0].view()).unwrap();
        for x in 0..cloud.len() {
            let mut idx = x;
            for k in 1..h.depth() {
                idx = h.level(k - 1).parent()[idx] as usize;
                let lvl = h.level(k);
                let d = euclidean_distance(cloud.point(x), lvl.cloud().point(idx));
                assert!(d <= lvl.radius()[idx] + 1e-9, "level {} point {}", k, x);
            }
        }
    }

    #[test]
    fn broadcast_copies_parent_values() {
        let cloud = grid_cloud(4);
        let h = ClusterHierarchy::build(&cloud, 2, 1.0, array![0.0, 0.0].view()).unwrap();
        let coarse: Array1<f64> = (0..h.level(1).cloud().len()).map(|k| k as f64).collect();
        let fine = h.broadcast(0, &coarse);
        for (i, &v) in fine.iter().enumerate() {
            assert_eq!(v, h.level(0).parent()[i] as f64);
        }
    }

    #[test]
    fn build_rejects_bad_arguments() {
        let cloud = grid_cloud(3);
        assert!(ClusterHierarchy::build(&cloud, 0, 1.0, array![0.0, 0.0].view()).is_err());
        assert!(ClusterHierarchy::build(&cloud, 2, 0.0, array![0.0, 0.0].view()).is_err());
        assert!(matches!(
            ClusterHierarchy::build(&cloud, 2, 1.0, array![0.0].view()),
            Err(Error::DimensionMismatch(2, 1))
        ));
    }

    #[test]
    fn depth_targets_the_coarse_size() {
        assert_eq!(hierarchy_depth(100, 2, 256), 1);
        assert_eq!(hierarchy_depth(16_384, 2, 256), 4);
        assert_eq!(hierarchy_depth(usize::MAX, 2, 1), MAX_DEPTH);
    }

    #[test]
    fn skeleton_covers_every_cluster() {
        let a = sample_grid(&random_grid(12, 5, 10.0).view()).unwrap();
        let b = sample_grid(&random_grid(12, 6, 10.0).view()).unwrap();
        let ha = ClusterHierarchy::build(&a, 3, 1.0, array![0.0, 0.0].view()).unwrap();
        let hb = ClusterHierarchy::build(&b, 3, 1.0, array![0.0, 0.0].view()).unwrap();
        let (la, lb) = (ha.level(1), hb.level(1));

        let pairs = feasible_skeleton(la, lb);
        let (m, n) = (la.cloud().len(), lb.cloud().len());
        assert!(pairs.len() <= m + n - 1);
        for i in 0..m as u32 {
            assert!(pairs.iter().any(|&(r, _)| r == i), "row cluster {} missing", i);
        }
        for j in 0..n as u32 {
            assert!(pairs.iter().any(|&(_, c)| c == j), "column cluster {} missing", j);
        }
    }

    #[test]
    fn skeleton_carries_a_plan_with_the_cluster_masses() {
        // Rebuild the corner plan on the returned pairs and check its marginals.
        let a = sample_grid(&random_grid(10, 8, 4.0).view()).unwrap();
        let b = sample_grid(&random_grid(10, 9, 4.0).view()).unwrap();
        let ha = ClusterHierarchy::build(&a, 2, 1.0, array![0.0, 0.0].view()).unwrap();
        let hb = ClusterHierarchy::build(&b, 2, 1.0, array![0.0, 0.0].view()).unwrap();
        let (la, lb) = (ha.level(1), hb.level(1));

        let mut left_a: Vec<f64> = la.cloud().weights().to_vec();
        let mut left_b: Vec<f64> = lb.cloud().weights().to_vec();
        for &(i, j) in &feasible_skeleton(la, lb) {
            let (i, j) = (i as usize, j as usize);
            let moved = left_a[i].min(left_b[j]);
            left_a[i] -= moved;
            left_b[j] -= moved;
        }
        assert!(left_a.iter().chain(left_b.iter()).all(|&r| r.abs() < 1e-9));
    }

    #[test]
    fn admission_never_drops_a_visible_pair() {
        let n = 16;
        let a = sample_grid(&random_grid(n, 11, 50.0).view()).unwrap();
        let b = sample_grid(&random_grid(n, 12, 50.0).view()).unwrap();
        let ha = ClusterHierarchy::build(&a, 3, 1.0, array![0.0, 0.0].view()).unwrap();
        let hb = ClusterHierarchy::build(&b, 3, 1.0, array![0.0, 0.0].view()).unwrap();
        let cost = CostModel::new(1.0).unwrap();
        let pyramid = Pyramid { a: &ha, b: &hb, cost, truncate: 8.0 };

        let eps = 0.5;
        let schedule = AnnealingSchedule::constant(eps).unwrap();
        let options = SolverOptions::from(&DivergenceConfig::default());
        let potentials = SinkhornSolver::new(&a, &b, cost, options)
            .unwrap()
            .solve_annealed(&schedule, None)
            .unwrap()
            .potentials;

        let rows = pyramid.admit(0, &potentials, eps, &[]);
        let (log_a, log_b) = (log_weights(a.weights()), log_weights(b.weights()));
        let (pa, pb) = (ha.level(0).parent(), hb.level(0).parent());
        for x in 0..a.len() {
            for y in 0..b.len() {
                let z = (potentials.f[x] + potentials.g[y] - cost.cost(a.point(x), b.point(y))) / eps;
                if (log_b[y] + z).max(log_a[x] + z) >= -8.0 {
                    assert!(
                        rows[pa[x] as usize].contains(&pb[y]),
                        "pair ({}, {}) dropped",
                        x,
                        y
                    );
                }
            }
        }
        let kept: usize = rows.iter().map(Vec::len).sum();
        assert!(kept < ha.level(1).cloud().len() * hb.level(1).cloud().len());
    }

    #[test]
    fn admission_always_keeps_the_skeleton() {
        let a = grid_cloud(8);
        let ha = ClusterHierarchy::build(&a, 2, 1.0, array![0.0, 0.0].view()).unwrap();
        let pyramid = Pyramid { a: &ha, b: &ha, cost: CostModel::new(1.0).unwrap(), truncate: 8.0 };
        // Potentials far below zero make every share invisible.
        let potentials = DualPotentials {
            f: Array1::from_elem(a.len(), -1e3),
            g: Array1::from_elem(a.len(), -1e3),
        };
        let skeleton = feasible_skeleton(ha.level(1), ha.level(1));
        let rows = pyramid.admit(0, &potentials, 0.01, &skeleton);
        for &(i, j) in &skeleton {
            assert!(rows[i as usize].contains(&j));
        }
        assert_eq!(rows.iter().map(Vec::len).sum::<usize>(), skeleton.len());
    }

    #[test]
    fn block_support_visits_children_of_kept_blocks() {
        // Rows: fine 0,1 under cluster 0; fine 2 under cluster 1.
        // Cols: fine 0 under cluster 0; fine 1,2 under cluster 1.
        let row_parent = vec![0u32, 0, 1];
        let col_parent = vec![0u32, 1, 1];
        let row_children = vec![vec![0u32, 1], vec![2]];
        let col_children = vec![vec![0u32], vec![1, 2]];
        let blocks = BlockSupport::new(
            &row_parent,
            &col_parent,
            &row_children,
            &col_children,
            vec![vec![1], vec![0, 1]],
        );
        assert_eq!(blocks.block_count(), 3);
        assert_eq!(blocks.pair_count(), 2 * 2 + 1 + 2);

        let support = Support::Blocks(blocks);
        let mut seen = Vec::new();
        support.visit_cols(0, 3, &mut |y| seen.push(y));
        assert_eq!(seen, vec![1, 2]);

        seen.clear();
        support.visit_rows(0, 3, &mut |x| seen.push(x));
        assert_eq!(seen, vec![2]);

        seen.clear();
        support.visit_rows(2, 3, &mut |x| seen.push(x));
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn small_clouds_fall_back_to_direct() {
        let a = grid_cloud(4);
        let schedule = AnnealingSchedule::new(5.0, 0.05, 0.5, 1.0).unwrap();
        let out = solve_multiscale(&a, &a, &schedule, &DivergenceConfig::default()).unwrap();
        assert_eq!(out.levels, 1);
    }

    #[test]
    fn multiscale_matches_direct() {
        let n = 24;
        let a = sample_grid(&random_grid(n, 1, 100.0).view()).unwrap();
        let b = sample_grid(&random_grid(n, 2, 100.0).view()).unwrap();
        let config = DivergenceConfig::default()
            .with_blur(0.05)
            .with_tolerance(1e-6)
            .with_max_iterations(10_000)
            .with_min_multiscale_points(64)
            .with_coarse_points(32);
        let schedule =
            AnnealingSchedule::new(a.diameter_with(&b), config.blur, config.scaling, config.p).unwrap();

        let multi = solve_multiscale(&a, &b, &schedule, &config).unwrap();
        assert!(multi.levels > 1);

        let direct = SinkhornSolver::new(&a, &b, CostModel::new(1.0).unwrap(), SolverOptions::from(&config))
            .unwrap()
            .solve_annealed(&schedule, None)
            .unwrap();

        let rel = (multi.value - direct.value).abs() / direct.value.abs();
        assert!(rel < 1e-2, "multiscale={} direct={}", multi.value, direct.value);
    }
}
