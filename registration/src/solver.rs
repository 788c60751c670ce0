//! Decoupled robust SE(3) estimation.
//!
//! Translation-invariant measurements (pairwise differences of matched
//! points) decouple rotation from translation. Rotation is solved by
//! graduated non-convexity over a truncated-least-squares loss, either in
//! full 3-DoF or yaw-only ("Quatro") when roll and pitch are known to be
//! negligible. Translation is recovered per axis by consensus voting on
//! the rotated residuals. All arithmetic is f64: inputs are promoted at
//! the match/solve boundary.

use cm_core::RegistrationSolution;
use nalgebra::{Matrix3, Matrix3xX, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Rotation estimation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationEstimation {
    /// Full 3-DoF graduated non-convexity over a TLS loss.
    #[default]
    GncTls,
    /// Yaw-only estimation with gravity-aligned components cancelled.
    Quatro,
}

#[derive(Debug, Clone)]
pub struct SolverParams {
    /// Truncation bound c-bar of the TLS loss and the translation
    /// consensus half-width.
    pub noise_bound: f64,
    pub rotation_estimation: RotationEstimation,
    /// Divisor of the surrogate control parameter per GNC iteration.
    pub gnc_factor: f64,
    pub max_iterations: usize,
    /// Stop once the L1 change of the weight vector drops below this.
    pub cost_threshold: f64,
    /// TIM weights at or above this count as rotation inliers.
    pub inlier_weight_threshold: f64,
    /// Cap on translation-invariant measurements; beyond it pairs are
    /// subsampled with a seeded generator.
    pub max_tims: usize,
    pub tim_seed: u64,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            noise_bound: 0.1,
            rotation_estimation: RotationEstimation::GncTls,
            gnc_factor: 1.4,
            max_iterations: 100,
            cost_threshold: 1e-6,
            inlier_weight_threshold: 0.5,
            max_tims: 20_000,
            tim_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SolverState {
    Reset,
    Fitted,
}

/// Robust registration solver.
///
/// `solve` always leaves the solver in the fitted state; calling it again
/// without `reset` simply overwrites the previous solution.
pub struct RobustRegistrationSolver {
    params: SolverParams,
    state: SolverState,
    solution: RegistrationSolution,
    rotation_inliers: Vec<usize>,
    translation_inliers: Vec<usize>,
}

impl RobustRegistrationSolver {
    pub fn new(params: SolverParams) -> Self {
        Self {
            params,
            state: SolverState::Reset,
            solution: RegistrationSolution::invalid_identity(),
            rotation_inliers: Vec::new(),
            translation_inliers: Vec::new(),
        }
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Return to the initial state, discarding any previous solution.
    pub fn reset(&mut self) {
        self.state = SolverState::Reset;
        self.solution = RegistrationSolution::invalid_identity();
        self.rotation_inliers.clear();
        self.translation_inliers.clear();
    }

    pub fn is_fitted(&self) -> bool {
        self.state == SolverState::Fitted
    }

    pub fn solution(&self) -> &RegistrationSolution {
        &self.solution
    }

    /// Indices of translation-invariant measurements whose final GNC
    /// weight passed the inlier threshold.
    pub fn rotation_inliers(&self) -> &[usize] {
        &self.rotation_inliers
    }

    /// Correspondence indices inside the consensus window on all axes.
    pub fn translation_inliers(&self) -> &[usize] {
        &self.translation_inliers
    }

    /// Estimate the rigid transform aligning `src` to `dst`.
    ///
    /// Columns are matched pairs. Fewer than two columns, a column-count
    /// mismatch or non-finite input yields the invalid identity solution.
    pub fn solve(
        &mut self,
        src: &Matrix3xX<f64>,
        dst: &Matrix3xX<f64>,
    ) -> &RegistrationSolution {
        self.reset();
        self.state = SolverState::Fitted;

        let m = src.ncols();
        if m != dst.ncols() || m < 2 {
            return &self.solution;
        }
        if !src.iter().all(|v| v.is_finite()) || !dst.iter().all(|v| v.is_finite()) {
            return &self.solution;
        }

        let (tims_src, tims_dst) =
            build_tims(src, dst, self.params.max_tims, self.params.tim_seed);

        let estimate = match self.params.rotation_estimation {
            RotationEstimation::GncTls => self.gnc_rotation(&tims_src, &tims_dst),
            RotationEstimation::Quatro => self.quatro_rotation(&tims_src, &tims_dst),
        };
        let Some((rotation, weights)) = estimate else {
            return &self.solution;
        };
        if !is_proper_rotation(&rotation) {
            return &self.solution;
        }

        let threshold = self.params.inlier_weight_threshold;
        self.rotation_inliers = weights
            .iter()
            .enumerate()
            .filter(|(_, &w)| w >= threshold)
            .map(|(k, _)| k)
            .collect();

        let Some((translation, translation_inliers)) =
            estimate_translation(src, dst, &rotation, self.params.noise_bound)
        else {
            return &self.solution;
        };
        self.translation_inliers = translation_inliers;

        if self.rotation_inliers.len() >= 3 && self.translation_inliers.len() >= 3 {
            self.solution = RegistrationSolution {
                valid: true,
                scale: 1.0,
                rotation,
                translation,
            };
        }
        &self.solution
    }

    /// GNC loop over the TLS surrogate.
    ///
    /// Weights start uniform (convex surrogate); mu shrinks by
    /// `gnc_factor` per iteration down to the floor of 1 where the
    /// surrogate equals the target robust loss. Convergence is judged on
    /// the weight change, not the residual, which is non-monotone under
    /// TLS.
    fn gnc_rotation(
        &self,
        tims_src: &[Vector3<f64>],
        tims_dst: &[Vector3<f64>],
    ) -> Option<(Matrix3<f64>, Vec<f64>)> {
        let n = tims_src.len();
        let cbar2 = self.params.noise_bound * self.params.noise_bound;

        let mut weights = vec![1.0f64; n];
        let mut rotation = weighted_procrustes(tims_src, tims_dst, &weights)?;
        let mut residuals = rotation_residuals(tims_src, tims_dst, &rotation);

        let r_max = residuals.iter().copied().fold(0.0f64, f64::max);
        let mut mu = (2.0 * r_max / cbar2).max(1.0);

        for _ in 0..self.params.max_iterations {
            let delta = update_weights(&residuals, mu, cbar2, &mut weights);
            rotation = weighted_procrustes(tims_src, tims_dst, &weights)?;
            residuals = rotation_residuals(tims_src, tims_dst, &rotation);
            if delta < self.params.cost_threshold {
                break;
            }
            mu = (mu / self.params.gnc_factor).max(1.0);
        }
        Some((rotation, weights))
    }

    /// Yaw-only GNC: gravity-aligned components are zeroed and the
    /// weighted 2D Procrustes has a closed form.
    fn quatro_rotation(
        &self,
        tims_src: &[Vector3<f64>],
        tims_dst: &[Vector3<f64>],
    ) -> Option<(Matrix3<f64>, Vec<f64>)> {
        let n = tims_src.len();
        let cbar2 = self.params.noise_bound * self.params.noise_bound;

        let a: Vec<(f64, f64)> = tims_src.iter().map(|v| (v.x, v.y)).collect();
        let b: Vec<(f64, f64)> = tims_dst.iter().map(|v| (v.x, v.y)).collect();

        let mut weights = vec![1.0f64; n];
        let mut yaw = weighted_yaw(&a, &b, &weights)?;
        let mut residuals = yaw_residuals(&a, &b, yaw);

        let r_max = residuals.iter().copied().fold(0.0f64, f64::max);
        let mut mu = (2.0 * r_max / cbar2).max(1.0);

        for _ in 0..self.params.max_iterations {
            let delta = update_weights(&residuals, mu, cbar2, &mut weights);
            yaw = weighted_yaw(&a, &b, &weights)?;
            residuals = yaw_residuals(&a, &b, yaw);
            if delta < self.params.cost_threshold {
                break;
            }
            mu = (mu / self.params.gnc_factor).max(1.0);
        }

        let (sin, cos) = yaw.sin_cos();
        let rotation = Matrix3::new(cos, -sin, 0.0, sin, cos, 0.0, 0.0, 0.0, 1.0);
        Some((rotation, weights))
    }
}

/// Pairwise translation-invariant measurements. All pairs when their
/// count stays within `max_tims`, otherwise a seeded random subsample.
fn build_tims(
    src: &Matrix3xX<f64>,
    dst: &Matrix3xX<f64>,
    max_tims: usize,
    seed: u64,
) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
    let m = src.ncols();
    let total = m * (m - 1) / 2;
    let mut tims_src = Vec::with_capacity(total.min(max_tims));
    let mut tims_dst = Vec::with_capacity(total.min(max_tims));

    if total <= max_tims {
        for i in 0..m {
            for j in (i + 1)..m {
                tims_src.push(Vector3::from(src.column(j) - src.column(i)));
                tims_dst.push(Vector3::from(dst.column(j) - dst.column(i)));
            }
        }
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        while tims_src.len() < max_tims {
            let i = rng.random_range(0..m);
            let j = rng.random_range(0..m);
            if i == j {
                continue;
            }
            tims_src.push(Vector3::from(src.column(j) - src.column(i)));
            tims_dst.push(Vector3::from(dst.column(j) - dst.column(i)));
        }
    }
    (tims_src, tims_dst)
}

/// TLS surrogate weights for the given squared residuals; returns the L1
/// change of the weight vector.
fn update_weights(residuals: &[f64], mu: f64, cbar2: f64, weights: &mut [f64]) -> f64 {
    let mut delta = 0.0;
    for (w, &r) in weights.iter_mut().zip(residuals) {
        let denom = r + mu * cbar2;
        let w_new = if denom <= f64::EPSILON {
            1.0
        } else {
            let t = mu * cbar2 / denom;
            t * t
        };
        delta += (w_new - *w).abs();
        *w = w_new;
    }
    delta
}

fn rotation_residuals(
    tims_src: &[Vector3<f64>],
    tims_dst: &[Vector3<f64>],
    rotation: &Matrix3<f64>,
) -> Vec<f64> {
    tims_src
        .iter()
        .zip(tims_dst)
        .map(|(a, b)| (b - rotation * a).norm_squared())
        .collect()
}

fn yaw_residuals(a: &[(f64, f64)], b: &[(f64, f64)], yaw: f64) -> Vec<f64> {
    let (sin, cos) = yaw.sin_cos();
    a.iter()
        .zip(b)
        .map(|(&(ax, ay), &(bx, by))| {
            let rx = bx - (cos * ax - sin * ay);
            let ry = by - (sin * ax + cos * ay);
            rx * rx + ry * ry
        })
        .collect()
}

/// Weighted orthogonal Procrustes on translation-invariant measurements.
///
/// SVD of the weighted cross-covariance; when the determinant comes out
/// negative the last right-singular vector is sign-flipped to stay in
/// SO(3). `None` when the weights vanish or the SVD degenerates.
fn weighted_procrustes(
    tims_src: &[Vector3<f64>],
    tims_dst: &[Vector3<f64>],
    weights: &[f64],
) -> Option<Matrix3<f64>> {
    let mut cross = Matrix3::zeros();
    let mut total = 0.0;
    for ((a, b), &w) in tims_src.iter().zip(tims_dst).zip(weights) {
        if w > 0.0 {
            cross += (b * a.transpose()) * w;
            total += w;
        }
    }
    if total <= f64::EPSILON {
        return None;
    }

    let svd = cross.svd(true, true);
    let u = svd.u?;
    let mut v_t = svd.v_t?;

    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut row = v_t.row_mut(2);
        row *= -1.0;
        rotation = u * v_t;
    }
    if !rotation.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(rotation)
}

/// Closed-form weighted yaw aligning 2D measurement pairs.
fn weighted_yaw(a: &[(f64, f64)], b: &[(f64, f64)], weights: &[f64]) -> Option<f64> {
    let mut sin_sum = 0.0;
    let mut cos_sum = 0.0;
    for ((&(ax, ay), &(bx, by)), &w) in a.iter().zip(b).zip(weights) {
        cos_sum += w * (ax * bx + ay * by);
        sin_sum += w * (ax * by - ay * bx);
    }
    if sin_sum.abs() <= f64::EPSILON && cos_sum.abs() <= f64::EPSILON {
        return None;
    }
    let yaw = sin_sum.atan2(cos_sum);
    yaw.is_finite().then_some(yaw)
}

/// Component-wise consensus translation.
///
/// Per axis the residuals `dst - R * src` are sorted and swept with a
/// window of width `2 * noise_bound`; the first maximal window wins and
/// its mean is the estimate. Inliers are the correspondences inside the
/// winning window on every axis.
fn estimate_translation(
    src: &Matrix3xX<f64>,
    dst: &Matrix3xX<f64>,
    rotation: &Matrix3<f64>,
    noise_bound: f64,
) -> Option<(Vector3<f64>, Vec<usize>)> {
    let m = src.ncols();
    let rotated = rotation * src;
    let width = 2.0 * noise_bound;

    let mut translation = Vector3::zeros();
    let mut membership = vec![0u8; m];

    for axis in 0..3 {
        let mut residuals: Vec<(f64, usize)> = (0..m)
            .map(|k| (dst[(axis, k)] - rotated[(axis, k)], k))
            .collect();
        if residuals.iter().any(|(v, _)| !v.is_finite()) {
            return None;
        }
        residuals.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut best_lo = 0usize;
        let mut best_hi = 0usize;
        let mut lo = 0usize;
        for hi in 0..m {
            while residuals[hi].0 - residuals[lo].0 > width {
                lo += 1;
            }
            if hi - lo > best_hi - best_lo {
                best_lo = lo;
                best_hi = hi;
            }
        }

        let window = &residuals[best_lo..=best_hi];
        let mean = window.iter().map(|(v, _)| v).sum::<f64>() / window.len() as f64;
        if !mean.is_finite() {
            return None;
        }
        translation[axis] = mean;
        for &(_, k) in window {
            membership[k] += 1;
        }
    }

    let inliers: Vec<usize> = (0..m).filter(|&k| membership[k] == 3).collect();
    Some((translation, inliers))
}

fn is_proper_rotation(rotation: &Matrix3<f64>) -> bool {
    if !rotation.iter().all(|v| v.is_finite()) {
        return false;
    }
    let orthogonality = (rotation.transpose() * rotation - Matrix3::identity()).amax();
    orthogonality <= 1e-6 && rotation.determinant() > 0.0
}
