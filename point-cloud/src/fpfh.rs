//! Keypoint filtering and simplified PFH descriptor extraction.
//!
//! For every input point a surface normal is estimated from the covariance
//! of its radius neighborhood. Points whose neighborhood is too small or
//! too linear are rejected; the survivors become the keypoint cloud and
//! receive a 33-bin angle-histogram descriptor computed against their
//! surviving neighbors.

use crate::spatial::{build_rtree, radius_indices, IndexedPoint};
use nalgebra::{Matrix3, Point3, SymmetricEigen, Vector3};
use rayon::prelude::*;
use rstar::RTree;
use std::f32::consts::PI;

/// Descriptor dimensionality: three angle histograms of 11 bins each.
pub const FPFH_BINS: usize = 33;

const ANGLE_BINS: usize = 11;

/// A 33-bin local geometry descriptor, L1-normalized to sum 100.
#[derive(Debug, Clone, PartialEq)]
pub struct FpfhFeature {
    pub histogram: [f32; FPFH_BINS],
}

/// Keypoint and descriptor extractor.
///
/// Surface normals are sign-disambiguated toward the sensor origin
/// `(0, 0, 0)`: clouds are expected in the sensor frame. A point is kept
/// only when its `normal_radius` neighborhood holds at least
/// `min_neighbors` points (itself included) and its linearity
/// `(lambda_0 - lambda_1) / lambda_0` stays below the configured threshold.
#[derive(Debug, Clone)]
pub struct FpfhEstimator {
    normal_radius: f32,
    fpfh_radius: f32,
    thr_linearity: f32,
    min_neighbors: usize,
}

impl FpfhEstimator {
    pub fn new(normal_radius: f32, fpfh_radius: f32, thr_linearity: f32) -> Self {
        Self {
            normal_radius,
            fpfh_radius,
            thr_linearity,
            min_neighbors: 4,
        }
    }

    /// Compute keypoints and descriptors for `points`.
    ///
    /// Returns two parallel vectors: the surviving points in input order
    /// and one descriptor per survivor. Output is deterministic for a
    /// given input ordering.
    pub fn compute(&self, points: &[Point3<f32>]) -> (Vec<Point3<f32>>, Vec<FpfhFeature>) {
        if points.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let tree = build_rtree(points);

        // Pass 1: normal + validity per input point.
        let normals: Vec<Option<Vector3<f32>>> = (0..points.len())
            .into_par_iter()
            .map(|i| self.estimate_normal(points, &tree, i))
            .collect();

        let keypoint_ids: Vec<usize> = (0..points.len())
            .filter(|&i| normals[i].is_some())
            .collect();

        // Pass 2: descriptor per surviving point, against surviving neighbors.
        let descriptors: Vec<FpfhFeature> = keypoint_ids
            .par_iter()
            .map(|&i| self.describe(points, &normals, &tree, i))
            .collect();

        let keypoints: Vec<Point3<f32>> = keypoint_ids.iter().map(|&i| points[i]).collect();
        (keypoints, descriptors)
    }

    fn estimate_normal(
        &self,
        points: &[Point3<f32>],
        tree: &RTree<IndexedPoint>,
        i: usize,
    ) -> Option<Vector3<f32>> {
        let neighbors = radius_indices(tree, &points[i], self.normal_radius);
        if neighbors.len() < self.min_neighbors {
            return None;
        }

        let mut centroid = Vector3::zeros();
        for &n in &neighbors {
            centroid += points[n].coords;
        }
        centroid /= neighbors.len() as f32;

        let mut cov = Matrix3::zeros();
        for &n in &neighbors {
            let d = points[n].coords - centroid;
            cov += d * d.transpose();
        }
        cov /= neighbors.len() as f32;

        let eigen = SymmetricEigen::new(cov);

        // Sort eigenvalues descending, keeping track of the columns.
        let mut order = [0usize, 1, 2];
        order.sort_unstable_by(|&a, &b| {
            eigen.eigenvalues[b]
                .partial_cmp(&eigen.eigenvalues[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let l0 = eigen.eigenvalues[order[0]];
        let l1 = eigen.eigenvalues[order[1]];
        if !(l0 > f32::EPSILON) {
            return None;
        }

        let linearity = (l0 - l1) / l0;
        if linearity >= self.thr_linearity {
            return None;
        }

        // Smallest-eigenvalue eigenvector, oriented toward the sensor origin.
        let mut normal = eigen.eigenvectors.column(order[2]).into_owned();
        if normal.dot(&points[i].coords) > 0.0 {
            normal = -normal;
        }
        Some(normal)
    }

    fn describe(
        &self,
        points: &[Point3<f32>],
        normals: &[Option<Vector3<f32>>],
        tree: &RTree<IndexedPoint>,
        i: usize,
    ) -> FpfhFeature {
        let mut histogram = [0.0f32; FPFH_BINS];
        let Some(np) = normals[i] else {
            return FpfhFeature { histogram };
        };
        let p = points[i];

        for q_idx in radius_indices(tree, &p, self.fpfh_radius) {
            if q_idx == i {
                continue;
            }
            let Some(nq) = normals[q_idx] else {
                continue;
            };
            if let Some((alpha, phi, theta)) = pair_feature(&p, &np, &points[q_idx], &nq) {
                histogram[bin_unit(alpha)] += 1.0;
                histogram[ANGLE_BINS + bin_unit(phi)] += 1.0;
                histogram[2 * ANGLE_BINS + bin_angle(theta)] += 1.0;
            }
        }

        let sum: f32 = histogram.iter().sum();
        if sum > 0.0 {
            let scale = 100.0 / sum;
            for h in &mut histogram {
                *h *= scale;
            }
        }
        FpfhFeature { histogram }
    }
}

/// The (alpha, phi, theta) angle triple of a surfel pair in the Darboux
/// frame of `p`. `None` for coincident points or a degenerate frame.
fn pair_feature(
    p: &Point3<f32>,
    np: &Vector3<f32>,
    q: &Point3<f32>,
    nq: &Vector3<f32>,
) -> Option<(f32, f32, f32)> {
    let d = q - p;
    let dist = d.norm();
    if dist < 1e-6 {
        return None;
    }
    let d_hat = d / dist;

    let u = *np;
    let v = d_hat.cross(&u);
    let v_norm = v.norm();
    if v_norm < 1e-6 {
        return None;
    }
    let v = v / v_norm;
    let w = u.cross(&v);

    let alpha = v.dot(nq);
    let phi = u.dot(&d_hat);
    let theta = w.dot(nq).atan2(u.dot(nq));
    Some((alpha, phi, theta))
}

/// Bin a value from [-1, 1] into one of 11 bins.
fn bin_unit(value: f32) -> usize {
    (((value + 1.0) * 0.5) * ANGLE_BINS as f32).clamp(0.0, (ANGLE_BINS - 1) as f32) as usize
}

/// Bin an angle from [-pi, pi] into one of 11 bins.
fn bin_angle(value: f32) -> usize {
    (((value + PI) / (2.0 * PI)) * ANGLE_BINS as f32).clamp(0.0, (ANGLE_BINS - 1) as f32) as usize
}
