//! Voxel-grid downsampling.

use nalgebra::{Point3, Vector3};
use std::collections::HashMap;

/// Downsample a point cloud with a voxel grid, one centroid per occupied
/// voxel.
///
/// The output is sorted by voxel key so the result does not depend on hash
/// iteration order; downstream stages rely on a deterministic point order.
/// A non-positive `voxel_size` returns the input unchanged.
pub fn voxel_down_sample(points: &[Point3<f32>], voxel_size: f32) -> Vec<Point3<f32>> {
    if voxel_size <= 0.0 {
        return points.to_vec();
    }

    let mut grid: HashMap<(i32, i32, i32), (Vector3<f32>, usize)> = HashMap::new();
    for p in points {
        let key = (
            (p.x / voxel_size).floor() as i32,
            (p.y / voxel_size).floor() as i32,
            (p.z / voxel_size).floor() as i32,
        );
        let entry = grid.entry(key).or_insert((Vector3::zeros(), 0));
        entry.0 += p.coords;
        entry.1 += 1;
    }

    let mut cells: Vec<((i32, i32, i32), (Vector3<f32>, usize))> = grid.into_iter().collect();
    cells.sort_unstable_by_key(|(key, _)| *key);

    cells
        .into_iter()
        .map(|(_, (sum, count))| Point3::from(sum / count as f32))
        .collect()
}
