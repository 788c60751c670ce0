//! Spatial index helpers over 3D points.
//!
//! The index stores the original point position so radius queries can hand
//! back indices into the input slice. Query results are sorted by index:
//! neighborhood accumulation must not depend on tree traversal order.

use nalgebra::Point3;
use rstar::{PointDistance, RTree, RTreeObject, AABB};

/// A point tagged with its index in the source slice.
pub struct IndexedPoint(pub usize, pub Point3<f32>);

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f32; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.1.x, self.1.y, self.1.z])
    }
}

impl PointDistance for IndexedPoint {
    fn distance_2(&self, point: &[f32; 3]) -> f32 {
        let dx = self.1.x - point[0];
        let dy = self.1.y - point[1];
        let dz = self.1.z - point[2];
        dx * dx + dy * dy + dz * dz
    }
}

/// Bulk-load an r-tree over the given points.
pub fn build_rtree(points: &[Point3<f32>]) -> RTree<IndexedPoint> {
    let wrappers: Vec<IndexedPoint> = points
        .iter()
        .enumerate()
        .map(|(i, p)| IndexedPoint(i, *p))
        .collect();
    RTree::bulk_load(wrappers)
}

/// Indices of all points within `radius` of `center`, sorted ascending.
/// The query point itself is included when it is part of the tree.
pub fn radius_indices(tree: &RTree<IndexedPoint>, center: &Point3<f32>, radius: f32) -> Vec<usize> {
    let mut indices: Vec<usize> = tree
        .locate_within_distance([center.x, center.y, center.z], radius * radius)
        .map(|w| w.0)
        .collect();
    indices.sort_unstable();
    indices
}
