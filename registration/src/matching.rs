//! Descriptor-space correspondence search.
//!
//! Both matchers index the larger keypoint set and query from the smaller
//! one, restoring (source, target) orientation before returning. The
//! canonical path is `match_correspondences`: parallel mutual-NN with an
//! optional ratio test, followed by the random-tuple length-consistency
//! filter. `match_correspondences_legacy` reproduces the older
//! cross-check matcher and is kept for compatibility only.

use cm_point_cloud::fpfh::{FpfhFeature, FPFH_BINS};
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Point3;
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;

/// Lowe-style ratio bound applied when the ratio test is enabled.
const RATIO_TEST_THRESHOLD: f32 = 0.9;

/// Tuple-test sampling: trials per surviving correspondence.
const TUPLE_TRIALS_PER_CORR: usize = 100;

#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub use_ratio_test: bool,
    /// Length-ratio bound of the tuple test; 0.0 disables it.
    pub tuple_scale: f32,
    pub num_max_corr: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            use_ratio_test: false,
            tuple_scale: 0.95,
            num_max_corr: 5000,
        }
    }
}

fn build_descriptor_tree(descriptors: &[FpfhFeature]) -> KdTree<f32, FPFH_BINS> {
    let mut tree: KdTree<f32, FPFH_BINS> = KdTree::new();
    for (i, d) in descriptors.iter().enumerate() {
        tree.add(&d.histogram, i as u64);
    }
    tree
}

/// Establish (source, target) keypoint correspondences.
///
/// Mutual nearest neighbors in descriptor space, queried from the smaller
/// side; the result is sorted by `(i, j)` and duplicate-free regardless of
/// worker count. The tuple filter draws triples from `rng`, so a fixed
/// seed reproduces the exact output list.
pub fn match_correspondences(
    src_keypoints: &[Point3<f32>],
    tgt_keypoints: &[Point3<f32>],
    src_descriptors: &[FpfhFeature],
    tgt_descriptors: &[FpfhFeature],
    opts: &MatchOptions,
    rng: &mut StdRng,
) -> Vec<(usize, usize)> {
    debug_assert_eq!(src_keypoints.len(), src_descriptors.len());
    debug_assert_eq!(tgt_keypoints.len(), tgt_descriptors.len());
    if src_descriptors.is_empty() || tgt_descriptors.is_empty() {
        return Vec::new();
    }

    // Index the larger side, query from the smaller one.
    let swapped = tgt_keypoints.len() > src_keypoints.len();
    let (big_kp, big_desc, small_kp, small_desc) = if swapped {
        (tgt_keypoints, tgt_descriptors, src_keypoints, src_descriptors)
    } else {
        (src_keypoints, src_descriptors, tgt_keypoints, tgt_descriptors)
    };

    let big_tree = build_descriptor_tree(big_desc);
    let small_tree = build_descriptor_tree(small_desc);

    // Internal pairs are (big index, small index).
    let mut corres: Vec<(usize, usize)> = (0..small_desc.len())
        .into_par_iter()
        .filter_map(|j| {
            let query = &small_desc[j].histogram;
            let i = if opts.use_ratio_test {
                let nn = big_tree.nearest_n::<SquaredEuclidean>(query, 2);
                let first = nn.first()?;
                if let Some(second) = nn.get(1) {
                    let d1 = first.distance.sqrt();
                    let d2 = second.distance.sqrt();
                    if d2 > 0.0 && d1 / d2 >= RATIO_TEST_THRESHOLD {
                        return None;
                    }
                }
                first.item as usize
            } else {
                big_tree.nearest_one::<SquaredEuclidean>(query).item as usize
            };

            // Mutual check.
            let back = small_tree
                .nearest_one::<SquaredEuclidean>(&big_desc[i].histogram)
                .item as usize;
            (back == j).then_some((i, j))
        })
        .collect();
    corres.sort_unstable();
    corres.dedup();

    if opts.tuple_scale > 0.0 && opts.tuple_scale < 1.0 && corres.len() >= 3 {
        corres = tuple_filter(&corres, big_kp, small_kp, opts, rng);
    }

    let mut out: Vec<(usize, usize)> = if swapped {
        corres.into_iter().map(|(i, j)| (j, i)).collect()
    } else {
        corres
    };
    out.sort_unstable();
    out.dedup();
    out.truncate(opts.num_max_corr);
    out
}

/// Random-triple length-consistency filter.
///
/// Samples up to `100 * |corr|` triples and keeps each correspondence that
/// appears in at least one triple whose three pairwise lengths agree
/// between the clouds within the `tuple_scale` ratio. The first pair is
/// tested before the third member is drawn, which skips most doomed
/// triples early.
fn tuple_filter(
    corres: &[(usize, usize)],
    big_kp: &[Point3<f32>],
    small_kp: &[Point3<f32>],
    opts: &MatchOptions,
    rng: &mut StdRng,
) -> Vec<(usize, usize)> {
    let scale = opts.tuple_scale;
    let ncorr = corres.len();
    let trials = ncorr.saturating_mul(TUPLE_TRIALS_PER_CORR);

    let length_ok = |li: f32, lj: f32| -> bool { li * scale <= lj && lj <= li / scale };

    let mut included = vec![false; ncorr];
    let mut kept: Vec<(usize, usize)> = Vec::new();

    for _ in 0..trials {
        let r0 = rng.random_range(0..ncorr);
        let r1 = rng.random_range(0..ncorr);
        // A repeated member degenerates the length test to 0 <= 0.
        if r1 == r0 {
            continue;
        }
        let (i0, j0) = corres[r0];
        let (i1, j1) = corres[r1];

        let li0 = (big_kp[i0] - big_kp[i1]).norm();
        let lj0 = (small_kp[j0] - small_kp[j1]).norm();
        if !length_ok(li0, lj0) {
            continue;
        }

        let r2 = rng.random_range(0..ncorr);
        if r2 == r0 || r2 == r1 {
            continue;
        }
        let (i2, j2) = corres[r2];

        let li1 = (big_kp[i1] - big_kp[i2]).norm();
        let lj1 = (small_kp[j1] - small_kp[j2]).norm();
        let li2 = (big_kp[i2] - big_kp[i0]).norm();
        let lj2 = (small_kp[j2] - small_kp[j0]).norm();

        if length_ok(li1, lj1) && length_ok(li2, lj2) {
            for (r, pair) in [(r0, (i0, j0)), (r1, (i1, j1)), (r2, (i2, j2))] {
                if !included[r] {
                    included[r] = true;
                    kept.push(pair);
                }
            }
        }
        if kept.len() > opts.num_max_corr {
            break;
        }
    }
    kept
}

/// The older matching path: one-directional NN accumulation in both
/// directions, optional cross-check intersection and the full tuple test.
/// Sequential; superseded by `match_correspondences`.
pub fn match_correspondences_legacy(
    src_keypoints: &[Point3<f32>],
    tgt_keypoints: &[Point3<f32>],
    src_descriptors: &[FpfhFeature],
    tgt_descriptors: &[FpfhFeature],
    use_cross_check: bool,
    use_tuple_test: bool,
    opts: &MatchOptions,
    rng: &mut StdRng,
) -> Vec<(usize, usize)> {
    if src_descriptors.is_empty() || tgt_descriptors.is_empty() {
        return Vec::new();
    }

    let swapped = tgt_keypoints.len() > src_keypoints.len();
    let (big_kp, big_desc, small_kp, small_desc) = if swapped {
        (tgt_keypoints, tgt_descriptors, src_keypoints, src_descriptors)
    } else {
        (src_keypoints, src_descriptors, tgt_keypoints, tgt_descriptors)
    };

    let big_tree = build_descriptor_tree(big_desc);
    let small_tree = build_descriptor_tree(small_desc);

    // Forward pass: every small-side keypoint votes for its nearest
    // big-side keypoint; the reverse lookup is cached per big index.
    let mut big_to_small: Vec<Option<usize>> = vec![None; big_desc.len()];
    let mut corres_ji: Vec<(usize, usize)> = Vec::with_capacity(small_desc.len());
    for j in 0..small_desc.len() {
        let i = big_tree
            .nearest_one::<SquaredEuclidean>(&small_desc[j].histogram)
            .item as usize;
        if big_to_small[i].is_none() {
            let back = small_tree
                .nearest_one::<SquaredEuclidean>(&big_desc[i].histogram)
                .item as usize;
            big_to_small[i] = Some(back);
        }
        corres_ji.push((i, j));
    }
    let corres_ij: Vec<(usize, usize)> = big_to_small
        .iter()
        .enumerate()
        .filter_map(|(i, j)| j.map(|j| (i, j)))
        .collect();

    let mut corres: Vec<(usize, usize)>;
    if use_cross_check {
        // Keep pairs present in both directions.
        let mut small_votes: Vec<Vec<usize>> = vec![Vec::new(); small_desc.len()];
        for &(i, j) in &corres_ji {
            small_votes[j].push(i);
        }
        corres = corres_ij
            .iter()
            .copied()
            .filter(|&(i, j)| small_votes[j].contains(&i))
            .collect();
    } else {
        corres = corres_ij;
        corres.extend_from_slice(&corres_ji);
    }

    if use_tuple_test && opts.tuple_scale > 0.0 && opts.tuple_scale < 1.0 && corres.len() >= 3 {
        let scale = opts.tuple_scale;
        let ncorr = corres.len();
        let length_ok = |li: f32, lj: f32| -> bool { li * scale <= lj && lj <= li / scale };
        let mut accepted: Vec<(usize, usize)> = Vec::new();
        for _ in 0..ncorr.saturating_mul(TUPLE_TRIALS_PER_CORR) {
            let r = [
                rng.random_range(0..ncorr),
                rng.random_range(0..ncorr),
                rng.random_range(0..ncorr),
            ];
            if r[0] == r[1] || r[1] == r[2] || r[0] == r[2] {
                continue;
            }
            let picks = [corres[r[0]], corres[r[1]], corres[r[2]]];
            let ok = (0..3).all(|k| {
                let (ia, ja) = picks[k];
                let (ib, jb) = picks[(k + 1) % 3];
                length_ok(
                    (big_kp[ia] - big_kp[ib]).norm(),
                    (small_kp[ja] - small_kp[jb]).norm(),
                )
            });
            if ok {
                accepted.extend_from_slice(&picks);
            }
        }
        corres = accepted;
    }

    let mut out: Vec<(usize, usize)> = if swapped {
        corres.into_iter().map(|(i, j)| (j, i)).collect()
    } else {
        corres
    };
    out.sort_unstable();
    out.dedup();
    out.truncate(opts.num_max_corr);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    /// Distinct descriptors: a single dominant bin per index.
    fn synthetic_descriptors(n: usize) -> Vec<FpfhFeature> {
        (0..n)
            .map(|i| {
                let mut histogram = [0.0f32; FPFH_BINS];
                histogram[i % FPFH_BINS] = 80.0;
                histogram[(i * 7 + 1) % FPFH_BINS] += 20.0;
                FpfhFeature { histogram }
            })
            .collect()
    }

    fn grid_keypoints(n: usize) -> Vec<Point3<f32>> {
        (0..n)
            .map(|i| Point3::new(i as f32 * 1.7, (i as f32 * 0.9).sin(), 0.0))
            .collect()
    }

    #[test]
    fn test_identical_clouds_match_identity() {
        let keypoints = grid_keypoints(20);
        let descriptors = synthetic_descriptors(20);
        let mut rng = StdRng::seed_from_u64(7);
        let corr = match_correspondences(
            &keypoints,
            &keypoints,
            &descriptors,
            &descriptors,
            &MatchOptions {
                tuple_scale: 0.0,
                ..MatchOptions::default()
            },
            &mut rng,
        );
        // Descriptors repeat every FPFH_BINS indices, but with n = 20 they
        // are unique, so every keypoint matches itself.
        assert_eq!(corr.len(), 20);
        for (k, &(i, j)) in corr.iter().enumerate() {
            assert_eq!(i, k);
            assert_eq!(j, k);
        }
    }

    #[test]
    fn test_indices_in_caller_frame_after_swap() {
        // Target larger than source: internal swap must be undone.
        let src_kp = grid_keypoints(10);
        let tgt_kp = grid_keypoints(20);
        let src_desc = synthetic_descriptors(10);
        let tgt_desc = synthetic_descriptors(20);
        let mut rng = StdRng::seed_from_u64(7);
        let corr = match_correspondences(
            &src_kp,
            &tgt_kp,
            &src_desc,
            &tgt_desc,
            &MatchOptions {
                tuple_scale: 0.0,
                ..MatchOptions::default()
            },
            &mut rng,
        );
        assert!(!corr.is_empty());
        for &(i, j) in &corr {
            assert!(i < src_kp.len());
            assert!(j < tgt_kp.len());
        }
    }

    #[test]
    fn test_no_duplicates_and_sorted() {
        let keypoints = grid_keypoints(30);
        let descriptors = synthetic_descriptors(30);
        let mut rng = StdRng::seed_from_u64(3);
        let corr = match_correspondences(
            &keypoints,
            &keypoints,
            &descriptors,
            &descriptors,
            &MatchOptions::default(),
            &mut rng,
        );
        let mut sorted = corr.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(corr, sorted);
    }

    #[test]
    fn test_tuple_filter_removes_geometric_outliers() {
        // Self-matches on a rigid cloud plus one cross-match that breaks
        // pairwise lengths.
        let keypoints = grid_keypoints(12);
        let corres: Vec<(usize, usize)> = (0..12).map(|k| (k, k)).chain([(0usize, 11usize)]).collect();
        let opts = MatchOptions::default();
        let mut rng = StdRng::seed_from_u64(1);
        let kept = tuple_filter(&corres, &keypoints, &keypoints, &opts, &mut rng);
        assert!(kept.contains(&(3, 3)));
        assert!(!kept.contains(&(0, 11)));
    }

    #[test]
    fn test_same_seed_same_output() {
        let keypoints = grid_keypoints(25);
        let descriptors = synthetic_descriptors(25);
        let opts = MatchOptions::default();
        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let a = match_correspondences(
            &keypoints, &keypoints, &descriptors, &descriptors, &opts, &mut rng_a,
        );
        let b = match_correspondences(
            &keypoints, &keypoints, &descriptors, &descriptors, &opts, &mut rng_b,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_sides() {
        let mut rng = StdRng::seed_from_u64(0);
        let corr = match_correspondences(
            &[],
            &grid_keypoints(5),
            &[],
            &synthetic_descriptors(5),
            &MatchOptions::default(),
            &mut rng,
        );
        assert!(corr.is_empty());
    }

    #[test]
    fn test_legacy_cross_check_agrees_on_identical_clouds() {
        let keypoints = grid_keypoints(15);
        let descriptors = synthetic_descriptors(15);
        let mut rng = StdRng::seed_from_u64(9);
        let corr = match_correspondences_legacy(
            &keypoints,
            &keypoints,
            &descriptors,
            &descriptors,
            true,
            false,
            &MatchOptions {
                tuple_scale: 0.0,
                ..MatchOptions::default()
            },
            &mut rng,
        );
        for &(i, j) in &corr {
            assert_eq!(i, j);
        }
        assert_eq!(corr.len(), 15);
    }
}
