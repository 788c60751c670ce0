//! Graph-theoretic correspondence pruning.
//!
//! Correspondences become vertices of a compatibility graph with an edge
//! wherever two correspondences preserve pairwise length within twice the
//! noise bound. A set of true inliers forms a clique under that test, so
//! the maximum k-core (cheap) or the exact maximum clique (small graphs)
//! isolates them from the mutually inconsistent outliers.

use cm_core::RobinMode;
use nalgebra::Point3;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Exact max-clique search is only attempted up to this vertex count;
/// larger graphs fall back to the max k-core.
pub const MAX_CLIQUE_VERTEX_LIMIT: usize = 1000;

/// Prune a correspondence list down to its mutually consistent core.
///
/// The returned list preserves the input order of the survivors.
pub fn prune(
    corr: &[(usize, usize)],
    src_keypoints: &[Point3<f32>],
    tgt_keypoints: &[Point3<f32>],
    noise_bound: f32,
    mode: RobinMode,
) -> Vec<(usize, usize)> {
    if mode == RobinMode::None || corr.len() < 2 {
        return corr.to_vec();
    }

    let adjacency = build_compatibility_graph(corr, src_keypoints, tgt_keypoints, noise_bound);
    let keep = match mode {
        RobinMode::None => unreachable!(),
        RobinMode::MaxKCore => max_kcore(&adjacency),
        RobinMode::MaxClique => {
            if corr.len() <= MAX_CLIQUE_VERTEX_LIMIT {
                max_clique(&adjacency)
            } else {
                max_kcore(&adjacency)
            }
        }
    };
    keep.iter().map(|&v| corr[v]).collect()
}

/// Undirected compatibility graph as per-vertex adjacency lists.
///
/// Edge (a, b) requires length preservation within `2 * noise_bound` and
/// node-level one-to-one indices on both sides.
fn build_compatibility_graph(
    corr: &[(usize, usize)],
    src_keypoints: &[Point3<f32>],
    tgt_keypoints: &[Point3<f32>],
    noise_bound: f32,
) -> Vec<Vec<u32>> {
    let n = corr.len();
    let threshold = 2.0 * noise_bound;

    (0..n)
        .into_par_iter()
        .map(|a| {
            let (ai, aj) = corr[a];
            let mut neighbors = Vec::new();
            for (b, &(bi, bj)) in corr.iter().enumerate() {
                if b == a || ai == bi || aj == bj {
                    continue;
                }
                let ls = (src_keypoints[ai] - src_keypoints[bi]).norm();
                let lt = (tgt_keypoints[aj] - tgt_keypoints[bj]).norm();
                if (ls - lt).abs() <= threshold {
                    neighbors.push(b as u32);
                }
            }
            neighbors
        })
        .collect()
}

/// Vertices of the non-empty k-core with maximal k, ascending.
///
/// Min-degree peeling with lazy heap entries; each vertex's core number is
/// fixed when it is removed.
fn max_kcore(adjacency: &[Vec<u32>]) -> Vec<usize> {
    let n = adjacency.len();
    let mut degree: Vec<usize> = adjacency.iter().map(|a| a.len()).collect();
    let mut heap: BinaryHeap<Reverse<(usize, usize)>> =
        (0..n).map(|v| Reverse((degree[v], v))).collect();
    let mut removed = vec![false; n];
    let mut core = vec![0usize; n];
    let mut k = 0usize;

    while let Some(Reverse((d, v))) = heap.pop() {
        if removed[v] || d != degree[v] {
            continue;
        }
        removed[v] = true;
        k = k.max(degree[v]);
        core[v] = k;
        for &u in &adjacency[v] {
            let u = u as usize;
            if !removed[u] && degree[u] > 0 {
                degree[u] -= 1;
                heap.push(Reverse((degree[u], u)));
            }
        }
    }

    let k_max = core.iter().copied().max().unwrap_or(0);
    (0..n).filter(|&v| core[v] >= k_max).collect()
}

/// Exact maximum clique, branch-and-bound with a greedy coloring bound.
/// Returns the clique's vertices in ascending order.
fn max_clique(adjacency: &[Vec<u32>]) -> Vec<usize> {
    let n = adjacency.len();
    let words = n.div_ceil(64);
    let mut bits = vec![vec![0u64; words]; n];
    for (v, neighbors) in adjacency.iter().enumerate() {
        for &u in neighbors {
            bits[v][u as usize / 64] |= 1 << (u as usize % 64);
        }
    }

    // High-degree vertices first shrinks the search tree.
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&v| Reverse(adjacency[v].len()));

    let mut best: Vec<usize> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    expand(&bits, order, &mut current, &mut best);
    best.sort_unstable();
    best
}

fn adjacent(bits: &[Vec<u64>], v: usize, u: usize) -> bool {
    bits[v][u / 64] & (1 << (u % 64)) != 0
}

/// Greedy coloring of `candidates` in the given order. Returns the
/// vertices grouped by color class with their 1-based color number, which
/// upper-bounds the clique size reachable through that vertex.
fn color_sort(bits: &[Vec<u64>], candidates: &[usize]) -> Vec<(usize, usize)> {
    let mut classes: Vec<Vec<usize>> = Vec::new();
    for &v in candidates {
        let mut placed = false;
        for class in classes.iter_mut() {
            if class.iter().all(|&u| !adjacent(bits, v, u)) {
                class.push(v);
                placed = true;
                break;
            }
        }
        if !placed {
            classes.push(vec![v]);
        }
    }

    let mut out = Vec::with_capacity(candidates.len());
    for (color, class) in classes.iter().enumerate() {
        for &v in class {
            out.push((v, color + 1));
        }
    }
    out
}

fn expand(bits: &[Vec<u64>], candidates: Vec<usize>, current: &mut Vec<usize>, best: &mut Vec<usize>) {
    let colored = color_sort(bits, &candidates);
    let ordered: Vec<usize> = colored.iter().map(|&(v, _)| v).collect();

    for (idx, &(v, color)) in colored.iter().enumerate().rev() {
        if current.len() + color <= best.len() {
            return;
        }
        current.push(v);
        let next: Vec<usize> = ordered[..idx]
            .iter()
            .copied()
            .filter(|&u| adjacent(bits, v, u))
            .collect();
        if next.is_empty() {
            if current.len() > best.len() {
                *best = current.clone();
            }
        } else {
            expand(bits, next, current, best);
        }
        current.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rigid-consistent self-matches plus shuffled outlier pairs.
    fn mixed_correspondences() -> (Vec<(usize, usize)>, Vec<Point3<f32>>, Vec<Point3<f32>>) {
        let points: Vec<Point3<f32>> = (0..10)
            .map(|k| {
                let f = k as f32;
                Point3::new(f * 2.0, (f * 1.3).sin() * 3.0, (f * 0.7).cos() * 2.0)
            })
            .collect();

        let mut corr: Vec<(usize, usize)> = (0..6).map(|k| (k, k)).collect();
        // Inconsistent pairings between distant points.
        corr.push((6, 9));
        corr.push((7, 6));
        corr.push((9, 7));
        (corr, points.clone(), points)
    }

    #[test]
    fn test_kcore_keeps_consistent_set() {
        let (corr, src, tgt) = mixed_correspondences();
        let pruned = prune(&corr, &src, &tgt, 0.05, RobinMode::MaxKCore);
        assert_eq!(pruned, (0..6).map(|k| (k, k)).collect::<Vec<_>>());
    }

    #[test]
    fn test_max_clique_keeps_consistent_set() {
        let (corr, src, tgt) = mixed_correspondences();
        let pruned = prune(&corr, &src, &tgt, 0.05, RobinMode::MaxClique);
        assert_eq!(pruned, (0..6).map(|k| (k, k)).collect::<Vec<_>>());
    }

    #[test]
    fn test_mode_none_passthrough() {
        let (corr, src, tgt) = mixed_correspondences();
        let pruned = prune(&corr, &src, &tgt, 0.05, RobinMode::None);
        assert_eq!(pruned, corr);
    }

    #[test]
    fn test_one_to_one_constraint_blocks_edges() {
        // Two correspondences reusing the same source index never connect,
        // even with identical geometry.
        let src = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let tgt = src.clone();
        let corr = vec![(0, 0), (0, 1)];
        let adjacency = build_compatibility_graph(&corr, &src, &tgt, 10.0);
        assert!(adjacency[0].is_empty());
        assert!(adjacency[1].is_empty());
    }

    #[test]
    fn test_edge_threshold_is_two_epsilon() {
        let src = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)];
        let tgt = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.19, 0.0, 0.0)];
        let corr = vec![(0, 0), (1, 1)];
        // |1.0 - 1.19| = 0.19 <= 2 * 0.1
        let adjacency = build_compatibility_graph(&corr, &src, &tgt, 0.1);
        assert_eq!(adjacency[0], vec![1]);

        let tgt_far = vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.21, 0.0, 0.0)];
        let adjacency = build_compatibility_graph(&corr, &src, &tgt_far, 0.1);
        assert!(adjacency[0].is_empty());
    }

    #[test]
    fn test_max_clique_on_known_graph() {
        // Triangle 0-1-2 plus pendant edge 2-3: maximum clique is {0,1,2}.
        let adjacency: Vec<Vec<u32>> = vec![vec![1, 2], vec![0, 2], vec![0, 1, 3], vec![2]];
        assert_eq!(max_clique(&adjacency), vec![0, 1, 2]);
    }

    #[test]
    fn test_max_kcore_on_known_graph() {
        // 4-clique {0,1,2,3} with a tail 3-4-5: the 3-core is the clique.
        let adjacency: Vec<Vec<u32>> = vec![
            vec![1, 2, 3],
            vec![0, 2, 3],
            vec![0, 1, 3],
            vec![0, 1, 2, 4],
            vec![3, 5],
            vec![4],
        ];
        assert_eq!(max_kcore(&adjacency), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_max_clique_falls_back_on_large_graphs() {
        // 1100 consistent self-matches plus 100 inconsistent pairings,
        // above the exact-search limit: MaxClique must take the k-core
        // path and agree with MaxKCore exactly.
        let n = 1200;
        let points: Vec<Point3<f32>> = (0..n)
            .map(|k| {
                let f = k as f32;
                Point3::new(
                    (f * 0.731).sin() * 40.0,
                    (f * 0.521).cos() * 30.0,
                    (f * 0.313).sin() * 20.0,
                )
            })
            .collect();

        let mut corr: Vec<(usize, usize)> = (0..1100).map(|k| (k, k)).collect();
        for i in 0..100 {
            corr.push((1100 + i, n - 1 - i));
        }
        assert!(corr.len() > MAX_CLIQUE_VERTEX_LIMIT);

        let via_clique = prune(&corr, &points, &points, 0.05, RobinMode::MaxClique);
        let via_kcore = prune(&corr, &points, &points, 0.05, RobinMode::MaxKCore);
        assert_eq!(via_clique, via_kcore);
        assert_eq!(via_clique, (0..1100).map(|k| (k, k)).collect::<Vec<_>>());
    }

    #[test]
    fn test_short_lists_pass_through() {
        let src = vec![Point3::new(0.0, 0.0, 0.0)];
        let corr = vec![(0, 0)];
        assert_eq!(prune(&corr, &src, &src, 0.1, RobinMode::MaxKCore), corr);
        assert!(prune(&[], &src, &src, 0.1, RobinMode::MaxClique).is_empty());
    }
}
