//! Pipeline facade.
//!
//! `CloudMatcher` owns every intermediate buffer of the pipeline:
//! keypoints, descriptors, correspondence lists and the matched coordinate
//! pairs. Buffers are cleared at the start of each `match_clouds` call and
//! stay readable through the accessors until the next call. One instance
//! must not be shared across concurrent calls; independent instances may
//! run in parallel.

use crate::matching::{match_correspondences, MatchOptions};
use crate::robin::prune;
use crate::solver::{RobustRegistrationSolver, RotationEstimation, SolverParams};
use cm_core::{MatcherConfig, RegistrationSolution, Result};
use cm_point_cloud::filtering::voxel_down_sample;
use cm_point_cloud::fpfh::{FpfhEstimator, FpfhFeature};
use nalgebra::{Matrix3xX, Point3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

/// Wall-clock seconds spent in each pipeline phase of the last call.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    /// Voxel downsampling.
    pub processing: f64,
    /// Keypoint and descriptor extraction.
    pub extraction: f64,
    /// Descriptor matching including the tuple test.
    pub matching: f64,
    /// Compatibility-graph pruning.
    pub rejection: f64,
    /// Robust SE(3) solving.
    pub solving: f64,
}

impl PhaseTimings {
    pub fn total(&self) -> f64 {
        self.processing + self.extraction + self.matching + self.rejection + self.solving
    }
}

/// Correspondence and inlier counts of the last pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchScore {
    pub initial_pairs: usize,
    pub pruned_pairs: usize,
    pub rot_inliers: usize,
    pub trans_inliers: usize,
}

/// Correspondence-based global registration pipeline.
pub struct CloudMatcher {
    config: MatcherConfig,
    extractor: FpfhEstimator,
    solver: RobustRegistrationSolver,

    src_keypoints: Vec<Point3<f32>>,
    tgt_keypoints: Vec<Point3<f32>>,
    src_descriptors: Vec<FpfhFeature>,
    tgt_descriptors: Vec<FpfhFeature>,
    initial_corr: Vec<(usize, usize)>,
    pruned_corr: Vec<(usize, usize)>,
    src_matched: Vec<Point3<f32>>,
    tgt_matched: Vec<Point3<f32>>,

    timings: PhaseTimings,
}

impl CloudMatcher {
    /// Build a pipeline from a validated configuration.
    ///
    /// This is the only place a configuration error surfaces; every later
    /// failure is reported through an invalid solution instead.
    pub fn new(config: MatcherConfig) -> Result<Self> {
        config.validate()?;
        let extractor = FpfhEstimator::new(
            config.normal_radius,
            config.fpfh_radius,
            config.thr_linearity,
        );
        let solver = RobustRegistrationSolver::new(solver_params(&config));
        Ok(Self {
            config,
            extractor,
            solver,
            src_keypoints: Vec::new(),
            tgt_keypoints: Vec::new(),
            src_descriptors: Vec::new(),
            tgt_descriptors: Vec::new(),
            initial_corr: Vec::new(),
            pruned_corr: Vec::new(),
            src_matched: Vec::new(),
            tgt_matched: Vec::new(),
            timings: PhaseTimings::default(),
        })
    }

    /// Pipeline with every parameter derived from the voxel size.
    pub fn from_voxel_size(voxel_size: f32) -> Result<Self> {
        Self::new(MatcherConfig::new(voxel_size))
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    fn clear(&mut self) {
        self.src_keypoints.clear();
        self.tgt_keypoints.clear();
        self.src_descriptors.clear();
        self.tgt_descriptors.clear();
        self.initial_corr.clear();
        self.pruned_corr.clear();
        self.src_matched.clear();
        self.tgt_matched.clear();
        self.timings = PhaseTimings::default();
    }

    /// Rebuild the solver from the current configuration, dropping any
    /// previous solution.
    pub fn reset_solver(&mut self) {
        self.solver = RobustRegistrationSolver::new(solver_params(&self.config));
    }

    /// Run extraction, matching and pruning, returning the matched
    /// source/target coordinate pairs.
    ///
    /// The returned slices are views into buffers owned by the matcher and
    /// stay valid until the next `match_clouds` call.
    pub fn match_clouds(
        &mut self,
        src: &[Point3<f32>],
        tgt: &[Point3<f32>],
    ) -> (&[Point3<f32>], &[Point3<f32>]) {
        self.clear();

        let t_start = Instant::now();
        let (src_input, tgt_input) = if self.config.use_voxel_sampling {
            (
                voxel_down_sample(src, self.config.voxel_size),
                voxel_down_sample(tgt, self.config.voxel_size),
            )
        } else {
            (src.to_vec(), tgt.to_vec())
        };
        self.timings.processing = t_start.elapsed().as_secs_f64();

        let t_extract = Instant::now();
        let (src_keypoints, src_descriptors) = self.extractor.compute(&src_input);
        let (tgt_keypoints, tgt_descriptors) = self.extractor.compute(&tgt_input);
        self.src_keypoints = src_keypoints;
        self.src_descriptors = src_descriptors;
        self.tgt_keypoints = tgt_keypoints;
        self.tgt_descriptors = tgt_descriptors;
        self.timings.extraction = t_extract.elapsed().as_secs_f64();
        log::debug!(
            "extracted {} / {} keypoints",
            self.src_keypoints.len(),
            self.tgt_keypoints.len()
        );

        if self.src_keypoints.is_empty() || self.tgt_keypoints.is_empty() {
            log::warn!("keypoint extraction left one side empty, no correspondences");
            return (&self.src_matched, &self.tgt_matched);
        }

        let t_match = Instant::now();
        let opts = MatchOptions {
            use_ratio_test: self.config.use_ratio_test,
            tuple_scale: self.config.tuple_scale,
            num_max_corr: self.config.num_max_corr,
        };
        let mut rng = StdRng::seed_from_u64(self.config.tuple_seed);
        self.initial_corr = match_correspondences(
            &self.src_keypoints,
            &self.tgt_keypoints,
            &self.src_descriptors,
            &self.tgt_descriptors,
            &opts,
            &mut rng,
        );
        self.timings.matching = t_match.elapsed().as_secs_f64();

        let t_reject = Instant::now();
        self.pruned_corr = prune(
            &self.initial_corr,
            &self.src_keypoints,
            &self.tgt_keypoints,
            self.config.robin_noise_bound,
            self.config.robin_mode,
        );
        self.timings.rejection = t_reject.elapsed().as_secs_f64();
        log::debug!(
            "correspondences: {} initial, {} after pruning",
            self.initial_corr.len(),
            self.pruned_corr.len()
        );

        self.src_matched.reserve(self.pruned_corr.len());
        self.tgt_matched.reserve(self.pruned_corr.len());
        for &(i, j) in &self.pruned_corr {
            self.src_matched.push(self.src_keypoints[i]);
            self.tgt_matched.push(self.tgt_keypoints[j]);
        }
        (&self.src_matched, &self.tgt_matched)
    }

    /// Full registration: `match_clouds` followed by the robust solver.
    ///
    /// Matched pairs are promoted to f64 before solving; the extraction
    /// and matching stages stay in f32.
    pub fn estimate(&mut self, src: &[Point3<f32>], tgt: &[Point3<f32>]) -> RegistrationSolution {
        self.reset_solver();
        self.match_clouds(src, tgt);

        let m = self.src_matched.len();
        if m < 2 {
            log::warn!("only {} matched pairs, returning invalid solution", m);
            return self.solver.solution().clone();
        }

        let t_solve = Instant::now();
        let src_mat = promote(&self.src_matched);
        let tgt_mat = promote(&self.tgt_matched);
        self.solver.solve(&src_mat, &tgt_mat);
        self.timings.solving = t_solve.elapsed().as_secs_f64();

        self.solver.solution().clone()
    }

    /// Keypoints that survived extraction, per side.
    pub fn keypoints(&self) -> (&[Point3<f32>], &[Point3<f32>]) {
        (&self.src_keypoints, &self.tgt_keypoints)
    }

    /// Matched coordinate pairs of the pre-pruning correspondence list.
    pub fn initial_matched_keypoints(&self) -> (Vec<Point3<f32>>, Vec<Point3<f32>>) {
        let src = self
            .initial_corr
            .iter()
            .map(|&(i, _)| self.src_keypoints[i])
            .collect();
        let tgt = self
            .initial_corr
            .iter()
            .map(|&(_, j)| self.tgt_keypoints[j])
            .collect();
        (src, tgt)
    }

    /// Pruned correspondence index pairs of the last call.
    pub fn correspondences(&self) -> &[(usize, usize)] {
        &self.pruned_corr
    }

    pub fn initial_correspondence_count(&self) -> usize {
        self.initial_corr.len()
    }

    pub fn pruned_correspondence_count(&self) -> usize {
        self.pruned_corr.len()
    }

    pub fn rotation_inlier_count(&self) -> usize {
        self.solver.rotation_inliers().len()
    }

    pub fn translation_inlier_count(&self) -> usize {
        self.solver.translation_inliers().len()
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    pub fn score(&self) -> MatchScore {
        MatchScore {
            initial_pairs: self.initial_corr.len(),
            pruned_pairs: self.pruned_corr.len(),
            rot_inliers: self.rotation_inlier_count(),
            trans_inliers: self.translation_inlier_count(),
        }
    }

    /// Log the phase timing and correspondence summary of the last run.
    pub fn log_summary(&self) {
        let t = &self.timings;
        log::info!("============== Time ==============");
        log::info!("Voxelization: {:.6} sec", t.processing);
        log::info!("Extraction  : {:.6} sec", t.extraction);
        log::info!("Matching    : {:.6} sec", t.matching);
        log::info!("Pruning     : {:.6} sec", t.rejection);
        log::info!("Solving     : {:.6} sec", t.solving);
        log::info!("Total       : {:.6} sec", t.total());
        log::info!("====== # of correspondences ======");
        log::info!("# initial pairs : {}", self.initial_correspondence_count());
        log::info!("# pruned pairs  : {}", self.pruned_correspondence_count());
        log::info!("# rot inliers   : {}", self.rotation_inlier_count());
        log::info!("# trans inliers : {}", self.translation_inlier_count());
    }
}

fn solver_params(config: &MatcherConfig) -> SolverParams {
    SolverParams {
        noise_bound: config.solver_noise_bound,
        rotation_estimation: if config.use_quatro {
            RotationEstimation::Quatro
        } else {
            RotationEstimation::GncTls
        },
        ..SolverParams::default()
    }
}

/// Promote matched f32 coordinates to a 3xM f64 matrix for the solver.
fn promote(points: &[Point3<f32>]) -> Matrix3xX<f64> {
    Matrix3xX::from_iterator(
        points.len(),
        points
            .iter()
            .flat_map(|p| [p.x as f64, p.y as f64, p.z as f64]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_core::Error;

    #[test]
    fn test_invalid_config_fails_construction() {
        match CloudMatcher::from_voxel_size(-0.1) {
            Err(Error::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_accessors_zeroed_before_first_call() {
        let matcher = CloudMatcher::from_voxel_size(0.1).unwrap();
        assert_eq!(matcher.score(), MatchScore::default());
        assert_eq!(matcher.initial_correspondence_count(), 0);
        assert_eq!(matcher.timings().total(), 0.0);
        let (src_kp, tgt_kp) = matcher.keypoints();
        assert!(src_kp.is_empty());
        assert!(tgt_kp.is_empty());
    }

    #[test]
    fn test_empty_inputs_give_invalid_solution() {
        let mut matcher = CloudMatcher::from_voxel_size(0.1).unwrap();
        let solution = matcher.estimate(&[], &[]);
        assert!(!solution.valid);
        assert_eq!(solution.rotation, nalgebra::Matrix3::identity());
        assert_eq!(solution.translation, nalgebra::Vector3::zeros());
        // The solver never ran.
        assert_eq!(matcher.timings().solving, 0.0);
    }

    #[test]
    fn test_promote_is_column_major_pairs() {
        let points = vec![Point3::new(1.0, 2.0, 3.0), Point3::new(4.0, 5.0, 6.0)];
        let mat = promote(&points);
        assert_eq!(mat.ncols(), 2);
        assert_eq!(mat[(0, 0)], 1.0);
        assert_eq!(mat[(2, 0)], 3.0);
        assert_eq!(mat[(1, 1)], 5.0);
    }
}
