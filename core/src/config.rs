use crate::{Error, Result};

/// Graph-pruning operator applied to the correspondence compatibility graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RobinMode {
    /// Keep the raw mutual-NN correspondences.
    None,
    /// Maximum k-core of the compatibility graph.
    #[default]
    MaxKCore,
    /// Exact maximum clique (falls back to max k-core on large graphs).
    MaxClique,
}

/// Full configuration of the matching/registration pipeline.
///
/// All radii and noise bounds default to multiples of `voxel_size`, which
/// is the one required parameter. Values can be overridden with the
/// builder-style setters; `validate` is called eagerly when the pipeline
/// is constructed and is the only place a configuration error can surface.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Downsample grid size in the cloud's length unit.
    pub voxel_size: f32,
    /// Apply voxel downsampling before keypoint extraction.
    pub use_voxel_sampling: bool,
    /// Neighborhood radius for normal estimation.
    pub normal_radius: f32,
    /// Neighborhood radius for descriptor accumulation.
    pub fpfh_radius: f32,
    /// Reject neighborhoods with linearity >= this value. 1.0 disables.
    pub thr_linearity: f32,
    /// Noise bound epsilon of the compatibility-graph edge test.
    pub robin_noise_bound: f32,
    /// Upper cap on correspondences kept after matching.
    pub num_max_corr: usize,
    /// Length-ratio bound of the tuple test; 0.0 disables the test.
    pub tuple_scale: f32,
    pub robin_mode: RobinMode,
    /// Lowe-style descriptor ratio filter during matching.
    pub use_ratio_test: bool,
    /// Use the yaw-only rotation estimator instead of full GNC-TLS.
    pub use_quatro: bool,
    /// Truncation bound of the robust solver.
    pub solver_noise_bound: f64,
    /// Seed of the tuple-test sampler. Same seed + same inputs gives an
    /// identical correspondence list.
    pub tuple_seed: u64,
}

impl MatcherConfig {
    pub fn new(voxel_size: f32) -> Self {
        Self {
            voxel_size,
            use_voxel_sampling: true,
            normal_radius: 2.0 * voxel_size,
            fpfh_radius: 5.0 * voxel_size,
            thr_linearity: 1.0,
            robin_noise_bound: 2.0 * voxel_size,
            num_max_corr: 5000,
            tuple_scale: 0.95,
            robin_mode: RobinMode::MaxKCore,
            use_ratio_test: false,
            use_quatro: false,
            solver_noise_bound: 2.0 * voxel_size as f64,
            tuple_seed: 0,
        }
    }

    pub fn with_voxel_sampling(mut self, enabled: bool) -> Self {
        self.use_voxel_sampling = enabled;
        self
    }

    pub fn with_normal_radius(mut self, radius: f32) -> Self {
        self.normal_radius = radius;
        self
    }

    pub fn with_fpfh_radius(mut self, radius: f32) -> Self {
        self.fpfh_radius = radius;
        self
    }

    pub fn with_linearity_threshold(mut self, thr: f32) -> Self {
        self.thr_linearity = thr;
        self
    }

    pub fn with_robin_noise_bound(mut self, bound: f32) -> Self {
        self.robin_noise_bound = bound;
        self
    }

    pub fn with_max_correspondences(mut self, cap: usize) -> Self {
        self.num_max_corr = cap;
        self
    }

    pub fn with_tuple_scale(mut self, scale: f32) -> Self {
        self.tuple_scale = scale;
        self
    }

    pub fn with_robin_mode(mut self, mode: RobinMode) -> Self {
        self.robin_mode = mode;
        self
    }

    pub fn with_ratio_test(mut self, enabled: bool) -> Self {
        self.use_ratio_test = enabled;
        self
    }

    pub fn with_quatro(mut self, enabled: bool) -> Self {
        self.use_quatro = enabled;
        self
    }

    pub fn with_solver_noise_bound(mut self, bound: f64) -> Self {
        self.solver_noise_bound = bound;
        self
    }

    pub fn with_tuple_seed(mut self, seed: u64) -> Self {
        self.tuple_seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        fn positive_f32(name: &str, value: f32) -> Result<()> {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be positive and finite, got {value}"
                )));
            }
            Ok(())
        }

        positive_f32("voxel_size", self.voxel_size)?;
        positive_f32("normal_radius", self.normal_radius)?;
        positive_f32("fpfh_radius", self.fpfh_radius)?;
        positive_f32("robin_noise_bound", self.robin_noise_bound)?;

        if !self.solver_noise_bound.is_finite() || self.solver_noise_bound <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "solver_noise_bound must be positive and finite, got {}",
                self.solver_noise_bound
            )));
        }
        if !self.thr_linearity.is_finite() || self.thr_linearity <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "thr_linearity must be positive and finite, got {}",
                self.thr_linearity
            )));
        }
        // 0.0 disables the tuple test; otherwise the ratio must stay in (0, 1).
        if self.tuple_scale != 0.0 && !(self.tuple_scale > 0.0 && self.tuple_scale < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "tuple_scale must be 0.0 or inside (0, 1), got {}",
                self.tuple_scale
            )));
        }
        if self.num_max_corr == 0 {
            return Err(Error::InvalidConfig(
                "num_max_corr must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_derive_from_voxel_size() {
        let config = MatcherConfig::new(0.25);
        assert_eq!(config.normal_radius, 0.5);
        assert_eq!(config.fpfh_radius, 1.25);
        assert_eq!(config.robin_noise_bound, 0.5);
        assert_eq!(config.num_max_corr, 5000);
        assert_eq!(config.robin_mode, RobinMode::MaxKCore);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_nonpositive_radii() {
        assert!(MatcherConfig::new(-1.0).validate().is_err());
        assert!(MatcherConfig::new(0.0).validate().is_err());
        assert!(MatcherConfig::new(0.3)
            .with_normal_radius(f32::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_rejects_bad_tuple_scale() {
        assert!(MatcherConfig::new(0.3)
            .with_tuple_scale(1.0)
            .validate()
            .is_err());
        assert!(MatcherConfig::new(0.3)
            .with_tuple_scale(-0.5)
            .validate()
            .is_err());
        // Zero disables, which is legal.
        assert!(MatcherConfig::new(0.3)
            .with_tuple_scale(0.0)
            .validate()
            .is_ok());
    }
}
