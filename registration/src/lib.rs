//! Correspondence-based global registration.
//!
//! The pipeline runs in four stages: descriptor extraction
//! (`cm_point_cloud::fpfh`), mutual-NN correspondence search with a
//! geometric tuple filter (`matching`), compatibility-graph pruning
//! (`robin`) and a decoupled robust SE(3) solver (`solver`). The
//! `CloudMatcher` facade owns the buffers flowing between stages.

pub mod matcher;
pub mod matching;
pub mod robin;
pub mod solver;

pub use matcher::{CloudMatcher, MatchScore, PhaseTimings};
pub use matching::{match_correspondences, match_correspondences_legacy, MatchOptions};
pub use robin::prune;
pub use solver::{RobustRegistrationSolver, RotationEstimation, SolverParams};

pub use cm_core::{Error, MatcherConfig, RegistrationSolution, Result, RobinMode};
