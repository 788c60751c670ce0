//! Point cloud preprocessing for the registration pipeline.
//!
//! - `filtering`: voxel-grid downsampling
//! - `spatial`: rstar-backed radius queries with stable index ordering
//! - `fpfh`: keypoint filtering and 33-bin descriptor extraction

pub mod filtering;
pub mod fpfh;
pub mod spatial;

pub use filtering::voxel_down_sample;
pub use fpfh::{FpfhEstimator, FpfhFeature, FPFH_BINS};
