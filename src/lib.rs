pub use cm_core as core;
pub use cm_point_cloud as point_cloud;
pub use cm_registration as registration;

pub use cm_registration::{CloudMatcher, MatcherConfig, RegistrationSolution, RobinMode};

use cm_core::{Error, Result};
use rayon::ThreadPoolBuilder;
use std::num::NonZeroUsize;
use std::sync::OnceLock;

/// Size the global Rayon pool shared by the parallel pipeline stages.
///
/// The first call wins: later calls return the recorded outcome no matter
/// what they pass. Without an explicit count the `CLOUDMATCH_THREADS`
/// variable is consulted; when that is unset too, Rayon sizes the pool
/// itself.
pub fn init_thread_pool(num_threads: Option<usize>) -> Result<()> {
    static INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();
    INIT.get_or_init(|| {
        let threads = match num_threads {
            Some(n) => Some(n),
            None => match std::env::var("CLOUDMATCH_THREADS") {
                Ok(raw) => Some(
                    raw.parse::<NonZeroUsize>()
                        .map_err(|_| {
                            format!("CLOUDMATCH_THREADS must be a positive integer, got '{raw}'")
                        })?
                        .get(),
                ),
                Err(_) => None,
            },
        };
        let mut builder = ThreadPoolBuilder::new();
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        builder.build_global().map_err(|e| e.to_string())
    })
    .clone()
    .map_err(Error::InvalidConfig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    #[test]
    fn test_thread_pool_init_is_idempotent() {
        assert!(init_thread_pool(Some(2)).is_ok());
        // The pool is already built; a conflicting request still reports
        // the first outcome.
        assert!(init_thread_pool(Some(4)).is_ok());

        // The parallel stages run on the configured pool.
        let cloud: Vec<Point3<f32>> = (0..64)
            .map(|i| {
                let f = i as f32;
                Point3::new((f * 0.37).sin(), (f * 0.23).cos(), 1.0)
            })
            .collect();
        let mut matcher = CloudMatcher::from_voxel_size(0.5).expect("valid config");
        let _ = matcher.estimate(&cloud, &cloud);
    }
}
