use nalgebra::{Matrix3, Matrix4, Vector3};

/// Result of a robust SE(3) registration.
///
/// When `valid` is false the transform is the identity: callers must not
/// apply an invalid solution. `rotation` is always a proper rotation
/// (orthogonal, determinant +1) and `scale` is fixed at 1.0; the pipeline
/// does not estimate scale.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationSolution {
    pub valid: bool,
    pub scale: f64,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
}

impl Default for RegistrationSolution {
    fn default() -> Self {
        Self::invalid_identity()
    }
}

impl RegistrationSolution {
    /// The well-defined failure value: identity transform, `valid == false`.
    pub fn invalid_identity() -> Self {
        Self {
            valid: false,
            scale: 1.0,
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Homogeneous 4x4 transform matrix.
    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_identity() {
        let sol = RegistrationSolution::invalid_identity();
        assert!(!sol.valid);
        assert_eq!(sol.scale, 1.0);
        assert_eq!(sol.rotation, Matrix3::identity());
        assert_eq!(sol.translation, Vector3::zeros());
    }

    #[test]
    fn test_to_matrix4() {
        let mut sol = RegistrationSolution::invalid_identity();
        sol.translation = Vector3::new(1.0, 2.0, 3.0);
        let m = sol.to_matrix4();
        assert_eq!(m[(0, 3)], 1.0);
        assert_eq!(m[(1, 3)], 2.0);
        assert_eq!(m[(2, 3)], 3.0);
        assert_eq!(m[(3, 3)], 1.0);
    }
}
