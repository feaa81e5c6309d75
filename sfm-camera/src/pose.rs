use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

/// Rotation by pi about the x-axis, mapping between the standard viewing
/// frame (-z forward, y up) and the projection frame (+z forward, y down).
fn x_flip() -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::identity(),
        UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI),
    )
}

/// Converts a standard `world_T_camera` pose into the inverted-flipped
/// `flipped_camera_T_world` transform used for projection.
pub fn standard_to_inverted_flipped(world_t_camera: &Isometry3<f64>) -> Isometry3<f64> {
    x_flip() * world_t_camera.inverse()
}

/// Converts an inverted-flipped `flipped_camera_T_world` transform back into
/// the standard `world_T_camera` pose.
pub fn inverted_flipped_to_standard(flipped_camera_t_world: &Isometry3<f64>) -> Isometry3<f64> {
    flipped_camera_t_world.inverse() * x_flip()
}

/// A 6-DOF pose in exponential coordinates: a Rodrigues rotation vector and
/// a translation.
///
/// This is the parameterization the optimization providers update; deltas
/// are subtracted component-wise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpPose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl ExpPose {
    pub fn from_isometry(isometry: &Isometry3<f64>) -> Self {
        Self {
            rotation: isometry.rotation.scaled_axis(),
            translation: isometry.translation.vector,
        }
    }

    pub fn to_isometry(&self) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_scaled_axis(self.rotation),
        )
    }

    /// Subtracts a 6-vector correction `(rotation, translation)`.
    pub fn corrected(&self, deltas: &[f64]) -> Self {
        debug_assert_eq!(deltas.len(), 6);
        Self {
            rotation: self.rotation - Vector3::new(deltas[0], deltas[1], deltas[2]),
            translation: self.translation - Vector3::new(deltas[3], deltas[4], deltas[5]),
        }
    }
}
