use nalgebra::{DMatrix, DVector, Isometry3, Matrix2, Point3, UnitQuaternion, Vector2, Vector3};

use robust_lm::{dense_optimization, Estimator, OptimizationProvider, OptimizationResult};
use sfm_camera::{
    inverted_flipped_to_standard, orientation_jacobian_2x3, standard_to_inverted_flipped, Camera,
};

use super::fill_robust_error;

/// Optimizes a 3-DOF camera orientation (pure-rotation pose) over 2D/3D
/// point correspondences.
pub struct OrientationProvider<'a> {
    camera: &'a Camera,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Vector2<f64>],
    /// `flipped_camera_R_world` in exponential coordinates.
    rotation: Vector3<f64>,
    candidate: Vector3<f64>,
}

impl<'a> OrientationProvider<'a> {
    pub fn new(
        camera: &'a Camera,
        world_r_camera: &UnitQuaternion<f64>,
        object_points: &'a [Point3<f64>],
        image_points: &'a [Vector2<f64>],
    ) -> Self {
        debug_assert_eq!(object_points.len(), image_points.len());
        debug_assert!(object_points.len() >= 3);

        let standard = Isometry3::from_parts(nalgebra::Translation3::identity(), *world_r_camera);
        let rotation = standard_to_inverted_flipped(&standard).rotation.scaled_axis();

        Self {
            camera,
            object_points,
            image_points,
            rotation,
            candidate: rotation,
        }
    }

    /// The current (accepted) orientation in the standard convention.
    pub fn world_r_camera(&self) -> UnitQuaternion<f64> {
        let flipped = Isometry3::from_parts(
            nalgebra::Translation3::identity(),
            UnitQuaternion::from_scaled_axis(self.rotation),
        );
        inverted_flipped_to_standard(&flipped).rotation
    }

    fn residuals(&self, rotation: &Vector3<f64>) -> Vec<Vector2<f64>> {
        let flipped = Isometry3::from_parts(
            nalgebra::Translation3::identity(),
            UnitQuaternion::from_scaled_axis(*rotation),
        );
        self.object_points
            .iter()
            .zip(self.image_points.iter())
            .map(|(object_point, image_point)| {
                self.camera.project_if(&flipped, object_point) - image_point
            })
            .collect()
    }
}

impl OptimizationProvider for OrientationProvider<'_> {
    fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>) {
        *jacobian = DMatrix::zeros(self.object_points.len() * 2, 3);

        for (n, object_point) in self.object_points.iter().enumerate() {
            let block = orientation_jacobian_2x3(self.camera, &self.rotation, object_point);
            jacobian.view_mut((2 * n, 0), (2, 3)).copy_from(&block);
        }
    }

    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
        inverted_covariances: Option<&[Matrix2<f64>]>,
    ) -> f64 {
        fill_robust_error(
            estimator,
            self.residuals(&self.candidate),
            3,
            weighted_errors,
            weights,
            inverted_covariances,
        )
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.candidate = self.rotation - Vector3::new(deltas[0], deltas[1], deltas[2]);
    }

    fn accept_correction(&mut self) {
        self.rotation = self.candidate;
    }
}

/// Robust orientation refinement; returns the optimized standard orientation
/// and the driver outcome.
#[allow(clippy::too_many_arguments)]
pub fn optimize_orientation(
    camera: &Camera,
    world_r_camera: &UnitQuaternion<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    iterations: usize,
    estimator: Estimator,
    lambda: f64,
    lambda_factor: f64,
) -> robust_lm::Result<(UnitQuaternion<f64>, OptimizationResult)> {
    let mut provider = OrientationProvider::new(camera, world_r_camera, object_points, image_points);

    let result = dense_optimization(
        &mut provider,
        iterations,
        estimator,
        lambda,
        lambda_factor,
        None,
        None,
    )?;

    Ok((provider.world_r_camera(), result))
}
