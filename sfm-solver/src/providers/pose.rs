use nalgebra::{DMatrix, DVector, Isometry3, Matrix2, Point3, Vector2};

use robust_lm::{dense_optimization, Estimator, OptimizationProvider, OptimizationResult};
use sfm_camera::{
    inverted_flipped_to_standard, pose_jacobian_2x6, standard_to_inverted_flipped, Camera, ExpPose,
};

use super::fill_robust_error;

/// Optimizes a 6-DOF camera pose over 2D/3D point correspondences.
pub struct PoseProvider<'a> {
    camera: &'a Camera,
    object_points: &'a [Point3<f64>],
    image_points: &'a [Vector2<f64>],
    flipped_pose: ExpPose,
    candidate: ExpPose,
}

impl<'a> PoseProvider<'a> {
    pub fn new(
        camera: &'a Camera,
        world_t_camera: &Isometry3<f64>,
        object_points: &'a [Point3<f64>],
        image_points: &'a [Vector2<f64>],
    ) -> Self {
        debug_assert_eq!(object_points.len(), image_points.len());
        debug_assert!(object_points.len() >= 3);

        let flipped_pose = ExpPose::from_isometry(&standard_to_inverted_flipped(world_t_camera));

        Self {
            camera,
            object_points,
            image_points,
            flipped_pose,
            candidate: flipped_pose,
        }
    }

    /// The current (accepted) pose in the standard convention.
    pub fn world_t_camera(&self) -> Isometry3<f64> {
        inverted_flipped_to_standard(&self.flipped_pose.to_isometry())
    }

    fn residuals(&self, pose: &ExpPose) -> Vec<Vector2<f64>> {
        let flipped = pose.to_isometry();
        self.object_points
            .iter()
            .zip(self.image_points.iter())
            .map(|(object_point, image_point)| {
                self.camera.project_if(&flipped, object_point) - image_point
            })
            .collect()
    }
}

impl OptimizationProvider for PoseProvider<'_> {
    fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>) {
        *jacobian = DMatrix::zeros(self.object_points.len() * 2, 6);

        for (n, object_point) in self.object_points.iter().enumerate() {
            let block = pose_jacobian_2x6(self.camera, &self.flipped_pose, object_point);
            jacobian.view_mut((2 * n, 0), (2, 6)).copy_from(&block);
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
            6,
            weighted_errors,
            weights,
            inverted_covariances,
        )
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.candidate = self.flipped_pose.corrected(deltas.as_slice());
    }

    fn accept_correction(&mut self) {
        self.flipped_pose = self.candidate;
    }
}

/// Robust pose refinement; returns the optimized standard pose together with
/// the driver outcome.
#[allow(clippy::too_many_arguments)]
pub fn optimize_pose(
    camera: &Camera,
    world_t_camera: &Isometry3<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    iterations: usize,
    estimator: Estimator,
    lambda: f64,
    lambda_factor: f64,
    inverted_covariances: Option<&[Matrix2<f64>]>,
) -> robust_lm::Result<(Isometry3<f64>, OptimizationResult)> {
    let mut provider = PoseProvider::new(camera, world_t_camera, object_points, image_points);

    let result = dense_optimization(
        &mut provider,
        iterations,
        estimator,
        lambda,
        lambda_factor,
        inverted_covariances,
        None,
    )?;

    Ok((provider.world_t_camera(), result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    fn camera() -> Camera {
        Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
    }

    fn scene() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, -2.0),
            Point3::new(0.5, 0.2, -2.5),
            Point3::new(-0.4, 0.3, -1.8),
            Point3::new(0.2, -0.4, -2.2),
            Point3::new(-0.3, -0.2, -2.8),
            Point3::new(0.6, -0.1, -1.9),
        ]
    }

    #[test]
    fn refines_perturbed_pose() {
        let camera = camera();
        let truth = Isometry3::from_parts(
            Translation3::new(0.1, -0.05, 0.2),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.05, 0.1, -0.02)),
        );

        let object_points = scene();
        let image_points: Vec<Vector2<f64>> = object_points
            .iter()
            .map(|p| camera.project(&truth, p))
            .collect();

        let rough = Isometry3::from_parts(
            Translation3::new(0.15, -0.02, 0.17),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.08, 0.07, 0.0)),
        );

        let (optimized, result) = optimize_pose(
            &camera,
            &rough,
            &object_points,
            &image_points,
            20,
            Estimator::Square,
            0.001,
            5.0,
            None,
        )
        .unwrap();

        assert!(result.final_error < 1e-8);
        assert_relative_eq!(
            optimized.translation.vector,
            truth.translation.vector,
            epsilon = 1e-5
        );
        assert!(optimized.rotation.angle_to(&truth.rotation) < 1e-5);
    }

    #[test]
    fn huber_survives_outlier_observation() {
        let camera = camera();
        let truth = Isometry3::from_parts(
            Translation3::new(0.0, 0.0, 0.3),
            UnitQuaternion::identity(),
        );

        let object_points = scene();
        let mut image_points: Vec<Vector2<f64>> = object_points
            .iter()
            .map(|p| camera.project(&truth, p))
            .collect();
        image_points[2] += Vector2::new(25.0, -18.0);

        let rough = Isometry3::from_parts(
            Translation3::new(0.05, 0.02, 0.25),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.02, -0.03, 0.01)),
        );

        let (optimized, _) = optimize_pose(
            &camera,
            &rough,
            &object_points,
            &image_points,
            50,
            Estimator::Huber,
            0.001,
            5.0,
            None,
        )
        .unwrap();

        assert!((optimized.translation.vector - truth.translation.vector).norm() < 0.01);
        assert!(optimized.rotation.angle_to(&truth.rotation) < 0.01);
    }
}
