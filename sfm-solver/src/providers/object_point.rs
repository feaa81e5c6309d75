use nalgebra::{DMatrix, DVector, Isometry3, Matrix2, Point3, Vector2, Vector3};

use robust_lm::{dense_optimization, Estimator, OptimizationProvider, OptimizationResult};
use sfm_camera::{point_jacobian_2x3, standard_to_inverted_flipped, Camera};

use super::fill_robust_error;

/// Optimizes a single 3-D object point over its observations in a set of
/// fixed camera poses.
pub struct ObjectPointProvider<'a> {
    camera: &'a Camera,
    flipped_poses: Vec<Isometry3<f64>>,
    image_points: &'a [Vector2<f64>],
    point: Point3<f64>,
    candidate: Point3<f64>,
}

impl<'a> ObjectPointProvider<'a> {
    pub fn new(
        camera: &'a Camera,
        world_t_cameras: &[Isometry3<f64>],
        image_points: &'a [Vector2<f64>],
        point: Point3<f64>,
    ) -> Self {
        debug_assert_eq!(world_t_cameras.len(), image_points.len());
        debug_assert!(world_t_cameras.len() >= 2);

        let flipped_poses = world_t_cameras
            .iter()
            .map(standard_to_inverted_flipped)
            .collect();

        Self {
            camera,
            flipped_poses,
            image_points,
            point,
            candidate: point,
        }
    }

    pub fn object_point(&self) -> Point3<f64> {
        self.point
    }

    fn residuals(&self, point: &Point3<f64>) -> Vec<Vector2<f64>> {
        self.flipped_poses
            .iter()
            .zip(self.image_points.iter())
            .map(|(flipped, image_point)| self.camera.project_if(flipped, point) - image_point)
            .collect()
    }
}

impl OptimizationProvider for ObjectPointProvider<'_> {
    fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>) {
        *jacobian = DMatrix::zeros(self.flipped_poses.len() * 2, 3);

        for (n, flipped) in self.flipped_poses.iter().enumerate() {
            let block = point_jacobian_2x3(self.camera, flipped, &self.point);
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
        self.candidate =
            self.point - Vector3::new(deltas[0], deltas[1], deltas[2]);
    }

    fn accept_correction(&mut self) {
        self.point = self.candidate;
    }
}

/// Robust refinement of a single object point with fixed poses.
#[allow(clippy::too_many_arguments)]
pub fn optimize_object_point(
    camera: &Camera,
    world_t_cameras: &[Isometry3<f64>],
    image_points: &[Vector2<f64>],
    point: Point3<f64>,
    iterations: usize,
    estimator: Estimator,
    lambda: f64,
    lambda_factor: f64,
) -> robust_lm::Result<(Point3<f64>, OptimizationResult)> {
    let mut provider = ObjectPointProvider::new(camera, world_t_cameras, image_points, point);

    let result = dense_optimization(
        &mut provider,
        iterations,
        estimator,
        lambda,
        lambda_factor,
        None,
        None,
    )?;

    Ok((provider.object_point(), result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn refines_perturbed_point() {
        let camera = Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap();
        let truth = Point3::new(0.2, -0.3, -2.4);

        let poses: Vec<Isometry3<f64>> = (0..4)
            .map(|n| {
                Isometry3::from_parts(
                    Translation3::new(n as f64 * 0.15, 0.0, 0.0),
                    UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.02 * n as f64, 0.0)),
                )
            })
            .collect();

        let image_points: Vec<Vector2<f64>> =
            poses.iter().map(|pose| camera.project(pose, &truth)).collect();

        let (optimized, result) = optimize_object_point(
            &camera,
            &poses,
            &image_points,
            Point3::new(0.25, -0.2, -2.2),
            20,
            Estimator::Square,
            0.001,
            5.0,
        )
        .unwrap();

        assert!(result.final_error < 1e-10);
        assert_relative_eq!(optimized.coords, truth.coords, epsilon = 1e-6);
    }
}
