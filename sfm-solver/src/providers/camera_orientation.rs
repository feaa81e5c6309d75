use nalgebra::{DMatrix, DVector, Isometry3, Matrix2, Point3, Translation3, UnitQuaternion, Vector2, Vector3};

use obs_database::ObjectPointGroups;
use robust_lm::{dense_optimization, Estimator, OptimizationProvider, OptimizationResult};
use sfm_camera::{
    intrinsics_jacobian_2x8, inverted_flipped_to_standard, orientation_jacobian_2x3,
    standard_to_inverted_flipped, Camera,
};

use super::fill_robust_error;

/// Optimizes camera orientations together with the eight intrinsic camera
/// parameters over fixed 3-D object points.
///
/// Candidate intrinsics with a principal point outside the image or a
/// non-positive focal length are infeasible; the driver backs off via the
/// damping in that case.
pub struct CameraOrientationProvider<'a> {
    base_camera: &'a Camera,
    groups: &'a ObjectPointGroups,
    points: &'a [Point3<f64>],
    /// `flipped_camera_R_world` exponential coordinates per keyframe.
    orientations: Vec<Vector3<f64>>,
    intrinsics: [f64; 8],
    candidate_orientations: Vec<Vector3<f64>>,
    candidate_intrinsics: [f64; 8],
}

impl<'a> CameraOrientationProvider<'a> {
    pub fn new(
        camera: &'a Camera,
        world_r_cameras: &[UnitQuaternion<f64>],
        groups: &'a ObjectPointGroups,
        points: &'a [Point3<f64>],
    ) -> Self {
        debug_assert_eq!(groups.len(), points.len());

        let orientations: Vec<Vector3<f64>> = world_r_cameras
            .iter()
            .map(|rotation| {
                let standard = Isometry3::from_parts(Translation3::identity(), *rotation);
                standard_to_inverted_flipped(&standard).rotation.scaled_axis()
            })
            .collect();

        let (k1, k2, _k3, p1, p2) = camera.distortion();
        let intrinsics = [
            camera.fx(),
            camera.fy(),
            camera.cx(),
            camera.cy(),
            k1,
            k2,
            p1,
            p2,
        ];

        Self {
            base_camera: camera,
            groups,
            points,
            candidate_orientations: orientations.clone(),
            candidate_intrinsics: intrinsics,
            orientations,
            intrinsics,
        }
    }

    fn dimension(&self) -> usize {
        3 * self.orientations.len() + 8
    }

    fn intrinsics_feasible(&self, intrinsics: &[f64; 8]) -> bool {
        intrinsics[0] > 0.0
            && intrinsics[1] > 0.0
            && (0.0..self.base_camera.width() as f64).contains(&intrinsics[2])
            && (0.0..self.base_camera.height() as f64).contains(&intrinsics[3])
    }

    fn build_camera(&self, intrinsics: &[f64; 8]) -> Option<Camera> {
        if !self.intrinsics_feasible(intrinsics) {
            return None;
        }
        Camera::from_params_with_distortion(
            self.base_camera.width(),
            self.base_camera.height(),
            intrinsics[0],
            intrinsics[1],
            intrinsics[2],
            intrinsics[3],
            intrinsics[4],
            intrinsics[5],
            intrinsics[6],
            intrinsics[7],
        )
        .ok()
    }

    fn residuals(
        &self,
        orientations: &[Vector3<f64>],
        intrinsics: &[f64; 8],
    ) -> Option<Vec<Vector2<f64>>> {
        let camera = self.build_camera(intrinsics)?;

        let flipped: Vec<Isometry3<f64>> = orientations
            .iter()
            .map(|rotation| {
                Isometry3::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_scaled_axis(*rotation),
                )
            })
            .collect();

        let mut residuals = Vec::with_capacity(self.groups.correspondence_count());
        for (point_index, group) in self.groups.iter().enumerate() {
            for &(pose_index, image_point) in group {
                let projected =
                    camera.project_if(&flipped[pose_index as usize], &self.points[point_index]);
                residuals.push(projected - image_point);
            }
        }

        Some(residuals)
    }

    /// The optimized camera.
    pub fn camera(&self) -> Camera {
        self.build_camera(&self.intrinsics)
            .unwrap_or_else(|| self.base_camera.clone())
    }

    /// The optimized orientations in the standard convention.
    pub fn world_r_cameras(&self) -> Vec<UnitQuaternion<f64>> {
        self.orientations
            .iter()
            .map(|rotation| {
                let flipped = Isometry3::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_scaled_axis(*rotation),
                );
                inverted_flipped_to_standard(&flipped).rotation
            })
            .collect()
    }
}

impl OptimizationProvider for CameraOrientationProvider<'_> {
    fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>) {
        let rows = self.groups.correspondence_count() * 2;
        let dimension = self.dimension();
        let intrinsics_offset = 3 * self.orientations.len();

        *jacobian = DMatrix::zeros(rows, dimension);

        let camera = self
            .build_camera(&self.intrinsics)
            .expect("current model must be feasible");

        let flipped: Vec<Isometry3<f64>> = self
            .orientations
            .iter()
            .map(|rotation| {
                Isometry3::from_parts(
                    Translation3::identity(),
                    UnitQuaternion::from_scaled_axis(*rotation),
                )
            })
            .collect();

        let mut row = 0usize;
        for (point_index, group) in self.groups.iter().enumerate() {
            for &(pose_index, _) in group {
                let pose_index = pose_index as usize;
                let point = &self.points[point_index];

                let orientation_block =
                    orientation_jacobian_2x3(&camera, &self.orientations[pose_index], point);
                jacobian
                    .view_mut((row, 3 * pose_index), (2, 3))
                    .copy_from(&orientation_block);

                let intrinsics_block =
                    intrinsics_jacobian_2x8(&camera, &flipped[pose_index], point);
                jacobian
                    .view_mut((row, intrinsics_offset), (2, 8))
                    .copy_from(&intrinsics_block);

                row += 2;
            }
        }
    }

    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
        inverted_covariances: Option<&[Matrix2<f64>]>,
    ) -> f64 {
        let Some(residuals) =
            self.residuals(&self.candidate_orientations, &self.candidate_intrinsics)
        else {
            return f64::MAX;
        };

        fill_robust_error(
            estimator,
            residuals,
            self.dimension(),
            weighted_errors,
            weights,
            inverted_covariances,
        )
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        debug_assert_eq!(deltas.len(), self.dimension());

        for (n, orientation) in self.orientations.iter().enumerate() {
            self.candidate_orientations[n] = orientation
                - Vector3::new(deltas[3 * n], deltas[3 * n + 1], deltas[3 * n + 2]);
        }

        let offset = 3 * self.orientations.len();
        for (i, value) in self.candidate_intrinsics.iter_mut().enumerate() {
            *value = self.intrinsics[i] - deltas[offset + i];
        }
    }

    fn accept_correction(&mut self) {
        self.orientations.clone_from(&self.candidate_orientations);
        self.intrinsics = self.candidate_intrinsics;
    }
}

/// Joint optimization of keyframe orientations and camera intrinsics over
/// fixed object points.
#[allow(clippy::too_many_arguments)]
pub fn optimize_camera_and_orientations(
    camera: &Camera,
    world_r_cameras: &[UnitQuaternion<f64>],
    groups: &ObjectPointGroups,
    points: &[Point3<f64>],
    iterations: usize,
    estimator: Estimator,
    lambda: f64,
    lambda_factor: f64,
) -> robust_lm::Result<(Camera, Vec<UnitQuaternion<f64>>, OptimizationResult)> {
    let mut provider = CameraOrientationProvider::new(camera, world_r_cameras, groups, points);

    let result = dense_optimization(
        &mut provider,
        iterations,
        estimator,
        lambda,
        lambda_factor,
        None,
        None,
    )?;

    Ok((provider.camera(), provider.world_r_cameras(), result))
}
