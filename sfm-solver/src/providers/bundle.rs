use nalgebra::{DMatrix, DVector, Dyn, Isometry3, Matrix2, Matrix3, OMatrix, Point3, Vector2, Vector3, U3};

use obs_database::ObjectPointGroups;
use robust_lm::{
    advanced_sparse_optimization, dense_optimization, AdvancedSparseProvider, Estimator,
    OptimizationProvider,
};
use sfm_camera::{
    intrinsics_jacobian_2x8, inverted_flipped_to_standard, orientation_jacobian_2x3,
    point_jacobian_2x3, pose_jacobian_2x6, standard_to_inverted_flipped, Camera, ExpPose,
};

use super::{fill_robust_error, robust_mean_error, robust_weights};

/// Camera-block-to-point-block coupling of the normal equations.
type CouplingMatrix = OMatrix<f64, Dyn, U3>;

/// Degrees of freedom per pose block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseDof {
    /// Full 6-DOF pose (rotation + translation).
    Six,
    /// Orientation only; translations stay exactly zero (rotational motion).
    Three,
}

impl PoseDof {
    #[inline]
    fn dimension(self) -> usize {
        match self {
            PoseDof::Six => 6,
            PoseDof::Three => 3,
        }
    }
}

/// Bundle adjustment over poses and points, optionally with the eight
/// intrinsic camera parameters as a shared block.
///
/// The parameter layout is `[intrinsics?; poses; points]`. The provider
/// implements both the plain dense capability and the advanced sparse one;
/// the latter eliminates the point blocks with a Schur complement and
/// re-applies the damping from the stored Hessian diagonals.
pub struct BundleProvider<'a> {
    base_camera: &'a Camera,
    groups: &'a ObjectPointGroups,
    pose_dof: PoseDof,
    optimize_intrinsics: bool,
    estimator: Estimator,

    poses: Vec<ExpPose>,
    points: Vec<Point3<f64>>,
    intrinsics: [f64; 8],

    candidate_poses: Vec<ExpPose>,
    candidate_points: Vec<Point3<f64>>,
    candidate_intrinsics: [f64; 8],

    cam_hessian: DMatrix<f64>,
    cam_gradient: DVector<f64>,
    cam_diagonal: DVector<f64>,
    point_hessians: Vec<Matrix3<f64>>,
    point_gradients: Vec<Vector3<f64>>,
    point_diagonals: Vec<Vector3<f64>>,
    couplings: Vec<CouplingMatrix>,
}

/// Outcome of a bundle adjustment.
#[derive(Debug, Clone)]
pub struct BundleResult {
    pub world_t_cameras: Vec<Isometry3<f64>>,
    pub object_points: Vec<Point3<f64>>,
    pub camera: Camera,
    pub initial_error: f64,
    pub final_error: f64,
}

impl<'a> BundleProvider<'a> {
    pub fn new(
        camera: &'a Camera,
        world_t_cameras: &[Isometry3<f64>],
        object_points: &[Point3<f64>],
        groups: &'a ObjectPointGroups,
        pose_dof: PoseDof,
        optimize_intrinsics: bool,
        estimator: Estimator,
    ) -> Self {
        debug_assert_eq!(groups.len(), object_points.len());
        debug_assert!(groups.iter().all(|group| {
            group
                .iter()
                .all(|&(pose_index, _)| (pose_index as usize) < world_t_cameras.len())
        }));

        let poses: Vec<ExpPose> = world_t_cameras
            .iter()
            .map(|pose| {
                let mut flipped = ExpPose::from_isometry(&standard_to_inverted_flipped(pose));
                if pose_dof == PoseDof::Three {
                    flipped.translation = Vector3::zeros();
                }
                flipped
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
            pose_dof,
            optimize_intrinsics,
            estimator,
            candidate_poses: poses.clone(),
            candidate_points: object_points.to_vec(),
            candidate_intrinsics: intrinsics,
            poses,
            points: object_points.to_vec(),
            intrinsics,
            cam_hessian: DMatrix::zeros(0, 0),
            cam_gradient: DVector::zeros(0),
            cam_diagonal: DVector::zeros(0),
            point_hessians: Vec::new(),
            point_gradients: Vec::new(),
            point_diagonals: Vec::new(),
            couplings: Vec::new(),
        }
    }

    #[inline]
    fn intrinsics_dimension(&self) -> usize {
        if self.optimize_intrinsics {
            8
        } else {
            0
        }
    }

    #[inline]
    fn camera_dimension(&self) -> usize {
        self.intrinsics_dimension() + self.pose_dof.dimension() * self.poses.len()
    }

    #[inline]
    fn total_dimension(&self) -> usize {
        self.camera_dimension() + 3 * self.points.len()
    }

    fn intrinsics_feasible(&self, intrinsics: &[f64; 8]) -> bool {
        intrinsics[0] > 0.0
            && intrinsics[1] > 0.0
            && (0.0..self.base_camera.width() as f64).contains(&intrinsics[2])
            && (0.0..self.base_camera.height() as f64).contains(&intrinsics[3])
    }

    fn build_camera(&self, intrinsics: &[f64; 8]) -> Option<Camera> {
        if !self.optimize_intrinsics {
            return Some(self.base_camera.clone());
        }
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

    /// Residuals of a given state, in group iteration order.
    fn residuals(
        &self,
        poses: &[ExpPose],
        points: &[Point3<f64>],
        intrinsics: &[f64; 8],
    ) -> Option<Vec<Vector2<f64>>> {
        let camera = self.build_camera(intrinsics)?;
        let flipped: Vec<Isometry3<f64>> = poses.iter().map(|p| p.to_isometry()).collect();

        let mut residuals = Vec::with_capacity(self.groups.correspondence_count());
        for (point_index, group) in self.groups.iter().enumerate() {
            for &(pose_index, image_point) in group {
                let projected =
                    camera.project_if(&flipped[pose_index as usize], &points[point_index]);
                residuals.push(projected - image_point);
            }
        }

        Some(residuals)
    }

    fn candidate_sqr_errors(&self) -> Option<Vec<f64>> {
        let residuals = self.residuals(
            &self.candidate_poses,
            &self.candidate_points,
            &self.candidate_intrinsics,
        )?;
        let sqr: Vec<f64> = residuals.iter().map(|r| r.norm_squared()).collect();
        sqr.iter().all(|e| e.is_finite()).then_some(sqr)
    }

    fn subtract_correction(&mut self, deltas: &DVector<f64>) {
        debug_assert_eq!(deltas.len(), self.total_dimension());

        let intrinsics_dim = self.intrinsics_dimension();
        let pose_dim = self.pose_dof.dimension();

        if self.optimize_intrinsics {
            for (i, value) in self.candidate_intrinsics.iter_mut().enumerate() {
                *value = self.intrinsics[i] - deltas[i];
            }
        } else {
            self.candidate_intrinsics = self.intrinsics;
        }

        for (p, pose) in self.poses.iter().enumerate() {
            let offset = intrinsics_dim + p * pose_dim;
            let candidate = &mut self.candidate_poses[p];
            candidate.rotation = pose.rotation
                - Vector3::new(deltas[offset], deltas[offset + 1], deltas[offset + 2]);
            candidate.translation = match self.pose_dof {
                PoseDof::Six => {
                    pose.translation
                        - Vector3::new(deltas[offset + 3], deltas[offset + 4], deltas[offset + 5])
                }
                PoseDof::Three => Vector3::zeros(),
            };
        }

        let points_offset = self.camera_dimension();
        for (n, point) in self.points.iter().enumerate() {
            let offset = points_offset + 3 * n;
            self.candidate_points[n] = *point
                - Vector3::new(deltas[offset], deltas[offset + 1], deltas[offset + 2]);
        }
    }

    fn promote_candidate(&mut self) {
        self.poses.clone_from(&self.candidate_poses);
        self.points.clone_from(&self.candidate_points);
        self.intrinsics = self.candidate_intrinsics;
    }

    /// The optimized poses in the standard convention.
    pub fn world_t_cameras(&self) -> Vec<Isometry3<f64>> {
        self.poses
            .iter()
            .map(|pose| inverted_flipped_to_standard(&pose.to_isometry()))
            .collect()
    }

    pub fn object_points(&self) -> Vec<Point3<f64>> {
        self.points.clone()
    }

    /// The (possibly optimized) camera.
    pub fn camera(&self) -> Camera {
        self.build_camera(&self.intrinsics)
            .unwrap_or_else(|| self.base_camera.clone())
    }
}

impl OptimizationProvider for BundleProvider<'_> {
    fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>) {
        let rows = self.groups.correspondence_count() * 2;
        let intrinsics_dim = self.intrinsics_dimension();
        let pose_dim = self.pose_dof.dimension();
        let points_offset = self.camera_dimension();

        *jacobian = DMatrix::zeros(rows, self.total_dimension());

        let camera = self
            .build_camera(&self.intrinsics)
            .expect("current model must be feasible");
        let flipped: Vec<Isometry3<f64>> = self.poses.iter().map(|p| p.to_isometry()).collect();

        let mut row = 0usize;
        for (point_index, group) in self.groups.iter().enumerate() {
            for &(pose_index, _) in group {
                let pose_index = pose_index as usize;
                let pose = &self.poses[pose_index];
                let point = &self.points[point_index];

                if self.optimize_intrinsics {
                    let block = intrinsics_jacobian_2x8(&camera, &flipped[pose_index], point);
                    jacobian.view_mut((row, 0), (2, 8)).copy_from(&block);
                }

                let pose_offset = intrinsics_dim + pose_index * pose_dim;
                match self.pose_dof {
                    PoseDof::Six => {
                        let block = pose_jacobian_2x6(&camera, pose, point);
                        jacobian.view_mut((row, pose_offset), (2, 6)).copy_from(&block);
                    }
                    PoseDof::Three => {
                        let block = orientation_jacobian_2x3(&camera, &pose.rotation, point);
                        jacobian.view_mut((row, pose_offset), (2, 3)).copy_from(&block);
                    }
                }

                let block = point_jacobian_2x3(&camera, &flipped[pose_index], point);
                jacobian
                    .view_mut((row, points_offset + 3 * point_index), (2, 3))
                    .copy_from(&block);

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
        let Some(residuals) = self.residuals(
            &self.candidate_poses,
            &self.candidate_points,
            &self.candidate_intrinsics,
        ) else {
            return f64::MAX;
        };

        fill_robust_error(
            estimator,
            residuals,
            self.total_dimension(),
            weighted_errors,
            weights,
            inverted_covariances,
        )
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.subtract_correction(deltas);
    }

    fn accept_correction(&mut self) {
        self.promote_candidate();
    }
}

impl AdvancedSparseProvider for BundleProvider<'_> {
    fn determine_error(&self) -> f64 {
        if self.optimize_intrinsics && !self.intrinsics_feasible(&self.candidate_intrinsics) {
            return f64::MAX;
        }

        match self.candidate_sqr_errors() {
            Some(sqr_errors) => {
                robust_mean_error(self.estimator, &sqr_errors, self.total_dimension())
            }
            None => f64::MAX,
        }
    }

    fn determine_parameters(&mut self) -> bool {
        let Some(camera) = self.build_camera(&self.intrinsics) else {
            return false;
        };

        let Some(residuals) = self.residuals(&self.poses, &self.points, &self.intrinsics) else {
            return false;
        };
        let sqr_errors: Vec<f64> = residuals.iter().map(|r| r.norm_squared()).collect();
        if sqr_errors.iter().any(|e| !e.is_finite()) {
            return false;
        }
        let weights = robust_weights(self.estimator, &sqr_errors, self.total_dimension());

        let cam_dim = self.camera_dimension();
        let intrinsics_dim = self.intrinsics_dimension();
        let pose_dim = self.pose_dof.dimension();

        self.cam_hessian = DMatrix::zeros(cam_dim, cam_dim);
        self.cam_gradient = DVector::zeros(cam_dim);
        self.point_hessians = vec![Matrix3::zeros(); self.points.len()];
        self.point_gradients = vec![Vector3::zeros(); self.points.len()];
        self.couplings = vec![CouplingMatrix::zeros(cam_dim); self.points.len()];

        let flipped: Vec<Isometry3<f64>> = self.poses.iter().map(|p| p.to_isometry()).collect();

        let mut observation = 0usize;
        for (point_index, group) in self.groups.iter().enumerate() {
            for &(pose_index, _) in group {
                let pose_index = pose_index as usize;
                let pose = &self.poses[pose_index];
                let point = &self.points[point_index];
                let weight = weights[observation];
                let residual = residuals[observation];
                observation += 1;

                // The camera-block columns of this observation.
                let mut cam_block = DMatrix::zeros(2, cam_dim);
                if self.optimize_intrinsics {
                    let block = intrinsics_jacobian_2x8(&camera, &flipped[pose_index], point);
                    cam_block.view_mut((0, 0), (2, 8)).copy_from(&block);
                }
                let pose_offset = intrinsics_dim + pose_index * pose_dim;
                match self.pose_dof {
                    PoseDof::Six => {
                        let block = pose_jacobian_2x6(&camera, pose, point);
                        cam_block.view_mut((0, pose_offset), (2, 6)).copy_from(&block);
                    }
                    PoseDof::Three => {
                        let block = orientation_jacobian_2x3(&camera, &pose.rotation, point);
                        cam_block.view_mut((0, pose_offset), (2, 3)).copy_from(&block);
                    }
                }

                let point_block = point_jacobian_2x3(&camera, &flipped[pose_index], point);

                let weighted_cam = cam_block.transpose() * weight;
                self.cam_hessian += &weighted_cam * &cam_block;
                self.cam_gradient += &weighted_cam * residual;

                self.point_hessians[point_index] +=
                    point_block.transpose() * weight * point_block;
                self.point_gradients[point_index] +=
                    point_block.transpose() * (residual * weight);

                self.couplings[point_index] += weighted_cam * point_block;
            }
        }

        self.cam_diagonal = self.cam_hessian.diagonal();
        self.point_diagonals = self.point_hessians.iter().map(|h| h.diagonal()).collect();

        true
    }

    fn solve(&mut self, deltas: &mut DVector<f64>, lambda: f64) -> bool {
        let cam_dim = self.camera_dimension();

        // Re-apply the damping to the stored original diagonals.
        let mut damped_cam = self.cam_hessian.clone();
        if lambda > f64::EPSILON {
            for n in 0..cam_dim {
                damped_cam[(n, n)] = self.cam_diagonal[n] * (1.0 + lambda);
            }
        }

        let mut inverted_points = Vec::with_capacity(self.points.len());
        for (hessian, diagonal) in self.point_hessians.iter().zip(self.point_diagonals.iter()) {
            let mut damped = *hessian;
            if lambda > f64::EPSILON {
                for n in 0..3 {
                    damped[(n, n)] = diagonal[n] * (1.0 + lambda);
                }
            }
            match damped.try_inverse() {
                Some(inverse) => inverted_points.push(inverse),
                None => return false,
            }
        }

        // Schur complement over the camera block.
        let mut reduced = damped_cam;
        let mut rhs = self.cam_gradient.clone();
        for (point_index, coupling) in self.couplings.iter().enumerate() {
            let inverse = &inverted_points[point_index];
            reduced -= coupling * *inverse * coupling.transpose();
            rhs -= coupling * (inverse * self.point_gradients[point_index]);
        }

        let camera_deltas = match reduced.clone().cholesky() {
            Some(cholesky) => cholesky.solve(&rhs),
            None => match reduced.lu().solve(&rhs) {
                Some(solution) => solution,
                None => return false,
            },
        };
        if camera_deltas.iter().any(|v| !v.is_finite()) {
            return false;
        }

        *deltas = DVector::zeros(self.total_dimension());
        deltas.rows_mut(0, cam_dim).copy_from(&camera_deltas);

        for (point_index, coupling) in self.couplings.iter().enumerate() {
            let back = self.point_gradients[point_index]
                - coupling.transpose() * &camera_deltas;
            let point_deltas = inverted_points[point_index] * back;
            deltas
                .rows_mut(cam_dim + 3 * point_index, 3)
                .copy_from(&point_deltas);
        }

        deltas.iter().all(|v| v.is_finite())
    }

    fn apply_correction(&mut self, deltas: &DVector<f64>) {
        self.subtract_correction(deltas);
    }

    fn accept_correction(&mut self) {
        self.promote_candidate();
    }
}

/// Bundle adjustment entry point.
///
/// `use_dense` switches between the dense driver (driver-owned normal
/// equations) and the sparse driver (provider-owned Schur elimination); both
/// converge to the same solutions.
#[allow(clippy::too_many_arguments)]
pub fn optimize_object_points_and_poses(
    camera: &Camera,
    world_t_cameras: &[Isometry3<f64>],
    object_points: &[Point3<f64>],
    groups: &ObjectPointGroups,
    pose_dof: PoseDof,
    optimize_intrinsics: bool,
    iterations: usize,
    estimator: Estimator,
    lambda: f64,
    lambda_factor: f64,
    use_dense: bool,
) -> robust_lm::Result<BundleResult> {
    let mut provider = BundleProvider::new(
        camera,
        world_t_cameras,
        object_points,
        groups,
        pose_dof,
        optimize_intrinsics,
        estimator,
    );

    let result = if use_dense {
        dense_optimization(
            &mut provider,
            iterations,
            estimator,
            lambda,
            lambda_factor,
            None,
            None,
        )?
    } else {
        advanced_sparse_optimization(&mut provider, iterations, lambda, lambda_factor, None)?
    };

    Ok(BundleResult {
        world_t_cameras: provider.world_t_cameras(),
        object_points: provider.object_points(),
        camera: provider.camera(),
        initial_error: result.initial_error,
        final_error: result.final_error,
    })
}
