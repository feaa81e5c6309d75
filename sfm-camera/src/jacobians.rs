//! Analytic Jacobians of the distorted projection.
//!
//! All derivatives are taken in the inverted-flipped projection frame; the
//! rotation is parameterized by exponential (Rodrigues) coordinates, matching
//! the update rule of the optimization providers.

use nalgebra::{
    Isometry3, Matrix2, Matrix2x3, Matrix3, Point3, SMatrix, Vector3,
};

use crate::camera::Camera;
use crate::pose::ExpPose;

type Matrix2x6 = SMatrix<f64, 2, 6>;
type Matrix2x8 = SMatrix<f64, 2, 8>;

/// d(pixel) / d(normalized) at normalized coordinates `(x, y)`, including
/// the distortion model and the pinhole matrix.
fn pixel_wrt_normalized(camera: &Camera, x: f64, y: f64) -> Matrix2<f64> {
    let (k1, k2, k3, p1, p2) = camera.distortion();

    let r2 = x * x + y * y;
    let radial = 1.0 + r2 * (k1 + r2 * (k2 + r2 * k3));
    let dradial_dr2 = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r2 * r2;

    let dxd_dx = radial + x * dradial_dr2 * 2.0 * x + 2.0 * p1 * y + 6.0 * p2 * x;
    let dxd_dy = x * dradial_dr2 * 2.0 * y + 2.0 * p1 * x + 2.0 * p2 * y;
    let dyd_dx = y * dradial_dr2 * 2.0 * x + 2.0 * p1 * x + 2.0 * p2 * y;
    let dyd_dy = radial + y * dradial_dr2 * 2.0 * y + 6.0 * p1 * y + 2.0 * p2 * x;

    let fx = camera.fx();
    let fy = camera.fy();
    let skew = camera.intrinsics().skew();

    Matrix2::new(
        fx * dxd_dx + skew * dyd_dx,
        fx * dxd_dy + skew * dyd_dy,
        fy * dyd_dx,
        fy * dyd_dy,
    )
}

/// d(normalized) / d(camera point) at camera-frame point `p`.
fn normalized_wrt_camera_point(p: &Vector3<f64>) -> Matrix2x3<f64> {
    let inv_z = 1.0 / p.z;
    Matrix2x3::new(
        inv_z,
        0.0,
        -p.x * inv_z * inv_z,
        0.0,
        inv_z,
        -p.y * inv_z * inv_z,
    )
}

/// d(pixel) / d(camera point) at camera-frame point `p`.
fn pixel_wrt_camera_point(camera: &Camera, p: &Vector3<f64>) -> Matrix2x3<f64> {
    pixel_wrt_normalized(camera, p.x / p.z, p.y / p.z) * normalized_wrt_camera_point(p)
}

/// d(R(w) * x) / dw for exponential coordinates `w`, evaluated at the
/// current rotation (Gallego & Yezzi closed form). `rotated` must equal
/// `R(w) * x`.
fn rotated_point_wrt_rodrigues(w: &Vector3<f64>, rotated: &Vector3<f64>) -> Matrix3<f64> {
    let norm_sqr = w.norm_squared();

    if norm_sqr < 1e-14 {
        // Limit at the identity: d(Rx)/dw = -[x]_x.
        return -skew_symmetric(rotated);
    }

    let rotation = nalgebra::Rotation3::from_scaled_axis(*w);
    let identity_minus_r = Matrix3::identity() - rotation.matrix();

    let mut jacobian = Matrix3::zeros();
    for i in 0..3 {
        let e_i = Vector3::ith(i, 1.0);
        let factor = skew_symmetric(&(*w * w[i])) + skew_symmetric(&w.cross(&(identity_minus_r * e_i)));
        jacobian.set_column(i, &((factor / norm_sqr) * rotated));
    }

    jacobian
}

fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Jacobian of the projection with respect to the 3-D object point.
pub fn point_jacobian_2x3(
    camera: &Camera,
    flipped_camera_t_world: &Isometry3<f64>,
    object_point: &Point3<f64>,
) -> Matrix2x3<f64> {
    let p = flipped_camera_t_world * object_point;
    pixel_wrt_camera_point(camera, &p.coords) * flipped_camera_t_world.rotation.to_rotation_matrix().matrix()
}

/// Jacobian of the projection with respect to the exponential rotation
/// coordinates of a translation-free `flipped_camera_R_world` orientation.
pub fn orientation_jacobian_2x3(
    camera: &Camera,
    rotation: &Vector3<f64>,
    object_point: &Point3<f64>,
) -> Matrix2x3<f64> {
    let rotated = nalgebra::Rotation3::from_scaled_axis(*rotation) * object_point.coords;
    pixel_wrt_camera_point(camera, &rotated) * rotated_point_wrt_rodrigues(rotation, &rotated)
}

/// Jacobian of the projection with respect to the 6-DOF inverted-flipped
/// pose in exponential coordinates `(rotation, translation)`.
pub fn pose_jacobian_2x6(
    camera: &Camera,
    flipped_pose: &ExpPose,
    object_point: &Point3<f64>,
) -> Matrix2x6 {
    let rotated = nalgebra::Rotation3::from_scaled_axis(flipped_pose.rotation) * object_point.coords;
    let p = rotated + flipped_pose.translation;

    let pixel_wrt_point = pixel_wrt_camera_point(camera, &p);
    let rotation_block = pixel_wrt_point * rotated_point_wrt_rodrigues(&flipped_pose.rotation, &rotated);

    let mut jacobian = Matrix2x6::zeros();
    jacobian.fixed_view_mut::<2, 3>(0, 0).copy_from(&rotation_block);
    jacobian.fixed_view_mut::<2, 3>(0, 3).copy_from(&pixel_wrt_point);
    jacobian
}

/// Jacobian of the projection with respect to the eight intrinsic camera
/// parameters `(fx, fy, cx, cy, k1, k2, p1, p2)`.
pub fn intrinsics_jacobian_2x8(
    camera: &Camera,
    flipped_camera_t_world: &Isometry3<f64>,
    object_point: &Point3<f64>,
) -> Matrix2x8 {
    let p = flipped_camera_t_world * object_point;
    let x = p.x / p.z;
    let y = p.y / p.z;

    let (xd, yd) = camera.distort_normalized(x, y);

    let r2 = x * x + y * y;
    let r4 = r2 * r2;

    let dxd = [x * r2, x * r4, 2.0 * x * y, r2 + 2.0 * x * x];
    let dyd = [y * r2, y * r4, r2 + 2.0 * y * y, 2.0 * x * y];

    let fx = camera.fx();
    let fy = camera.fy();
    let skew = camera.intrinsics().skew();

    let mut jacobian = Matrix2x8::zeros();

    // fx, fy, cx, cy
    jacobian[(0, 0)] = xd;
    jacobian[(1, 1)] = yd;
    jacobian[(0, 2)] = 1.0;
    jacobian[(1, 3)] = 1.0;

    // k1, k2, p1, p2
    for i in 0..4 {
        jacobian[(0, 4 + i)] = fx * dxd[i] + skew * dyd[i];
        jacobian[(1, 4 + i)] = fy * dyd[i];
    }

    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::standard_to_inverted_flipped;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion, Vector2};

    const STEP: f64 = 1e-7;

    fn test_camera() -> Camera {
        Camera::from_params_with_distortion(
            640, 480, 500.0, 505.0, 320.0, 240.0, 0.03, -0.008, 0.001, -0.0005,
        )
        .unwrap()
    }

    fn flipped_test_pose() -> Isometry3<f64> {
        let pose = Isometry3::from_parts(
            Translation3::new(0.1, -0.3, 0.4),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.2, -0.1, 0.3)),
        );
        standard_to_inverted_flipped(&pose)
    }

    fn assert_columns_match(
        analytic: impl Fn(usize) -> Vector2<f64>,
        numeric: impl Fn(usize) -> Vector2<f64>,
        columns: usize,
    ) {
        for c in 0..columns {
            let a = analytic(c);
            let n = numeric(c);
            assert_relative_eq!(a.x, n.x, epsilon = 1e-4, max_relative = 1e-4);
            assert_relative_eq!(a.y, n.y, epsilon = 1e-4, max_relative = 1e-4);
        }
    }

    #[test]
    fn point_jacobian_matches_finite_differences() {
        let camera = test_camera();
        let flipped = flipped_test_pose();
        let point = Point3::new(0.2, 0.1, -1.5);

        let jacobian = point_jacobian_2x3(&camera, &flipped, &point);

        assert_columns_match(
            |c| jacobian.column(c).into_owned(),
            |c| {
                let mut shifted = point;
                shifted.coords[c] += STEP;
                (camera.project_if(&flipped, &shifted) - camera.project_if(&flipped, &point)) / STEP
            },
            3,
        );
    }

    #[test]
    fn pose_jacobian_matches_finite_differences() {
        let camera = test_camera();
        let flipped = ExpPose::from_isometry(&flipped_test_pose());
        let point = Point3::new(-0.1, 0.25, -2.0);

        let jacobian = pose_jacobian_2x6(&camera, &flipped, &point);

        let project = |pose: &ExpPose| {
            camera.project_if(&pose.to_isometry(), &point)
        };

        assert_columns_match(
            |c| jacobian.column(c).into_owned(),
            |c| {
                let mut deltas = [0.0; 6];
                deltas[c] = -STEP;
                (project(&flipped.corrected(&deltas)) - project(&flipped)) / STEP
            },
            6,
        );
    }

    #[test]
    fn orientation_jacobian_matches_finite_differences() {
        let camera = test_camera();
        let rotation = Vector3::new(0.4, -0.2, 0.15);
        let point = Point3::new(0.3, -0.2, -2.5);

        let jacobian = orientation_jacobian_2x3(&camera, &rotation, &point);

        let project = |w: &Vector3<f64>| {
            let flipped = ExpPose {
                rotation: *w,
                translation: Vector3::zeros(),
            };
            camera.project_if(&flipped.to_isometry(), &point)
        };

        assert_columns_match(
            |c| jacobian.column(c).into_owned(),
            |c| {
                let mut shifted = rotation;
                shifted[c] += STEP;
                (project(&shifted) - project(&rotation)) / STEP
            },
            3,
        );
    }

    #[test]
    fn intrinsics_jacobian_matches_finite_differences() {
        let camera = test_camera();
        let flipped = flipped_test_pose();
        let point = Point3::new(0.15, -0.1, -1.8);

        let jacobian = intrinsics_jacobian_2x8(&camera, &flipped, &point);

        let project_with = |params: &[f64; 8]| {
            let camera = Camera::from_params_with_distortion(
                640, 480, params[0], params[1], params[2], params[3], params[4], params[5],
                params[6], params[7],
            )
            .unwrap();
            camera.project_if(&flipped, &point)
        };

        let (k1, k2, _k3, p1, p2) = camera.distortion();
        let base = [
            camera.fx(),
            camera.fy(),
            camera.cx(),
            camera.cy(),
            k1,
            k2,
            p1,
            p2,
        ];

        assert_columns_match(
            |c| jacobian.column(c).into_owned(),
            |c| {
                let mut shifted = base;
                shifted[c] += STEP;
                (project_with(&shifted) - project_with(&base)) / STEP
            },
            8,
        );
    }
}
