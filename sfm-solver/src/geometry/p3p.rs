use nalgebra::{DMatrix, Isometry3, Matrix3, Point3, Translation3, UnitQuaternion, Vector2, Vector3};

use sfm_camera::{inverted_flipped_to_standard, Camera};

/// Closed-form three-point pose (Grunert's solution).
///
/// Returns up to four standard `world_T_camera` candidates; disambiguation
/// is left to the caller (typically by scoring a fourth correspondence or a
/// RANSAC consensus).
pub fn p3p(
    camera: &Camera,
    object_points: &[Point3<f64>; 3],
    image_points: &[Vector2<f64>; 3],
) -> Vec<Isometry3<f64>> {
    let q1 = camera.bearing_if(&image_points[0]).into_inner();
    let q2 = camera.bearing_if(&image_points[1]).into_inner();
    let q3 = camera.bearing_if(&image_points[2]).into_inner();

    let a = (object_points[1] - object_points[2]).norm();
    let b = (object_points[0] - object_points[2]).norm();
    let c = (object_points[0] - object_points[1]).norm();

    if a < 1e-12 || b < 1e-12 || c < 1e-12 {
        return Vec::new();
    }

    let cos_alpha = q2.dot(&q3);
    let cos_beta = q1.dot(&q3);
    let cos_gamma = q1.dot(&q2);

    let a2 = a * a;
    let b2 = b * b;
    let c2 = c * c;

    // Grunert's quartic in v = s3 / s1.
    let aq = (a2 - c2) / b2;

    let a4 = (aq - 1.0).powi(2) - 4.0 * c2 / b2 * cos_alpha * cos_alpha;
    let a3 = 4.0
        * (aq * (1.0 - aq) * cos_beta - (1.0 - (a2 + c2) / b2) * cos_alpha * cos_gamma
            + 2.0 * c2 / b2 * cos_alpha * cos_alpha * cos_beta);
    let a2_coeff = 2.0
        * (aq * aq - 1.0
            + 2.0 * aq * aq * cos_beta * cos_beta
            + 2.0 * (b2 - c2) / b2 * cos_alpha * cos_alpha
            - 4.0 * (a2 + c2) / b2 * cos_alpha * cos_beta * cos_gamma
            + 2.0 * (b2 - a2) / b2 * cos_gamma * cos_gamma);
    let a1 = 4.0
        * (-aq * (1.0 + aq) * cos_beta + 2.0 * a2 / b2 * cos_gamma * cos_gamma * cos_beta
            - (1.0 - (a2 + c2) / b2) * cos_alpha * cos_gamma);
    let a0 = (1.0 + aq).powi(2) - 4.0 * a2 / b2 * cos_gamma * cos_gamma;

    let mut poses = Vec::new();

    for v in real_roots(&[a4, a3, a2_coeff, a1, a0]) {
        if !(v > 0.0) {
            continue;
        }

        let denominator = 2.0 * (cos_gamma - v * cos_alpha);
        if denominator.abs() < 1e-12 {
            continue;
        }

        let u = ((-1.0 + aq) * v * v - 2.0 * aq * cos_beta * v + 1.0 + aq) / denominator;
        if !(u > 0.0) {
            continue;
        }

        let s1_sqr = b2 / (1.0 + v * v - 2.0 * v * cos_beta);
        if !(s1_sqr > 0.0) {
            continue;
        }

        let s1 = s1_sqr.sqrt();
        let s2 = u * s1;
        let s3 = v * s1;

        let camera_points = [q1 * s1, q2 * s2, q3 * s3];

        if let Some(flipped) = absolute_orientation(object_points, &camera_points) {
            let pose = inverted_flipped_to_standard(&flipped);
            if pose.translation.vector.iter().all(|v| v.is_finite()) {
                poses.push(pose);
            }
        }
    }

    poses
}

/// Rigid transform mapping the world points onto the camera-frame points
/// (Kabsch alignment).
fn absolute_orientation(
    world_points: &[Point3<f64>; 3],
    camera_points: &[Vector3<f64>; 3],
) -> Option<Isometry3<f64>> {
    let world_centroid =
        (world_points[0].coords + world_points[1].coords + world_points[2].coords) / 3.0;
    let camera_centroid = (camera_points[0] + camera_points[1] + camera_points[2]) / 3.0;

    let mut h = Matrix3::zeros();
    for (world, camera) in world_points.iter().zip(camera_points.iter()) {
        h += (camera - camera_centroid) * (world.coords - world_centroid).transpose();
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.set_column(2, &(-u.column(2)));
        rotation = u_fixed * v_t;
    }

    let rotation = UnitQuaternion::from_matrix(&rotation);
    let translation = camera_centroid - rotation * world_centroid;

    Some(Isometry3::from_parts(Translation3::from(translation), rotation))
}

/// Real roots of a polynomial given by coefficients from the highest to the
/// lowest degree, via the companion-matrix eigenvalues.
fn real_roots(coefficients: &[f64]) -> Vec<f64> {
    // Strip (near-)zero leading coefficients.
    let mut start = 0;
    while start < coefficients.len() && coefficients[start].abs() < 1e-14 {
        start += 1;
    }
    let coefficients = &coefficients[start..];

    let degree = coefficients.len().saturating_sub(1);
    if degree == 0 {
        return Vec::new();
    }
    if degree == 1 {
        return vec![-coefficients[1] / coefficients[0]];
    }

    let leading = coefficients[0];
    let mut companion = DMatrix::zeros(degree, degree);
    for i in 1..degree {
        companion[(i, i - 1)] = 1.0;
    }
    for i in 0..degree {
        companion[(i, degree - 1)] = -coefficients[degree - i] / leading;
    }

    companion
        .complex_eigenvalues()
        .iter()
        .filter(|root| root.im.abs() < 1e-8 * root.re.abs().max(1.0))
        .map(|root| root.re)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Camera {
        Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
    }

    #[test]
    fn real_roots_of_factored_quartic() {
        // (x - 1)(x - 2)(x + 3)(x - 0.5)
        let coefficients = [1.0, -0.5, -6.5, 9.5, -3.0];
        let mut roots = real_roots(&coefficients);
        roots.sort_by(|a, b| a.partial_cmp(b).unwrap());

        assert_eq!(roots.len(), 4);
        assert_relative_eq!(roots[0], -3.0, epsilon = 1e-8);
        assert_relative_eq!(roots[1], 0.5, epsilon = 1e-8);
        assert_relative_eq!(roots[2], 1.0, epsilon = 1e-8);
        assert_relative_eq!(roots[3], 2.0, epsilon = 1e-8);
    }

    #[test]
    fn recovers_synthetic_pose() {
        let camera = camera();
        let pose = Isometry3::from_parts(
            Translation3::new(0.4, -0.2, 0.6),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.3, -0.05)),
        );

        let object_points = [
            Point3::new(0.0, 0.0, -2.0),
            Point3::new(0.5, 0.1, -2.4),
            Point3::new(-0.3, 0.4, -1.8),
        ];
        let image_points = [
            camera.project(&pose, &object_points[0]),
            camera.project(&pose, &object_points[1]),
            camera.project(&pose, &object_points[2]),
        ];

        let candidates = p3p(&camera, &object_points, &image_points);
        assert!(!candidates.is_empty());

        // One candidate must match the true pose.
        let best = candidates
            .iter()
            .map(|candidate| {
                (candidate.translation.vector - pose.translation.vector).norm()
                    + candidate.rotation.angle_to(&pose.rotation)
            })
            .fold(f64::MAX, f64::min);

        assert!(best < 1e-6, "no candidate near ground truth: {best}");
    }

    #[test]
    fn collinear_points_yield_nothing_useful() {
        let camera = camera();
        let pose = Isometry3::identity();

        let object_points = [
            Point3::new(0.0, 0.0, -2.0),
            Point3::new(0.0, 0.0, -2.0),
            Point3::new(0.1, 0.0, -2.0),
        ];
        let image_points = [
            camera.project(&pose, &object_points[0]),
            camera.project(&pose, &object_points[1]),
            camera.project(&pose, &object_points[2]),
        ];

        assert!(p3p(&camera, &object_points, &image_points).is_empty());
    }
}
