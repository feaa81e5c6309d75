use nalgebra::{
    DMatrix, Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector2, Vector3,
};
use rand::Rng;

use sfm_camera::{inverted_flipped_to_standard, Camera};

/// Result of the two-view relative pose recovery.
///
/// The first camera has the identity standard pose; the scene scale is fixed
/// by a unit-length baseline.
#[derive(Debug, Clone)]
pub struct TwoViewPose {
    pub world_t_camera_b: Isometry3<f64>,
    pub object_points: Vec<Point3<f64>>,
    pub valid_indices: Vec<usize>,
}

/// Estimates the essential matrix from 8+ normalized (projection-frame)
/// correspondences with the normalized 8-point algorithm:
/// `x_b^T E x_a = 0`.
pub fn essential_8_point(
    normalized_a: &[Vector2<f64>],
    normalized_b: &[Vector2<f64>],
) -> Option<Matrix3<f64>> {
    debug_assert_eq!(normalized_a.len(), normalized_b.len());

    if normalized_a.len() < 8 {
        return None;
    }

    let (shift_a, scale_a) = conditioning(normalized_a)?;
    let (shift_b, scale_b) = conditioning(normalized_b)?;

    let mut a = DMatrix::zeros(normalized_a.len(), 9);
    for (n, (pa, pb)) in normalized_a.iter().zip(normalized_b.iter()).enumerate() {
        let xa = (pa.x - shift_a.x) * scale_a;
        let ya = (pa.y - shift_a.y) * scale_a;
        let xb = (pb.x - shift_b.x) * scale_b;
        let yb = (pb.y - shift_b.y) * scale_b;

        a[(n, 0)] = xb * xa;
        a[(n, 1)] = xb * ya;
        a[(n, 2)] = xb;
        a[(n, 3)] = yb * xa;
        a[(n, 4)] = yb * ya;
        a[(n, 5)] = yb;
        a[(n, 6)] = xa;
        a[(n, 7)] = ya;
        a[(n, 8)] = 1.0;
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let e = v_t.row(v_t.nrows() - 1);

    let raw = Matrix3::new(e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8]);

    // Undo the conditioning transforms: E = T_b^T * E' * T_a.
    let t_a = conditioning_matrix(&shift_a, scale_a);
    let t_b = conditioning_matrix(&shift_b, scale_b);
    let unconditioned = t_b.transpose() * raw * t_a;

    // Enforce the rank-2 essential structure with equal singular values.
    let svd = unconditioned.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let sigma = (svd.singular_values[0] + svd.singular_values[1]) * 0.5;

    Some(u * Matrix3::from_diagonal(&Vector3::new(sigma, sigma, 0.0)) * v_t)
}

fn conditioning(points: &[Vector2<f64>]) -> Option<(Vector2<f64>, f64)> {
    let mut centroid = Vector2::zeros();
    for p in points {
        centroid += p;
    }
    centroid /= points.len() as f64;

    let mean_distance =
        points.iter().map(|p| (p - centroid).norm()).sum::<f64>() / points.len() as f64;
    if mean_distance < 1e-12 {
        return None;
    }

    Some((centroid, std::f64::consts::SQRT_2 / mean_distance))
}

fn conditioning_matrix(shift: &Vector2<f64>, scale: f64) -> Matrix3<f64> {
    Matrix3::new(
        scale,
        0.0,
        -scale * shift.x,
        0.0,
        scale,
        -scale * shift.y,
        0.0,
        0.0,
        1.0,
    )
}

/// The four `(rotation, translation)` decompositions of an essential matrix,
/// with `x_b = R x_a + t` in projection-frame coordinates.
pub fn decompose_essential(essential: &Matrix3<f64>) -> Option<[(Rotation3<f64>, Vector3<f64>); 4]> {
    let svd = essential.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let fix = |m: Matrix3<f64>| {
        if m.determinant() < 0.0 {
            -m
        } else {
            m
        }
    };

    let r1 = fix(u * w * v_t);
    let r2 = fix(u * w.transpose() * v_t);
    let t = u.column(2).into_owned();

    Some([
        (Rotation3::from_matrix_unchecked(r1), t),
        (Rotation3::from_matrix_unchecked(r1), -t),
        (Rotation3::from_matrix_unchecked(r2), t),
        (Rotation3::from_matrix_unchecked(r2), -t),
    ])
}

/// Triangulates a normalized correspondence under a relative projection-frame
/// transform `x_b = R x_a + t`; returns the point in the a-frame.
fn triangulate_relative(
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    normalized_a: &Vector2<f64>,
    normalized_b: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let d_a = Vector3::new(normalized_a.x, normalized_a.y, 1.0);
    let d_b_in_a = rotation.inverse() * Vector3::new(normalized_b.x, normalized_b.y, 1.0);
    let origin_b = rotation.inverse() * (-translation);

    let w = -origin_b;
    let a = d_a.dot(&d_a);
    let b = d_a.dot(&d_b_in_a);
    let c = d_b_in_a.dot(&d_b_in_a);
    let d = d_a.dot(&w);
    let e = d_b_in_a.dot(&w);

    let denominator = a * c - b * b;
    if denominator.abs() < 1e-12 {
        return None;
    }

    let s = (b * e - c * d) / denominator;
    let t = (a * e - b * d) / denominator;

    Some((d_a * s + origin_b + d_b_in_a * t) * 0.5)
}

/// Recovers the relative pose of two views of the same scene and the 3-D
/// structure of the inlier correspondences.
///
/// The first view receives the identity standard pose; the second view's
/// pose and the object points are determined up to the unit-baseline scale.
/// Correspondences are scored by the reprojection error in both views.
pub fn two_view_pose<R: Rng + ?Sized>(
    camera: &Camera,
    image_points_a: &[Vector2<f64>],
    image_points_b: &[Vector2<f64>],
    rng: &mut R,
    iterations: usize,
    max_sqr_error: f64,
    minimal_valid: usize,
) -> Option<TwoViewPose> {
    debug_assert_eq!(image_points_a.len(), image_points_b.len());

    let count = image_points_a.len();
    if count < 8 || minimal_valid < 2 {
        return None;
    }

    let normalized_a: Vec<Vector2<f64>> = image_points_a
        .iter()
        .map(|p| camera.normalized_coordinates(p))
        .collect();
    let normalized_b: Vec<Vector2<f64>> = image_points_b
        .iter()
        .map(|p| camera.normalized_coordinates(p))
        .collect();

    let mut best: Option<(usize, Rotation3<f64>, Vector3<f64>)> = None;

    for _ in 0..iterations {
        let sample = sample_indices(rng, count, 8);

        let sample_a: Vec<Vector2<f64>> = sample.iter().map(|&i| normalized_a[i]).collect();
        let sample_b: Vec<Vector2<f64>> = sample.iter().map(|&i| normalized_b[i]).collect();

        let Some(essential) = essential_8_point(&sample_a, &sample_b) else {
            continue;
        };
        let Some(candidates) = decompose_essential(&essential) else {
            continue;
        };

        for (rotation, translation) in candidates {
            let inliers = count_inliers(
                camera,
                &rotation,
                &translation,
                &normalized_a,
                image_points_a,
                image_points_b,
                max_sqr_error,
            );

            if best.as_ref().map_or(true, |(best_count, _, _)| inliers > *best_count) {
                best = Some((inliers, rotation, translation));
            }
        }
    }

    let (_, rotation, translation) = best?;

    // Final triangulation of all correspondences under the best hypothesis.
    let flipped_a = sfm_camera::standard_to_inverted_flipped(&Isometry3::identity());
    let flipped_b = Isometry3::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_rotation_matrix(&rotation),
    ) * flipped_a;
    let world_t_camera_b = inverted_flipped_to_standard(&flipped_b);

    let mut object_points = Vec::new();
    let mut valid_indices = Vec::new();

    for index in 0..count {
        let Some(point_a_frame) =
            triangulate_relative(&rotation, &translation, &normalized_a[index], &normalized_b[index])
        else {
            continue;
        };

        if point_a_frame.z <= f64::EPSILON {
            continue;
        }

        // a-frame (projection frame of the identity pose) -> world.
        let world_point = Point3::from(flipped_a.inverse_transform_point(&Point3::from(point_a_frame)).coords);

        let error_a = (camera.project(&Isometry3::identity(), &world_point)
            - image_points_a[index])
            .norm_squared();
        let error_b =
            (camera.project(&world_t_camera_b, &world_point) - image_points_b[index]).norm_squared();

        if error_a <= max_sqr_error && error_b <= max_sqr_error {
            object_points.push(world_point);
            valid_indices.push(index);
        }
    }

    if object_points.len() < minimal_valid {
        return None;
    }

    Some(TwoViewPose {
        world_t_camera_b,
        object_points,
        valid_indices,
    })
}

fn count_inliers(
    camera: &Camera,
    rotation: &Rotation3<f64>,
    translation: &Vector3<f64>,
    normalized_a: &[Vector2<f64>],
    image_points_a: &[Vector2<f64>],
    image_points_b: &[Vector2<f64>],
    max_sqr_error: f64,
) -> usize {
    let flipped_a = sfm_camera::standard_to_inverted_flipped(&Isometry3::identity());
    let flipped_b = Isometry3::from_parts(
        Translation3::from(*translation),
        UnitQuaternion::from_rotation_matrix(rotation),
    ) * flipped_a;
    let world_t_camera_b = inverted_flipped_to_standard(&flipped_b);

    let mut inliers = 0;
    for index in 0..normalized_a.len() {
        let normalized_b = camera.normalized_coordinates(&image_points_b[index]);
        let Some(point_a_frame) =
            triangulate_relative(rotation, translation, &normalized_a[index], &normalized_b)
        else {
            continue;
        };

        // Cheirality: the point has to lie in front of both views.
        if point_a_frame.z <= f64::EPSILON
            || (rotation * point_a_frame + translation).z <= f64::EPSILON
        {
            continue;
        }

        let world_point =
            Point3::from(flipped_a.inverse_transform_point(&Point3::from(point_a_frame)).coords);

        let error_a = (camera.project(&Isometry3::identity(), &world_point)
            - image_points_a[index])
            .norm_squared();
        let error_b =
            (camera.project(&world_t_camera_b, &world_point) - image_points_b[index]).norm_squared();

        if error_a <= max_sqr_error && error_b <= max_sqr_error {
            inliers += 1;
        }
    }

    inliers
}

/// Draws `count` distinct indices from `[0, total)`.
pub(crate) fn sample_indices<R: Rng + ?Sized>(
    rng: &mut R,
    total: usize,
    count: usize,
) -> Vec<usize> {
    debug_assert!(count <= total);

    let mut indices = Vec::with_capacity(count);
    while indices.len() < count {
        let candidate = rng.random_range(0..total);
        if !indices.contains(&candidate) {
            indices.push(candidate);
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn camera() -> Camera {
        Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
    }

    fn cube_points() -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    points.push(Point3::new(
                        x as f64 * 0.3 - 0.3,
                        y as f64 * 0.25 - 0.25,
                        -2.0 - z as f64 * 0.3,
                    ));
                }
            }
        }
        points
    }

    #[test]
    fn recovers_relative_pose_up_to_scale() {
        let camera = camera();
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let pose_b = Isometry3::from_parts(
            Translation3::new(0.3, 0.05, 0.0),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.1, 0.02)),
        );

        let points = cube_points();
        let image_a: Vec<Vector2<f64>> = points
            .iter()
            .map(|p| camera.project(&Isometry3::identity(), p))
            .collect();
        let image_b: Vec<Vector2<f64>> = points.iter().map(|p| camera.project(&pose_b, p)).collect();

        let result = two_view_pose(&camera, &image_a, &image_b, &mut rng, 30, 2.0, 10).unwrap();

        assert!(result.object_points.len() >= 20);

        // The baseline direction must match; the magnitude is normalized.
        let estimated = result.world_t_camera_b.translation.vector.normalize();
        let truth = pose_b.translation.vector.normalize();
        assert_relative_eq!(estimated.dot(&truth), 1.0, epsilon = 1e-4);

        // The rotation is scale-free and must match directly.
        assert!(result
            .world_t_camera_b
            .rotation
            .angle_to(&pose_b.rotation)
            .abs()
            < 1e-3);

        // Reconstructed points match ground truth after re-scaling.
        let scale = pose_b.translation.vector.norm()
            / result.world_t_camera_b.translation.vector.norm();
        for (&index, point) in result.valid_indices.iter().zip(result.object_points.iter()) {
            let scaled = point.coords * scale;
            assert_relative_eq!(scaled, points[index].coords, epsilon = 1e-3);
        }
    }

    #[test]
    fn rejects_degenerate_input() {
        let camera = camera();
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let image: Vec<Vector2<f64>> = (0..10).map(|n| Vector2::new(n as f64, 0.0)).collect();
        assert!(two_view_pose(&camera, &image, &image, &mut rng, 10, 2.0, 5).is_none());
    }
}
