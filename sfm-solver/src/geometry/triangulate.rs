use nalgebra::{DMatrix, Isometry3, Point3, Vector2, Vector3};

use sfm_camera::{standard_to_inverted_flipped, Camera};

/// Triangulates a point as the midpoint of the closest segment between two
/// observation rays. Returns `None` for (near-)parallel rays.
pub fn triangulate_midpoint(
    camera: &Camera,
    world_t_camera_a: &Isometry3<f64>,
    world_t_camera_b: &Isometry3<f64>,
    image_point_a: &Vector2<f64>,
    image_point_b: &Vector2<f64>,
) -> Option<Point3<f64>> {
    let (origin_a, direction_a) = camera.ray(world_t_camera_a, image_point_a);
    let (origin_b, direction_b) = camera.ray(world_t_camera_b, image_point_b);

    let d_a: Vector3<f64> = direction_a.into_inner();
    let d_b: Vector3<f64> = direction_b.into_inner();

    let w = origin_a - origin_b;
    let a = d_a.dot(&d_a);
    let b = d_a.dot(&d_b);
    let c = d_b.dot(&d_b);
    let d = d_a.dot(&w);
    let e = d_b.dot(&w);

    let denominator = a * c - b * b;
    if denominator.abs() < 1e-12 {
        return None;
    }

    let s = (b * e - c * d) / denominator;
    let t = (a * e - b * d) / denominator;

    let closest_a = origin_a + d_a * s;
    let closest_b = origin_b + d_b * t;

    Some(Point3::from((closest_a.coords + closest_b.coords) * 0.5))
}

/// Triangulates a point from two or more observations with the direct linear
/// transform over normalized (undistorted) camera coordinates.
pub fn triangulate_dlt(
    camera: &Camera,
    world_t_cameras: &[Isometry3<f64>],
    image_points: &[Vector2<f64>],
) -> Option<Point3<f64>> {
    debug_assert_eq!(world_t_cameras.len(), image_points.len());

    if world_t_cameras.len() < 2 {
        return None;
    }

    let mut a = DMatrix::zeros(world_t_cameras.len() * 2, 4);

    for (n, (pose, image_point)) in world_t_cameras.iter().zip(image_points.iter()).enumerate() {
        let flipped = standard_to_inverted_flipped(pose);
        let rotation = flipped.rotation.to_rotation_matrix();
        let translation = flipped.translation.vector;

        // Normalized projection-frame coordinates of the observation.
        let undistorted = camera.undistort(image_point);
        let yn = (undistorted.y - camera.cy()) / camera.fy();
        let xn = (undistorted.x - camera.cx() - camera.intrinsics().skew() * yn) / camera.fx();

        // Rows of [R | t] in the projection frame.
        let r = rotation.matrix();
        let rows = [
            [r[(0, 0)], r[(0, 1)], r[(0, 2)], translation.x],
            [r[(1, 0)], r[(1, 1)], r[(1, 2)], translation.y],
            [r[(2, 0)], r[(2, 1)], r[(2, 2)], translation.z],
        ];

        for c in 0..4 {
            a[(2 * n, c)] = xn * rows[2][c] - rows[0][c];
            a[(2 * n + 1, c)] = yn * rows[2][c] - rows[1][c];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(v_t.nrows() - 1);

    if h[3].abs() < 1e-12 {
        return None;
    }

    Some(Point3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, UnitQuaternion};

    fn camera() -> Camera {
        Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
    }

    fn poses() -> Vec<Isometry3<f64>> {
        vec![
            Isometry3::identity(),
            Isometry3::from_parts(
                Translation3::new(0.3, 0.0, 0.0),
                UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.05, 0.0)),
            ),
            Isometry3::from_parts(
                Translation3::new(0.15, 0.2, 0.1),
                UnitQuaternion::from_scaled_axis(Vector3::new(0.04, 0.03, 0.0)),
            ),
        ]
    }

    #[test]
    fn midpoint_recovers_observed_point() {
        let camera = camera();
        let poses = poses();
        let point = Point3::new(0.2, -0.1, -2.0);

        let a = camera.project(&poses[0], &point);
        let b = camera.project(&poses[1], &point);

        let triangulated = triangulate_midpoint(&camera, &poses[0], &poses[1], &a, &b).unwrap();
        assert_relative_eq!(triangulated.coords, point.coords, epsilon = 1e-9);
    }

    #[test]
    fn midpoint_rejects_parallel_rays() {
        let camera = camera();
        let pose_a = Isometry3::identity();
        // Pure forward translation along the viewing axis of the point keeps
        // the rays collinear.
        let pose_b = Isometry3::translation(0.0, 0.0, -0.5);
        let point = Point3::new(0.0, 0.0, -2.0);

        let a = camera.project(&pose_a, &point);
        let b = camera.project(&pose_b, &point);

        assert!(triangulate_midpoint(&camera, &pose_a, &pose_b, &a, &b).is_none());
    }

    #[test]
    fn dlt_recovers_observed_point_from_three_views() {
        let camera = camera();
        let poses = poses();
        let point = Point3::new(-0.3, 0.2, -2.5);

        let image_points: Vec<Vector2<f64>> =
            poses.iter().map(|pose| camera.project(pose, &point)).collect();

        let triangulated = triangulate_dlt(&camera, &poses, &image_points).unwrap();
        assert_relative_eq!(triangulated.coords, point.coords, epsilon = 1e-8);
    }
}
