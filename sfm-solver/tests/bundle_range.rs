//! Bundle adjustment over a pose-id range with covering keyframe selection.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};

use obs_database::Database;
use robust_lm::Estimator;
use sfm_camera::Camera;
use sfm_solver::optimize_object_points_with_variable_poses_in_range;

#[test]
fn range_bundle_refines_perturbed_points() {
    let camera = Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap();

    let truth_points: Vec<Point3<f64>> = (0..12)
        .map(|n| {
            Point3::new(
                ((n % 4) as f64 - 1.5) * 0.3,
                ((n / 4) as f64 - 1.0) * 0.3,
                -2.0 - (n % 3) as f64 * 0.2,
            )
        })
        .collect();

    let poses: Vec<Isometry3<f64>> = (0..8)
        .map(|n| {
            Isometry3::from_parts(
                Translation3::new(n as f64 * 0.12, 0.0, 0.0),
                UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.015 * n as f64, 0.0)),
            )
        })
        .collect();

    let mut database = Database::new();
    for (pose_id, pose) in poses.iter().enumerate() {
        database.add_pose(pose_id as u32, Some(*pose));
    }

    let mut ids = Vec::new();
    for (n, point) in truth_points.iter().enumerate() {
        // Stored positions are slightly off; the observations are exact.
        let sign = if n % 2 == 0 { 1.0 } else { -1.0 };
        let perturbed = Point3::new(
            point.x + sign * 0.02,
            point.y - sign * 0.015,
            point.z + sign * 0.01,
        );

        let id = database.add_object_point(Some(perturbed));
        ids.push(id);
        for (pose_id, pose) in poses.iter().enumerate() {
            database.add_observation(pose_id as u32, id, camera.project(pose, point));
        }
    }

    let outcome = optimize_object_points_with_variable_poses_in_range(
        &database,
        &camera,
        0,
        7,
        &ids,
        3,
        3,
        Estimator::Square,
        50,
    )
    .unwrap();

    assert!(outcome.keyframe_ids.len() >= 3);
    assert_eq!(outcome.object_point_ids.len(), ids.len());
    assert!(outcome.final_error < outcome.initial_error);
    assert!(outcome.final_error < 1e-6);

    // The refined points converge towards ground truth (up to the gauge
    // freedom left by the damped bundle, which stays near the initial
    // poses).
    for (point, &id) in outcome.object_points.iter().zip(outcome.object_point_ids.iter()) {
        let index = ids.iter().position(|&i| i == id).unwrap();
        let error = (point - truth_points[index]).norm();
        assert!(error < 1e-2, "point {id} off by {error}");
    }
}
