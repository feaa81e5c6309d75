//! Determination and refinement of unlocated object points.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use obs_database::Database;
use robust_lm::Estimator;
use sfm_camera::Camera;
use sfm_solver::{
    determine_unknown_object_points, optimize_object_points_with_fixed_poses, CameraMotion,
};

fn camera() -> Camera {
    Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
}

fn populated_database(
    camera: &Camera,
    truth: &[Point3<f64>],
    located: bool,
) -> (Database, Vec<u32>) {
    let poses: Vec<Isometry3<f64>> = (0..6)
        .map(|n| {
            Isometry3::from_parts(
                Translation3::new(n as f64 * 0.15, 0.0, 0.0),
                UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.02 * n as f64, 0.0)),
            )
        })
        .collect();

    let mut database = Database::new();
    for (pose_id, pose) in poses.iter().enumerate() {
        database.add_pose(pose_id as u32, Some(*pose));
    }

    let mut ids = Vec::new();
    for point in truth {
        let id = database.add_object_point(located.then_some(*point));
        ids.push(id);
        for (pose_id, pose) in poses.iter().enumerate() {
            database.add_observation(pose_id as u32, id, camera.project(pose, point));
        }
    }

    (database, ids)
}

fn truth_points() -> Vec<Point3<f64>> {
    (0..10)
        .map(|n| {
            Point3::new(
                ((n % 5) as f64 - 2.0) * 0.3,
                ((n / 5) as f64 - 0.5) * 0.4,
                -2.0 - (n % 3) as f64 * 0.3,
            )
        })
        .collect()
}

#[test]
fn triangulates_unlocated_points() {
    let camera = camera();
    let truth = truth_points();
    let (database, ids) = populated_database(&camera, &truth, false);

    let mut rng = ChaCha8Rng::seed_from_u64(33);

    let (points, new_ids, observations) = determine_unknown_object_points(
        &database,
        &camera,
        CameraMotion::UNKNOWN,
        &ids,
        &mut rng,
        2,
        Estimator::Square,
        3.5 * 3.5,
        3.5 * 3.5,
        None,
        None,
    )
    .unwrap();

    assert_eq!(new_ids.len(), truth.len());
    for ((point, &id), &count) in points.iter().zip(new_ids.iter()).zip(observations.iter()) {
        let index = ids.iter().position(|&i| i == id).unwrap();
        assert!((point - truth[index]).norm() < 1e-6);
        assert!(count >= 2);
    }
}

#[test]
fn refines_located_points_with_fixed_poses() {
    let camera = camera();
    let truth = truth_points();
    let (mut database, ids) = populated_database(&camera, &truth, true);

    // Offset the stored positions; the observations stay exact.
    for (&id, point) in ids.iter().zip(truth.iter()) {
        database.set_object_point_position(
            id,
            Some(Point3::new(point.x + 0.03, point.y - 0.02, point.z + 0.02)),
        );
    }

    let (points, optimized_ids, average_error) = optimize_object_points_with_fixed_poses(
        &database,
        &camera,
        CameraMotion::UNKNOWN,
        &ids,
        2,
        Estimator::Square,
        3.5 * 3.5,
        None,
        None,
    )
    .unwrap();

    assert_eq!(optimized_ids.len(), ids.len());
    assert!(average_error < 1e-8);
    for (point, &id) in points.iter().zip(optimized_ids.iter()) {
        let index = ids.iter().position(|&i| i == id).unwrap();
        assert!((point - truth[index]).norm() < 1e-6);
    }
}

#[test]
fn skips_points_with_too_few_valid_poses() {
    let camera = camera();
    let truth = truth_points();
    let (mut database, ids) = populated_database(&camera, &truth, false);

    // Invalidate all poses but one; triangulation becomes impossible.
    for pose_id in 1..6u32 {
        database.set_pose(pose_id, None);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(5);

    let (points, _, _) = determine_unknown_object_points(
        &database,
        &camera,
        CameraMotion::UNKNOWN,
        &ids,
        &mut rng,
        2,
        Estimator::Square,
        3.5 * 3.5,
        3.5 * 3.5,
        None,
        None,
    )
    .unwrap();

    assert!(points.is_empty());
}
