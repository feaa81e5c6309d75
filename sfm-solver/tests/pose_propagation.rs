//! Bidirectional pose propagation over an orbiting camera sequence.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use obs_database::Database;
use sfm_camera::Camera;
use sfm_solver::{update_poses, CameraMotion, PoseEstimationOptions};

/// Camera on a circle of radius 2 m, rotated `angle` radians about the
/// world y-axis, always looking at the scene centre.
fn orbit_pose(angle: f64) -> Isometry3<f64> {
    let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle);

    // At angle 0 the camera sits at the origin looking down -z towards the
    // scene at z = -2; the orbit centre is the scene centre.
    let centre = Vector3::new(0.0, 0.0, -2.0);
    let offset = rotation * Vector3::new(0.0, 0.0, 2.0);

    Isometry3::from_parts(Translation3::from(centre + offset), rotation)
}

#[test]
fn update_poses_recovers_orbit() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);

    let camera = Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap();

    // 50 static points around the scene centre.
    let points: Vec<Point3<f64>> = (0..50)
        .map(|_| {
            Point3::new(
                rng.random_range(-0.6..0.6),
                rng.random_range(-0.5..0.5),
                rng.random_range(-2.6..-1.4),
            )
        })
        .collect();

    let truth: Vec<Isometry3<f64>> = (0..10)
        .map(|n| orbit_pose((n as f64 * 5.0).to_radians()))
        .collect();

    let mut database = Database::new();
    for (pose_id, _) in truth.iter().enumerate() {
        database.add_pose(pose_id as u32, None);
    }

    for point in &points {
        let id = database.add_object_point(Some(*point));
        for (pose_id, pose) in truth.iter().enumerate() {
            let projected = camera.project(pose, point);
            if camera.is_inside(&projected) {
                database.add_observation(pose_id as u32, id, projected);
            }
        }
    }

    // Ground truth at frame 0 seeds the propagation.
    database.set_pose(0, Some(truth[0]));

    let options = PoseEstimationOptions {
        minimal_correspondences: 5,
        ..Default::default()
    };

    let (average_error, valid_poses) = update_poses(
        &mut database,
        &camera,
        CameraMotion::UNKNOWN,
        &mut rng,
        0,
        0,
        9,
        &options,
        None,
    )
    .unwrap();

    assert_eq!(valid_poses, 10);
    assert!(average_error < 1e-6);

    for (pose_id, truth_pose) in truth.iter().enumerate() {
        let recovered = database.pose(pose_id as u32).expect("valid pose");

        let rotation_error = recovered.rotation.angle_to(&truth_pose.rotation).to_degrees();
        let translation_error =
            (recovered.translation.vector - truth_pose.translation.vector).norm();

        assert!(
            rotation_error < 0.1,
            "frame {pose_id}: rotation error {rotation_error} deg"
        );
        assert!(
            translation_error < 0.005,
            "frame {pose_id}: translation error {translation_error} m"
        );
    }
}

#[test]
fn poses_with_large_error_are_invalidated() {
    let mut rng = ChaCha8Rng::seed_from_u64(99);

    let camera = Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap();

    let points: Vec<Point3<f64>> = (0..30)
        .map(|n| {
            Point3::new(
                (n % 6) as f64 * 0.2 - 0.5,
                (n / 6) as f64 * 0.2 - 0.4,
                -2.0 - (n % 3) as f64 * 0.2,
            )
        })
        .collect();

    let truth: Vec<Isometry3<f64>> = (0..4)
        .map(|n| Isometry3::translation(n as f64 * 0.1, 0.0, 0.0))
        .collect();

    let mut database = Database::new();
    for (pose_id, _) in truth.iter().enumerate() {
        database.add_pose(pose_id as u32, None);
    }

    for point in &points {
        let id = database.add_object_point(Some(*point));
        for (pose_id, pose) in truth.iter().enumerate() {
            let mut projected = camera.project(pose, point);
            // Frame 2 carries inconsistent observations.
            if pose_id == 2 {
                projected += nalgebra::Vector2::new(
                    rng.random_range(-80.0..80.0),
                    rng.random_range(-80.0..80.0),
                );
            }
            database.add_observation(pose_id as u32, id, projected);
        }
    }

    let options = PoseEstimationOptions {
        minimal_correspondences: 5,
        ..Default::default()
    };

    let (_, valid_poses) = update_poses(
        &mut database,
        &camera,
        CameraMotion::UNKNOWN,
        &mut rng,
        0,
        0,
        3,
        &options,
        None,
    )
    .unwrap();

    assert!(valid_poses < 4);
    assert!(database.pose(2).is_none());
    assert!(database.pose(1).is_some());
}
