//! Camera-motion classification over synthetic sequences.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};

use obs_database::Database;
use sfm_camera::Camera;
use sfm_solver::{determine_camera_motion, MotionThresholds};

fn camera() -> Camera {
    Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap()
}

fn populate(database: &mut Database, camera: &Camera, poses: &[Isometry3<f64>], points: &[Point3<f64>]) {
    for (pose_id, pose) in poses.iter().enumerate() {
        database.add_pose(pose_id as u32, Some(*pose));
    }

    for point in points {
        let id = database.add_object_point(Some(*point));
        for (pose_id, pose) in poses.iter().enumerate() {
            let projected = camera.project(pose, point);
            if camera.is_inside(&projected) {
                database.add_observation(pose_id as u32, id, projected);
            }
        }
    }
}

#[test]
fn pure_rotation_classifies_rotational() {
    let camera = camera();
    let mut database = Database::new();

    // 30 frames sweeping +-15 degrees about the y-axis.
    let poses: Vec<Isometry3<f64>> = (0..30)
        .map(|n| {
            let angle = (-15.0 + n as f64 * 30.0 / 29.0).to_radians();
            Isometry3::from_parts(
                Translation3::identity(),
                UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle),
            )
        })
        .collect();

    // Points at mixed depths straight ahead; under a sole rotation the
    // observation rays stay pinned to the camera centre.
    let points: Vec<Point3<f64>> = (0..40)
        .map(|n| {
            Point3::new(
                ((n % 8) as f64 - 3.5) * 0.4,
                ((n / 8) as f64 - 2.0) * 0.3,
                -1.5 - (n % 5) as f64 * 0.5,
            )
        })
        .collect();

    populate(&mut database, &camera, &poses, &points);

    let motion = determine_camera_motion(
        &database,
        &camera,
        0,
        29,
        true,
        &MotionThresholds::default(),
        None,
    );

    assert!(motion.is_rotational(), "got {motion}");
    assert!(!motion.is_translational(), "got {motion}");
}

#[test]
fn pure_translation_classifies_translational() {
    let camera = camera();
    let mut database = Database::new();

    // 30 frames translating 0.5 m along x.
    let poses: Vec<Isometry3<f64>> = (0..30)
        .map(|n| Isometry3::translation(n as f64 * 0.5 / 29.0, 0.0, 0.0))
        .collect();

    let points: Vec<Point3<f64>> = (0..40)
        .map(|n| {
            Point3::new(
                ((n % 8) as f64 - 3.5) * 0.3,
                ((n / 8) as f64 - 2.0) * 0.25,
                -1.8 - (n % 4) as f64 * 0.3,
            )
        })
        .collect();

    populate(&mut database, &camera, &poses, &points);

    let motion = determine_camera_motion(
        &database,
        &camera,
        0,
        29,
        true,
        &MotionThresholds::default(),
        None,
    );

    assert!(motion.is_translational(), "got {motion}");
    assert!(!motion.is_rotational(), "got {motion}");
}

#[test]
fn single_frame_is_static() {
    let camera = camera();
    let mut database = Database::new();

    populate(
        &mut database,
        &camera,
        &[Isometry3::identity()],
        &[Point3::new(0.0, 0.0, -2.0)],
    );

    let motion = determine_camera_motion(
        &database,
        &camera,
        0,
        0,
        true,
        &MotionThresholds::default(),
        None,
    );

    assert!(motion.is_static());
}
