//! Two-keyframe bootstrap over a noisy synthetic stereo scene.

use nalgebra::{Isometry3, Point3, Vector2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use obs_database::Database;
use sfm_camera::Camera;
use sfm_solver::{
    determine_initial_object_points_from_sparse_key_frames, RelativeThreshold,
};

fn gaussian(rng: &mut ChaCha8Rng, sigma: f64) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

#[test]
fn stereo_bootstrap_recovers_cube_points() {
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let camera = Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap();

    // 20 object points within a unit cube in front of the cameras.
    let truth: Vec<Point3<f64>> = (0..20)
        .map(|_| {
            Point3::new(
                rng.random_range(-0.5..0.5),
                rng.random_range(-0.5..0.5),
                rng.random_range(-1.8..-0.8),
            )
        })
        .collect();

    // Two cameras 0.3 m apart.
    let poses = [
        Isometry3::identity(),
        Isometry3::translation(0.3, 0.0, 0.0),
    ];

    let mut database = Database::new();
    for (pose_id, pose) in poses.iter().enumerate() {
        database.add_pose(pose_id as u32, Some(*pose));
    }

    let mut ids = Vec::new();
    for point in &truth {
        // Positions stay unknown; the bootstrap has to find them.
        let id = database.add_object_point(None);
        ids.push(id);

        for (pose_id, pose) in poses.iter().enumerate() {
            let noise = Vector2::new(gaussian(&mut rng, 0.5), gaussian(&mut rng, 0.5));
            database.add_observation(pose_id as u32, id, camera.project(pose, point) + noise);
        }
    }

    let initial = determine_initial_object_points_from_sparse_key_frames(
        &database,
        &camera,
        &mut rng,
        0,
        0,
        1,
        0.0,
        &RelativeThreshold::new(10, 0.5, 100),
        2,
        10,
        3.5 * 3.5,
        None,
    )
    .unwrap();

    assert!(
        initial.object_points.len() >= 15,
        "only {} points survived",
        initial.object_points.len()
    );
    assert_eq!(initial.used_pose_ids.len(), 2);

    // The reconstruction lives in the first camera's frame at an arbitrary
    // scale; solve for the least-squares scale factor and compare.
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (estimated, &id) in initial.object_points.iter().zip(initial.object_point_ids.iter()) {
        let truth = truth[ids.iter().position(|&i| i == id).unwrap()];
        numerator += estimated.coords.dot(&truth.coords);
        denominator += estimated.coords.norm_squared();
    }
    let scale = numerator / denominator;
    assert!(scale.is_finite() && scale > 0.0);

    // At least 15 points reconstruct to within 2 cm of ground truth.
    let accurate = initial
        .object_points
        .iter()
        .zip(initial.object_point_ids.iter())
        .filter(|(estimated, &id)| {
            let truth = truth[ids.iter().position(|&i| i == id).unwrap()];
            (estimated.coords * scale - truth.coords).norm() < 0.02
        })
        .count();

    assert!(accurate >= 15, "only {accurate} accurate points");
}
