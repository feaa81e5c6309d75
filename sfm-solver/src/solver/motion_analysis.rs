//! Camera-motion classification over a frame range.

use nalgebra::Vector3;

use obs_database::{Database, PoseId};
use sfm_camera::Camera;

use crate::worker::execute_range_with;
use crate::CameraMotion;

/// Angle thresholds (radians) binning the translational and rotational
/// motion into tiny / moderate / significant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionThresholds {
    pub tiny_translation_observation_angle: f64,
    pub moderate_translation_observation_angle: f64,
    pub significant_translation_observation_angle: f64,
    pub tiny_rotation_angle: f64,
    pub moderate_rotation_angle: f64,
    pub significant_rotation_angle: f64,
}

impl Default for MotionThresholds {
    fn default() -> Self {
        Self {
            tiny_translation_observation_angle: 0.15f64.to_radians(),
            moderate_translation_observation_angle: 1.0f64.to_radians(),
            significant_translation_observation_angle: 5.0f64.to_radians(),
            tiny_rotation_angle: 0.25f64.to_radians(),
            moderate_rotation_angle: 5.0f64.to_radians(),
            significant_rotation_angle: 10.0f64.to_radians(),
        }
    }
}

/// Per-object-point observation accuracy: the median absolute cosine
/// between the mean observation direction and the individual observation
/// rays. Values near 1 mean the rays barely diverge (no parallax).
pub fn determine_object_point_accuracies(
    database: &Database,
    camera: &Camera,
    object_point_ids: &[u32],
    lower_frame: PoseId,
    upper_frame: PoseId,
    pool: Option<&rayon::ThreadPool>,
) -> Vec<f64> {
    let mut accuracies = vec![1.0f64; object_point_ids.len()];

    execute_range_with(pool, &mut accuracies, |chunk, offset, _| {
        for (i, slot) in chunk.iter_mut().enumerate() {
            let object_point_id = object_point_ids[offset + i];

            let mut directions: Vec<Vector3<f64>> = Vec::new();
            let mut mean = Vector3::zeros();

            for (pose_id, image_point) in
                database.observations_of_point_in_range(object_point_id, lower_frame, upper_frame)
            {
                let Some(pose) = database.pose(pose_id) else {
                    continue;
                };

                let (_, direction) = camera.ray(&pose, &image_point);
                mean += direction.into_inner();
                directions.push(direction.into_inner());
            }

            if directions.len() <= 1 {
                // cos(0): a single observation shows no parallax.
                *slot = 1.0;
                continue;
            }

            if mean.norm() < 1e-12 {
                // Parallel but opposite directions.
                *slot = 0.0;
                continue;
            }
            let mean = mean.normalize();

            let mut cosines: Vec<f64> =
                directions.iter().map(|d| mean.dot(d).abs()).collect();
            cosines.sort_by(|a, b| a.partial_cmp(b).expect("finite cosine"));
            *slot = cosines[cosines.len() / 2];
        }
    });

    accuracies
}

/// Per-frame cosines between each pose axis and the mean direction of that
/// axis across all valid poses of the range. Returns `(x, y, z)` cosine
/// vectors aligned with the valid poses.
pub fn determine_poses_orientation(
    database: &Database,
    lower_frame: PoseId,
    upper_frame: PoseId,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let poses: Vec<_> = database
        .valid_pose_ids(lower_frame, upper_frame)
        .into_iter()
        .map(|pose_id| database.pose(pose_id).expect("valid pose"))
        .collect();

    let mut x_mean = Vector3::zeros();
    let mut y_mean = Vector3::zeros();
    let mut z_mean = Vector3::zeros();

    let axes: Vec<(Vector3<f64>, Vector3<f64>, Vector3<f64>)> = poses
        .iter()
        .map(|pose| {
            let rotation = pose.rotation.to_rotation_matrix();
            let matrix = rotation.matrix();
            (
                matrix.column(0).into_owned(),
                matrix.column(1).into_owned(),
                matrix.column(2).into_owned(),
            )
        })
        .collect();

    for (x, y, z) in &axes {
        x_mean += x;
        y_mean += y;
        z_mean += z;
    }

    // If a mean direction cannot be normalized the scalar products are zero
    // anyway, which needs no further handling.
    let x_mean = x_mean.try_normalize(1e-12).unwrap_or_else(Vector3::zeros);
    let y_mean = y_mean.try_normalize(1e-12).unwrap_or_else(Vector3::zeros);
    let z_mean = z_mean.try_normalize(1e-12).unwrap_or_else(Vector3::zeros);

    let mut x_cosines = Vec::with_capacity(axes.len());
    let mut y_cosines = Vec::with_capacity(axes.len());
    let mut z_cosines = Vec::with_capacity(axes.len());

    for (x, y, z) in &axes {
        x_cosines.push(x_mean.dot(x));
        y_cosines.push(y_mean.dot(y));
        z_cosines.push(z_mean.dot(z));
    }

    (x_cosines, y_cosines, z_cosines)
}

fn median(values: &mut [f64]) -> f64 {
    debug_assert!(!values.is_empty());
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite value"));
    values[values.len() / 2]
}

/// Classifies the camera motion over `[lower_frame, upper_frame]`.
///
/// The translational magnitude comes from the 5th-percentile
/// observation-ray accuracy angle over the visible object points; the
/// rotational magnitude from the per-axis median cosine of the pose axes
/// against their mean directions.
pub fn determine_camera_motion(
    database: &Database,
    camera: &Camera,
    lower_frame: PoseId,
    upper_frame: PoseId,
    only_visible_object_points: bool,
    thresholds: &MotionThresholds,
    pool: Option<&rayon::ThreadPool>,
) -> CameraMotion {
    debug_assert!(lower_frame <= upper_frame);

    // A single frame is static in any case.
    if lower_frame == upper_frame {
        return CameraMotion::STATIC;
    }

    let object_point_ids = if only_visible_object_points {
        database.object_point_ids_in_range(lower_frame, upper_frame, true, false)
    } else {
        database.located_object_point_ids()
    };

    if object_point_ids.is_empty() {
        return CameraMotion::STATIC;
    }

    let mut accuracies = determine_object_point_accuracies(
        database,
        camera,
        &object_point_ids,
        lower_frame,
        upper_frame,
        pool,
    );
    accuracies.sort_by(|a, b| a.partial_cmp(b).expect("finite accuracy"));

    // The 5% quantile filters outliers.
    let translation_cosine = accuracies[accuracies.len() * 5 / 100];
    let translation_angle = translation_cosine.clamp(-1.0, 1.0).acos();

    let (mut x_cosines, mut y_cosines, mut z_cosines) =
        determine_poses_orientation(database, lower_frame, upper_frame);

    let rotation_cosine = if x_cosines.is_empty() {
        1.0
    } else {
        median(&mut x_cosines)
            .min(median(&mut y_cosines))
            .min(median(&mut z_cosines))
    };
    let rotation_angle = rotation_cosine.clamp(-1.0, 1.0).acos();

    let mut camera_motion = CameraMotion::INVALID;

    if translation_angle >= thresholds.significant_translation_observation_angle {
        camera_motion |= CameraMotion::TRANSLATIONAL_SIGNIFICANT;
    } else if translation_angle >= thresholds.moderate_translation_observation_angle {
        camera_motion |= CameraMotion::TRANSLATIONAL_MODERATE;
    } else if translation_angle >= thresholds.tiny_translation_observation_angle {
        camera_motion |= CameraMotion::TRANSLATIONAL_TINY;
    }

    if rotation_angle >= thresholds.significant_rotation_angle {
        camera_motion |= CameraMotion::ROTATIONAL_SIGNIFICANT;
    } else if rotation_angle >= thresholds.moderate_rotation_angle {
        camera_motion |= CameraMotion::ROTATIONAL_MODERATE;
    } else if rotation_angle >= thresholds.tiny_rotation_angle {
        camera_motion |= CameraMotion::ROTATIONAL_TINY;
    }

    if camera_motion.is_invalid() {
        camera_motion = CameraMotion::STATIC;
    }

    camera_motion
}
