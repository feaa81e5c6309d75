//! Rotational-only rewrite of the database.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;

use nalgebra::{Isometry3, Point3, Translation3, Vector2};
use rand::Rng;

use obs_database::{Database, ObjectPointGroups, ObjectPointId, PoseId};
use robust_lm::Estimator;
use sfm_camera::Camera;

use crate::geometry::ransac::orientation_ransac;
use crate::providers::{
    optimize_camera_and_orientations, optimize_object_points_and_poses, optimize_orientation,
    PoseDof,
};
use crate::solver::poses::{update_poses_parallel, PoseEstimationOptions};
use crate::solver::statistics::determine_representative_poses;
use crate::{aborted, CameraMotion, Result, SolverError};

/// Rewrites the database under the sole-rotation hypothesis.
///
/// The pose with the most correspondences becomes the reference with the
/// identity orientation and all its points are re-seated on their
/// observation rays at unit depth. Walking outward, each neighbouring frame
/// gets an orientation from RANSAC over the already-relocated points plus a
/// refinement, after which its remaining points are relocated onto their
/// rays. Frames without a recoverable orientation are invalidated.
///
/// Returns the ids of all relocated object points.
pub fn update_database_to_rotational_motion<R: Rng + ?Sized>(
    database: &mut Database,
    camera: &Camera,
    rng: &mut R,
    lower_frame: PoseId,
    upper_frame: PoseId,
    minimal_observations: usize,
) -> Result<BTreeSet<ObjectPointId>> {
    let (reference_pose_id, correspondences) = database
        .pose_with_most_correspondences(lower_frame, upper_frame, true)
        .ok_or(SolverError::InsufficientData)?;

    if correspondences < 5 {
        return Err(SolverError::InsufficientData);
    }

    let identity = Isometry3::identity();

    // Reference frame: identity orientation, every point at unit depth on
    // its observation ray.
    let reference = database.located_correspondences(reference_pose_id, minimal_observations);
    let mut relocated: BTreeSet<ObjectPointId> = BTreeSet::new();

    for correspondence in &reference {
        let point = camera.object_point_on_ray(&identity, &correspondence.image_point, 1.0);
        database.set_object_point_position(correspondence.object_point_id, Some(point));
        relocated.insert(correspondence.object_point_id);
    }
    database.set_pose(reference_pose_id, Some(identity));

    // Walk outward in both directions.
    let mut left_frame = reference_pose_id;
    let mut right_frame = reference_pose_id;

    loop {
        let mut processed = false;

        for direction in 0..2 {
            let frame = if direction == 0 && left_frame > lower_frame {
                left_frame -= 1;
                left_frame
            } else if direction == 1 && right_frame < upper_frame {
                right_frame += 1;
                right_frame
            } else {
                continue;
            };

            if !database.has_pose(frame) || database.pose(frame).is_none() {
                continue;
            }
            processed = true;

            let correspondences = database.located_correspondences(frame, minimal_observations);

            let mut relocated_points: Vec<Point3<f64>> = Vec::new();
            let mut relocated_images: Vec<Vector2<f64>> = Vec::new();
            let mut pending: Vec<(ObjectPointId, Vector2<f64>)> = Vec::new();

            for correspondence in &correspondences {
                if relocated.contains(&correspondence.object_point_id) {
                    relocated_points.push(correspondence.object_point);
                    relocated_images.push(correspondence.image_point);
                } else {
                    pending.push((correspondence.object_point_id, correspondence.image_point));
                }
            }

            let rough = orientation_ransac(
                camera,
                &relocated_points,
                &relocated_images,
                rng,
                3,
                50,
                10.0 * 10.0,
            )
            .map(|(orientation, _)| orientation);

            let Some(rough) = rough else {
                database.set_pose(frame, None);
                continue;
            };

            match optimize_orientation(
                camera,
                &rough,
                &relocated_points,
                &relocated_images,
                10,
                Estimator::Square,
                0.001,
                5.0,
            ) {
                Ok((orientation, _)) => {
                    let pose = Isometry3::from_parts(Translation3::identity(), orientation);
                    database.set_pose(frame, Some(pose));

                    // Remaining points of this frame go onto their rays.
                    for (object_point_id, image_point) in pending {
                        let point = camera.object_point_on_ray(&pose, &image_point, 1.0);
                        database.set_object_point_position(object_point_id, Some(point));
                        relocated.insert(object_point_id);
                    }
                }
                Err(_) => {
                    database.set_pose(frame, None);
                }
            }
        }

        if !processed {
            break;
        }
    }

    Ok(relocated)
}

/// Supposes a sole rotational camera motion for the given frame range.
///
/// A copy of the database is rewritten under the rotational hypothesis and
/// validated by an orientation bundle over representative keyframes;
/// optionally the camera intrinsics are optimized along the way. If the
/// final mean error stays within `maximal_sqr_error` the rewritten database
/// and the (possibly optimized) camera are returned, otherwise the
/// hypothesis is rejected.
#[allow(clippy::too_many_arguments)]
pub fn suppose_rotational_camera_motion<R: Rng + ?Sized>(
    database: &Database,
    camera: &Camera,
    lower_frame: PoseId,
    upper_frame: PoseId,
    optimize_intrinsics: bool,
    rng: &mut R,
    minimal_observations: usize,
    minimal_keyframes: usize,
    maximal_keyframes: usize,
    maximal_sqr_error: f64,
    pool: Option<&rayon::ThreadPool>,
    abort: Option<&AtomicBool>,
) -> Result<(Camera, Database, f64)> {
    debug_assert!(lower_frame <= upper_frame);
    debug_assert!(minimal_keyframes >= 2 && minimal_keyframes <= maximal_keyframes);

    let mut rotational_database = database.clone();

    let relocated = update_database_to_rotational_motion(
        &mut rotational_database,
        camera,
        rng,
        lower_frame,
        upper_frame,
        minimal_observations,
    )?;

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    // Validate the hypothesis over a representative keyframe subset.
    let keyframe_ids =
        determine_representative_poses(&rotational_database, lower_frame, upper_frame, maximal_keyframes);
    if keyframe_ids.len() < minimal_keyframes {
        return Err(SolverError::InsufficientData);
    }

    let relocated_ids: Vec<ObjectPointId> = relocated.iter().copied().collect();
    let (groups, valid_indices) =
        ObjectPointGroups::from_database(&rotational_database, &keyframe_ids, &relocated_ids, 2);
    if groups.is_empty() {
        return Err(SolverError::InsufficientData);
    }

    let used_ids: Vec<ObjectPointId> = valid_indices.iter().map(|&i| relocated_ids[i]).collect();
    let points: Vec<Point3<f64>> = used_ids
        .iter()
        .map(|&id| {
            rotational_database
                .object_point_position(id)
                .expect("relocated point")
        })
        .collect();

    let keyframe_poses: Vec<Isometry3<f64>> = keyframe_ids
        .iter()
        .map(|&id| rotational_database.pose(id).expect("valid keyframe"))
        .collect();

    let validation_error = if optimize_intrinsics {
        let orientations: Vec<_> = keyframe_poses.iter().map(|pose| pose.rotation).collect();
        let (_, _, result) = optimize_camera_and_orientations(
            camera,
            &orientations,
            &groups,
            &points,
            50,
            Estimator::Square,
            0.001,
            5.0,
        )?;
        result.final_error
    } else {
        let bundle = optimize_object_points_and_poses(
            camera,
            &keyframe_poses,
            &points,
            &groups,
            PoseDof::Three,
            false,
            50,
            Estimator::Square,
            0.001,
            5.0,
            false,
        )?;
        bundle.final_error
    };

    // A large validation error rules out a sole rotational motion.
    if validation_error > maximal_sqr_error {
        return Err(SolverError::InsufficientData);
    }

    // Optionally refit the intrinsics before the final rewrite.
    let optimized_camera = if optimize_intrinsics {
        let orientations: Vec<_> = keyframe_poses.iter().map(|pose| pose.rotation).collect();
        let (optimized_camera, _, _) = optimize_camera_and_orientations(
            camera,
            &orientations,
            &groups,
            &points,
            50,
            Estimator::Square,
            0.001,
            5.0,
        )?;
        optimized_camera
    } else {
        camera.clone()
    };

    // Now all object point locations and poses are updated concurrently:
    // a full rewrite, a bundle over fresh keyframes, and a final pose update
    // under the rotational motion.
    let relocated = update_database_to_rotational_motion(
        &mut rotational_database,
        &optimized_camera,
        rng,
        lower_frame,
        upper_frame,
        0,
    )?;

    let keyframe_ids = determine_representative_poses(
        &rotational_database,
        lower_frame,
        upper_frame,
        maximal_keyframes,
    );
    if keyframe_ids.len() < minimal_keyframes {
        return Err(SolverError::InsufficientData);
    }

    let relocated_ids: Vec<ObjectPointId> = relocated.iter().copied().collect();
    let (groups, valid_indices) =
        ObjectPointGroups::from_database(&rotational_database, &keyframe_ids, &relocated_ids, 2);

    let used_ids: Vec<ObjectPointId> = valid_indices.iter().map(|&i| relocated_ids[i]).collect();
    let points: Vec<Point3<f64>> = used_ids
        .iter()
        .map(|&id| {
            rotational_database
                .object_point_position(id)
                .expect("relocated point")
        })
        .collect();
    let keyframe_poses: Vec<Isometry3<f64>> = keyframe_ids
        .iter()
        .map(|&id| rotational_database.pose(id).expect("valid keyframe"))
        .collect();

    let bundle = optimize_object_points_and_poses(
        &optimized_camera,
        &keyframe_poses,
        &points,
        &groups,
        PoseDof::Three,
        false,
        50,
        Estimator::Square,
        0.001,
        5.0,
        false,
    )?;

    // Only points surviving the bundle keep a location.
    rotational_database.invalidate_all_object_point_positions();
    rotational_database.set_object_point_positions(&used_ids, &bundle.object_points);
    for (pose_id, pose) in keyframe_ids.iter().zip(bundle.world_t_cameras.iter()) {
        rotational_database.set_pose(*pose_id, Some(*pose));
    }

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    let options = PoseEstimationOptions {
        minimal_correspondences: 5,
        ..Default::default()
    };

    let (final_average_error, _valid) = update_poses_parallel(
        &mut rotational_database,
        &optimized_camera,
        CameraMotion::ROTATIONAL,
        rng,
        lower_frame,
        upper_frame,
        &options,
        pool,
        abort,
    )?;

    if final_average_error > maximal_sqr_error {
        return Err(SolverError::InsufficientData);
    }

    Ok((optimized_camera, rotational_database, final_average_error))
}
