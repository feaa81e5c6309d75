//! Determination and optimization of 3-D object points.

use std::sync::atomic::AtomicBool;

use nalgebra::{Isometry3, Point3, Vector2};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use obs_database::{Database, ObjectPointGroups, ObjectPointId, PoseId};
use robust_lm::Estimator;
use sfm_camera::Camera;

use crate::geometry::ransac::object_point_ransac;
use crate::providers::{
    optimize_object_point, optimize_object_points_and_poses, PoseDof,
};
use crate::solver::statistics::determine_representative_poses;
use crate::worker::execute_range_with;
use crate::{aborted, CameraMotion, Result, SolverError};

/// Outcome of a bundle adjustment over database keyframes.
#[derive(Debug, Clone)]
pub struct BundleOutcome {
    pub object_points: Vec<Point3<f64>>,
    pub object_point_ids: Vec<ObjectPointId>,
    pub keyframe_poses: Vec<Isometry3<f64>>,
    pub keyframe_ids: Vec<PoseId>,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Determines 3-D locations for currently unlocated object points from
/// their observations in frames with valid poses.
///
/// Under a translational (or unknown) motion, a RANSAC triangulation seeds
/// each point and a robust refinement with fixed poses polishes it; under a
/// purely rotational motion points cannot be triangulated and are seated on
/// the observation ray of their first valid observation at unit depth.
///
/// Returns the new locations, their ids, and the observation count per
/// accepted point.
#[allow(clippy::too_many_arguments)]
pub fn determine_unknown_object_points<R: Rng + ?Sized>(
    database: &Database,
    camera: &Camera,
    camera_motion: CameraMotion,
    unknown_object_point_ids: &[ObjectPointId],
    rng: &mut R,
    minimal_observations: usize,
    estimator: Estimator,
    ransac_maximal_sqr_error: f64,
    maximal_robust_error: f64,
    pool: Option<&rayon::ThreadPool>,
    abort: Option<&AtomicBool>,
) -> Result<(Vec<Point3<f64>>, Vec<ObjectPointId>, Vec<usize>)> {
    debug_assert!(!camera_motion.is_invalid());
    debug_assert!(minimal_observations >= 2);

    let thread_count = pool.map_or(1, |p| p.current_num_threads().max(1));
    let seeds: Vec<u64> = (0..thread_count).map(|_| rng.random()).collect();

    let mut results: Vec<Option<(Point3<f64>, usize)>> =
        vec![None; unknown_object_point_ids.len()];

    execute_range_with(pool, &mut results, |chunk, offset, thread_index| {
        let mut local_rng = ChaCha8Rng::seed_from_u64(seeds[thread_index % seeds.len()]);

        for (i, slot) in chunk.iter_mut().enumerate() {
            if aborted(abort) {
                break;
            }

            let object_point_id = unknown_object_point_ids[offset + i];

            let mut poses = Vec::new();
            let mut image_points = Vec::new();
            for (pose_id, image_point) in database.observations_of_point(object_point_id) {
                if let Some(pose) = database.pose(pose_id) {
                    poses.push(pose);
                    image_points.push(image_point);
                }
            }

            if poses.len() < minimal_observations {
                continue;
            }

            if camera_motion.is_purely_rotational() {
                // No parallax under a sole rotation; the point lives on its
                // observation ray at unit depth.
                let point = camera.object_point_on_ray(&poses[0], &image_points[0], 1.0);
                *slot = Some((point, poses.len()));
                continue;
            }

            let minimal_valid = (poses.len().saturating_sub(1)).max(2);
            let Some((seed_point, inliers)) = object_point_ransac(
                camera,
                &poses,
                &image_points,
                &mut local_rng,
                20,
                ransac_maximal_sqr_error,
                minimal_valid,
            ) else {
                continue;
            };

            let inlier_poses: Vec<Isometry3<f64>> = inliers.iter().map(|&n| poses[n]).collect();
            let inlier_images: Vec<Vector2<f64>> =
                inliers.iter().map(|&n| image_points[n]).collect();

            let Ok((point, result)) = optimize_object_point(
                camera,
                &inlier_poses,
                &inlier_images,
                seed_point,
                20,
                estimator,
                0.001,
                5.0,
            ) else {
                continue;
            };

            if result.final_error <= maximal_robust_error {
                *slot = Some((point, inlier_poses.len()));
            }
        }
    });

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    let mut new_points = Vec::new();
    let mut new_ids = Vec::new();
    let mut observation_counts = Vec::new();

    for (result, &id) in results.into_iter().zip(unknown_object_point_ids.iter()) {
        if let Some((point, observations)) = result {
            new_points.push(point);
            new_ids.push(id);
            observation_counts.push(observations);
        }
    }

    Ok((new_points, new_ids, observation_counts))
}

/// Optimizes located object points individually with all poses held fixed
/// (embarrassingly parallel per point).
///
/// Points whose refined robust error exceeds the bound are dropped from the
/// result; the totals are accumulated under a single mutex.
#[allow(clippy::too_many_arguments)]
pub fn optimize_object_points_with_fixed_poses(
    database: &Database,
    camera: &Camera,
    camera_motion: CameraMotion,
    object_point_ids: &[ObjectPointId],
    minimal_observations: usize,
    estimator: Estimator,
    maximal_robust_error: f64,
    pool: Option<&rayon::ThreadPool>,
    abort: Option<&AtomicBool>,
) -> Result<(Vec<Point3<f64>>, Vec<ObjectPointId>, f64)> {
    debug_assert!(!camera_motion.is_invalid());
    debug_assert!(minimal_observations >= 2);

    let accumulator = Mutex::new((0.0f64, 0usize));
    let mut results: Vec<Option<Point3<f64>>> = vec![None; object_point_ids.len()];

    {
        let accumulator = &accumulator;

        execute_range_with(pool, &mut results, |chunk, offset, _| {
            let mut local_error = 0.0;
            let mut local_count = 0usize;

            for (i, slot) in chunk.iter_mut().enumerate() {
                if aborted(abort) {
                    break;
                }

                let object_point_id = object_point_ids[offset + i];
                let Some(position) = database.object_point_position(object_point_id) else {
                    continue;
                };

                let mut poses = Vec::new();
                let mut image_points = Vec::new();
                for (pose_id, image_point) in database.observations_of_point(object_point_id) {
                    if let Some(pose) = database.pose(pose_id) {
                        poses.push(pose);
                        image_points.push(image_point);
                    }
                }

                if poses.len() < minimal_observations {
                    continue;
                }

                let Ok((point, result)) = optimize_object_point(
                    camera,
                    &poses,
                    &image_points,
                    position,
                    20,
                    estimator,
                    0.001,
                    5.0,
                ) else {
                    continue;
                };

                if result.final_error <= maximal_robust_error {
                    *slot = Some(point);
                    local_error += result.final_error;
                    local_count += 1;
                }
            }

            let mut totals = accumulator.lock();
            totals.0 += local_error;
            totals.1 += local_count;
        });
    }

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    let mut optimized_points = Vec::new();
    let mut optimized_ids = Vec::new();
    for (result, &id) in results.into_iter().zip(object_point_ids.iter()) {
        if let Some(point) = result {
            optimized_points.push(point);
            optimized_ids.push(id);
        }
    }

    let (total_error, count) = accumulator.into_inner();
    let average = if count > 0 { total_error / count as f64 } else { 0.0 };

    Ok((optimized_points, optimized_ids, average))
}

/// Bundle adjustment over keyframe poses and object points.
///
/// When no explicit keyframe list is given, the most representative poses
/// of the database are selected by the 6-D pose succession; candidate
/// object points must be observed in at least `minimal_observations` of the
/// chosen keyframes.
#[allow(clippy::too_many_arguments)]
pub fn optimize_object_points_with_variable_poses(
    database: &Database,
    camera: &Camera,
    keyframe_ids: Option<&[PoseId]>,
    object_point_ids: Option<&[ObjectPointId]>,
    minimal_keyframes: usize,
    maximal_keyframes: usize,
    minimal_observations: usize,
    estimator: Estimator,
    iterations: usize,
) -> Result<BundleOutcome> {
    let keyframe_ids: Vec<PoseId> = match keyframe_ids {
        Some(ids) => ids.to_vec(),
        None => {
            let lower = *database.pose_ids(0, PoseId::MAX).first().unwrap_or(&0);
            let upper = *database.pose_ids(0, PoseId::MAX).last().unwrap_or(&0);
            determine_representative_poses(database, lower, upper, maximal_keyframes)
        }
    };

    if keyframe_ids.len() < minimal_keyframes.max(2) {
        return Err(SolverError::InsufficientData);
    }

    let candidate_ids: Vec<ObjectPointId> = match object_point_ids {
        Some(ids) => ids.to_vec(),
        None => database.located_object_point_ids(),
    };

    let (groups, valid_indices) = ObjectPointGroups::from_database(
        database,
        &keyframe_ids,
        &candidate_ids,
        minimal_observations,
    );

    if groups.is_empty() {
        return Err(SolverError::InsufficientData);
    }

    let object_point_ids: Vec<ObjectPointId> =
        valid_indices.iter().map(|&i| candidate_ids[i]).collect();
    let object_points: Vec<Point3<f64>> = object_point_ids
        .iter()
        .map(|&id| {
            database
                .object_point_position(id)
                .expect("located candidate")
        })
        .collect();

    let keyframe_poses: Vec<Isometry3<f64>> = keyframe_ids
        .iter()
        .map(|&id| database.pose(id).ok_or(SolverError::InsufficientData))
        .collect::<Result<_>>()?;

    let bundle = optimize_object_points_and_poses(
        camera,
        &keyframe_poses,
        &object_points,
        &groups,
        PoseDof::Six,
        false,
        iterations,
        estimator,
        0.001,
        5.0,
        false,
    )?;

    Ok(BundleOutcome {
        object_points: bundle.object_points,
        object_point_ids,
        keyframe_poses: bundle.world_t_cameras,
        keyframe_ids,
        initial_error: bundle.initial_error,
        final_error: bundle.final_error,
    })
}

/// Bundle adjustment over a pose-id range: the keyframes are chosen as a
/// minimal covering subset, i.e. the smallest 6-D-succession-ordered set of
/// poses observing every requested object point at least
/// `minimal_observations` times (and at least `minimal_keyframes` poses).
#[allow(clippy::too_many_arguments)]
pub fn optimize_object_points_with_variable_poses_in_range(
    database: &Database,
    camera: &Camera,
    lower_frame: PoseId,
    upper_frame: PoseId,
    object_point_ids: &[ObjectPointId],
    minimal_observations: usize,
    minimal_keyframes: usize,
    estimator: Estimator,
    iterations: usize,
) -> Result<BundleOutcome> {
    let (covering_groups, keyframe_ids) = ObjectPointGroups::covering(
        database,
        lower_frame,
        upper_frame,
        object_point_ids,
        minimal_observations,
        minimal_keyframes,
    )
    .ok_or(SolverError::InsufficientData)?;

    if keyframe_ids.len() < minimal_keyframes.max(2) {
        return Err(SolverError::InsufficientData);
    }

    // Points without enough observations in the chosen keyframes drop out.
    let mut groups = ObjectPointGroups::default();
    let mut used_ids = Vec::new();
    for (group, &object_point_id) in covering_groups.iter().zip(object_point_ids.iter()) {
        if group.len() >= minimal_observations.max(2)
            && database.object_point_position(object_point_id).is_some()
        {
            groups.push_group(group.clone());
            used_ids.push(object_point_id);
        }
    }

    if groups.is_empty() {
        return Err(SolverError::InsufficientData);
    }

    let object_points: Vec<Point3<f64>> = used_ids
        .iter()
        .map(|&id| {
            database
                .object_point_position(id)
                .expect("located candidate")
        })
        .collect();

    let keyframe_poses: Vec<Isometry3<f64>> = keyframe_ids
        .iter()
        .map(|&id| database.pose(id).ok_or(SolverError::InsufficientData))
        .collect::<Result<_>>()?;

    let bundle = optimize_object_points_and_poses(
        camera,
        &keyframe_poses,
        &object_points,
        &groups,
        PoseDof::Six,
        false,
        iterations,
        estimator,
        0.001,
        5.0,
        false,
    )?;

    Ok(BundleOutcome {
        object_points: bundle.object_points,
        object_point_ids: used_ids,
        keyframe_poses: bundle.world_t_cameras,
        keyframe_ids,
        initial_error: bundle.initial_error,
        final_error: bundle.final_error,
    })
}
