//! Per-frame pose recovery and pose-sequence updates.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;

use nalgebra::{Isometry3, Matrix2, Point3, Translation3, UnitQuaternion, Vector2};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use obs_database::{Database, ObjectPointId, PoseId};
use robust_lm::Estimator;
use sfm_camera::Camera;

use crate::geometry::ransac::{orientation_ransac, p3p_ransac};
use crate::providers::{optimize_orientation, optimize_pose};
use crate::worker::execute_range_with;
use crate::{aborted, CameraMotion, Result, SolverError};

/// Options for per-frame pose estimation and pose-sequence updates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoseEstimationOptions {
    /// Refinement iteration cap.
    pub iterations: usize,
    /// Robust estimator applied during refinement.
    pub estimator: Estimator,
    /// Initial Levenberg-Marquardt damping; `(0, 1)` yields Gauss-Newton.
    pub lambda: f64,
    pub lambda_factor: f64,
    /// Minimal number of located correspondences for a pose to be estimated.
    pub minimal_correspondences: usize,
    /// Inlier-ratio floor for RANSAC acceptance; values >= 1 skip the gate.
    pub minimal_valid_correspondence_ratio: f64,
    pub ransac_iterations: usize,
    /// Squared-pixel inlier threshold for RANSAC.
    pub ransac_maximal_sqr_error: f64,
    /// Poses with a larger refined robust error are marked invalid.
    pub maximal_robust_error: f64,
}

impl Default for PoseEstimationOptions {
    fn default() -> Self {
        Self {
            iterations: 20,
            estimator: Estimator::Square,
            lambda: 0.001,
            lambda_factor: 5.0,
            minimal_correspondences: 10,
            minimal_valid_correspondence_ratio: 1.0,
            ransac_iterations: 50,
            ransac_maximal_sqr_error: 3.5 * 3.5,
            maximal_robust_error: 3.5 * 3.5,
        }
    }
}

/// Determines a 6-DOF pose from 2D/3D correspondences.
///
/// Without a rough pose (or with a sub-unity correspondence ratio) a P3P
/// RANSAC seeds the estimate; the result is refined over the inlier set with
/// the requested estimator. Returns the pose, its final robust error and the
/// inlier indices.
pub fn determine_pose<R: Rng + ?Sized>(
    camera: &Camera,
    rng: &mut R,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    rough_pose: Option<&Isometry3<f64>>,
    options: &PoseEstimationOptions,
) -> Option<(Isometry3<f64>, f64, Vec<usize>)> {
    determine_pose_with_priority(
        camera,
        rng,
        object_points,
        image_points,
        0,
        rough_pose,
        options,
    )
}

/// Like [`determine_pose`], with the first `priority_correspondences` entries
/// treated as priority observations: they receive identity covariances while
/// the remaining observations are down-weighted by a sigma equal to the
/// priority count (clamped to `[1, 10]`).
pub fn determine_pose_with_priority<R: Rng + ?Sized>(
    camera: &Camera,
    rng: &mut R,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    priority_correspondences: usize,
    rough_pose: Option<&Isometry3<f64>>,
    options: &PoseEstimationOptions,
) -> Option<(Isometry3<f64>, f64, Vec<usize>)> {
    debug_assert_eq!(object_points.len(), image_points.len());

    let count = object_points.len();
    let ratio = options.minimal_valid_correspondence_ratio;

    let mut previous_pose = rough_pose.copied();
    let mut valid_indices: Vec<usize> = Vec::new();

    if previous_pose.is_none() || ratio < 1.0 {
        if let Some((pose, inliers)) = p3p_ransac(
            camera,
            object_points,
            image_points,
            rng,
            5,
            options.ransac_iterations,
            options.ransac_maximal_sqr_error,
        ) {
            previous_pose = Some(pose);
            valid_indices = inliers;
        }
    }

    // A shortfall of up to 2 correspondences is tolerated as the ratio may
    // provide wrong results for small sets.
    if ratio < 1.0
        && (valid_indices.len() as f64) < count as f64 * ratio
        && count - valid_indices.len() > 2
    {
        return None;
    }

    let previous_pose = previous_pose?;

    let use_subset = ratio < 1.0 && valid_indices.len() != count;
    if !use_subset {
        valid_indices = (0..count).collect();
    }

    let subset_points: Vec<Point3<f64>> =
        valid_indices.iter().map(|&n| object_points[n]).collect();
    let subset_images: Vec<Vector2<f64>> =
        valid_indices.iter().map(|&n| image_points[n]).collect();

    let covariances = priority_covariances(priority_correspondences, &valid_indices);

    let (pose, result) = optimize_pose(
        camera,
        &previous_pose,
        &subset_points,
        &subset_images,
        options.iterations,
        options.estimator,
        options.lambda,
        options.lambda_factor,
        covariances.as_deref(),
    )
    .ok()?;

    Some((pose, result.final_error, valid_indices))
}

fn priority_covariances(
    priority_correspondences: usize,
    valid_indices: &[usize],
) -> Option<Vec<Matrix2<f64>>> {
    if priority_correspondences == 0 {
        return None;
    }

    // Priority observations keep sigma 1; the rest get a sigma equal to the
    // number of priority values, clamped to [1, 10].
    let sigma_remaining = (priority_correspondences as f64).clamp(1.0, 10.0);
    let inv_sqr = 1.0 / (sigma_remaining * sigma_remaining);

    Some(
        valid_indices
            .iter()
            .map(|&index| {
                if index < priority_correspondences {
                    Matrix2::identity()
                } else {
                    Matrix2::identity() * inv_sqr
                }
            })
            .collect(),
    )
}

/// Determines a 3-DOF orientation from 2D/3D correspondences for a
/// pure-rotation frame.
pub fn determine_orientation<R: Rng + ?Sized>(
    camera: &Camera,
    rng: &mut R,
    object_points: &[Point3<f64>],
    image_points: &[Vector2<f64>],
    rough_orientation: Option<&UnitQuaternion<f64>>,
    options: &PoseEstimationOptions,
) -> Option<(UnitQuaternion<f64>, f64, Vec<usize>)> {
    debug_assert_eq!(object_points.len(), image_points.len());

    let count = object_points.len();
    let ratio = options.minimal_valid_correspondence_ratio;

    let mut previous = rough_orientation.copied();
    let mut valid_indices: Vec<usize> = Vec::new();

    if previous.is_none() || ratio < 1.0 {
        if let Some((orientation, inliers)) = orientation_ransac(
            camera,
            object_points,
            image_points,
            rng,
            3,
            options.ransac_iterations,
            options.ransac_maximal_sqr_error,
        ) {
            previous = Some(orientation);
            valid_indices = inliers;
        }
    }

    if ratio < 1.0
        && (valid_indices.len() as f64) < count as f64 * ratio
        && count - valid_indices.len() > 2
    {
        return None;
    }

    let previous = previous?;

    let use_subset = ratio < 1.0 && valid_indices.len() != count;
    if !use_subset {
        valid_indices = (0..count).collect();
    }

    let subset_points: Vec<Point3<f64>> =
        valid_indices.iter().map(|&n| object_points[n]).collect();
    let subset_images: Vec<Vector2<f64>> =
        valid_indices.iter().map(|&n| image_points[n]).collect();

    let (orientation, result) = optimize_orientation(
        camera,
        &previous,
        &subset_points,
        &subset_images,
        options.iterations,
        options.estimator,
        options.lambda,
        options.lambda_factor,
    )
    .ok()?;

    Some((orientation, result.final_error, valid_indices))
}

/// Determines the pose of a database frame from its located correspondences.
pub fn determine_pose_for_frame<R: Rng + ?Sized>(
    database: &Database,
    camera: &Camera,
    rng: &mut R,
    frame: PoseId,
    rough_pose: Option<&Isometry3<f64>>,
    options: &PoseEstimationOptions,
) -> Option<(Isometry3<f64>, f64)> {
    let correspondences = database.located_correspondences(frame, 0);
    if correspondences.len() < options.minimal_correspondences {
        return None;
    }

    let object_points: Vec<Point3<f64>> =
        correspondences.iter().map(|c| c.object_point).collect();
    let image_points: Vec<Vector2<f64>> =
        correspondences.iter().map(|c| c.image_point).collect();

    determine_pose(camera, rng, &object_points, &image_points, rough_pose, options)
        .map(|(pose, error, _)| (pose, error))
}

/// Determines the orientation of a database frame from its located
/// correspondences.
pub fn determine_orientation_for_frame<R: Rng + ?Sized>(
    database: &Database,
    camera: &Camera,
    rng: &mut R,
    frame: PoseId,
    rough_orientation: Option<&UnitQuaternion<f64>>,
    options: &PoseEstimationOptions,
) -> Option<(UnitQuaternion<f64>, f64)> {
    let correspondences = database.located_correspondences(frame, 0);
    if correspondences.len() < options.minimal_correspondences {
        return None;
    }

    let object_points: Vec<Point3<f64>> =
        correspondences.iter().map(|c| c.object_point).collect();
    let image_points: Vec<Vector2<f64>> =
        correspondences.iter().map(|c| c.image_point).collect();

    determine_orientation(
        camera,
        rng,
        &object_points,
        &image_points,
        rough_orientation,
        options,
    )
    .map(|(orientation, error, _)| (orientation, error))
}

/// Updates the poses of all frames in `[lower, upper]`, propagating forward
/// and backward from `start_frame`; each new pose uses the neighbouring
/// accepted pose as initialization.
///
/// A pose whose refined robust error exceeds the maximal robust error is
/// marked invalid. Under a non-translational motion only orientations are
/// recovered and stored as zero-translation poses. Returns the average error
/// and the number of valid poses.
#[allow(clippy::too_many_arguments)]
pub fn update_poses<R: Rng + ?Sized>(
    database: &mut Database,
    camera: &Camera,
    camera_motion: CameraMotion,
    rng: &mut R,
    lower_frame: PoseId,
    start_frame: PoseId,
    upper_frame: PoseId,
    options: &PoseEstimationOptions,
    abort: Option<&AtomicBool>,
) -> Result<(f64, usize)> {
    debug_assert!(!camera_motion.is_invalid());
    debug_assert!(lower_frame <= start_frame && start_frame <= upper_frame);
    debug_assert!(options.minimal_correspondences >= 5);

    let frames = database.pose_ids(lower_frame, upper_frame);
    let forward: Vec<PoseId> = frames.iter().copied().filter(|&f| f >= start_frame).collect();
    let backward: Vec<PoseId> = frames
        .iter()
        .copied()
        .filter(|&f| f < start_frame)
        .rev()
        .collect();

    let mut total_error = 0.0;
    let mut valid_poses = 0usize;

    let translational = camera_motion.is_translational() || camera_motion.is_unknown();

    if translational {
        let mut previous: Option<Isometry3<f64>> = None;

        for direction in [&forward[..], &backward[..]] {
            for &frame in direction {
                if aborted(abort) {
                    return Err(SolverError::Aborted);
                }

                let estimated =
                    determine_pose_for_frame(database, camera, rng, frame, previous.as_ref(), options)
                        .filter(|&(_, error)| error <= options.maximal_robust_error);

                match estimated {
                    Some((pose, error)) => {
                        database.set_pose(frame, Some(pose));
                        previous = Some(pose);
                        total_error += error;
                        valid_poses += 1;
                    }
                    None => {
                        database.set_pose(frame, None);
                        previous = None;
                    }
                }
            }

            // The backward sweep restarts from the accepted start pose.
            previous = database.pose(start_frame);
        }
    } else {
        let mut previous: Option<UnitQuaternion<f64>> = None;

        for direction in [&forward[..], &backward[..]] {
            for &frame in direction {
                if aborted(abort) {
                    return Err(SolverError::Aborted);
                }

                let estimated = determine_orientation_for_frame(
                    database,
                    camera,
                    rng,
                    frame,
                    previous.as_ref(),
                    options,
                )
                .filter(|&(_, error)| error <= options.maximal_robust_error);

                match estimated {
                    Some((orientation, error)) => {
                        database.set_pose(
                            frame,
                            Some(Isometry3::from_parts(Translation3::identity(), orientation)),
                        );
                        previous = Some(orientation);
                        total_error += error;
                        valid_poses += 1;
                    }
                    None => {
                        database.set_pose(frame, None);
                        previous = None;
                    }
                }
            }

            previous = database.pose(start_frame).map(|pose| pose.rotation);
        }
    }

    let average = if valid_poses > 0 {
        total_error / valid_poses as f64
    } else {
        0.0
    };

    Ok((average, valid_poses))
}

/// Worker-parallel pose update: every pose is solved independently from its
/// stored rough pose, dropping the propagation dependency. The totals are
/// accumulated under a single mutex.
#[allow(clippy::too_many_arguments)]
pub fn update_poses_parallel<R: Rng + ?Sized>(
    database: &mut Database,
    camera: &Camera,
    camera_motion: CameraMotion,
    rng: &mut R,
    lower_frame: PoseId,
    upper_frame: PoseId,
    options: &PoseEstimationOptions,
    pool: Option<&rayon::ThreadPool>,
    abort: Option<&AtomicBool>,
) -> Result<(f64, usize)> {
    debug_assert!(!camera_motion.is_invalid());

    if pool.is_none() {
        return update_poses(
            database,
            camera,
            camera_motion,
            rng,
            lower_frame,
            lower_frame,
            upper_frame,
            options,
            abort,
        );
    }

    let frames = database.pose_ids(lower_frame, upper_frame);
    let translational = camera_motion.is_translational() || camera_motion.is_unknown();

    let thread_count = pool.map_or(1, |p| p.current_num_threads().max(1));
    let seeds: Vec<u64> = (0..thread_count).map(|_| rng.random()).collect();

    let accumulator = Mutex::new((0.0f64, 0usize));
    let mut results: Vec<Option<(Isometry3<f64>, f64)>> = vec![None; frames.len()];

    {
        let database = &*database;
        let frames = &frames;
        let accumulator = &accumulator;

        execute_range_with(pool, &mut results, |chunk, offset, thread_index| {
            let mut local_rng = ChaCha8Rng::seed_from_u64(seeds[thread_index % seeds.len()]);
            let mut local_error = 0.0;
            let mut local_valid = 0usize;

            for (i, slot) in chunk.iter_mut().enumerate() {
                if aborted(abort) {
                    break;
                }

                let frame = frames[offset + i];
                let rough = database.pose(frame);

                let estimated = if translational {
                    determine_pose_for_frame(
                        database,
                        camera,
                        &mut local_rng,
                        frame,
                        rough.as_ref(),
                        options,
                    )
                } else {
                    determine_orientation_for_frame(
                        database,
                        camera,
                        &mut local_rng,
                        frame,
                        rough.map(|pose| pose.rotation).as_ref(),
                        options,
                    )
                    .map(|(orientation, error)| {
                        (
                            Isometry3::from_parts(Translation3::identity(), orientation),
                            error,
                        )
                    })
                };

                if let Some((pose, error)) =
                    estimated.filter(|&(_, error)| error <= options.maximal_robust_error)
                {
                    *slot = Some((pose, error));
                    local_error += error;
                    local_valid += 1;
                }
            }

            let mut totals = accumulator.lock();
            totals.0 += local_error;
            totals.1 += local_valid;
        });
    }

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    for (frame, result) in frames.iter().zip(results.into_iter()) {
        database.set_pose(*frame, result.map(|(pose, _)| pose));
    }

    let (total_error, valid_poses) = accumulator.into_inner();
    let average = if valid_poses > 0 {
        total_error / valid_poses as f64
    } else {
        0.0
    };

    Ok((average, valid_poses))
}

/// Read-only pose determination over a frame range: recovers a pose per
/// frame without touching the database, optionally restricted to (or
/// prioritizing) a set of object points.
#[allow(clippy::too_many_arguments)]
pub fn determine_poses<R: Rng + ?Sized>(
    database: &Database,
    camera: &Camera,
    camera_motion: CameraMotion,
    priority_object_point_ids: &BTreeSet<ObjectPointId>,
    sole_priority_points: bool,
    rng: &mut R,
    lower_frame: PoseId,
    upper_frame: PoseId,
    options: &PoseEstimationOptions,
    pool: Option<&rayon::ThreadPool>,
    abort: Option<&AtomicBool>,
) -> Result<(BTreeMap<PoseId, Option<Isometry3<f64>>>, f64)> {
    debug_assert!(!camera_motion.is_invalid());

    let frames = database.pose_ids(lower_frame, upper_frame);
    let translational = camera_motion.is_translational() || camera_motion.is_unknown();

    let thread_count = pool.map_or(1, |p| p.current_num_threads().max(1));
    let seeds: Vec<u64> = (0..thread_count).map(|_| rng.random()).collect();

    let accumulator = Mutex::new(0.0f64);
    let mut results: Vec<Option<(Isometry3<f64>, f64)>> = vec![None; frames.len()];

    {
        let frames = &frames;
        let accumulator = &accumulator;

        execute_range_with(pool, &mut results, |chunk, offset, thread_index| {
            let mut local_rng = ChaCha8Rng::seed_from_u64(seeds[thread_index % seeds.len()]);
            let mut local_error = 0.0;

            for (i, slot) in chunk.iter_mut().enumerate() {
                if aborted(abort) {
                    break;
                }

                let frame = frames[offset + i];
                let rough = database.pose(frame);

                let (priority, remaining) =
                    database.located_correspondences_split(frame, priority_object_point_ids);

                let (object_points, image_points, priority_count) = if sole_priority_points {
                    let points: Vec<Point3<f64>> =
                        priority.iter().map(|c| c.object_point).collect();
                    let images: Vec<Vector2<f64>> =
                        priority.iter().map(|c| c.image_point).collect();
                    (points, images, 0)
                } else {
                    let mut points: Vec<Point3<f64>> =
                        priority.iter().map(|c| c.object_point).collect();
                    let mut images: Vec<Vector2<f64>> =
                        priority.iter().map(|c| c.image_point).collect();
                    let priority_count = points.len();
                    points.extend(remaining.iter().map(|c| c.object_point));
                    images.extend(remaining.iter().map(|c| c.image_point));
                    (points, images, priority_count)
                };

                if object_points.len() < options.minimal_correspondences {
                    continue;
                }

                let estimated = if translational {
                    determine_pose_with_priority(
                        camera,
                        &mut local_rng,
                        &object_points,
                        &image_points,
                        priority_count,
                        rough.as_ref(),
                        options,
                    )
                    .map(|(pose, error, _)| (pose, error))
                } else {
                    determine_orientation(
                        camera,
                        &mut local_rng,
                        &object_points,
                        &image_points,
                        rough.map(|pose| pose.rotation).as_ref(),
                        options,
                    )
                    .map(|(orientation, error, _)| {
                        (
                            Isometry3::from_parts(Translation3::identity(), orientation),
                            error,
                        )
                    })
                };

                if let Some((pose, error)) =
                    estimated.filter(|&(_, error)| error <= options.maximal_robust_error)
                {
                    *slot = Some((pose, error));
                    local_error += error;
                }
            }

            *accumulator.lock() += local_error;
        });
    }

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    let valid = results.iter().flatten().count();
    let average = if valid > 0 {
        accumulator.into_inner() / valid as f64
    } else {
        0.0
    };

    let poses = frames
        .into_iter()
        .zip(results)
        .map(|(frame, result)| (frame, result.map(|(pose, _)| pose)))
        .collect();

    Ok((poses, average))
}
