//! Initial object-point bootstrapping from keyframes.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicBool;

use nalgebra::{Isometry3, Point3, Vector2};
use rand::Rng;

use obs_database::succession::SuccessionSubset;
use obs_database::{Database, ObjectPointGroups, ObjectPointId, PoseId};
use robust_lm::Estimator;
use sfm_camera::Camera;

use crate::geometry::ransac::p3p_ransac;
use crate::geometry::two_view_pose;
use crate::providers::{optimize_object_points_and_poses, PoseDof};
use crate::solver::statistics::average_point_distance;
use crate::threshold::RelativeThreshold;
use crate::{aborted, Result, SolverError};

/// Observations propagated from a start frame: one image-point group per
/// contiguous frame, all groups covering the same object points.
#[derive(Debug, Clone)]
pub struct TrackedObservations {
    pub first_frame: PoseId,
    pub object_point_ids: Vec<ObjectPointId>,
    /// `groups[n][i]` is the image point of `object_point_ids[i]` at frame
    /// `first_frame + n`.
    pub image_point_groups: Vec<Vec<Vector2<f64>>>,
}

/// Outcome of the initial bootstrap.
#[derive(Debug, Clone)]
pub struct InitialObjectPoints {
    pub object_points: Vec<Point3<f64>>,
    pub object_point_ids: Vec<ObjectPointId>,
    pub used_pose_ids: Vec<PoseId>,
    pub final_error: f64,
    pub final_image_point_distance: f64,
}

/// Propagates the observations of the given object points forward and
/// backward from the start frame, at each step keeping only the points still
/// observed in the new frame, until the surviving count would drop below
/// `minimal_tracked`.
pub fn track_object_points(
    database: &Database,
    object_point_ids: &[ObjectPointId],
    lower_frame: PoseId,
    start_frame: PoseId,
    upper_frame: PoseId,
    minimal_tracked: usize,
    maximal_tracked: usize,
    abort: Option<&AtomicBool>,
) -> Option<TrackedObservations> {
    debug_assert!(lower_frame <= start_frame && start_frame <= upper_frame);
    debug_assert!(minimal_tracked > 0);

    let mut surviving: Vec<ObjectPointId> = object_point_ids
        .iter()
        .copied()
        .filter(|&id| database.has_observation(start_frame, id))
        .collect();

    if surviving.len() < minimal_tracked {
        return None;
    }

    // Forward, then backward; a frame is accepted only while enough points
    // survive in it.
    let mut last_frame = start_frame;
    for frame in (start_frame + 1)..=upper_frame {
        if aborted(abort) {
            return None;
        }

        let kept: Vec<ObjectPointId> = surviving
            .iter()
            .copied()
            .filter(|&id| database.has_observation(frame, id))
            .collect();
        if kept.len() < minimal_tracked {
            break;
        }
        surviving = kept;
        last_frame = frame;
    }

    let mut first_frame = start_frame;
    for frame in (lower_frame..start_frame).rev() {
        if aborted(abort) {
            return None;
        }

        let kept: Vec<ObjectPointId> = surviving
            .iter()
            .copied()
            .filter(|&id| database.has_observation(frame, id))
            .collect();
        if kept.len() < minimal_tracked {
            break;
        }
        surviving = kept;
        first_frame = frame;
    }

    if surviving.len() > maximal_tracked {
        surviving.truncate(maximal_tracked);
    }

    let image_point_groups: Vec<Vec<Vector2<f64>>> = (first_frame..=last_frame)
        .map(|frame| {
            surviving
                .iter()
                .map(|&id| database.observation(frame, id).expect("tracked observation"))
                .collect()
        })
        .collect();

    Some(TrackedObservations {
        first_frame,
        object_point_ids: surviving,
        image_point_groups,
    })
}

/// Removes perfectly static image points (sub-pixel motion across the whole
/// range), which are typically located on static logos or screen artifacts.
///
/// Filtering only happens when the ratio of static points does not exceed
/// `maximal_static_ratio`; returns the number of static points found.
pub fn filter_static_image_points(
    image_point_groups: &mut Vec<Vec<Vector2<f64>>>,
    object_point_ids: &mut Vec<ObjectPointId>,
    maximal_static_ratio: f64,
) -> usize {
    if maximal_static_ratio <= 0.0
        || image_point_groups.is_empty()
        || image_point_groups[0].is_empty()
    {
        return 0;
    }

    let point_count = image_point_groups[0].len();
    let frame_count = image_point_groups.len() as f64;

    let mut means = vec![Vector2::zeros(); point_count];
    for group in image_point_groups.iter() {
        for (mean, point) in means.iter_mut().zip(group.iter()) {
            *mean += point;
        }
    }
    for mean in means.iter_mut() {
        *mean /= frame_count;
    }

    let mut is_static = vec![true; point_count];
    let mut static_count = point_count;
    for group in image_point_groups.iter() {
        if static_count == 0 {
            break;
        }
        for i in 0..point_count {
            if is_static[i] && (means[i] - group[i]).norm_squared() > 1.5 * 1.5 {
                is_static[i] = false;
                static_count -= 1;
            }
        }
    }

    let static_ratio = static_count as f64 / point_count as f64;

    if static_count != 0 && static_ratio <= maximal_static_ratio {
        let keep: Vec<usize> = (0..point_count).filter(|&i| !is_static[i]).collect();

        *object_point_ids = keep.iter().map(|&i| object_point_ids[i]).collect();
        for group in image_point_groups.iter_mut() {
            *group = keep.iter().map(|&i| group[i]).collect();
        }
    }

    static_count
}

/// Recovers initial structure from a specific keyframe pair: two-view stereo
/// recovery and triangulation, followed by incremental P3P admission of the
/// remaining keyframes in best-correspondence order, intersecting the valid
/// point sets along the way.
#[allow(clippy::too_many_arguments)]
fn determine_initial_object_points_pair<R: Rng + ?Sized>(
    camera: &Camera,
    image_point_groups: &[Vec<Vector2<f64>>],
    rng: &mut R,
    first_group_index: usize,
    second_group_index: usize,
    minimal_valid_object_points: &RelativeThreshold,
    max_sqr_error: f64,
) -> Option<(Vec<Isometry3<f64>>, Vec<usize>, Vec<Point3<f64>>, Vec<usize>)> {
    debug_assert!(image_point_groups.len() >= 2);
    debug_assert_ne!(first_group_index, second_group_index);

    let points_first = &image_point_groups[first_group_index];
    let points_second = &image_point_groups[second_group_index];
    debug_assert_eq!(points_first.len(), points_second.len());

    if points_first.len() < 8 {
        return None;
    }

    let absolute_minimal =
        minimal_valid_object_points.valid_threshold(points_first.len() as u32, 5)? as usize;

    let two_view = two_view_pose(
        camera,
        points_first,
        points_second,
        rng,
        20,
        max_sqr_error,
        absolute_minimal,
    )?;

    let mut poses = vec![Isometry3::identity(), two_view.world_t_camera_b];
    let mut pose_indices = vec![first_group_index, second_group_index];

    // P3P for the remaining keyframes over the triangulated points.
    let mut remaining: Vec<(usize, Isometry3<f64>, BTreeSet<usize>)> = Vec::new();

    for (index, group) in image_point_groups.iter().enumerate() {
        if index == first_group_index || index == second_group_index {
            continue;
        }

        let subset_images: Vec<Vector2<f64>> = two_view
            .valid_indices
            .iter()
            .map(|&i| group[i])
            .collect();

        if let Some((pose, inliers)) = p3p_ransac(
            camera,
            &two_view.object_points,
            &subset_images,
            rng,
            5,
            50,
            max_sqr_error,
        ) {
            if inliers.len() < absolute_minimal {
                continue;
            }
            remaining.push((index, pose, inliers.into_iter().collect()));
        }
    }

    // Iteratively admit the pose with most valid correspondences,
    // intersecting the shared point set.
    let mut valid_point_set: BTreeSet<usize> = (0..two_view.object_points.len()).collect();

    while !remaining.is_empty() {
        let best = remaining
            .iter()
            .enumerate()
            .max_by_key(|(_, (_, _, inliers))| inliers.len())
            .map(|(i, _)| i)
            .expect("non-empty remaining");

        let (index, pose, inliers) = remaining.swap_remove(best);

        if inliers.len() < absolute_minimal {
            break;
        }

        valid_point_set = valid_point_set.intersection(&inliers).copied().collect();
        poses.push(pose);
        pose_indices.push(index);

        for (_, _, other) in remaining.iter_mut() {
            *other = other.intersection(&valid_point_set).copied().collect();
        }
    }

    if valid_point_set.len() < absolute_minimal {
        return None;
    }

    let object_points: Vec<Point3<f64>> = valid_point_set
        .iter()
        .map(|&i| two_view.object_points[i])
        .collect();
    let point_indices: Vec<usize> = valid_point_set
        .iter()
        .map(|&i| two_view.valid_indices[i])
        .collect();

    Some((poses, pose_indices, object_points, point_indices))
}

/// RANSAC bootstrap over keyframe pairs.
///
/// Samples random keyframe pairs, recovers structure for each and keeps the
/// sample with the largest `|validPoses| * |validPoints|` product, breaking
/// ties by the largest average image-point spread (widely spread points
/// yield more stable structure). When a database view is provided, the
/// interior (non-keyframe) poses of the winning sample are additionally
/// validated by pose recovery over the sample's points.
#[allow(clippy::too_many_arguments)]
pub fn determine_initial_object_points_ransac<R: Rng + ?Sized>(
    camera: &Camera,
    image_point_groups: &[Vec<Vector2<f64>>],
    rng: &mut R,
    iterations: usize,
    minimal_valid_object_points: &RelativeThreshold,
    max_sqr_error: f64,
    validation: Option<(&Database, &[PoseId], &[ObjectPointId])>,
    abort: Option<&AtomicBool>,
) -> Option<(Vec<Isometry3<f64>>, Vec<usize>, Vec<Point3<f64>>, Vec<usize>)> {
    debug_assert!(image_point_groups.len() >= 2);

    let group_count = image_point_groups.len();

    let mut best: Option<(Vec<Isometry3<f64>>, Vec<usize>, Vec<Point3<f64>>, Vec<usize>)> = None;
    let mut best_point_distance = f64::MAX;

    for _ in 0..iterations {
        if aborted(abort) {
            break;
        }

        let first = rng.random_range(0..group_count);
        let mut second = rng.random_range(0..group_count - 1);
        if second >= first {
            second += 1;
        }

        let Some(candidate) = determine_initial_object_points_pair(
            camera,
            image_point_groups,
            rng,
            first,
            second,
            minimal_valid_object_points,
            max_sqr_error,
        ) else {
            continue;
        };

        let (poses, pose_indices, object_points, point_indices) = candidate;

        let best_score = best
            .as_ref()
            .map_or(0, |(poses, _, points, _)| poses.len() * points.len());
        let score = poses.len() * object_points.len();

        if score < best_score {
            continue;
        }

        // The image-point spread across the sample's keyframes.
        let mut point_distance = 0.0;
        for &pose_index in &pose_indices {
            let points: Vec<Vector2<f64>> = point_indices
                .iter()
                .map(|&i| image_point_groups[pose_index][i])
                .collect();
            point_distance += average_point_distance(&points);
        }
        point_distance /= pose_indices.len() as f64;

        if score == best_score && point_distance <= best_point_distance {
            continue;
        }

        // All intermediate poses between the used keyframes have to be
        // recoverable from the sample's points, otherwise the keyframe
        // subset was not representative.
        if let Some((database, keyframe_ids, object_point_ids)) = validation {
            let mut sample_pose_ids: Vec<PoseId> =
                pose_indices.iter().map(|&i| keyframe_ids[i]).collect();
            sample_pose_ids.sort_unstable();

            let sample_point_ids: Vec<ObjectPointId> =
                point_indices.iter().map(|&i| object_point_ids[i]).collect();

            let mut all_poses_valid = true;
            'validation: for pose_id in sample_pose_ids[0] + 1..*sample_pose_ids.last().unwrap() {
                if aborted(abort) {
                    break;
                }

                let mut frame_points = Vec::new();
                let mut frame_images = Vec::new();
                for (point, &point_id) in object_points.iter().zip(sample_point_ids.iter()) {
                    if let Some(image_point) = database.observation(pose_id, point_id) {
                        frame_points.push(*point);
                        frame_images.push(image_point);
                    }
                }

                if frame_points.len() < 5 {
                    all_poses_valid = false;
                    break 'validation;
                }

                let options = crate::PoseEstimationOptions {
                    minimal_valid_correspondence_ratio: 0.9,
                    ransac_maximal_sqr_error: max_sqr_error,
                    ..Default::default()
                };

                match crate::determine_pose(
                    camera,
                    rng,
                    &frame_points,
                    &frame_images,
                    None,
                    &options,
                ) {
                    Some((_, error, _)) if error * 2.0 <= max_sqr_error => {}
                    _ => {
                        all_poses_valid = false;
                        break 'validation;
                    }
                }
            }

            if !all_poses_valid {
                continue;
            }
        }

        best_point_distance = point_distance;
        best = Some((poses, pose_indices, object_points, point_indices));
    }

    best.filter(|(poses, _, _, _)| poses.len() >= 2)
}

/// Determines initial 3-D object points from sparse keyframes around a start
/// frame.
///
/// The observations visible at the start frame are propagated forward and
/// backward until the survivor count falls below the relative threshold;
/// perfectly static image points are filtered; up to `maximal_keyframes`
/// keyframes are selected by a 2-D succession over cumulative inter-frame
/// offsets; a RANSAC bootstrap recovers rough structure which a final bundle
/// adjustment stabilizes.
#[allow(clippy::too_many_arguments)]
pub fn determine_initial_object_points_from_sparse_key_frames<R: Rng + ?Sized>(
    database: &Database,
    camera: &Camera,
    rng: &mut R,
    lower_frame: PoseId,
    start_frame: PoseId,
    upper_frame: PoseId,
    maximal_static_ratio: f64,
    points_threshold: &RelativeThreshold,
    minimal_keyframes: usize,
    maximal_keyframes: usize,
    max_sqr_error: f64,
    abort: Option<&AtomicBool>,
) -> Result<InitialObjectPoints> {
    debug_assert!(lower_frame < upper_frame);
    debug_assert!(lower_frame <= start_frame && start_frame <= upper_frame);
    debug_assert!((0.0..=1.0).contains(&maximal_static_ratio));

    // Track image points frame to frame until only the threshold amount of
    // the start frame's points survives.
    let start_ids: Vec<ObjectPointId> = database
        .observations_at(start_frame)
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    let minimal_tracking = points_threshold
        .valid_threshold(start_ids.len() as u32, 5)
        .ok_or(SolverError::InsufficientData)? as usize;

    let mut tracked = track_object_points(
        database,
        &start_ids,
        lower_frame,
        start_frame,
        upper_frame,
        minimal_tracking,
        points_threshold.upper_boundary() as usize,
        abort,
    )
    .ok_or(SolverError::InsufficientData)?;

    if tracked.image_point_groups.len() < minimal_keyframes {
        return Err(SolverError::InsufficientData);
    }
    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    filter_static_image_points(
        &mut tracked.image_point_groups,
        &mut tracked.object_point_ids,
        maximal_static_ratio,
    );

    // Cumulative inter-frame offsets feed a 2-D succession selection of the
    // keyframes.
    let mut offsets: Vec<Vec<f64>> = Vec::with_capacity(tracked.image_point_groups.len());
    offsets.push(vec![0.0, 0.0]);
    for window in tracked.image_point_groups.windows(2) {
        let mut offset = Vector2::zeros();
        for (previous, current) in window[0].iter().zip(window[1].iter()) {
            offset += current - previous;
        }
        let last = offsets.last().expect("seeded with origin");
        offsets.push(vec![last[0] + offset.x, last[1] + offset.y]);
    }

    let mut succession = SuccessionSubset::new(offsets);
    let mut keyframe_indices = succession.subset(maximal_keyframes);
    keyframe_indices.sort_unstable();

    let keyframe_ids: Vec<PoseId> = keyframe_indices
        .iter()
        .map(|&index| tracked.first_frame + index as PoseId)
        .collect();

    let keyframe_groups: Vec<Vec<Vector2<f64>>> = keyframe_indices
        .iter()
        .map(|&index| tracked.image_point_groups[index].clone())
        .collect();

    let ransac_iterations =
        ((keyframe_groups.len() * keyframe_groups.len()) / 2).clamp(10, 100);

    let (rough_poses, rough_pose_indices, rough_points, rough_point_indices) =
        determine_initial_object_points_ransac(
            camera,
            &keyframe_groups,
            rng,
            ransac_iterations,
            &RelativeThreshold::new(10, 0.3, 25),
            max_sqr_error,
            Some((database, &keyframe_ids, &tracked.object_point_ids)),
            abort,
        )
        .ok_or(SolverError::InsufficientData)?;

    let used_pose_ids: Vec<PoseId> = rough_pose_indices
        .iter()
        .map(|&index| keyframe_ids[index])
        .collect();

    // The image-point spread of the accepted sample.
    let mut final_image_point_distance = 0.0;
    for &pose_index in &rough_pose_indices {
        let points: Vec<Vector2<f64>> = rough_point_indices
            .iter()
            .map(|&i| keyframe_groups[pose_index][i])
            .collect();
        final_image_point_distance += average_point_distance(&points);
    }
    final_image_point_distance /= rough_pose_indices.len() as f64;

    // Stabilize the rough structure with a bundle adjustment over the
    // accepted keyframes.
    let groups = ObjectPointGroups::from_image_point_groups(
        &keyframe_groups,
        &rough_pose_indices,
        &rough_point_indices,
    );

    let bundle = optimize_object_points_and_poses(
        camera,
        &rough_poses,
        &rough_points,
        &groups,
        PoseDof::Six,
        false,
        50,
        Estimator::Square,
        0.001,
        5.0,
        false,
    )?;

    if aborted(abort) {
        return Err(SolverError::Aborted);
    }

    let object_point_ids: Vec<ObjectPointId> = rough_point_indices
        .iter()
        .map(|&index| tracked.object_point_ids[index])
        .collect();

    Ok(InitialObjectPoints {
        object_points: bundle.object_points,
        object_point_ids,
        used_pose_ids,
        final_error: bundle.final_error,
        final_image_point_distance,
    })
}
