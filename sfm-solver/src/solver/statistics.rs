//! Projection-error and correspondence statistics over the database.

use nalgebra::Vector2;

use obs_database::succession::{pose_vector, SuccessionSubset};
use obs_database::{Database, ObjectPointId, PoseId};
use sfm_camera::Camera;

use crate::worker::execute_range_with;

/// Min / average / max squared projection error over a set of
/// correspondences, together with the number of contributing observations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProjectionErrorStatistics {
    pub observations: usize,
    pub minimal_sqr_error: f64,
    pub average_sqr_error: f64,
    pub maximal_sqr_error: f64,
}

/// Correspondence-count statistics over a frame range.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CorrespondenceStatistics {
    pub minimal: usize,
    pub average: f64,
    pub median: usize,
    pub maximal: usize,
}

/// The average distance of a set of image points to their centre of gravity,
/// a measure of how widely the points spread over the image.
pub fn average_point_distance(points: &[Vector2<f64>]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }

    let mut centre = Vector2::zeros();
    for point in points {
        centre += point;
    }
    centre /= points.len() as f64;

    points.iter().map(|point| (point - centre).norm()).sum::<f64>() / points.len() as f64
}

/// Projection-error statistics for all located correspondences of one pose.
pub fn determine_projection_error(
    database: &Database,
    camera: &Camera,
    pose_id: PoseId,
) -> Option<ProjectionErrorStatistics> {
    let pose = database.pose(pose_id)?;
    let correspondences = database.located_correspondences(pose_id, 0);

    if correspondences.is_empty() {
        return None;
    }

    let mut statistics = ProjectionErrorStatistics {
        observations: correspondences.len(),
        minimal_sqr_error: f64::MAX,
        average_sqr_error: 0.0,
        maximal_sqr_error: 0.0,
    };

    for correspondence in &correspondences {
        let error = (camera.project(&pose, &correspondence.object_point)
            - correspondence.image_point)
            .norm_squared();

        statistics.minimal_sqr_error = statistics.minimal_sqr_error.min(error);
        statistics.maximal_sqr_error = statistics.maximal_sqr_error.max(error);
        statistics.average_sqr_error += error;
    }

    statistics.average_sqr_error /= correspondences.len() as f64;
    Some(statistics)
}

/// Per-object-point projection-error statistics over a pose range,
/// optionally in parallel across the worker pool.
pub fn determine_projection_errors(
    database: &Database,
    camera: &Camera,
    object_point_ids: &[ObjectPointId],
    lower_frame: PoseId,
    upper_frame: PoseId,
    pool: Option<&rayon::ThreadPool>,
) -> Vec<Option<ProjectionErrorStatistics>> {
    let mut results: Vec<Option<ProjectionErrorStatistics>> = vec![None; object_point_ids.len()];

    execute_range_with(pool, &mut results, |chunk, offset, _| {
        for (i, slot) in chunk.iter_mut().enumerate() {
            let object_point_id = object_point_ids[offset + i];

            let Some(position) = database.object_point_position(object_point_id) else {
                continue;
            };

            let mut statistics = ProjectionErrorStatistics {
                observations: 0,
                minimal_sqr_error: f64::MAX,
                average_sqr_error: 0.0,
                maximal_sqr_error: 0.0,
            };

            for (pose_id, image_point) in
                database.observations_of_point_in_range(object_point_id, lower_frame, upper_frame)
            {
                let Some(pose) = database.pose(pose_id) else {
                    continue;
                };

                let error = (camera.project(&pose, &position) - image_point).norm_squared();
                statistics.minimal_sqr_error = statistics.minimal_sqr_error.min(error);
                statistics.maximal_sqr_error = statistics.maximal_sqr_error.max(error);
                statistics.average_sqr_error += error;
                statistics.observations += 1;
            }

            if statistics.observations > 0 {
                statistics.average_sqr_error /= statistics.observations as f64;
                *slot = Some(statistics);
            }
        }
    });

    results
}

/// Correspondence-count statistics over the registered frames of a range.
pub fn determine_number_correspondences(
    database: &Database,
    need_valid_pose: bool,
    lower_frame: PoseId,
    upper_frame: PoseId,
) -> Option<CorrespondenceStatistics> {
    let frames = if need_valid_pose {
        database.valid_pose_ids(lower_frame, upper_frame)
    } else {
        database.pose_ids(lower_frame, upper_frame)
    };

    if frames.is_empty() {
        return None;
    }

    let mut counts: Vec<usize> = frames
        .iter()
        .map(|&frame| database.correspondence_count(frame, true))
        .collect();
    counts.sort_unstable();

    Some(CorrespondenceStatistics {
        minimal: counts[0],
        average: counts.iter().sum::<usize>() as f64 / counts.len() as f64,
        median: counts[counts.len() / 2],
        maximal: *counts.last().expect("non-empty counts"),
    })
}

/// Picks up to `count` representative poses by a 6-D succession over the
/// valid poses of the range (greedy max-distance subset over exponential
/// rotation + translation coordinates).
pub fn determine_representative_poses(
    database: &Database,
    lower_frame: PoseId,
    upper_frame: PoseId,
    count: usize,
) -> Vec<PoseId> {
    let pose_ids = database.valid_pose_ids(lower_frame, upper_frame);

    if pose_ids.len() <= count {
        return pose_ids;
    }

    let vectors: Vec<Vec<f64>> = pose_ids
        .iter()
        .map(|&pose_id| pose_vector(&database.pose(pose_id).expect("valid pose")))
        .collect();

    let mut succession = SuccessionSubset::new(vectors);
    let mut subset = succession.subset(count);
    subset.sort_unstable();

    subset.into_iter().map(|index| pose_ids[index]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Point3};

    #[test]
    fn point_distance_of_symmetric_set() {
        let points = vec![
            Vector2::new(-1.0, 0.0),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, -1.0),
            Vector2::new(0.0, 1.0),
        ];
        assert_relative_eq!(average_point_distance(&points), 1.0);
    }

    #[test]
    fn projection_errors_reflect_position_offsets() {
        let camera = Camera::from_params(640, 480, 500.0, 500.0, 320.0, 240.0).unwrap();
        let mut db = Database::new();

        db.add_pose(0, Some(Isometry3::identity()));
        db.add_pose(1, Some(Isometry3::translation(0.2, 0.0, 0.0)));

        let truth = Point3::new(0.1, 0.1, -2.0);
        let id = db.add_object_point(Some(truth));

        for pose_id in 0..2 {
            let pose = db.pose(pose_id).unwrap();
            db.add_observation(pose_id, id, camera.project(&pose, &truth));
        }

        let exact = determine_projection_errors(&db, &camera, &[id], 0, 1, None);
        let statistics = exact[0].unwrap();
        assert_eq!(statistics.observations, 2);
        assert!(statistics.maximal_sqr_error < 1e-16);

        // Shift the stored point; the error has to grow accordingly.
        db.set_object_point_position(id, Some(Point3::new(0.1, 0.1, -2.1)));
        let shifted = determine_projection_errors(&db, &camera, &[id], 0, 1, None);
        assert!(shifted[0].unwrap().average_sqr_error > 1.0);
    }

    #[test]
    fn representative_poses_cover_the_range() {
        let mut db = Database::new();
        for n in 0..20 {
            db.add_pose(n, Some(Isometry3::translation(n as f64 * 0.1, 0.0, 0.0)));
        }

        let representative = determine_representative_poses(&db, 0, 19, 5);
        assert_eq!(representative.len(), 5);
        assert!(representative.contains(&0) || representative.contains(&19));
    }
}
