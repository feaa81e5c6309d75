//! Database cleanup: removal of degenerate object points.

use obs_database::{Database, ObjectPointId};
use sfm_camera::{standard_to_inverted_flipped, Camera};

/// Removes every located object point whose position lands behind any of
/// its observing cameras. Returns the number of removed points and fills the
/// optional id list.
pub fn remove_object_points_not_in_front_of_camera(
    database: &mut Database,
    camera: &Camera,
    mut removed_object_point_ids: Option<&mut Vec<ObjectPointId>>,
) -> usize {
    let mut removed = 0usize;

    for object_point_id in database.located_object_point_ids() {
        let position = database
            .object_point_position(object_point_id)
            .expect("located point");

        let mut in_front = true;
        for (pose_id, _) in database.observations_of_point(object_point_id) {
            if let Some(pose) = database.pose(pose_id) {
                let flipped = standard_to_inverted_flipped(&pose);
                if !camera.is_object_point_in_front_if(&flipped, &position) {
                    in_front = false;
                    break;
                }
            }
        }

        if !in_front {
            database.remove_object_point(object_point_id);
            if let Some(ids) = removed_object_point_ids.as_deref_mut() {
                ids.push(object_point_id);
            }
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!(removed, "removed object points behind cameras");
    }

    removed
}

/// Removes every object point with fewer than `minimal_observations`
/// observations.
pub fn remove_object_points_without_enough_observations(
    database: &mut Database,
    minimal_observations: usize,
    mut removed_object_point_ids: Option<&mut Vec<ObjectPointId>>,
) -> usize {
    debug_assert!(minimal_observations >= 1);

    let mut removed = 0usize;

    for object_point_id in database.object_point_ids() {
        if database.observation_count(object_point_id) < minimal_observations {
            database.remove_object_point(object_point_id);
            if let Some(ids) = removed_object_point_ids.as_deref_mut() {
                ids.push(object_point_id);
            }
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!(removed, "removed object points with too few observations");
    }

    removed
}

/// Removes every object point whose observing-camera translations lie in a
/// bounding box with a diagonal shorter than `minimal_box_diagonal` (too
/// small a baseline for a reliable triangulation).
pub fn remove_object_points_with_small_baseline(
    database: &mut Database,
    minimal_box_diagonal: f64,
    mut removed_object_point_ids: Option<&mut Vec<ObjectPointId>>,
) -> usize {
    debug_assert!(minimal_box_diagonal > 0.0);

    let mut removed = 0usize;

    for object_point_id in database.object_point_ids() {
        let mut lower = [f64::MAX; 3];
        let mut upper = [f64::MIN; 3];
        let mut any_valid_pose = false;

        for (pose_id, _) in database.observations_of_point(object_point_id) {
            if let Some(pose) = database.pose(pose_id) {
                any_valid_pose = true;
                let translation = pose.translation.vector;
                for axis in 0..3 {
                    lower[axis] = lower[axis].min(translation[axis]);
                    upper[axis] = upper[axis].max(translation[axis]);
                }
            }
        }

        let diagonal = if any_valid_pose {
            ((upper[0] - lower[0]).powi(2)
                + (upper[1] - lower[1]).powi(2)
                + (upper[2] - lower[2]).powi(2))
            .sqrt()
        } else {
            0.0
        };

        if !any_valid_pose || diagonal < minimal_box_diagonal {
            database.remove_object_point(object_point_id);
            if let Some(ids) = removed_object_point_ids.as_deref_mut() {
                ids.push(object_point_id);
            }
            removed += 1;
        }
    }

    if removed > 0 {
        tracing::debug!(removed, "removed object points with small baseline");
    }

    removed
}
