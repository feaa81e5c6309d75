//! Correspondence-group views over the database.
//!
//! Two dual layouts share one container: one group per pose with
//! `(objectPointId, imagePoint)` elements, or one group per object point
//! with `(poseIndex, imagePoint)` elements, where pose indices refer to
//! positions in the surviving pose list rather than raw pose ids.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector2;

use crate::succession::{pose_vector, SuccessionSubset};
use crate::{Database, ObjectPointId, PoseId};

/// Groups of `(first, imagePoint)` correspondence pairs.
#[derive(Debug, Clone, Default)]
pub struct CorrespondenceGroups<T> {
    groups: Vec<Vec<(T, Vector2<f64>)>>,
}

impl<T> CorrespondenceGroups<T> {
    pub fn from_groups(groups: Vec<Vec<(T, Vector2<f64>)>>) -> Self {
        Self { groups }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    #[inline]
    pub fn group(&self, index: usize) -> &[(T, Vector2<f64>)] {
        &self.groups[index]
    }

    pub fn groups(&self) -> &[Vec<(T, Vector2<f64>)>] {
        &self.groups
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<(T, Vector2<f64>)>> {
        self.groups.iter()
    }

    /// Total number of correspondences over all groups.
    pub fn correspondence_count(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn push_group(&mut self, group: Vec<(T, Vector2<f64>)>) -> usize {
        self.groups.push(group);
        self.groups.len() - 1
    }
}

/// One group per pose, elements `(objectPointId, imagePoint)`.
pub type PoseGroups = CorrespondenceGroups<ObjectPointId>;

/// One group per object point, elements `(poseIndex, imagePoint)`.
pub type ObjectPointGroups = CorrespondenceGroups<u32>;

impl PoseGroups {
    /// Builds one group per pose from the observations of the candidate
    /// object points, dropping poses with fewer than
    /// `minimal_visible_object_points` usable observations.
    ///
    /// Returns the groups, the indices of the surviving poses (into
    /// `pose_ids`) and the indices of all object points used by at least one
    /// surviving pose (into `object_point_ids`).
    pub fn from_database(
        database: &Database,
        pose_ids: &[PoseId],
        object_point_ids: &[ObjectPointId],
        minimal_visible_object_points: usize,
    ) -> (Self, Vec<usize>, Vec<usize>) {
        let candidate_set: BTreeMap<ObjectPointId, usize> = object_point_ids
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, index))
            .collect();

        let mut groups = Vec::new();
        let mut valid_pose_indices = Vec::new();
        let mut used_object_point_indices = BTreeSet::new();

        for (pose_index, &pose_id) in pose_ids.iter().enumerate() {
            let mut group = Vec::new();
            for (object_point_id, image_point) in database.observations_at(pose_id) {
                if candidate_set.contains_key(&object_point_id) {
                    group.push((object_point_id, image_point));
                }
            }

            if group.len() < minimal_visible_object_points {
                continue;
            }

            for (object_point_id, _) in &group {
                used_object_point_indices.insert(candidate_set[object_point_id]);
            }

            groups.push(group);
            valid_pose_indices.push(pose_index);
        }

        (
            Self { groups },
            valid_pose_indices,
            used_object_point_indices.into_iter().collect(),
        )
    }
}

impl ObjectPointGroups {
    /// Builds one group per candidate object point from its observations in
    /// the given poses, dropping points with fewer than
    /// `minimal_observations` observations. Pose indices in the elements
    /// refer to positions in `pose_ids`.
    ///
    /// Returns the groups together with the surviving candidate indices.
    pub fn from_database(
        database: &Database,
        pose_ids: &[PoseId],
        candidate_ids: &[ObjectPointId],
        minimal_observations: usize,
    ) -> (Self, Vec<usize>) {
        let mut groups = Vec::new();
        let mut valid_indices = Vec::new();

        for (candidate_index, &object_point_id) in candidate_ids.iter().enumerate() {
            let observations = database.observations_of_point_in(object_point_id, pose_ids);

            if observations.len() < minimal_observations {
                continue;
            }

            groups.push(
                observations
                    .into_iter()
                    .map(|(pose_index, image_point)| (pose_index as u32, image_point))
                    .collect(),
            );
            valid_indices.push(candidate_index);
        }

        (Self { groups }, valid_indices)
    }

    /// Selects a minimal keyframe subset covering all object points and
    /// builds the per-point groups over it.
    ///
    /// Starting from the pose with the most correspondences, candidate poses
    /// are taken in 6-D pose-succession order; a candidate is kept only while
    /// some object point is still below `minimal_observations`. The selection
    /// stops once every point reached its threshold (or has no further
    /// observations) and at least `minimal_keyframes` poses were chosen.
    ///
    /// Returns the groups (pose indices referring to the keyframe list) and
    /// the chosen keyframe pose ids, or `None` when the range holds no valid
    /// pose.
    pub fn covering(
        database: &Database,
        lower: PoseId,
        upper: PoseId,
        object_point_ids: &[ObjectPointId],
        minimal_observations: usize,
        minimal_keyframes: usize,
    ) -> Option<(Self, Vec<PoseId>)> {
        let candidate_pose_ids = database.valid_pose_ids(lower, upper);
        if candidate_pose_ids.is_empty() {
            return None;
        }

        let pose_vectors: Vec<Vec<f64>> = candidate_pose_ids
            .iter()
            .map(|&pose_id| pose_vector(&database.pose(pose_id).expect("valid pose")))
            .collect();

        let mut succession = SuccessionSubset::new(pose_vectors);

        // The ids of all object points which currently don't have enough
        // observations.
        let mut pending: BTreeSet<ObjectPointId> = object_point_ids.iter().copied().collect();
        let mut observation_counts: BTreeMap<ObjectPointId, usize> = BTreeMap::new();

        let (first_pose_id, _) = candidate_pose_ids
            .iter()
            .map(|&pose_id| (pose_id, database.correspondence_count(pose_id, false)))
            .max_by_key(|&(pose_id, count)| (count, std::cmp::Reverse(pose_id)))?;

        let first_index = candidate_pose_ids
            .iter()
            .position(|&id| id == first_pose_id)?;
        succession.increment_with(first_index);

        let mut keyframe_ids = vec![first_pose_id];
        for &object_point_id in object_point_ids {
            if database.has_observation(first_pose_id, object_point_id) {
                let count = observation_counts.entry(object_point_id).or_insert(0);
                *count += 1;
                if *count >= minimal_observations {
                    pending.remove(&object_point_id);
                }
            }
        }

        while succession.selected().len() < succession.len() {
            if keyframe_ids.len() >= minimal_keyframes && pending.is_empty() {
                break;
            }

            // Another keyframe is needed; skip candidates not contributing to
            // any under-covered object point.
            while let Some(candidate_index) = succession.increment() {
                let pose_id = candidate_pose_ids[candidate_index];

                let visible: Vec<ObjectPointId> = object_point_ids
                    .iter()
                    .copied()
                    .filter(|&id| database.has_observation(pose_id, id))
                    .collect();

                let contributes =
                    pending.is_empty() || visible.iter().any(|id| pending.contains(id));
                if !contributes {
                    continue;
                }

                keyframe_ids.push(pose_id);
                for object_point_id in visible {
                    let count = observation_counts.entry(object_point_id).or_insert(0);
                    *count += 1;
                    if *count >= minimal_observations {
                        pending.remove(&object_point_id);
                    }
                }
                break;
            }
        }

        let mut groups = Vec::with_capacity(object_point_ids.len());
        for &object_point_id in object_point_ids {
            groups.push(
                database
                    .observations_of_point_in(object_point_id, &keyframe_ids)
                    .into_iter()
                    .map(|(pose_index, image_point)| (pose_index as u32, image_point))
                    .collect(),
            );
        }

        Some((Self { groups }, keyframe_ids))
    }

    /// Builds per-point groups from in-memory image-point groups: for each
    /// selected point index, the elements pair each selected pose index with
    /// the point's image point in that group.
    pub fn from_image_point_groups(
        image_point_groups: &[Vec<Vector2<f64>>],
        pose_subset: &[usize],
        point_subset: &[usize],
    ) -> Self {
        let groups = point_subset
            .iter()
            .map(|&point_index| {
                pose_subset
                    .iter()
                    .enumerate()
                    .map(|(k, &pose_group)| {
                        (k as u32, image_point_groups[pose_group][point_index])
                    })
                    .collect()
            })
            .collect();

        Self { groups }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Point3};

    fn grid_database(poses: u32, points: u32) -> (Database, Vec<ObjectPointId>) {
        let mut db = Database::new();
        for pose_id in 0..poses {
            db.add_pose(
                pose_id,
                Some(Isometry3::translation(pose_id as f64 * 0.1, 0.0, 0.0)),
            );
        }

        let mut ids = Vec::new();
        for p in 0..points {
            let id = db.add_object_point(Some(Point3::new(p as f64, 0.0, -2.0)));
            ids.push(id);
            for pose_id in 0..poses {
                db.add_observation(pose_id, id, Vector2::new(p as f64, pose_id as f64));
            }
        }

        (db, ids)
    }

    #[test]
    fn surviving_rows_match_group_count() {
        let (mut db, ids) = grid_database(4, 6);

        // The last point loses all observations and falls below the
        // threshold.
        db.remove_object_point(*ids.last().unwrap());

        let pose_ids: Vec<PoseId> = (0..4).collect();
        let (groups, valid) =
            ObjectPointGroups::from_database(&db, &pose_ids, &ids, 2);

        assert_eq!(groups.len(), valid.len());
        assert_eq!(groups.len(), 5);

        for group in groups.iter() {
            assert_eq!(group.len(), 4);
            // Pose indices refer to the surviving pose list.
            assert!(group.iter().all(|&(index, _)| (index as usize) < pose_ids.len()));
        }
    }

    #[test]
    fn pose_groups_drop_sparse_poses() {
        let (mut db, ids) = grid_database(3, 4);
        db.add_pose(3, Some(Isometry3::identity()));
        db.add_observation(3, ids[0], Vector2::new(0.0, 3.0));

        let pose_ids: Vec<PoseId> = (0..4).collect();
        let (groups, valid_poses, used_points) =
            PoseGroups::from_database(&db, &pose_ids, &ids, 2);

        // Pose 3 sees only one candidate and is dropped.
        assert_eq!(groups.len(), 3);
        assert_eq!(valid_poses, vec![0, 1, 2]);
        assert_eq!(used_points.len(), 4);
    }

    #[test]
    fn covering_reaches_all_points() {
        let (db, ids) = grid_database(8, 5);

        let (groups, keyframes) =
            ObjectPointGroups::covering(&db, 0, 7, &ids, 3, 2).unwrap();

        assert!(keyframes.len() >= 3);
        assert_eq!(groups.len(), ids.len());
        for group in groups.iter() {
            assert!(group.len() >= 3);
        }
    }

    #[test]
    fn image_point_group_layout() {
        let image_point_groups = vec![
            vec![Vector2::new(0.0, 0.0), Vector2::new(1.0, 0.0)],
            vec![Vector2::new(0.0, 1.0), Vector2::new(1.0, 1.0)],
            vec![Vector2::new(0.0, 2.0), Vector2::new(1.0, 2.0)],
        ];

        let groups =
            ObjectPointGroups::from_image_point_groups(&image_point_groups, &[0, 2], &[1]);

        assert_eq!(groups.len(), 1);
        let group = groups.group(0);
        assert_eq!(group.len(), 2);
        assert_eq!(group[0], (0, Vector2::new(1.0, 0.0)));
        assert_eq!(group[1], (1, Vector2::new(1.0, 2.0)));
    }
}
