//! Observation database for structure-from-motion trackers.
//!
//! The database is the substrate of the pipeline: it owns camera poses,
//! 3-D object points and the `(poseId, objectPointId, imagePoint)`
//! observations joining them. The solver borrows it mutably during
//! write-back phases and immutably elsewhere; accessors derive short-lived
//! correspondence-group views from it.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{Isometry3, Point3, Vector2};

mod accessors;
pub mod succession;

pub use crate::accessors::{CorrespondenceGroups, ObjectPointGroups, PoseGroups};

pub type PoseId = u32;
pub type ObjectPointId = u32;

/// A 3-D object point; the position is absent until first triangulation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPoint {
    pub position: Option<Point3<f64>>,
    pub priority: f32,
}

impl ObjectPoint {
    #[inline]
    pub fn is_located(&self) -> bool {
        self.position.is_some()
    }
}

/// A located correspondence at a single pose.
#[derive(Debug, Clone, PartialEq)]
pub struct Correspondence {
    pub object_point_id: ObjectPointId,
    pub object_point: Point3<f64>,
    pub image_point: Vector2<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct Database {
    poses: BTreeMap<PoseId, Option<Isometry3<f64>>>,
    object_points: BTreeMap<ObjectPointId, ObjectPoint>,
    /// Primary observation join, ordered by pose then object point.
    observations: BTreeMap<(PoseId, ObjectPointId), Vector2<f64>>,
    /// Reverse index: the poses observing each object point.
    observing_poses: BTreeMap<ObjectPointId, BTreeSet<PoseId>>,
    next_object_point_id: ObjectPointId,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    // -- poses ---------------------------------------------------------------

    /// Registers a pose id; the pose starts invalid unless one is given.
    pub fn add_pose(&mut self, pose_id: PoseId, world_t_camera: Option<Isometry3<f64>>) -> bool {
        if self.poses.contains_key(&pose_id) {
            return false;
        }
        self.poses.insert(pose_id, world_t_camera);
        true
    }

    /// Sets or invalidates the pose of a registered frame.
    pub fn set_pose(&mut self, pose_id: PoseId, world_t_camera: Option<Isometry3<f64>>) -> bool {
        match self.poses.get_mut(&pose_id) {
            Some(entry) => {
                *entry = world_t_camera;
                true
            }
            None => false,
        }
    }

    /// The pose of a frame; `None` if unregistered or not yet recovered.
    pub fn pose(&self, pose_id: PoseId) -> Option<Isometry3<f64>> {
        self.poses.get(&pose_id).copied().flatten()
    }

    pub fn has_pose(&self, pose_id: PoseId) -> bool {
        self.poses.contains_key(&pose_id)
    }

    pub fn pose_count(&self) -> usize {
        self.poses.len()
    }

    /// Registered pose ids within the inclusive range.
    pub fn pose_ids(&self, lower: PoseId, upper: PoseId) -> Vec<PoseId> {
        self.poses.range(lower..=upper).map(|(&id, _)| id).collect()
    }

    /// Registered pose ids with a valid pose within the inclusive range.
    pub fn valid_pose_ids(&self, lower: PoseId, upper: PoseId) -> Vec<PoseId> {
        self.poses
            .range(lower..=upper)
            .filter_map(|(&id, pose)| pose.map(|_| id))
            .collect()
    }

    pub fn remove_pose(&mut self, pose_id: PoseId) -> bool {
        if self.poses.remove(&pose_id).is_none() {
            return false;
        }

        let attached: Vec<ObjectPointId> = self
            .observations
            .range((pose_id, 0)..=(pose_id, ObjectPointId::MAX))
            .map(|(&(_, object_point_id), _)| object_point_id)
            .collect();

        for object_point_id in attached {
            self.observations.remove(&(pose_id, object_point_id));
            if let Some(poses) = self.observing_poses.get_mut(&object_point_id) {
                poses.remove(&pose_id);
            }
        }

        true
    }

    // -- object points -------------------------------------------------------

    /// Adds a new object point and returns its id.
    pub fn add_object_point(&mut self, position: Option<Point3<f64>>) -> ObjectPointId {
        self.add_object_point_with_priority(position, 0.0)
    }

    pub fn add_object_point_with_priority(
        &mut self,
        position: Option<Point3<f64>>,
        priority: f32,
    ) -> ObjectPointId {
        let id = self.next_object_point_id;
        self.next_object_point_id += 1;
        self.object_points
            .insert(id, ObjectPoint { position, priority });
        id
    }

    pub fn object_point(&self, id: ObjectPointId) -> Option<&ObjectPoint> {
        self.object_points.get(&id)
    }

    /// The 3-D position, `None` if the point is unknown or not located.
    pub fn object_point_position(&self, id: ObjectPointId) -> Option<Point3<f64>> {
        self.object_points.get(&id).and_then(|p| p.position)
    }

    pub fn has_object_point(&self, id: ObjectPointId) -> bool {
        self.object_points.contains_key(&id)
    }

    pub fn object_point_count(&self) -> usize {
        self.object_points.len()
    }

    pub fn set_object_point_position(
        &mut self,
        id: ObjectPointId,
        position: Option<Point3<f64>>,
    ) -> bool {
        match self.object_points.get_mut(&id) {
            Some(point) => {
                point.position = position;
                true
            }
            None => false,
        }
    }

    /// Sets the positions of several object points at once.
    pub fn set_object_point_positions(&mut self, ids: &[ObjectPointId], positions: &[Point3<f64>]) {
        debug_assert_eq!(ids.len(), positions.len());
        for (&id, &position) in ids.iter().zip(positions.iter()) {
            self.set_object_point_position(id, Some(position));
        }
    }

    /// Invalidates the position of every object point.
    pub fn invalidate_all_object_point_positions(&mut self) {
        for point in self.object_points.values_mut() {
            point.position = None;
        }
    }

    pub fn remove_object_point(&mut self, id: ObjectPointId) -> bool {
        if self.object_points.remove(&id).is_none() {
            return false;
        }

        if let Some(poses) = self.observing_poses.remove(&id) {
            for pose_id in poses {
                self.observations.remove(&(pose_id, id));
            }
        }

        true
    }

    pub fn object_point_ids(&self) -> Vec<ObjectPointId> {
        self.object_points.keys().copied().collect()
    }

    /// Ids of located object points.
    pub fn located_object_point_ids(&self) -> Vec<ObjectPointId> {
        self.object_points
            .iter()
            .filter(|(_, p)| p.is_located())
            .map(|(&id, _)| id)
            .collect()
    }

    /// Ids of unlocated object points with at least the given priority.
    pub fn unlocated_object_point_ids(&self, minimal_priority: f32) -> Vec<ObjectPointId> {
        self.object_points
            .iter()
            .filter(|(_, p)| !p.is_located() && p.priority >= minimal_priority)
            .map(|(&id, _)| id)
            .collect()
    }

    /// Ids of object points observed within the pose range. With
    /// `only_located`, restricts to points with a valid 3-D position; with
    /// `visible_in_all`, the point must be observed at every registered pose
    /// of the range.
    pub fn object_point_ids_in_range(
        &self,
        lower: PoseId,
        upper: PoseId,
        only_located: bool,
        visible_in_all: bool,
    ) -> Vec<ObjectPointId> {
        let range_poses: Vec<PoseId> = self.pose_ids(lower, upper);

        self.object_points
            .iter()
            .filter(|(_, p)| !only_located || p.is_located())
            .filter(|(&id, _)| {
                let observing = match self.observing_poses.get(&id) {
                    Some(observing) => observing,
                    None => return false,
                };
                if visible_in_all {
                    range_poses.iter().all(|pose_id| observing.contains(pose_id))
                } else {
                    observing.range(lower..=upper).next().is_some()
                }
            })
            .map(|(&id, _)| id)
            .collect()
    }

    // -- observations --------------------------------------------------------

    /// Registers an observation; both the pose and the object point must
    /// exist. An existing observation for the pair is replaced.
    pub fn add_observation(
        &mut self,
        pose_id: PoseId,
        object_point_id: ObjectPointId,
        image_point: Vector2<f64>,
    ) -> bool {
        if !self.poses.contains_key(&pose_id) || !self.object_points.contains_key(&object_point_id)
        {
            return false;
        }

        self.observations.insert((pose_id, object_point_id), image_point);
        self.observing_poses
            .entry(object_point_id)
            .or_default()
            .insert(pose_id);
        true
    }

    pub fn observation(&self, pose_id: PoseId, object_point_id: ObjectPointId) -> Option<Vector2<f64>> {
        self.observations.get(&(pose_id, object_point_id)).copied()
    }

    #[inline]
    pub fn has_observation(&self, pose_id: PoseId, object_point_id: ObjectPointId) -> bool {
        self.observations.contains_key(&(pose_id, object_point_id))
    }

    /// All `(objectPointId, imagePoint)` pairs observed at a pose.
    pub fn observations_at(&self, pose_id: PoseId) -> Vec<(ObjectPointId, Vector2<f64>)> {
        self.observations
            .range((pose_id, 0)..=(pose_id, ObjectPointId::MAX))
            .map(|(&(_, object_point_id), &image_point)| (object_point_id, image_point))
            .collect()
    }

    /// Located correspondences at a pose whose object points have at least
    /// `minimal_observations` observations overall.
    pub fn located_correspondences(
        &self,
        pose_id: PoseId,
        minimal_observations: usize,
    ) -> Vec<Correspondence> {
        self.observations
            .range((pose_id, 0)..=(pose_id, ObjectPointId::MAX))
            .filter_map(|(&(_, object_point_id), &image_point)| {
                let position = self.object_point_position(object_point_id)?;
                if minimal_observations > 1
                    && self.observation_count(object_point_id) < minimal_observations
                {
                    return None;
                }
                Some(Correspondence {
                    object_point_id,
                    object_point: position,
                    image_point,
                })
            })
            .collect()
    }

    /// Located correspondences at a pose, split into a priority set and the
    /// remaining observations.
    pub fn located_correspondences_split(
        &self,
        pose_id: PoseId,
        priority_ids: &BTreeSet<ObjectPointId>,
    ) -> (Vec<Correspondence>, Vec<Correspondence>) {
        self.located_correspondences(pose_id, 0)
            .into_iter()
            .partition(|c| priority_ids.contains(&c.object_point_id))
    }

    /// The number of observations at a pose; with `only_located`, only
    /// observations of located object points count.
    pub fn correspondence_count(&self, pose_id: PoseId, only_located: bool) -> usize {
        self.observations
            .range((pose_id, 0)..=(pose_id, ObjectPointId::MAX))
            .filter(|(&(_, object_point_id), _)| {
                !only_located || self.object_point_position(object_point_id).is_some()
            })
            .count()
    }

    /// The pose with the most correspondences within the inclusive range.
    pub fn pose_with_most_correspondences(
        &self,
        lower: PoseId,
        upper: PoseId,
        only_located: bool,
    ) -> Option<(PoseId, usize)> {
        self.poses
            .range(lower..=upper)
            .map(|(&pose_id, _)| (pose_id, self.correspondence_count(pose_id, only_located)))
            .max_by_key(|&(pose_id, count)| (count, std::cmp::Reverse(pose_id)))
    }

    /// All observations of an object point, ordered by pose id.
    pub fn observations_of_point(&self, object_point_id: ObjectPointId) -> Vec<(PoseId, Vector2<f64>)> {
        match self.observing_poses.get(&object_point_id) {
            Some(poses) => poses
                .iter()
                .map(|&pose_id| {
                    (
                        pose_id,
                        self.observations[&(pose_id, object_point_id)],
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Observations of an object point within the inclusive pose range.
    pub fn observations_of_point_in_range(
        &self,
        object_point_id: ObjectPointId,
        lower: PoseId,
        upper: PoseId,
    ) -> Vec<(PoseId, Vector2<f64>)> {
        match self.observing_poses.get(&object_point_id) {
            Some(poses) => poses
                .range(lower..=upper)
                .map(|&pose_id| {
                    (
                        pose_id,
                        self.observations[&(pose_id, object_point_id)],
                    )
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Observations of an object point within a given pose list; returns the
    /// indices into `pose_ids` together with the image points.
    pub fn observations_of_point_in(
        &self,
        object_point_id: ObjectPointId,
        pose_ids: &[PoseId],
    ) -> Vec<(usize, Vector2<f64>)> {
        pose_ids
            .iter()
            .enumerate()
            .filter_map(|(index, &pose_id)| {
                self.observation(pose_id, object_point_id)
                    .map(|image_point| (index, image_point))
            })
            .collect()
    }

    pub fn observation_count(&self, object_point_id: ObjectPointId) -> usize {
        self.observing_poses
            .get(&object_point_id)
            .map_or(0, |poses| poses.len())
    }

    pub fn poses_observing(&self, object_point_id: ObjectPointId) -> Vec<PoseId> {
        self.observing_poses
            .get(&object_point_id)
            .map_or_else(Vec::new, |poses| poses.iter().copied().collect())
    }
}
