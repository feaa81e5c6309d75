use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use nalgebra::{Isometry3, UnitQuaternion};
use rand::Rng;
use serde::{Deserialize, Serialize};

use sfm_camera::Camera;

use crate::contracts::TrackingBackend;
use crate::mesh::TexturedTriMesh;
use crate::object::MeshObject;
use crate::{MeshTrackerError, Result, Timestamp};

pub type ObjectId = u32;

/// Algorithm parameters for tracking a single object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackingOptions {
    /// Number of successfully tracked points required for an estimated pose
    /// to count as valid during tracking.
    pub minimal_tracked_points: usize,
    /// Number of pyramid layers used for frame-to-frame tracking.
    pub pyramid_layers: usize,
    /// RANSAC iterations when verifying a newly recognized object.
    pub recognition_ransac_iterations: usize,
    /// Maximal time in seconds spent on round-robin rectification right
    /// after a successful recognition.
    pub recognition_rectification_budget: f64,
    /// Maximal time in seconds spent on round-robin rectification per
    /// tracked frame.
    pub tracking_rectification_budget: f64,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            minimal_tracked_points: 4,
            pyramid_layers: 3,
            recognition_ransac_iterations: 50,
            recognition_rectification_budget: 0.006,
            tracking_rectification_budget: 0.002,
        }
    }
}

/// Configuration of the tracker core.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackerOptions {
    /// Maximal number of objects visible concurrently; 0 means no limit.
    pub concurrent_tracked_object_limit: usize,
    /// Maximal number of features extracted per recognition attempt;
    /// 0 means no limit.
    pub max_features: usize,
    /// Maximal time in seconds spent on one feature-based recognition
    /// attempt, including the post-recognition rectification; 0 means no
    /// limit.
    pub max_time_allowed_for_recognition: f64,
    /// Seconds to wait between recognition attempts while at least one
    /// object is tracked.
    pub recognition_cadence_with_tracked_objects: f64,
    /// Seconds to wait between recognition attempts while nothing is
    /// tracked.
    pub recognition_cadence_without_tracked_objects: f64,
    /// Consumers may reuse a cached pose guess while its age stays within
    /// this bound, in seconds.
    pub maximal_pose_guess_age: f64,
    pub tracking: TrackingOptions,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            concurrent_tracked_object_limit: 1,
            max_features: 0,
            max_time_allowed_for_recognition: 0.0,
            recognition_cadence_with_tracked_objects: 0.5,
            recognition_cadence_without_tracked_objects: 0.0,
            maximal_pose_guess_age: 0.5,
            tracking: TrackingOptions::default(),
        }
    }
}

/// The mesh tracker core: a per-object state machine coordinating
/// frame-to-frame tracking, rectified per-triangle refinement and
/// feature-based recognition under a configurable cadence.
pub struct MeshTrackerCore<B: TrackingBackend> {
    backend: B,
    options: TrackerOptions,
    objects: BTreeMap<ObjectId, MeshObject<B>>,
    next_object_id: ObjectId,
    previous_frame: Option<(B::Frame, Timestamp)>,
    /// Timestamp of the last frame in which new objects were sought.
    last_recognition_attempt: Option<Timestamp>,
    /// Round-robin cursor of feature-based recognition.
    last_object_tested_for_recognition: Option<ObjectId>,
}

impl<B: TrackingBackend> MeshTrackerCore<B> {
    pub fn new(backend: B, options: TrackerOptions) -> Self {
        Self {
            backend,
            options,
            objects: BTreeMap::new(),
            next_object_id: 0,
            previous_frame: None,
            last_recognition_attempt: None,
            last_object_tested_for_recognition: None,
        }
    }

    #[inline]
    pub fn options(&self) -> &TrackerOptions {
        &self.options
    }

    /// Registers a new UV-mapped mesh tracking object; the triangle
    /// rectification order is shuffled from the caller's generator.
    pub fn add<R: Rng + ?Sized>(
        &mut self,
        texture: &B::Frame,
        mesh: TexturedTriMesh,
        rng: &mut R,
    ) -> ObjectId {
        let object = MeshObject::new(
            &self.backend,
            texture,
            mesh,
            self.options.tracking.pyramid_layers,
            rng,
        );

        let id = self.next_object_id;
        self.next_object_id += 1;
        self.objects.insert(id, object);
        id
    }

    pub fn remove(&mut self, object_id: ObjectId) -> Result<()> {
        self.objects
            .remove(&object_id)
            .map(|_| ())
            .ok_or(MeshTrackerError::UnknownObject)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    #[inline]
    pub fn object(&self, object_id: ObjectId) -> Option<&MeshObject<B>> {
        self.objects.get(&object_id)
    }

    #[inline]
    pub fn registered_object_count(&self) -> usize {
        self.objects.len()
    }

    /// The number of objects with a valid pose in the most recent frame.
    pub fn tracked_object_count(&self) -> usize {
        self.objects
            .values()
            .filter(|object| object.pose_world_t_camera().is_some())
            .count()
    }

    /// The effective concurrent cap: the configured limit or, if unlimited,
    /// the number of registered objects.
    fn concurrent_limit(&self) -> usize {
        if self.options.concurrent_tracked_object_limit == 0 {
            self.objects.len()
        } else {
            self.options
                .concurrent_tracked_object_limit
                .min(self.objects.len())
        }
    }

    /// Seconds to wait between recognition attempts, depending on whether
    /// anything is currently tracked.
    fn recognition_cadence(&self, tracked_objects: usize) -> f64 {
        if tracked_objects == 0 {
            self.options.recognition_cadence_without_tracked_objects
        } else {
            self.options.recognition_cadence_with_tracked_objects
        }
    }

    /// Resets all tracking state but keeps the registered objects; use this
    /// e.g. when the input resolution changes.
    pub fn untrack_all(&mut self) {
        for object in self.objects.values_mut() {
            object.reset(false);
        }
        self.previous_frame = None;
        self.last_recognition_attempt = None;
        self.last_object_tested_for_recognition = None;
    }

    /// The next untracked object in round-robin order after the last one
    /// tested for recognition.
    fn next_recognition_candidate(&self) -> Option<ObjectId> {
        let untracked: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, object)| object.pose_world_t_camera().is_none())
            .map(|(&id, _)| id)
            .collect();

        if untracked.is_empty() {
            return None;
        }

        match self.last_object_tested_for_recognition {
            Some(last) => untracked
                .iter()
                .copied()
                .find(|&id| id > last)
                .or_else(|| untracked.first().copied()),
            None => untracked.first().copied(),
        }
    }

    /// Processes one frame: frame-to-frame tracking for objects with a
    /// previous pose, budgeted round-robin rectification, per-object pose
    /// re-estimation, and at most one feature-based recognition attempt
    /// gated by the cadence and the concurrent-tracked-object cap.
    ///
    /// Returns the `(objectId, world_T_camera)` poses of all objects tracked
    /// in this frame.
    #[allow(clippy::too_many_arguments)]
    pub fn track_frame<R: Rng + ?Sized>(
        &mut self,
        timestamp: Timestamp,
        frame: B::Frame,
        camera: &Camera,
        allow_recognition: bool,
        rotation_previous_t_current: Option<&UnitQuaternion<f64>>,
        rng: &mut R,
    ) -> Vec<(ObjectId, Isometry3<f64>)> {
        let minimal_tracked = self.options.tracking.minimal_tracked_points;

        // Frame-to-frame tracking of every object with a previous pose.
        if let Some((previous_frame, _)) = &self.previous_frame {
            for object in self.objects.values_mut() {
                if object.pose_world_t_camera().is_none() {
                    continue;
                }

                let tracked_points = object.track_frame_to_frame(
                    &self.backend,
                    previous_frame,
                    &frame,
                    rotation_previous_t_current,
                );

                if tracked_points < minimal_tracked {
                    // Lost: drop the correspondences, keep the pose guess.
                    object.reset(true);
                    continue;
                }

                // One triangle per tracked frame, round-robin.
                if self.options.tracking.tracking_rectification_budget > 0.0 {
                    object.rectify_next_triangle(&self.backend, &frame, camera, timestamp);
                }

                if !object.determine_pose(camera, rng, &self.options.tracking, timestamp) {
                    object.reset(true);
                }
            }
        } else {
            // No previous frame: nothing can be tracked frame to frame.
            for object in self.objects.values_mut() {
                if object.pose_world_t_camera().is_some() {
                    object.reset(true);
                }
            }
        }

        // Feature-based recognition, at most one object per frame.
        let tracked_objects = self.tracked_object_count();
        let cadence_elapsed = self
            .last_recognition_attempt
            .map_or(true, |last| timestamp - last >= self.recognition_cadence(tracked_objects));

        if allow_recognition && tracked_objects < self.concurrent_limit() && cadence_elapsed {
            if let Some(candidate_id) = self.next_recognition_candidate() {
                self.last_recognition_attempt = Some(timestamp);
                self.last_object_tested_for_recognition = Some(candidate_id);

                let recognition_start = Instant::now();

                let features = self
                    .backend
                    .extract_features(&frame, self.options.max_features);

                let object = self.objects.get_mut(&candidate_id).expect("candidate exists");
                if object.try_recognize(
                    &self.backend,
                    &features,
                    camera,
                    rng,
                    &self.options.tracking,
                    timestamp,
                ) {
                    tracing::debug!(object = candidate_id, "recognized object");

                    // The rectification shares the recognition deadline.
                    let mut budget = self.options.tracking.recognition_rectification_budget;
                    if self.options.max_time_allowed_for_recognition > 0.0 {
                        let remaining = self.options.max_time_allowed_for_recognition
                            - recognition_start.elapsed().as_secs_f64();
                        budget = budget.min(remaining);
                    }

                    rectify_within_budget(
                        object,
                        &self.backend,
                        &frame,
                        camera,
                        timestamp,
                        budget,
                    );

                    if !object.determine_pose(camera, rng, &self.options.tracking, timestamp) {
                        object.reset(true);
                    }
                }
            }
        }

        let mut results = Vec::new();
        for (&id, object) in self.objects.iter_mut() {
            if let Some(pose) = object.pose_world_t_camera() {
                object.update_pose_guess(timestamp);
                results.push((id, pose));
            }
        }

        self.previous_frame = Some((frame, timestamp));
        results
    }
}

/// Rectifies round-robin triangles until the wall-clock budget is spent, at
/// most one full round.
fn rectify_within_budget<B: TrackingBackend>(
    object: &mut MeshObject<B>,
    backend: &B,
    frame: &B::Frame,
    camera: &Camera,
    timestamp: Timestamp,
    budget_seconds: f64,
) {
    if budget_seconds <= 0.0 {
        return;
    }

    let deadline = Instant::now() + Duration::from_secs_f64(budget_seconds);
    let triangle_count = object.mesh().triangle_count();

    for n in 0..triangle_count {
        object.rectify_next_triangle(backend, frame, camera, timestamp);

        if n + 1 < triangle_count && Instant::now() >= deadline {
            break;
        }
    }
}
