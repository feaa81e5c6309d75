use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector2};
use rand::seq::SliceRandom;
use rand::Rng;

use sfm_camera::Camera;
use sfm_solver::{determine_pose, PoseEstimationOptions};

use crate::contracts::TrackingBackend;
use crate::mesh::TexturedTriMesh;
use crate::tracker::TrackingOptions;
use crate::Timestamp;

/// Per-triangle tracking state.
#[derive(Debug, Clone, Default)]
pub struct MeshTriangle {
    /// Reference points in texture pixels, one set per texture pyramid
    /// level.
    reference_points: Vec<Vec<Vector2<f64>>>,
    /// The pyramid level of the last successful reference match.
    last_matched_level: Option<usize>,
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Vector2<f64>>,
    /// Timestamp of the last successful rectification.
    last_rectification: Option<Timestamp>,
}

impl MeshTriangle {
    fn new(pyramid_levels: usize) -> Self {
        Self {
            reference_points: vec![Vec::new(); pyramid_levels],
            ..Default::default()
        }
    }

    #[inline]
    pub fn tracked_point_count(&self) -> usize {
        self.object_points.len()
    }

    #[inline]
    pub fn object_points(&self) -> &[Point3<f64>] {
        &self.object_points
    }

    #[inline]
    pub fn image_points(&self) -> &[Vector2<f64>] {
        &self.image_points
    }

    #[inline]
    pub fn reference_points(&self, level: usize) -> &[Vector2<f64>] {
        &self.reference_points[level]
    }

    #[inline]
    pub fn last_matched_level(&self) -> Option<usize> {
        self.last_matched_level
    }

    #[inline]
    pub fn last_rectification(&self) -> Option<Timestamp> {
        self.last_rectification
    }

    fn clear_tracked_points(&mut self) {
        self.object_points.clear();
        self.image_points.clear();
    }

    fn set_tracked_points(
        &mut self,
        object_points: Vec<Point3<f64>>,
        image_points: Vec<Vector2<f64>>,
    ) {
        debug_assert_eq!(object_points.len(), image_points.len());
        self.object_points = object_points;
        self.image_points = image_points;
    }
}

/// One registered textured mesh with its full tracking state.
pub struct MeshObject<B: TrackingBackend> {
    mesh: TexturedTriMesh,
    feature_map: B::FeatureMap,
    triangles: Vec<MeshTriangle>,
    pose_world_t_camera: Option<Isometry3<f64>>,
    pose_guess: Option<(Isometry3<f64>, Timestamp)>,
    /// Round-robin cursor into `rectification_order`.
    rectification_cursor: usize,
    /// Random triangle visitation order, shuffled at registration.
    rectification_order: Vec<usize>,
}

impl<B: TrackingBackend> MeshObject<B> {
    pub fn new<R: Rng + ?Sized>(
        backend: &B,
        texture: &B::Frame,
        mesh: TexturedTriMesh,
        pyramid_levels: usize,
        rng: &mut R,
    ) -> Self {
        let feature_map = backend.build_feature_map(texture, &mesh);

        let mut triangles: Vec<MeshTriangle> = (0..mesh.triangle_count())
            .map(|_| MeshTriangle::new(pyramid_levels))
            .collect();

        // Distribute the texture reference points onto the triangles that
        // contain them.
        for (level, points) in backend
            .reference_points(texture, pyramid_levels)
            .into_iter()
            .enumerate()
        {
            for uv in points {
                if let Some((triangle_index, _)) = mesh.lift(&uv) {
                    triangles[triangle_index].reference_points[level].push(uv);
                }
            }
        }

        let mut rectification_order: Vec<usize> = (0..mesh.triangle_count()).collect();
        rectification_order.shuffle(rng);

        Self {
            mesh,
            feature_map,
            triangles,
            pose_world_t_camera: None,
            pose_guess: None,
            rectification_cursor: 0,
            rectification_order,
        }
    }

    #[inline]
    pub fn mesh(&self) -> &TexturedTriMesh {
        &self.mesh
    }

    #[inline]
    pub fn feature_map(&self) -> &B::FeatureMap {
        &self.feature_map
    }

    #[inline]
    pub fn triangles(&self) -> &[MeshTriangle] {
        &self.triangles
    }

    #[inline]
    pub fn pose_world_t_camera(&self) -> Option<Isometry3<f64>> {
        self.pose_world_t_camera
    }

    /// The cached rough pose, if its age does not exceed `maximal_age`.
    pub fn pose_guess(&self, now: Timestamp, maximal_age: f64) -> Option<Isometry3<f64>> {
        self.pose_guess
            .filter(|(_, stamp)| (now - stamp).abs() <= maximal_age)
            .map(|(pose, _)| pose)
    }

    /// Total number of tracked points over all triangles.
    pub fn tracked_point_count(&self) -> usize {
        self.triangles.iter().map(|t| t.tracked_point_count()).sum()
    }

    /// All currently tracked 3-D points.
    pub fn object_points(&self) -> Vec<Point3<f64>> {
        self.triangles
            .iter()
            .flat_map(|t| t.object_points.iter().copied())
            .collect()
    }

    /// All currently tracked 2-D points.
    pub fn image_points(&self) -> Vec<Vector2<f64>> {
        self.triangles
            .iter()
            .flat_map(|t| t.image_points.iter().copied())
            .collect()
    }

    /// Drops the correspondence lists and the current pose; the pose guess
    /// survives unless `keep_pose_guess` is false, so the next recognition
    /// attempt can seed from it.
    pub fn reset(&mut self, keep_pose_guess: bool) {
        for triangle in &mut self.triangles {
            triangle.clear_tracked_points();
            triangle.last_matched_level = None;
        }
        self.pose_world_t_camera = None;
        if !keep_pose_guess {
            self.pose_guess = None;
        }
    }

    /// Tracks the object's image points from the previous into the current
    /// frame; triangles losing all points drop out. Returns the surviving
    /// tracked point count.
    pub fn track_frame_to_frame(
        &mut self,
        backend: &B,
        previous_frame: &B::Frame,
        current_frame: &B::Frame,
        rotation_previous_t_current: Option<&UnitQuaternion<f64>>,
    ) -> usize {
        let image_points = self.image_points();
        if image_points.is_empty() {
            return 0;
        }

        let tracked = backend.track_points(
            previous_frame,
            current_frame,
            &image_points,
            rotation_previous_t_current,
        );
        debug_assert_eq!(tracked.len(), image_points.len());

        let mut offset = 0usize;
        for triangle in &mut self.triangles {
            let count = triangle.tracked_point_count();
            let mut surviving_object_points = Vec::with_capacity(count);
            let mut surviving_image_points = Vec::with_capacity(count);

            for (i, object_point) in triangle.object_points.iter().enumerate() {
                if let Some(new_location) = tracked[offset + i] {
                    surviving_object_points.push(*object_point);
                    surviving_image_points.push(new_location);
                }
            }

            offset += count;
            triangle.set_tracked_points(surviving_object_points, surviving_image_points);
        }

        self.tracked_point_count()
    }

    /// Re-estimates the object pose from the current correspondences via
    /// PnP, seeded by the previous pose. Updates the pose and the pose
    /// guess on success.
    pub fn determine_pose<R: Rng + ?Sized>(
        &mut self,
        camera: &Camera,
        rng: &mut R,
        options: &TrackingOptions,
        timestamp: Timestamp,
    ) -> bool {
        let object_points = self.object_points();
        let image_points = self.image_points();

        if object_points.len() < options.minimal_tracked_points.max(4) {
            self.pose_world_t_camera = None;
            return false;
        }

        let pose_options = PoseEstimationOptions {
            minimal_correspondences: options.minimal_tracked_points.max(4),
            ransac_iterations: options.recognition_ransac_iterations,
            ..Default::default()
        };

        let rough = self.pose_world_t_camera;

        match determine_pose(
            camera,
            rng,
            &object_points,
            &image_points,
            rough.as_ref(),
            &pose_options,
        ) {
            Some((pose, _, _)) => {
                self.pose_world_t_camera = Some(pose);
                self.pose_guess = Some((pose, timestamp));
                true
            }
            None => {
                self.pose_world_t_camera = None;
                false
            }
        }
    }

    /// Rectifies the next triangle of the round-robin schedule; on success
    /// the triangle's correspondences are replaced with the rectified ones.
    pub fn rectify_next_triangle(
        &mut self,
        backend: &B,
        frame: &B::Frame,
        camera: &Camera,
        timestamp: Timestamp,
    ) -> bool {
        let Some(pose) = self.pose_world_t_camera else {
            return false;
        };
        if self.rectification_order.is_empty() {
            return false;
        }

        let triangle_index = self.rectification_order[self.rectification_cursor];
        self.rectification_cursor =
            (self.rectification_cursor + 1) % self.rectification_order.len();

        let Some((matched_level, matches)) =
            backend.rectify_triangle(frame, camera, &pose, &self.mesh, triangle_index)
        else {
            // A failed rectification is absorbed; the remaining triangles
            // continue with their tracked points.
            return false;
        };

        if matches.is_empty() {
            return false;
        }

        let triangle = &mut self.triangles[triangle_index];
        triangle.set_tracked_points(
            matches.iter().map(|m| m.object_point).collect(),
            matches.iter().map(|m| m.image_point).collect(),
        );
        triangle.last_matched_level = Some(matched_level);
        triangle.last_rectification = Some(timestamp);

        true
    }

    /// Attempts feature-based recognition from pre-extracted frame features.
    ///
    /// On success the matches seed the per-triangle correspondences and the
    /// pose is recovered by PnP RANSAC.
    pub fn try_recognize<R: Rng + ?Sized>(
        &mut self,
        backend: &B,
        features: &B::Features,
        camera: &Camera,
        rng: &mut R,
        options: &TrackingOptions,
        timestamp: Timestamp,
    ) -> bool {
        let matches = backend.match_features(&self.feature_map, features);

        if matches.len() < options.minimal_tracked_points.max(4) {
            return false;
        }

        let object_points: Vec<Point3<f64>> = matches.iter().map(|m| m.object_point).collect();
        let image_points: Vec<Vector2<f64>> = matches.iter().map(|m| m.image_point).collect();

        let pose_options = PoseEstimationOptions {
            minimal_correspondences: options.minimal_tracked_points.max(4),
            ransac_iterations: options.recognition_ransac_iterations,
            // Recognition always verifies through RANSAC.
            minimal_valid_correspondence_ratio: 0.5,
            ..Default::default()
        };

        let Some((pose, _, valid_indices)) = determine_pose(
            camera,
            rng,
            &object_points,
            &image_points,
            self.pose_guess.map(|(pose, _)| pose).as_ref(),
            &pose_options,
        ) else {
            return false;
        };

        for triangle in &mut self.triangles {
            triangle.clear_tracked_points();
        }
        for &index in &valid_indices {
            let matched = &matches[index];
            let triangle = &mut self.triangles[matched.triangle_index];
            triangle.object_points.push(matched.object_point);
            triangle.image_points.push(matched.image_point);
        }

        self.pose_world_t_camera = Some(pose);
        self.pose_guess = Some((pose, timestamp));

        true
    }

    pub(crate) fn update_pose_guess(&mut self, timestamp: Timestamp) {
        if let Some(pose) = self.pose_world_t_camera {
            self.pose_guess = Some((pose, timestamp));
        }
    }
}
