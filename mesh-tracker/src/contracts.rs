use nalgebra::{Isometry3, Point3, UnitQuaternion, Vector2};

use sfm_camera::Camera;

use crate::mesh::TexturedTriMesh;

/// A 2D/3D feature match against an object's feature map, attributed to the
/// mesh triangle the 3-D point lies on.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPoint {
    pub object_point: Point3<f64>,
    pub image_point: Vector2<f64>,
    pub triangle_index: usize,
}

/// The image-level collaborators of the mesh tracker.
///
/// Implementations supply frame pyramids, feature extraction and matching,
/// frame-to-frame point tracking, and the rectified per-triangle
/// re-alignment; the tracker core only coordinates their results.
pub trait TrackingBackend {
    /// An image pyramid (or any frame representation the backend tracks on).
    type Frame;
    /// A pre-built feature map of one registered object.
    type FeatureMap;
    /// Features extracted from a live frame.
    type Features;

    /// Builds the feature map of a textured mesh at registration time.
    fn build_feature_map(&self, texture: &Self::Frame, mesh: &TexturedTriMesh)
        -> Self::FeatureMap;

    /// Per-pyramid-level reference points of the texture image, in texture
    /// pixels.
    fn reference_points(&self, texture: &Self::Frame, pyramid_levels: usize)
        -> Vec<Vec<Vector2<f64>>>;

    /// Extracts up to `max_features` features from a live frame
    /// (0 = no limit).
    fn extract_features(&self, frame: &Self::Frame, max_features: usize) -> Self::Features;

    /// Matches extracted features against an object's feature map.
    fn match_features(&self, map: &Self::FeatureMap, features: &Self::Features)
        -> Vec<MatchedPoint>;

    /// Tracks image points from the previous into the current frame;
    /// `None` marks a lost point. An optional relative orientation between
    /// the frames may seed the search windows.
    fn track_points(
        &self,
        previous: &Self::Frame,
        current: &Self::Frame,
        points: &[Vector2<f64>],
        rotation_previous_t_current: Option<&UnitQuaternion<f64>>,
    ) -> Vec<Option<Vector2<f64>>>;

    /// Rectifies one mesh triangle against the live frame and re-identifies
    /// precise 2D/3D correspondences. Returns the texture pyramid level the
    /// reference points matched at plus the correspondences; `None` when the
    /// triangle could not be rectified this frame.
    fn rectify_triangle(
        &self,
        frame: &Self::Frame,
        camera: &Camera,
        world_t_camera: &Isometry3<f64>,
        mesh: &TexturedTriMesh,
        triangle_index: usize,
    ) -> Option<(usize, Vec<MatchedPoint>)>;
}
