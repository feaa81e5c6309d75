//! Structure-from-motion solver.
//!
//! Orchestrates initial 3-D point bootstrapping from keyframes, per-frame
//! 6-DOF pose recovery, bundle adjustment over poses and points (optionally
//! intrinsics), camera-motion classification, the rotational-only database
//! rewrite, and database sanitation. The numerical back-end is the robust
//! Levenberg-Marquardt driver from `robust-lm`; all observations live in the
//! external `obs-database`.

use thiserror::Error;

pub mod geometry;
mod motion;
pub mod providers;
mod solver;
mod threshold;
pub mod worker;

pub use crate::motion::CameraMotion;
pub use crate::solver::bootstrap::{
    determine_initial_object_points_from_sparse_key_frames, determine_initial_object_points_ransac,
    filter_static_image_points, track_object_points, InitialObjectPoints, TrackedObservations,
};
pub use crate::solver::camera::{
    optimize_camera_with_variable_object_points_and_poses, CameraBundleOutcome,
};
pub use crate::solver::motion_analysis::{
    determine_camera_motion, determine_object_point_accuracies, determine_poses_orientation,
    MotionThresholds,
};
pub use crate::solver::object_points::{
    determine_unknown_object_points, optimize_object_points_with_fixed_poses,
    optimize_object_points_with_variable_poses,
    optimize_object_points_with_variable_poses_in_range, BundleOutcome,
};
pub use crate::solver::poses::{
    determine_orientation, determine_orientation_for_frame, determine_pose, determine_pose_for_frame,
    determine_pose_with_priority, determine_poses, update_poses, update_poses_parallel,
    PoseEstimationOptions,
};
pub use crate::solver::rotational::{
    suppose_rotational_camera_motion, update_database_to_rotational_motion,
};
pub use crate::solver::sanitation::{
    remove_object_points_not_in_front_of_camera, remove_object_points_with_small_baseline,
    remove_object_points_without_enough_observations,
};
pub use crate::solver::statistics::{
    average_point_distance, determine_number_correspondences, determine_projection_error,
    determine_projection_errors, determine_representative_poses, CorrespondenceStatistics,
    ProjectionErrorStatistics,
};
pub use crate::threshold::RelativeThreshold;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("not enough observations, keyframes or inliers")]
    InsufficientData,
    #[error("optimization failed: {0}")]
    Optimization(#[from] robust_lm::OptimizationError),
    #[error("aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, SolverError>;

/// Polls the caller's abort flag at outer-loop boundaries.
#[inline]
pub(crate) fn aborted(abort: Option<&std::sync::atomic::AtomicBool>) -> bool {
    abort.is_some_and(|flag| flag.load(std::sync::atomic::Ordering::Relaxed))
}
