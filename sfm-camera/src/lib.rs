//! Pinhole camera model with OpenCV (Brown-Conrady) distortion, the two pose
//! conventions used by the trackers, and the analytic projection Jacobians
//! used by the optimization providers.
//!
//! Two pose conventions are in use:
//!
//! * **standard**: `world_T_camera`, the camera looks down the negative
//!   z-axis with the y-axis pointing up,
//! * **inverted-flipped**: `flipped_camera_T_world`, the camera looks down
//!   the positive z-axis with the y-axis pointing down (the projection
//!   frame).

use thiserror::Error;

mod camera;
mod jacobians;
mod pose;

pub use crate::camera::Camera;
pub use crate::jacobians::{
    intrinsics_jacobian_2x8, orientation_jacobian_2x3, point_jacobian_2x3, pose_jacobian_2x6,
};
pub use crate::pose::{
    inverted_flipped_to_standard, standard_to_inverted_flipped, ExpPose,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("invalid camera intrinsics")]
    InvalidIntrinsics,
    #[error("image dimensions must be positive")]
    InvalidImageSize,
}

pub type Result<T> = std::result::Result<T, CameraError>;
