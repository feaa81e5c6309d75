//! Geometric primitives backing the solver: triangulation, the three-point
//! pose, two-view relative pose recovery, and the RANSAC wrappers around
//! them.

mod epipolar;
mod p3p;
pub mod ransac;
mod triangulate;

pub use self::epipolar::{decompose_essential, essential_8_point, two_view_pose, TwoViewPose};
pub use self::p3p::p3p;
pub use self::triangulate::{triangulate_dlt, triangulate_midpoint};
