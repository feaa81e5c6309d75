//! 6-DOF tracking core for textured mesh objects.
//!
//! The tracker maintains one [`MeshObject`] per registered textured mesh.
//! Each object owns per-triangle 2-D reference points, runs per-frame
//! optical-flow-style tracking, triggers periodic rectified re-alignment per
//! triangle in a round-robin schedule, and falls back to feature-based
//! recognition with a configurable cadence.
//!
//! Image-level concerns (pyramids, feature extraction and matching, the
//! rectified warps) are external collaborators expressed by the
//! [`TrackingBackend`] trait, which keeps the state machine testable with
//! synthetic implementations.

use thiserror::Error;

mod contracts;
mod mesh;
mod object;
mod tracker;

pub use crate::contracts::{MatchedPoint, TrackingBackend};
pub use crate::mesh::TexturedTriMesh;
pub use crate::object::{MeshObject, MeshTriangle};
pub use crate::tracker::{MeshTrackerCore, ObjectId, TrackerOptions, TrackingOptions};

/// Seconds; timestamps are caller-supplied so cadence behavior stays
/// deterministic under test.
pub type Timestamp = f64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshTrackerError {
    #[error("mesh has inconsistent indices, coordinates or uv coordinates")]
    InvalidMesh,
    #[error("unknown object id")]
    UnknownObject,
}

pub type Result<T> = std::result::Result<T, MeshTrackerError>;
