//! Joint optimization of camera intrinsics, keyframe poses and object
//! points.

use nalgebra::{Isometry3, Point3};

use obs_database::{Database, ObjectPointGroups, ObjectPointId, PoseId};
use robust_lm::Estimator;
use sfm_camera::Camera;

use crate::providers::{optimize_object_points_and_poses, PoseDof};
use crate::solver::statistics::determine_representative_poses;
use crate::{Result, SolverError};

/// Outcome of the camera bundle adjustment.
#[derive(Debug, Clone)]
pub struct CameraBundleOutcome {
    pub camera: Camera,
    pub object_points: Vec<Point3<f64>>,
    pub object_point_ids: Vec<ObjectPointId>,
    pub keyframe_poses: Vec<Isometry3<f64>>,
    pub keyframe_ids: Vec<PoseId>,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Bundle adjustment over keyframe poses, object points and the eight
/// intrinsic camera parameters.
///
/// When no keyframe list is given, the most representative poses are chosen
/// by the 6-D succession; object points must be observed in at least
/// `minimal_observations` of the chosen keyframes.
#[allow(clippy::too_many_arguments)]
pub fn optimize_camera_with_variable_object_points_and_poses(
    database: &Database,
    camera: &Camera,
    keyframe_ids: Option<&[PoseId]>,
    object_point_ids: Option<&[ObjectPointId]>,
    minimal_keyframes: usize,
    maximal_keyframes: usize,
    minimal_observations: usize,
    estimator: Estimator,
    iterations: usize,
) -> Result<CameraBundleOutcome> {
    let keyframe_ids: Vec<PoseId> = match keyframe_ids {
        Some(ids) => ids.to_vec(),
        None => {
            let frames = database.pose_ids(0, PoseId::MAX);
            let lower = *frames.first().unwrap_or(&0);
            let upper = *frames.last().unwrap_or(&0);
            determine_representative_poses(database, lower, upper, maximal_keyframes)
        }
    };

    if keyframe_ids.len() < minimal_keyframes.max(2) {
        return Err(SolverError::InsufficientData);
    }

    let candidate_ids: Vec<ObjectPointId> = match object_point_ids {
        Some(ids) => ids.to_vec(),
        None => database.located_object_point_ids(),
    };

    let (groups, valid_indices) = ObjectPointGroups::from_database(
        database,
        &keyframe_ids,
        &candidate_ids,
        minimal_observations,
    );

    if groups.is_empty() {
        return Err(SolverError::InsufficientData);
    }

    let object_point_ids: Vec<ObjectPointId> =
        valid_indices.iter().map(|&i| candidate_ids[i]).collect();
    let object_points: Vec<Point3<f64>> = object_point_ids
        .iter()
        .map(|&id| {
            database
                .object_point_position(id)
                .expect("located candidate")
        })
        .collect();

    let keyframe_poses: Vec<Isometry3<f64>> = keyframe_ids
        .iter()
        .map(|&id| database.pose(id).ok_or(SolverError::InsufficientData))
        .collect::<Result<_>>()?;

    let bundle = optimize_object_points_and_poses(
        camera,
        &keyframe_poses,
        &object_points,
        &groups,
        PoseDof::Six,
        true,
        iterations,
        estimator,
        0.001,
        5.0,
        false,
    )?;

    Ok(CameraBundleOutcome {
        camera: bundle.camera,
        object_points: bundle.object_points,
        object_point_ids,
        keyframe_poses: bundle.world_t_cameras,
        keyframe_ids,
        initial_error: bundle.initial_error,
        final_error: bundle.final_error,
    })
}
