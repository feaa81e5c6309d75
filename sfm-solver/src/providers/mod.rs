//! Per-problem optimization providers for the robust LM driver.
//!
//! Every provider holds the database slice it optimizes plus a candidate
//! copy of the estimated parameters; `apply_correction` writes the
//! candidate, `accept_correction` promotes it. Residuals are 2-D
//! reprojection errors evaluated in the inverted-flipped frame.

use nalgebra::{DVector, Matrix2, Vector2};
use robust_lm::{sqr_errors_to_robust_errors_2, Estimator, WEIGHT_EPS};

mod bundle;
mod camera_orientation;
mod object_point;
mod orientation;
mod pose;

pub use self::bundle::{
    optimize_object_points_and_poses, BundleProvider, BundleResult, PoseDof,
};
pub use self::camera_orientation::{optimize_camera_and_orientations, CameraOrientationProvider};
pub use self::object_point::{optimize_object_point, ObjectPointProvider};
pub use self::orientation::{optimize_orientation, OrientationProvider};
pub use self::pose::{optimize_pose, PoseProvider};

/// Converts reprojection residuals into the driver's weighted error and
/// weight vectors and returns the robust mean error. Non-finite residuals
/// mark the candidate infeasible.
pub(crate) fn fill_robust_error(
    estimator: Estimator,
    residuals: Vec<Vector2<f64>>,
    model_parameters: usize,
    weighted_errors: &mut DVector<f64>,
    weights: &mut DVector<f64>,
    inverted_covariances: Option<&[Matrix2<f64>]>,
) -> f64 {
    if residuals.iter().any(|r| !r.x.is_finite() || !r.y.is_finite()) {
        return f64::MAX;
    }

    let sqr_errors: Vec<f64> = residuals.iter().map(|r| r.norm_squared()).collect();

    let mut errors = residuals;
    let mut weight_pairs = vec![Vector2::zeros(); errors.len()];

    let robust = sqr_errors_to_robust_errors_2(
        estimator,
        &sqr_errors,
        model_parameters,
        &mut errors,
        &mut weight_pairs,
        inverted_covariances,
    );

    *weighted_errors =
        DVector::from_iterator(errors.len() * 2, errors.iter().flat_map(|v| [v.x, v.y]));
    *weights = DVector::from_iterator(
        weight_pairs.len() * 2,
        weight_pairs.iter().flat_map(|v| [v.x, v.y]),
    );

    robust
}

/// Robust mean error of a set of squared residuals, without producing the
/// driver buffers (used by the advanced providers).
pub(crate) fn robust_mean_error(
    estimator: Estimator,
    sqr_errors: &[f64],
    model_parameters: usize,
) -> f64 {
    if sqr_errors.is_empty() {
        return 0.0;
    }
    if sqr_errors.iter().any(|e| !e.is_finite()) {
        return f64::MAX;
    }

    let sqr_sigma = if estimator.needs_sigma() {
        estimator.determine_sigma_square(sqr_errors, model_parameters)
    } else {
        0.0
    };

    sqr_errors
        .iter()
        .map(|&e| e * estimator.robust_weight_square(e, sqr_sigma).max(WEIGHT_EPS))
        .sum::<f64>()
        / sqr_errors.len() as f64
}

/// Per-observation robust weights for building weighted normal equations.
pub(crate) fn robust_weights(
    estimator: Estimator,
    sqr_errors: &[f64],
    model_parameters: usize,
) -> Vec<f64> {
    let sqr_sigma = if estimator.needs_sigma() {
        estimator.determine_sigma_square(sqr_errors, model_parameters)
    } else {
        0.0
    };

    sqr_errors
        .iter()
        .map(|&e| estimator.robust_weight_square(e, sqr_sigma).max(WEIGHT_EPS))
        .collect()
}
