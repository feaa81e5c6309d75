//! Robust non-linear least-squares optimization.
//!
//! The driver implements a single Levenberg-Marquardt / Gauss-Newton loop;
//! problem-specific behavior (residuals, Jacobians, parameter updates) is
//! supplied through a provider trait. Estimator kinds are runtime tags
//! dispatched to the robust weight kernel.

use thiserror::Error;

mod estimator;
mod driver;

pub use crate::estimator::{
    sqr_errors_to_robust_errors, sqr_errors_to_robust_errors_2, sqr_errors_to_robust_errors_i,
    Estimator, WEIGHT_EPS,
};
pub use crate::driver::{
    advanced_dense_optimization, advanced_sparse_optimization, dense_optimization,
    AdvancedDenseProvider, AdvancedSparseProvider, OptimizationProvider, OptimizationResult,
    DELTA_EPS, LAMBDA_MAX,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("initial model is invalid")]
    InvalidInitialModel,
    #[error("no iteration produced a solvable linear system")]
    NoValidIteration,
    #[error("provider failed to determine the normal equation parameters")]
    ParameterDetermination,
}

pub type Result<T> = std::result::Result<T, OptimizationError>;
