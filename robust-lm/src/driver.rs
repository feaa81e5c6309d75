use nalgebra::{DMatrix, DVector, Matrix2};

use crate::estimator::Estimator;
use crate::{OptimizationError, Result};

/// Largest accepted damping value; beyond this the optimization terminates.
pub const LAMBDA_MAX: f64 = 1e8;

/// Convergence bound on `|deltas| / dim(deltas)`.
pub const DELTA_EPS: f64 = 1e-9;

/// Capability set of a dense optimization problem.
///
/// The provider holds the current model and a candidate copy;
/// `apply_correction` writes the candidate, `accept_correction` promotes it.
/// The driver never reads residual vectors directly, it only receives the
/// robust error scalar, which keeps covariance weighting and the residual
/// dimension private to the provider.
pub trait OptimizationProvider {
    /// Determines the Jacobian for the current (accepted) model.
    fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>);

    /// Determines the robust error of the candidate model, filling the
    /// weighted error vector and, for non-standard estimators, the weight
    /// vector. Returns `f64::MAX` for an infeasible candidate.
    fn determine_robust_error(
        &self,
        estimator: Estimator,
        weighted_errors: &mut DVector<f64>,
        weights: &mut DVector<f64>,
        inverted_covariances: Option<&[Matrix2<f64>]>,
    ) -> f64;

    /// Applies the (to be subtracted) correction, writing the candidate model.
    fn apply_correction(&mut self, deltas: &DVector<f64>);

    /// Promotes the candidate model to the current model.
    fn accept_correction(&mut self);

    /// Whether the provider solves the normal equations itself.
    fn has_solver(&self) -> bool {
        false
    }

    /// Provider-owned solve of `jtj * deltas = jt_error`.
    fn solve(&self, jtj: &DMatrix<f64>, jt_error: &DVector<f64>, deltas: &mut DVector<f64>) -> bool {
        let _ = (jtj, jt_error, deltas);
        false
    }
}

/// Capability set of a problem owning its (dense) normal equations.
pub trait AdvancedDenseProvider {
    /// Error of the candidate model, `f64::MAX` if infeasible.
    fn determine_error(&self) -> f64;

    /// Determines the Hessian approximation `J^T J` and the error Jacobian
    /// `J^T e` for the current model.
    fn determine_hessian_and_error_jacobian(
        &self,
        hessian: &mut DMatrix<f64>,
        error_jacobian: &mut DVector<f64>,
    ) -> bool;

    fn apply_correction(&mut self, deltas: &DVector<f64>);

    fn accept_correction(&mut self);

    fn should_stop(&self) -> bool {
        false
    }

    fn has_solver(&self) -> bool {
        false
    }

    fn solve(
        &self,
        hessian: &DMatrix<f64>,
        error_jacobian: &DVector<f64>,
        deltas: &mut DVector<f64>,
    ) -> bool {
        let _ = (hessian, error_jacobian, deltas);
        false
    }
}

/// Capability set of a problem owning abstract (typically sparse or
/// block-structured) normal equations.
///
/// The provider stores the original Hessian diagonal so `solve` can re-apply
/// the damping several times per outer step without recomputing the Jacobian.
pub trait AdvancedSparseProvider {
    /// Error of the candidate model, `f64::MAX` if infeasible.
    fn determine_error(&self) -> f64;

    /// Determines the internal parameters (Jacobian, Hessian, error
    /// Jacobian or any abstraction thereof) for the current model.
    fn determine_parameters(&mut self) -> bool;

    /// Solves for the correction using the stored parameters and the given
    /// damping value.
    fn solve(&mut self, deltas: &mut DVector<f64>, lambda: f64) -> bool;

    fn apply_correction(&mut self, deltas: &DVector<f64>);

    fn accept_correction(&mut self);

    fn should_stop(&self) -> bool {
        false
    }
}

/// Outcome of a successful optimization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizationResult {
    pub initial_error: f64,
    pub final_error: f64,
}

/// Solves the symmetric system `a * x = b`, Cholesky first, LU as fallback.
fn solve_symmetric(a: &DMatrix<f64>, b: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(cholesky) = a.clone().cholesky() {
        let x = cholesky.solve(b);
        if x.iter().all(|v| v.is_finite()) {
            return Some(x);
        }
    }

    let x = a.clone().lu().solve(b)?;
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Scales each row block of the Jacobian by the per-component weights and the
/// optional per-observation 2x2 inverted covariances, producing the left-hand
/// factor of the normal equations.
fn weighted_jacobian(
    jacobian: &DMatrix<f64>,
    weights: Option<&DVector<f64>>,
    inverted_covariances: Option<&[Matrix2<f64>]>,
) -> DMatrix<f64> {
    let mut scaled = jacobian.clone();

    if let Some(weights) = weights {
        debug_assert_eq!(weights.len(), scaled.nrows());
        for (r, &w) in weights.iter().enumerate() {
            for c in 0..scaled.ncols() {
                scaled[(r, c)] *= w;
            }
        }
    }

    if let Some(covariances) = inverted_covariances {
        debug_assert_eq!(covariances.len() * 2, scaled.nrows());
        for (n, cov) in covariances.iter().enumerate() {
            for c in 0..scaled.ncols() {
                let a = scaled[(2 * n, c)];
                let b = scaled[(2 * n + 1, c)];
                scaled[(2 * n, c)] = cov[(0, 0)] * a + cov[(0, 1)] * b;
                scaled[(2 * n + 1, c)] = cov[(1, 0)] * a + cov[(1, 1)] * b;
            }
        }
    }

    scaled
}

/// Applies the optional inverted covariances to an error vector.
fn covariance_weighted_errors(
    errors: &DVector<f64>,
    inverted_covariances: Option<&[Matrix2<f64>]>,
) -> DVector<f64> {
    let mut weighted = errors.clone();

    if let Some(covariances) = inverted_covariances {
        debug_assert_eq!(covariances.len() * 2, weighted.len());
        for (n, cov) in covariances.iter().enumerate() {
            let a = weighted[2 * n];
            let b = weighted[2 * n + 1];
            weighted[2 * n] = cov[(0, 0)] * a + cov[(0, 1)] * b;
            weighted[2 * n + 1] = cov[(1, 0)] * a + cov[(1, 1)] * b;
        }
    }

    weighted
}

/// Dense Levenberg-Marquardt / Gauss-Newton optimization.
///
/// Pass `lambda = 0` and `lambda_factor = 1` for Gauss-Newton. The returned
/// error is the robust mean error of the accepted model.
pub fn dense_optimization<P: OptimizationProvider>(
    provider: &mut P,
    iterations: usize,
    estimator: Estimator,
    mut lambda: f64,
    lambda_factor: f64,
    inverted_covariances: Option<&[Matrix2<f64>]>,
    mut intermediate_errors: Option<&mut Vec<f64>>,
) -> Result<OptimizationResult> {
    debug_assert!(lambda >= 0.0 && lambda <= LAMBDA_MAX);

    let mut jacobian = DMatrix::zeros(0, 0);

    // The error vectors are weighted for non-square estimators only.
    let mut weighted_errors = DVector::zeros(0);
    let mut swap_weighted_errors = DVector::zeros(0);
    let mut weights = DVector::zeros(0);
    let mut swap_weights = DVector::zeros(0);

    let mut best_error = provider.determine_robust_error(
        estimator,
        &mut weighted_errors,
        &mut weights,
        inverted_covariances,
    );

    if best_error == f64::MAX {
        tracing::warn!("initial model is invalid, optimization cannot be applied");
        return Err(OptimizationError::InvalidInitialModel);
    }

    let initial_error = best_error;

    if let Some(errors) = intermediate_errors.as_deref_mut() {
        errors.push(best_error);
    }

    let mut one_valid_iteration = false;

    let mut i = 0usize;
    while i < iterations {
        provider.determine_jacobian(&mut jacobian);

        let use_weights = !estimator.is_standard();

        let scaled = weighted_jacobian(
            &jacobian,
            use_weights.then_some(&weights),
            inverted_covariances,
        );

        // J^T * iCov * diag(weights) * J and J^T * iCov * diag(weights) * e;
        // the weights are already folded into `weighted_errors`.
        let mut jtj = jacobian.transpose() * &scaled;
        let jt_error =
            jacobian.transpose() * covariance_weighted_errors(&weighted_errors, inverted_covariances);

        let jtj_diagonal = jtj.diagonal();

        while i < iterations {
            i += 1;

            // LM damping on the stored diagonal: JTJ(k,k) = diag0(k) * (1 + lambda).
            if lambda > f64::EPSILON {
                for n in 0..jtj.ncols() {
                    jtj[(n, n)] = jtj_diagonal[n] * (1.0 + lambda);
                }
            }

            // We solve JTJ * deltas = +J^T e and subtract the deltas in the
            // provider afterwards.
            let deltas = if provider.has_solver() {
                let mut deltas = DVector::zeros(jt_error.len());
                provider.solve(&jtj, &jt_error, &mut deltas).then_some(deltas)
            } else {
                solve_symmetric(&jtj, &jt_error)
            };

            match deltas {
                Some(deltas) => {
                    one_valid_iteration = true;

                    if deltas.norm() / deltas.len() as f64 <= DELTA_EPS {
                        i = iterations;
                    }

                    provider.apply_correction(&deltas);

                    let iteration_error = provider.determine_robust_error(
                        estimator,
                        &mut swap_weighted_errors,
                        &mut swap_weights,
                        inverted_covariances,
                    );

                    if iteration_error >= best_error {
                        if lambda_factor > f64::EPSILON && lambda > 0.0 && lambda <= LAMBDA_MAX {
                            lambda *= lambda_factor;
                        } else {
                            i = iterations;
                        }
                        continue;
                    }

                    best_error = iteration_error;

                    if let Some(errors) = intermediate_errors.as_deref_mut() {
                        errors.push(best_error);
                    }

                    provider.accept_correction();

                    std::mem::swap(&mut weighted_errors, &mut swap_weighted_errors);
                    std::mem::swap(&mut weights, &mut swap_weights);

                    if (lambda_factor - 1.0).abs() > f64::EPSILON && lambda > f64::EPSILON {
                        lambda /= lambda_factor;
                    }

                    // A new Jacobian has to be calculated.
                    break;
                }
                None if lambda > f64::EPSILON && lambda <= LAMBDA_MAX => {
                    lambda *= lambda_factor;
                }
                None => {
                    i = iterations;
                }
            }
        }
    }

    if !one_valid_iteration {
        return Err(OptimizationError::NoValidIteration);
    }

    Ok(OptimizationResult {
        initial_error,
        final_error: best_error,
    })
}

/// Levenberg-Marquardt / Gauss-Newton optimization for providers owning the
/// dense normal equations.
pub fn advanced_dense_optimization<P: AdvancedDenseProvider>(
    provider: &mut P,
    iterations: usize,
    mut lambda: f64,
    lambda_factor: f64,
    mut intermediate_errors: Option<&mut Vec<f64>>,
) -> Result<OptimizationResult> {
    debug_assert!(lambda >= 0.0 && lambda <= LAMBDA_MAX);
    debug_assert!(
        (lambda == 0.0 && lambda_factor == 1.0) || (lambda > 0.0 && lambda_factor > 1.0)
    );

    let use_levenberg_marquardt = lambda > 0.0 && lambda_factor > 1.0;

    let mut best_error = provider.determine_error();
    if best_error == f64::MAX {
        return Err(OptimizationError::InvalidInitialModel);
    }

    let initial_error = best_error;

    if let Some(errors) = intermediate_errors.as_deref_mut() {
        errors.push(best_error);
    }

    let mut one_valid_iteration = false;

    let mut hessian = DMatrix::zeros(0, 0);
    let mut error_jacobian = DVector::zeros(0);

    let mut i = 0usize;
    while !provider.should_stop() && i < iterations {
        if !provider.determine_hessian_and_error_jacobian(&mut hessian, &mut error_jacobian) {
            return Err(OptimizationError::ParameterDetermination);
        }

        debug_assert_eq!(hessian.nrows(), hessian.ncols());
        debug_assert_eq!(hessian.nrows(), error_jacobian.len());

        let hessian_diagonal = hessian.diagonal();

        while !provider.should_stop() && i < iterations {
            i += 1;

            if lambda > f64::EPSILON {
                for n in 0..hessian.ncols() {
                    hessian[(n, n)] = hessian_diagonal[n] * (1.0 + lambda);
                }
            }

            let deltas = if provider.has_solver() {
                let mut deltas = DVector::zeros(error_jacobian.len());
                provider
                    .solve(&hessian, &error_jacobian, &mut deltas)
                    .then_some(deltas)
            } else {
                solve_symmetric(&hessian, &error_jacobian)
            };

            match deltas {
                Some(deltas) => {
                    one_valid_iteration = true;

                    if deltas.norm() / deltas.len() as f64 <= DELTA_EPS {
                        i = iterations;
                    }

                    provider.apply_correction(&deltas);

                    let iteration_error = provider.determine_error();

                    if use_levenberg_marquardt && iteration_error >= best_error {
                        if lambda > 0.0 && lambda <= LAMBDA_MAX {
                            lambda *= lambda_factor;
                        } else {
                            i = iterations;
                        }
                        continue;
                    }

                    best_error = iteration_error;

                    if let Some(errors) = intermediate_errors.as_deref_mut() {
                        errors.push(best_error);
                    }

                    provider.accept_correction();

                    if use_levenberg_marquardt
                        && (lambda_factor - 1.0).abs() > f64::EPSILON
                        && lambda > f64::EPSILON
                    {
                        lambda /= lambda_factor;
                    }

                    break;
                }
                None if lambda > f64::EPSILON && lambda <= LAMBDA_MAX => {
                    lambda *= lambda_factor;
                }
                None => {
                    i = iterations;
                }
            }
        }
    }

    if !one_valid_iteration {
        return Err(OptimizationError::NoValidIteration);
    }

    Ok(OptimizationResult {
        initial_error,
        final_error: best_error,
    })
}

/// Levenberg-Marquardt / Gauss-Newton optimization for providers owning
/// abstract (sparse / block-structured) normal equations.
pub fn advanced_sparse_optimization<P: AdvancedSparseProvider>(
    provider: &mut P,
    iterations: usize,
    mut lambda: f64,
    lambda_factor: f64,
    mut intermediate_errors: Option<&mut Vec<f64>>,
) -> Result<OptimizationResult> {
    debug_assert!(lambda >= 0.0 && lambda <= LAMBDA_MAX);

    let use_levenberg_marquardt = lambda > 0.0 && lambda_factor > 1.0;

    let mut best_error = provider.determine_error();
    if best_error == f64::MAX {
        return Err(OptimizationError::InvalidInitialModel);
    }

    let initial_error = best_error;

    if let Some(errors) = intermediate_errors.as_deref_mut() {
        errors.push(best_error);
    }

    let mut one_valid_iteration = false;
    let mut deltas = DVector::zeros(0);

    let mut i = 0usize;
    while !provider.should_stop() && i < iterations {
        if !provider.determine_parameters() {
            return Err(OptimizationError::ParameterDetermination);
        }

        while !provider.should_stop() && i < iterations {
            i += 1;

            if provider.solve(&mut deltas, lambda) {
                one_valid_iteration = true;

                if deltas.norm() / deltas.len() as f64 <= DELTA_EPS {
                    i = iterations;
                }

                provider.apply_correction(&deltas);

                let iteration_error = provider.determine_error();

                if use_levenberg_marquardt && iteration_error >= best_error {
                    if lambda > 0.0 && lambda <= LAMBDA_MAX {
                        lambda *= lambda_factor;
                    } else {
                        i = iterations;
                    }
                    continue;
                }

                best_error = iteration_error;

                if let Some(errors) = intermediate_errors.as_deref_mut() {
                    errors.push(best_error);
                }

                provider.accept_correction();

                if use_levenberg_marquardt
                    && (lambda_factor - 1.0).abs() > f64::EPSILON
                    && lambda > f64::EPSILON
                {
                    lambda /= lambda_factor;
                }

                break;
            } else if lambda > f64::EPSILON && lambda <= LAMBDA_MAX {
                lambda *= lambda_factor;
            } else {
                i = iterations;
            }
        }
    }

    if !one_valid_iteration {
        return Err(OptimizationError::NoValidIteration);
    }

    Ok(OptimizationResult {
        initial_error,
        final_error: best_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::sqr_errors_to_robust_errors_2;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    /// Fits `y = a * x + b` to noisy samples; residual dimension 2 with a
    /// zero second component so the 2-D kernel applies.
    struct LineFit {
        xs: Vec<f64>,
        ys: Vec<f64>,
        model: Vector2<f64>,
        candidate: Vector2<f64>,
    }

    impl LineFit {
        fn new(xs: Vec<f64>, ys: Vec<f64>) -> Self {
            Self {
                xs,
                ys,
                model: Vector2::zeros(),
                candidate: Vector2::zeros(),
            }
        }

        fn residuals(&self) -> Vec<Vector2<f64>> {
            self.xs
                .iter()
                .zip(self.ys.iter())
                .map(|(&x, &y)| Vector2::new(self.candidate.x * x + self.candidate.y - y, 0.0))
                .collect()
        }
    }

    impl OptimizationProvider for LineFit {
        fn determine_jacobian(&self, jacobian: &mut DMatrix<f64>) {
            *jacobian = DMatrix::zeros(self.xs.len() * 2, 2);
            for (n, &x) in self.xs.iter().enumerate() {
                jacobian[(2 * n, 0)] = x;
                jacobian[(2 * n, 1)] = 1.0;
            }
        }

        fn determine_robust_error(
            &self,
            estimator: Estimator,
            weighted_errors: &mut DVector<f64>,
            weights: &mut DVector<f64>,
            inverted_covariances: Option<&[Matrix2<f64>]>,
        ) -> f64 {
            let residuals = self.residuals();
            let sqr_errors: Vec<f64> = residuals.iter().map(|r| r.norm_squared()).collect();

            let mut errors2 = residuals;
            let mut weights2 = vec![Vector2::zeros(); errors2.len()];

            let robust = sqr_errors_to_robust_errors_2(
                estimator,
                &sqr_errors,
                2,
                &mut errors2,
                &mut weights2,
                inverted_covariances,
            );

            *weighted_errors = DVector::from_iterator(
                errors2.len() * 2,
                errors2.iter().flat_map(|v| [v.x, v.y]),
            );
            *weights = DVector::from_iterator(
                weights2.len() * 2,
                weights2.iter().flat_map(|v| [v.x, v.y]),
            );

            robust
        }

        fn apply_correction(&mut self, deltas: &DVector<f64>) {
            self.candidate = self.model - Vector2::new(deltas[0], deltas[1]);
        }

        fn accept_correction(&mut self) {
            self.model = self.candidate;
        }
    }

    fn line_samples() -> (Vec<f64>, Vec<f64>) {
        let xs: Vec<f64> = (0..40).map(|n| n as f64 * 0.25).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 3.0 * x - 1.5).collect();
        (xs, ys)
    }

    #[test]
    fn converges_to_exact_line() {
        let (xs, ys) = line_samples();
        let mut provider = LineFit::new(xs, ys);

        let result = dense_optimization(
            &mut provider,
            20,
            Estimator::Square,
            0.001,
            5.0,
            None,
            None,
        )
        .unwrap();

        assert!(result.final_error < 1e-12);
        assert_relative_eq!(provider.model.x, 3.0, epsilon = 1e-6);
        assert_relative_eq!(provider.model.y, -1.5, epsilon = 1e-6);
    }

    #[test]
    fn idempotent_after_convergence() {
        let (xs, ys) = line_samples();
        let mut provider = LineFit::new(xs, ys);

        let first = dense_optimization(
            &mut provider,
            20,
            Estimator::Square,
            0.001,
            5.0,
            None,
            None,
        )
        .unwrap();

        let model = provider.model;

        // A Gauss-Newton pass on the converged model neither moves the model
        // nor changes the error.
        let second =
            dense_optimization(&mut provider, 5, Estimator::Square, 0.0, 1.0, None, None).unwrap();

        assert!((second.final_error - first.final_error).abs() < 1e-6);
        assert_relative_eq!(provider.model.x, model.x, epsilon = 1e-9);
        assert_relative_eq!(provider.model.y, model.y, epsilon = 1e-9);
    }

    #[test]
    fn gauss_newton_never_increases_accepted_error() {
        let (xs, mut ys) = line_samples();
        // Perturb so the fit is not exact.
        for (n, y) in ys.iter_mut().enumerate() {
            *y += if n % 2 == 0 { 0.05 } else { -0.05 };
        }

        let mut provider = LineFit::new(xs, ys);
        let mut intermediate = Vec::new();

        dense_optimization(
            &mut provider,
            20,
            Estimator::Square,
            0.0,
            1.0,
            None,
            Some(&mut intermediate),
        )
        .unwrap();

        for pair in intermediate.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12);
        }
    }

    #[test]
    fn huber_ignores_single_outlier() {
        let (xs, mut ys) = line_samples();
        ys[10] += 50.0;

        let mut provider = LineFit::new(xs, ys);
        dense_optimization(&mut provider, 50, Estimator::Huber, 0.001, 5.0, None, None).unwrap();

        assert_relative_eq!(provider.model.x, 3.0, epsilon = 1e-2);
        assert_relative_eq!(provider.model.y, -1.5, epsilon = 5e-2);
    }

    #[test]
    fn covariances_down_weight_observations() {
        let (xs, mut ys) = line_samples();
        // Corrupt the second half and give it a weak covariance.
        let half = xs.len() / 2;
        for y in ys.iter_mut().skip(half) {
            *y += 10.0;
        }

        let covariances: Vec<Matrix2<f64>> = (0..xs.len())
            .map(|n| {
                if n < half {
                    Matrix2::identity()
                } else {
                    Matrix2::identity() * 1e-6
                }
            })
            .collect();

        let mut provider = LineFit::new(xs, ys);
        dense_optimization(
            &mut provider,
            50,
            Estimator::Square,
            0.001,
            5.0,
            Some(&covariances),
            None,
        )
        .unwrap();

        assert_relative_eq!(provider.model.x, 3.0, epsilon = 1e-3);
        assert_relative_eq!(provider.model.y, -1.5, epsilon = 1e-2);
    }
}
