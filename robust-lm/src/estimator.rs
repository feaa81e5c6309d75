use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Weight floor keeping the normal equations solvable when an estimator
/// (e.g. Tukey) returns a zero weight.
pub const WEIGHT_EPS: f64 = 1e-6;

/// Robust error estimator kinds.
///
/// `Square` is the ordinary least-squares estimator; the remaining kinds
/// attenuate outliers by re-weighting squared residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Estimator {
    Square,
    Linear,
    Huber,
    Tukey,
    Cauchy,
}

impl Estimator {
    /// Whether this estimator is the standard least-squares estimator.
    #[inline]
    pub fn is_standard(self) -> bool {
        self == Estimator::Square
    }

    /// Whether the weight function needs a scale (sigma) estimate.
    #[inline]
    pub fn needs_sigma(self) -> bool {
        matches!(self, Estimator::Huber | Estimator::Tukey | Estimator::Cauchy)
    }

    /// 95% asymptotic efficiency tuning constant.
    #[inline]
    fn tuning_constant(self) -> f64 {
        match self {
            Estimator::Huber => 1.345,
            Estimator::Tukey => 4.6851,
            Estimator::Cauchy => 2.3849,
            Estimator::Square | Estimator::Linear => 1.0,
        }
    }

    /// Determines the squared scale sigma^2 for a set of squared residuals.
    ///
    /// Uses the MAD-style estimate `1.4826 * (1 + 5/(n - m)) * sqrt(median)`
    /// scaled by the estimator's tuning constant, where `m` is the number of
    /// model parameters.
    pub fn determine_sigma_square(self, sqr_errors: &[f64], model_parameters: usize) -> f64 {
        debug_assert!(self.needs_sigma());
        debug_assert!(!sqr_errors.is_empty());

        let n = sqr_errors.len();
        let excess = n.saturating_sub(model_parameters).max(1);

        let sigma = self.tuning_constant()
            * 1.4826
            * (1.0 + 5.0 / excess as f64)
            * median(sqr_errors).sqrt();

        sigma * sigma
    }

    /// The weight for one squared residual.
    pub fn robust_weight_square(self, sqr_error: f64, sqr_sigma: f64) -> f64 {
        match self {
            Estimator::Square => 1.0,
            Estimator::Linear => 1.0 / (sqr_error + f64::EPSILON).sqrt(),
            Estimator::Huber => {
                if sqr_error <= sqr_sigma {
                    1.0
                } else {
                    (sqr_sigma / sqr_error).sqrt()
                }
            }
            Estimator::Tukey => {
                if sqr_error <= sqr_sigma {
                    let ratio = 1.0 - sqr_error / sqr_sigma;
                    ratio * ratio
                } else {
                    0.0
                }
            }
            Estimator::Cauchy => 1.0 / (1.0 + sqr_error / sqr_sigma),
        }
    }
}

/// Median of a slice, by copy; the input order is preserved.
fn median(values: &[f64]) -> f64 {
    debug_assert!(!values.is_empty());

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("non-finite residual"));
    sorted[sorted.len() / 2]
}

/// Converts squared residuals into robust residuals for 2-D observations.
///
/// Each weighted error is multiplied in place by its robust weight, the
/// weight is stored per component, and the robust mean error
/// `sum(r^2 * w) / n` is returned. Optional transposed inverted 2x2
/// covariances are folded into the returned error the way the driver folds
/// them into the normal equations.
pub fn sqr_errors_to_robust_errors_2(
    estimator: Estimator,
    sqr_errors: &[f64],
    model_parameters: usize,
    weighted_errors: &mut [Vector2<f64>],
    weight_vectors: &mut [Vector2<f64>],
    transposed_inverted_covariances: Option<&[Matrix2<f64>]>,
) -> f64 {
    debug_assert_eq!(sqr_errors.len(), weighted_errors.len());
    debug_assert_eq!(sqr_errors.len(), weight_vectors.len());

    let sqr_sigma = if estimator.needs_sigma() {
        estimator.determine_sigma_square(sqr_errors, model_parameters)
    } else {
        0.0
    };

    let mut robust_error = 0.0;

    for (n, &sqr_error) in sqr_errors.iter().enumerate() {
        let weight = estimator
            .robust_weight_square(sqr_error, sqr_sigma)
            .max(WEIGHT_EPS);

        if let Some(covariances) = transposed_inverted_covariances {
            let transformed = covariances[n].transpose() * weighted_errors[n];
            robust_error += transformed.norm_squared() * weight;
        } else {
            robust_error += sqr_error * weight;
        }

        weighted_errors[n] *= weight;
        weight_vectors[n] = Vector2::new(weight, weight);
    }

    robust_error / sqr_errors.len() as f64
}

/// Converts squared residuals into robust residuals for observations with a
/// static residual dimension `D`.
pub fn sqr_errors_to_robust_errors<const D: usize>(
    estimator: Estimator,
    sqr_errors: &[f64],
    model_parameters: usize,
    weighted_errors: &mut [[f64; D]],
    weight_vectors: &mut [[f64; D]],
) -> f64 {
    debug_assert_eq!(sqr_errors.len(), weighted_errors.len());
    debug_assert_eq!(sqr_errors.len(), weight_vectors.len());

    let sqr_sigma = if estimator.needs_sigma() {
        estimator.determine_sigma_square(sqr_errors, model_parameters)
    } else {
        0.0
    };

    let mut robust_error = 0.0;

    for (n, &sqr_error) in sqr_errors.iter().enumerate() {
        let weight = estimator
            .robust_weight_square(sqr_error, sqr_sigma)
            .max(WEIGHT_EPS);

        robust_error += sqr_error * weight;

        for d in 0..D {
            weighted_errors[n][d] *= weight;
            weight_vectors[n][d] = weight;
        }
    }

    robust_error / sqr_errors.len() as f64
}

/// Converts squared residuals into robust residuals for observations with a
/// runtime residual dimension.
///
/// `weighted_errors` and `weight_vectors` are interleaved buffers of length
/// `sqr_errors.len() * dimension`.
pub fn sqr_errors_to_robust_errors_i(
    estimator: Estimator,
    sqr_errors: &[f64],
    model_parameters: usize,
    dimension: usize,
    weighted_errors: &mut [f64],
    weight_vectors: &mut [f64],
) -> f64 {
    debug_assert_eq!(sqr_errors.len() * dimension, weighted_errors.len());
    debug_assert_eq!(sqr_errors.len() * dimension, weight_vectors.len());

    let sqr_sigma = if estimator.needs_sigma() {
        estimator.determine_sigma_square(sqr_errors, model_parameters)
    } else {
        0.0
    };

    let mut robust_error = 0.0;

    for (n, &sqr_error) in sqr_errors.iter().enumerate() {
        let weight = estimator
            .robust_weight_square(sqr_error, sqr_sigma)
            .max(WEIGHT_EPS);

        robust_error += sqr_error * weight;

        for d in 0..dimension {
            weighted_errors[n * dimension + d] *= weight;
            weight_vectors[n * dimension + d] = weight;
        }
    }

    robust_error / sqr_errors.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn square_weights_are_unity() {
        let mut rng = ChaCha8Rng::seed_from_u64(101);

        for _ in 0..10 {
            let sqr_errors: Vec<f64> = (0..50).map(|_| rng.random_range(0.0..25.0)).collect();

            let mut weighted: Vec<Vector2<f64>> = sqr_errors
                .iter()
                .map(|e| Vector2::new((e / 2.0).sqrt(), (e / 2.0).sqrt()))
                .collect();
            let mut weights = vec![Vector2::zeros(); sqr_errors.len()];

            let robust = sqr_errors_to_robust_errors_2(
                Estimator::Square,
                &sqr_errors,
                6,
                &mut weighted,
                &mut weights,
                None,
            );

            let mean: f64 = sqr_errors.iter().sum::<f64>() / sqr_errors.len() as f64;
            assert_relative_eq!(robust, mean, epsilon = 1e-12);

            for w in &weights {
                assert_relative_eq!(w.x, 1.0);
                assert_relative_eq!(w.y, 1.0);
            }
        }
    }

    #[test]
    fn robust_error_matches_weight_definition() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        for estimator in [
            Estimator::Linear,
            Estimator::Huber,
            Estimator::Tukey,
            Estimator::Cauchy,
        ] {
            let sqr_errors: Vec<f64> = (0..100).map(|_| rng.random_range(0.0..9.0)).collect();

            let mut weighted = vec![Vector2::new(1.0, 0.0); sqr_errors.len()];
            for (w, e) in weighted.iter_mut().zip(sqr_errors.iter()) {
                *w *= e.sqrt();
            }
            let mut weights = vec![Vector2::zeros(); sqr_errors.len()];

            let robust = sqr_errors_to_robust_errors_2(
                estimator,
                &sqr_errors,
                6,
                &mut weighted,
                &mut weights,
                None,
            );

            let sqr_sigma = if estimator.needs_sigma() {
                estimator.determine_sigma_square(&sqr_errors, 6)
            } else {
                0.0
            };

            let expected: f64 = sqr_errors
                .iter()
                .map(|&e| e * estimator.robust_weight_square(e, sqr_sigma).max(WEIGHT_EPS))
                .sum::<f64>()
                / sqr_errors.len() as f64;

            assert_relative_eq!(robust, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn huber_down_weights_outliers() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        // 90 inliers from N(0, 0.5) per axis, 10 outliers around 20 px.
        let mut sqr_errors = Vec::with_capacity(100);
        for _ in 0..90 {
            let x: f64 = sample_normal(&mut rng, 0.5);
            let y: f64 = sample_normal(&mut rng, 0.5);
            sqr_errors.push(x * x + y * y);
        }
        for _ in 0..10 {
            let x = 20.0 + sample_normal(&mut rng, 0.5);
            let y = sample_normal(&mut rng, 0.5);
            sqr_errors.push(x * x + y * y);
        }

        let mut weighted: Vec<Vector2<f64>> = sqr_errors
            .iter()
            .map(|e| Vector2::new(e.sqrt(), 0.0))
            .collect();
        let mut weights = vec![Vector2::zeros(); 100];

        let huber = sqr_errors_to_robust_errors_2(
            Estimator::Huber,
            &sqr_errors,
            6,
            &mut weighted.clone(),
            &mut weights.clone(),
            None,
        );
        let square = sqr_errors_to_robust_errors_2(
            Estimator::Square,
            &sqr_errors,
            6,
            &mut weighted,
            &mut weights,
            None,
        );

        // The outliers dominate the squared mean but not the robust mean:
        // the robust value stays near the inlier scale (2 * sigma^2 = 0.5
        // per 2-D residual) while the squared mean is pulled to ~40.
        assert!(square > 3.0 * huber);
        assert!(huber < 2.0, "huber mean {huber}");
        assert!(square > 30.0, "square mean {square}");
    }

    #[test]
    fn tukey_rejects_far_outliers_entirely() {
        let sqr_sigma = Estimator::Tukey.determine_sigma_square(&[1.0, 1.0, 1.0, 400.0], 0);
        assert_eq!(Estimator::Tukey.robust_weight_square(sqr_sigma * 4.0, sqr_sigma), 0.0);
        assert!(Estimator::Tukey.robust_weight_square(0.0, sqr_sigma) == 1.0);
    }

    #[test]
    fn static_and_dynamic_shapes_agree() {
        let sqr_errors: Vec<f64> = vec![0.25, 4.0, 1.0, 9.0, 0.0625, 2.25];

        let mut weighted_s: Vec<[f64; 2]> =
            sqr_errors.iter().map(|e| [e.sqrt(), 0.0]).collect();
        let mut weights_s = vec![[0.0; 2]; sqr_errors.len()];

        let mut weighted_d: Vec<f64> = weighted_s.iter().flatten().copied().collect();
        let mut weights_d = vec![0.0; weighted_d.len()];

        let a = sqr_errors_to_robust_errors::<2>(
            Estimator::Cauchy,
            &sqr_errors,
            3,
            &mut weighted_s,
            &mut weights_s,
        );
        let b = sqr_errors_to_robust_errors_i(
            Estimator::Cauchy,
            &sqr_errors,
            3,
            2,
            &mut weighted_d,
            &mut weights_d,
        );

        assert_relative_eq!(a, b, epsilon = 1e-14);
        for (s, d) in weights_s.iter().flatten().zip(weights_d.iter()) {
            assert_relative_eq!(s, d, epsilon = 1e-14);
        }
    }

    fn sample_normal(rng: &mut ChaCha8Rng, sigma: f64) -> f64 {
        // Box-Muller.
        let u1: f64 = rng.random_range(f64::EPSILON..1.0);
        let u2: f64 = rng.random_range(0.0..1.0);
        sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}
